//! Tabsight analysis agent
//!
//! Answers free-form questions about spreadsheet tables with a closed loop:
//! profile the tables, infer how they relate, route the question to the
//! tables it needs, then plan, generate and verify transformation code until
//! an attempt passes every check or the attempt budget is spent.

pub mod analyst;
pub mod codegen;
pub mod config;
pub mod error;
pub mod history;
pub mod llm;
pub mod loader;
pub mod logging;
pub mod outcome;
pub mod planner;
pub mod profile;
pub mod retry;
pub mod router;
pub mod scripted;
pub mod semantic;
pub mod session;
pub mod verify;

pub use analyst::Analyst;
pub use config::Config;
pub use error::AnalysisError;
pub use outcome::{ExecutionOutcome, LogicReason};
pub use session::Session;
