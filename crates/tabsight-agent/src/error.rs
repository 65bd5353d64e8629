//! Caller-facing errors
//!
//! Only failures that end an analysis outright live here. Runtime and logic
//! failures of generated code are [`crate::outcome::ExecutionOutcome`] values
//! and go through the retry loop instead.

use thiserror::Error;

use crate::history::StoreError;
use crate::llm::{LlmError, Purpose};
use crate::loader::DataError;
use crate::planner::PlanningError;
use crate::semantic::MappingError;

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    Mapping(#[from] MappingError),

    #[error(transparent)]
    Planning(#[from] PlanningError),

    #[error("{stage} stage failed: {source}")]
    Llm {
        stage: Purpose,
        #[source]
        source: LlmError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AnalysisError {
    pub fn llm(stage: Purpose, source: LlmError) -> Self {
        AnalysisError::Llm { stage, source }
    }
}
