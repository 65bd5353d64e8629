//! Classification of analysis attempts

use serde::Serialize;
use std::fmt;
use tabsight_duck::Table;

use crate::codegen::CodeArtifact;

/// Consistency check a result can violate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicReason {
    /// A join produced more rows than its larger input allows
    CartesianExpansion,
    /// A preserving join over non-empty inputs matched nothing
    JoinWithoutMatches,
    /// The code joins although the plan never asked for it
    UnplannedJoin,
}

impl LogicReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogicReason::CartesianExpansion => "cartesian_expansion",
            LogicReason::JoinWithoutMatches => "join_without_matches",
            LogicReason::UnplannedJoin => "unplanned_join",
        }
    }
}

impl fmt::Display for LogicReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogicViolation {
    pub reason: LogicReason,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Success {
        attempt: u32,
        artifact: CodeArtifact,
        result: Table,
        summary: String,
    },
    RuntimeFailure {
        attempt: u32,
        artifact: CodeArtifact,
        error: String,
    },
    LogicFailure {
        attempt: u32,
        artifact: CodeArtifact,
        violation: LogicViolation,
    },
    /// Every attempt failed; `attempts` holds them all in order
    RetryExhausted {
        last: Box<ExecutionOutcome>,
        attempts: Vec<ExecutionOutcome>,
        explanation: String,
    },
}

impl ExecutionOutcome {
    pub fn attempt(&self) -> u32 {
        match self {
            ExecutionOutcome::Success { attempt, .. }
            | ExecutionOutcome::RuntimeFailure { attempt, .. }
            | ExecutionOutcome::LogicFailure { attempt, .. } => *attempt,
            ExecutionOutcome::RetryExhausted { last, .. } => last.attempt(),
        }
    }

    pub fn artifact(&self) -> &CodeArtifact {
        match self {
            ExecutionOutcome::Success { artifact, .. }
            | ExecutionOutcome::RuntimeFailure { artifact, .. }
            | ExecutionOutcome::LogicFailure { artifact, .. } => artifact,
            ExecutionOutcome::RetryExhausted { last, .. } => last.artifact(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Success { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionOutcome::Success { .. } => "success",
            ExecutionOutcome::RuntimeFailure { .. } => "runtime_failure",
            ExecutionOutcome::LogicFailure { .. } => "logic_failure",
            ExecutionOutcome::RetryExhausted { .. } => "retry_exhausted",
        }
    }

    pub fn logic_reason(&self) -> Option<LogicReason> {
        match self {
            ExecutionOutcome::LogicFailure { violation, .. } => Some(violation.reason),
            ExecutionOutcome::RetryExhausted { last, .. } => last.logic_reason(),
            _ => None,
        }
    }

    /// Diagnostic handed to the next planning attempt
    pub fn failure_hint(&self) -> Option<String> {
        match self {
            ExecutionOutcome::Success { .. } => None,
            ExecutionOutcome::RuntimeFailure { attempt, error, .. } => Some(format!(
                "Attempt {} raised a runtime error: {}",
                attempt, error
            )),
            ExecutionOutcome::LogicFailure {
                attempt, violation, ..
            } => Some(format!(
                "Attempt {} failed the {} check: {}",
                attempt, violation.reason, violation.detail
            )),
            ExecutionOutcome::RetryExhausted { last, .. } => last.failure_hint(),
        }
    }

    /// One-line description for history records
    pub fn summary(&self) -> String {
        match self {
            ExecutionOutcome::Success { summary, .. } => summary.clone(),
            ExecutionOutcome::RetryExhausted { explanation, .. } => explanation.clone(),
            other => other.failure_hint().unwrap_or_default(),
        }
    }
}
