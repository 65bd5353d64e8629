//! Bounded plan, generate, verify loop

use crate::codegen::{CodeGenerator, CodeInput};
use crate::error::AnalysisError;
use crate::llm::Purpose;
use crate::log_event;
use crate::outcome::ExecutionOutcome;
use crate::planner::{PlanInput, Planner};
use crate::session::{AnalysisRequest, Dataset};
use crate::verify::Verifier;

pub struct RetryController {
    planner: Planner,
    generator: CodeGenerator,
    verifier: Verifier,
    max_attempts: u32,
}

impl RetryController {
    /// `max_attempts` below 1 is raised to 1
    pub fn new(planner: Planner, generator: CodeGenerator, verifier: Verifier, max_attempts: u32) -> Self {
        Self {
            planner,
            generator,
            verifier,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Drive attempts until one verifies or the budget runs out.
    ///
    /// Every attempt gets a fresh plan and fresh code; the previous failure is
    /// passed to the planner verbatim. Planning and generation errors end the
    /// run immediately.
    pub async fn run(
        &self,
        request: &mut AnalysisRequest,
        dataset: &Dataset,
    ) -> Result<ExecutionOutcome, AnalysisError> {
        let tables: Vec<String> = request.subgraph.table_names().map(str::to_string).collect();
        let profiles = dataset.profiles_for(tables.iter().map(String::as_str));
        let store = dataset.store.subset(tables.iter().map(String::as_str));

        let mut failures: Vec<ExecutionOutcome> = Vec::new();
        let mut hint: Option<String> = None;
        let mut attempt = 1;

        loop {
            request.attempt = attempt;
            tracing::info!(attempt, max_attempts = self.max_attempts, "Starting attempt");

            let plan = self
                .planner
                .plan(&PlanInput {
                    query: &request.query,
                    intent: request.intent,
                    subgraph: &request.subgraph,
                    profiles: &profiles,
                    hint: hint.as_deref(),
                    attempt,
                })
                .await?;

            let artifact = self
                .generator
                .generate(&CodeInput {
                    query: &request.query,
                    plan: &plan,
                    subgraph: &request.subgraph,
                    profiles: &profiles,
                    hint: hint.as_deref(),
                    attempt,
                })
                .await
                .map_err(|err| AnalysisError::llm(Purpose::CodeGeneration, err))?;

            let outcome = self.verifier.verify(artifact, store.clone(), &request.query).await;
            log_event!(
                level: tracing::Level::INFO,
                event: "attempt_finished",
                attempt: attempt,
                kind: outcome.kind()
            );

            if outcome.is_success() {
                return Ok(outcome);
            }
            if attempt >= self.max_attempts {
                return Ok(exhausted(outcome, failures));
            }

            hint = outcome.failure_hint();
            failures.push(outcome);
            attempt += 1;
        }
    }
}

fn exhausted(last: ExecutionOutcome, mut attempts: Vec<ExecutionOutcome>) -> ExecutionOutcome {
    let reason = match &last {
        ExecutionOutcome::LogicFailure { violation, .. } => {
            format!("ran but failed the {} check: {}", violation.reason, violation.detail)
        }
        ExecutionOutcome::RuntimeFailure { error, .. } => format!("raised an error: {}", error),
        other => format!("ended as {}", other.kind()),
    };
    let explanation = format!(
        "No verified answer after {} attempt(s). The last generated code {}. \
         The code is returned for review instead of an unverified result.",
        last.attempt(),
        reason
    );
    tracing::warn!(attempts = last.attempt(), "Retry budget exhausted");

    attempts.push(last.clone());
    ExecutionOutcome::RetryExhausted {
        last: Box::new(last),
        attempts,
        explanation,
    }
}
