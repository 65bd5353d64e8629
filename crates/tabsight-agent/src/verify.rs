//! Sandboxed execution and logic checks
//!
//! Each attempt runs on a fresh [`DuckExecutor`] that only sees the tables
//! the route selected, on a blocking thread under a wall-clock timeout. A run
//! that completes is then checked against its execution trace; the absence of
//! an error alone never makes an attempt a success.

use std::time::Duration;
use tabsight_duck::{DuckExecutor, ExecutionBudget, ExecutionTrace, JoinStats, Table, TableStore};
use tabsight_ir::JoinType;

use crate::codegen::CodeArtifact;
use crate::config::ExecutionConfig;
use crate::llm::{LlmCaller, LlmRequest, Purpose};
use crate::outcome::{ExecutionOutcome, LogicReason, LogicViolation};
use crate::planner::Plan;

/// Rows of the result shown to the summarizer
const PREVIEW_ROWS: usize = 20;

/// Upper bound on a join's output before it counts as expansion
fn expansion_limit(join: &JoinStats, tolerance: f64) -> f64 {
    // Right rows without a partner are appended after the matched rows
    let unmatched_right = match join.join_type {
        JoinType::Full | JoinType::Right => join.right_rows.saturating_sub(join.matched_right_rows),
        _ => 0,
    };
    let base = join.left_rows.max(join.right_rows) + unmatched_right;
    base as f64 * (1.0 + tolerance.max(0.0))
}

/// Check an execution trace for silent logical errors.
///
/// `tolerance` is the fraction by which a join may exceed its larger input;
/// 0 flags any excess.
pub fn logic_check(plan: &Plan, trace: &ExecutionTrace, tolerance: f64) -> Option<LogicViolation> {
    for join in trace.joins() {
        let limit = expansion_limit(join, tolerance);
        if join.output_rows as f64 > limit {
            return Some(LogicViolation {
                reason: LogicReason::CartesianExpansion,
                detail: format!(
                    "{} join with {} produced {} rows from {} left and {} right rows (at most {} expected). \
                     The join key is not unique on at least one side; deduplicate or aggregate before joining, or join on a different key",
                    join.join_type,
                    join.right_source,
                    join.output_rows,
                    join.left_rows,
                    join.right_rows,
                    limit.floor()
                ),
            });
        }
    }

    for join in trace.joins() {
        let preserving = matches!(join.join_type, JoinType::Left | JoinType::Inner);
        if preserving && join.left_rows > 0 && join.right_rows > 0 && join.matched_left_rows == 0 {
            return Some(LogicViolation {
                reason: LogicReason::JoinWithoutMatches,
                detail: format!(
                    "{} join with {} matched none of {} left rows, so every joined column is empty. \
                     The join keys do not share values; pick columns that hold the same identifiers",
                    join.join_type, join.right_source, join.left_rows
                ),
            });
        }
    }

    let joins = trace.joins().count();
    if joins > 0 && !plan.has_join_step() {
        return Some(LogicViolation {
            reason: LogicReason::UnplannedJoin,
            detail: format!(
                "the code performs {} join(s) but the plan has no join step; answer from the planned tables only",
                joins
            ),
        });
    }

    None
}

/// Final natural-language description of a verified result
pub struct Summarizer {
    caller: LlmCaller,
}

const SUMMARY_PROMPT: &str = "You summarize the result of a data analysis in two or three plain sentences. \
State the answer to the question directly, using the numbers in the result. Do not speculate beyond the data.";

impl Summarizer {
    pub fn new(caller: LlmCaller) -> Self {
        Self { caller }
    }

    pub async fn summarize(&self, query: &str, result: &Table) -> String {
        let request = LlmRequest::new(
            Purpose::Summary,
            SUMMARY_PROMPT,
            format!(
                "Question: {}\n\nResult ({} rows):\n{}",
                query,
                result.row_count(),
                result.render_preview(PREVIEW_ROWS)
            ),
        );

        match self.caller.call(&request).await {
            Ok(text) => text.trim().to_string(),
            Err(err) => {
                tracing::warn!(error = %err, "Summary call failed, describing result shape");
                describe(result)
            }
        }
    }
}

/// Deterministic description used when no summary can be produced
pub fn describe(result: &Table) -> String {
    if let (Some(value), Some(column)) = (result.scalar(), result.columns.first()) {
        return format!("{} = {}", column, value);
    }
    format!(
        "Result has {} rows and {} columns ({})",
        result.row_count(),
        result.column_count(),
        result.columns.join(", ")
    )
}

pub struct Verifier {
    tolerance: f64,
    budget: ExecutionBudget,
    timeout: Duration,
    summarizer: Summarizer,
}

impl Verifier {
    pub fn new(caller: LlmCaller, execution: &ExecutionConfig, tolerance: f64) -> Self {
        Self {
            tolerance,
            budget: ExecutionBudget {
                max_time_ms: Some(execution.timeout_ms),
                max_memory_mb: Some(execution.max_memory_mb),
                max_rows: Some(execution.max_rows),
            },
            timeout: Duration::from_millis(execution.timeout_ms),
            summarizer: Summarizer::new(caller),
        }
    }

    /// Run `artifact` against `store` and classify the attempt
    pub async fn verify(&self, artifact: CodeArtifact, store: TableStore, query: &str) -> ExecutionOutcome {
        let attempt = artifact.attempt;
        let code = artifact.code.clone();
        let budget = self.budget.clone();
        let task = tokio::task::spawn_blocking(move || {
            DuckExecutor::new(store).execute_json(&code, Some(&budget))
        });

        let execution = match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(Ok(execution))) => execution,
            Ok(Ok(Err(err))) => {
                tracing::warn!(attempt, error = %err, "Generated code failed");
                return ExecutionOutcome::RuntimeFailure {
                    attempt,
                    artifact,
                    error: err.to_string(),
                };
            }
            Ok(Err(err)) => {
                tracing::warn!(attempt, error = %err, "Execution task aborted");
                return ExecutionOutcome::RuntimeFailure {
                    attempt,
                    artifact,
                    error: format!("execution aborted: {}", err),
                };
            }
            Err(_) => {
                tracing::warn!(attempt, timeout_ms = self.timeout.as_millis() as u64, "Execution timed out");
                return ExecutionOutcome::RuntimeFailure {
                    attempt,
                    artifact,
                    error: format!("execution timed out after {} ms", self.timeout.as_millis()),
                };
            }
        };

        tracing::debug!(
            attempt,
            rows = execution.result.row_count(),
            joins = execution.trace.joins().count(),
            "Execution finished, checking logic"
        );

        if let Some(violation) = logic_check(&artifact.plan, &execution.trace, self.tolerance) {
            tracing::warn!(attempt, reason = %violation.reason, detail = %violation.detail, "Logic check failed");
            return ExecutionOutcome::LogicFailure {
                attempt,
                artifact,
                violation,
            };
        }

        let summary = self.summarizer.summarize(query, &execution.result).await;
        ExecutionOutcome::Success {
            attempt,
            artifact,
            result: execution.result,
            summary,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{CallPolicy, LlmError};
    use crate::scripted::ScriptedModel;
    use std::sync::Arc;
    use tabsight_duck::StepTrace;
    use tabsight_ir::Value;

    fn trace(join: JoinStats) -> ExecutionTrace {
        ExecutionTrace {
            steps: vec![StepTrace {
                scope: "result".to_string(),
                index: 0,
                op: "Join",
                input_rows: join.left_rows,
                output_rows: join.output_rows,
                join: Some(join),
            }],
        }
    }

    fn join(join_type: JoinType, left: usize, right: usize, output: usize, matched: usize) -> JoinStats {
        JoinStats {
            join_type,
            right_source: "Customers".to_string(),
            left_rows: left,
            right_rows: right,
            output_rows: output,
            matched_left_rows: matched,
            matched_right_rows: matched.min(right),
        }
    }

    fn join_plan() -> Plan {
        Plan::new(vec!["Left join Orders with Customers on customer_id".to_string()])
    }

    #[test]
    fn test_expansion_is_strict_by_default() {
        let at_limit = trace(join(JoinType::Left, 100, 100, 100, 100));
        assert_eq!(logic_check(&join_plan(), &at_limit, 0.0), None);

        let over = trace(join(JoinType::Left, 100, 100, 103, 100));
        let violation = logic_check(&join_plan(), &over, 0.0).unwrap();
        assert_eq!(violation.reason, LogicReason::CartesianExpansion);
        assert!(violation.detail.contains("103 rows"));
    }

    #[test]
    fn test_tolerance_allows_bounded_growth() {
        let over = trace(join(JoinType::Left, 100, 100, 103, 100));
        assert_eq!(logic_check(&join_plan(), &over, 0.05), None);
        assert!(logic_check(&join_plan(), &over, 0.01).is_some());
    }

    #[test]
    fn test_full_join_counts_unmatched_rows() {
        let full = trace(join(JoinType::Full, 4, 4, 5, 3));
        assert_eq!(logic_check(&join_plan(), &full, 0.0), None);
    }

    #[test]
    fn test_full_join_many_to_one_is_not_expansion() {
        // Five orders over three customers, every key matched
        let mut stats = join(JoinType::Full, 5, 3, 5, 5);
        stats.matched_right_rows = 3;
        assert_eq!(logic_check(&join_plan(), &trace(stats.clone()), 0.0), None);

        // One extra unmatched customer adds exactly one row
        stats.right_rows = 4;
        stats.output_rows = 6;
        assert_eq!(logic_check(&join_plan(), &trace(stats.clone()), 0.0), None);
        stats.output_rows = 7;
        assert!(logic_check(&join_plan(), &trace(stats), 0.0).is_some());
    }

    #[test]
    fn test_executed_full_join_passes_logic_check() {
        let orders = Table::new(
            "Orders",
            vec!["cid".to_string()],
            [1, 1, 2, 2, 3].iter().map(|&c| vec![Value::Int(c)]).collect(),
        )
        .unwrap();
        let customers = Table::new(
            "Customers",
            vec!["cid".to_string(), "name".to_string()],
            vec![
                vec![Value::Int(1), Value::from("Ada")],
                vec![Value::Int(2), Value::from("Bo")],
                vec![Value::Int(3), Value::from("Cy")],
            ],
        )
        .unwrap();
        let store: TableStore = vec![orders, customers].into_iter().collect();
        let code = r#"{"pipeline": {"source": {"type": "Table", "name": "Orders"},
            "ops": [{"op": "Join", "source": {"type": "Table", "name": "Customers"}, "join_type": "Full",
                "on": {"type": "BinaryOp", "op": "Eq",
                    "left": {"type": "Column", "col": {"table": "Orders", "column": "cid"}},
                    "right": {"type": "Column", "col": {"table": "Customers", "column": "cid"}}}}]}}"#;

        let execution = DuckExecutor::new(store).execute_json(code, None).unwrap();
        assert_eq!(execution.result.row_count(), 5);
        assert_eq!(logic_check(&join_plan(), &execution.trace, 0.0), None);
    }

    #[test]
    fn test_join_without_matches() {
        let empty = trace(join(JoinType::Left, 10, 5, 10, 0));
        let violation = logic_check(&join_plan(), &empty, 0.0).unwrap();
        assert_eq!(violation.reason, LogicReason::JoinWithoutMatches);

        let anti = trace(join(JoinType::Anti, 10, 5, 10, 0));
        assert_eq!(logic_check(&join_plan(), &anti, 0.0), None);
    }

    #[test]
    fn test_unplanned_join() {
        let plan = Plan::new(vec!["Sum Orders.Amount".to_string()]);
        let joined = trace(join(JoinType::Left, 4, 3, 4, 3));
        let violation = logic_check(&plan, &joined, 0.0).unwrap();
        assert_eq!(violation.reason, LogicReason::UnplannedJoin);

        assert_eq!(logic_check(&plan, &ExecutionTrace::default(), 0.0), None);
    }

    #[test]
    fn test_describe_scalar_and_table() {
        let scalar = Table::new("result", vec!["total".to_string()], vec![vec![Value::Int(7)]]).unwrap();
        assert_eq!(describe(&scalar), "total = 7");

        let empty = Table::empty("result", vec!["a".to_string(), "b".to_string()]);
        assert_eq!(describe(&empty), "Result has 0 rows and 2 columns (a, b)");
    }

    fn store() -> TableStore {
        vec![Table::new(
            "Orders",
            vec!["Amount".to_string()],
            vec![vec![Value::Int(5)], vec![Value::Int(7)]],
        )
        .unwrap()]
        .into_iter()
        .collect()
    }

    fn artifact(code: &str) -> CodeArtifact {
        CodeArtifact {
            attempt: 1,
            code: code.to_string(),
            plan: Plan::new(vec!["Sum Orders.Amount".to_string()]),
        }
    }

    const SUM: &str = r#"{"pipeline": {"source": {"type": "Table", "name": "Orders"},
        "ops": [{"op": "GroupBy", "keys": [], "aggs": {"total": {"func": "sum", "args": [{"type": "Column", "col": {"column": "Amount"}}]}}}]}}"#;

    fn verifier(model: ScriptedModel) -> Verifier {
        Verifier::new(
            LlmCaller::new(Arc::new(model), CallPolicy::default()),
            &ExecutionConfig::default(),
            0.0,
        )
    }

    #[tokio::test]
    async fn test_success_uses_model_summary() {
        let verifier = verifier(ScriptedModel::new().respond(Purpose::Summary, " Total is 12. "));

        match verifier.verify(artifact(SUM), store(), "total amount").await {
            ExecutionOutcome::Success { result, summary, .. } => {
                assert_eq!(result.scalar(), Some(&Value::Int(12)));
                assert_eq!(summary, "Total is 12.");
            }
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_summary_falls_back_to_description() {
        let verifier = verifier(
            ScriptedModel::new().fail(Purpose::Summary, LlmError::Permanent("down".to_string())),
        );

        let outcome = verifier.verify(artifact(SUM), store(), "total amount").await;
        assert!(outcome.is_success());
        assert_eq!(outcome.summary(), "total = 12");
    }

    #[tokio::test]
    async fn test_slow_program_times_out() {
        let column = |name: &str, n: i64| {
            Table::new(name, vec![name.to_string()], (0..n).map(|i| vec![Value::Int(i)]).collect()).unwrap()
        };
        let store: TableStore = vec![column("x", 4000), column("y", 4000)].into_iter().collect();
        // Non-equi join producing about eight million rows
        let code = r#"{"pipeline": {"source": {"type": "Table", "name": "x"},
            "ops": [{"op": "Join", "source": {"type": "Table", "name": "y"}, "join_type": "Inner",
                "on": {"type": "BinaryOp", "op": "Lt",
                    "left": {"type": "Column", "col": {"column": "x"}},
                    "right": {"type": "Column", "col": {"column": "y"}}}}]}}"#;
        let execution = ExecutionConfig {
            timeout_ms: 50,
            max_rows: 100_000_000,
            ..ExecutionConfig::default()
        };
        let verifier = Verifier::new(
            LlmCaller::new(Arc::new(ScriptedModel::new()), CallPolicy::default()),
            &execution,
            0.0,
        );

        let outcome = verifier.verify(artifact(code), store, "pairs").await;
        match &outcome {
            ExecutionOutcome::RuntimeFailure { error, .. } => {
                assert!(error.contains("timed out"), "unexpected error: {}", error);
            }
            other => panic!("expected timeout, got {:?}", other),
        }
        assert!(outcome.failure_hint().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_invalid_code_is_runtime_failure() {
        let verifier = verifier(ScriptedModel::new());

        match verifier.verify(artifact("SELECT 1"), store(), "q").await {
            ExecutionOutcome::RuntimeFailure { attempt, error, .. } => {
                assert_eq!(attempt, 1);
                assert!(error.contains("Invalid program JSON"));
            }
            other => panic!("expected runtime failure, got {:?}", other),
        }
    }
}
