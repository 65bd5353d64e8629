//! End-to-end analyses against scripted model responses

use std::sync::Arc;

use tabsight_agent::history::{HistoryStore, MemoryHistoryStore};
use tabsight_agent::llm::{LlmError, Purpose};
use tabsight_agent::scripted::ScriptedModel;
use tabsight_agent::{AnalysisError, Analyst, Config, ExecutionOutcome, LogicReason};
use tabsight_duck::{Table, TableStore};
use tabsight_ir::{Program, Value};

fn config(max_attempts: u32) -> Config {
    let mut config = Config::default();
    config.analysis.max_attempts = max_attempts;
    config.llm.backoff_ms = 1;
    config
}

fn strings(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

fn sales_store() -> TableStore {
    let orders = Table::new(
        "Orders",
        strings(&["order_id", "customer_id", "Amount"]),
        vec![
            vec![Value::Int(1), Value::Int(10), Value::Float(100.0)],
            vec![Value::Int(2), Value::Int(20), Value::Float(50.5)],
            vec![Value::Int(3), Value::Int(10), Value::Float(70.0)],
            vec![Value::Int(4), Value::Int(30), Value::Float(60.0)],
        ],
    )
    .unwrap();
    let customers = Table::new(
        "Customers",
        strings(&["customer_id", "region"]),
        vec![
            vec![Value::Int(10), Value::from("North")],
            vec![Value::Int(20), Value::from("South")],
            vec![Value::Int(30), Value::from("East")],
        ],
    )
    .unwrap();
    let employees = Table::new(
        "Employees",
        strings(&["employee_id", "name"]),
        vec![vec![Value::Int(1), Value::from("Ada")]],
    )
    .unwrap();
    vec![orders, customers, employees].into_iter().collect()
}

const SALES_MAP: &str = r#"{
  "nodes": [
    {"table": "Orders", "description": "Customer orders with amounts"},
    {"table": "Customers", "description": "Customers and their region"},
    {"table": "Employees", "description": "Staff roster"}
  ],
  "edges": [
    {"from_col": "Orders.customer_id", "to_col": "Customers.customer_id", "logic": "JOIN", "confidence": 1.7},
    {"from_col": "Orders.rep_id", "to_col": "Employees.employee_id", "logic": "JOIN", "confidence": 0.6}
  ]
}"#;

const SUM_AMOUNT: &str = r#"```json
{"pipeline": {"source": {"type": "Table", "name": "Orders"},
  "ops": [{"op": "GroupBy", "keys": [],
           "aggs": {"total_amount": {"func": "sum", "args": [{"type": "Column", "col": {"column": "Amount"}}]}}}]}}
```"#;

const REVENUE_BY_REGION: &str = r#"{"pipeline": {"source": {"type": "Table", "name": "Orders"},
  "ops": [
    {"op": "Join", "source": {"type": "Table", "name": "Customers"},
     "on": {"type": "BinaryOp", "op": "Eq",
            "left": {"type": "Column", "col": {"table": "Orders", "column": "customer_id"}},
            "right": {"type": "Column", "col": {"table": "Customers", "column": "customer_id"}}}},
    {"op": "GroupBy", "keys": [{"column": "region"}],
     "aggs": {"revenue": {"func": "sum", "args": [{"type": "Column", "col": {"column": "Amount"}}]}}}
  ]}}"#;

fn analyst(model: &Arc<ScriptedModel>, max_attempts: u32) -> Analyst {
    Analyst::new(model.clone(), &config(max_attempts))
}

#[tokio::test]
async fn test_single_table_sum_needs_no_join() {
    let model = Arc::new(
        ScriptedModel::new()
            .respond(Purpose::SemanticMap, SALES_MAP)
            .respond(Purpose::Routing, r#"{"intent": "Descriptive", "tables": ["Orders"]}"#)
            .respond(Purpose::Planning, r#"{"steps": ["Sum the Amount column of Orders"]}"#)
            .respond(Purpose::CodeGeneration, SUM_AMOUNT)
            .respond(Purpose::Summary, "The total amount is 280.5."),
    );
    let analyst = analyst(&model, 3);
    let session = analyst.open("memory", sales_store()).await;

    let outcome = analyst
        .analyze(&session, "sum of column Amount in table Orders")
        .await
        .unwrap();

    match &outcome {
        ExecutionOutcome::Success {
            attempt,
            artifact,
            result,
            summary,
        } => {
            assert_eq!(*attempt, 1);
            assert_eq!(result.scalar(), Some(&Value::Float(280.5)));
            assert_eq!(summary, "The total amount is 280.5.");
            assert!(!artifact.plan.has_join_step());
            assert_eq!(Program::from_json(&artifact.code).unwrap().join_count(), 0);
        }
        other => panic!("expected success, got {:?}", other),
    }

    let planning = model.requests_for(Purpose::Planning);
    assert_eq!(planning.len(), 1);
    let prompt = planning[0].user_text();
    assert!(prompt.contains("- Orders: order_id, customer_id, Amount"));
    assert!(!prompt.contains("Employees"));
}

#[tokio::test]
async fn test_unique_key_join_succeeds_with_left_join() {
    let model = Arc::new(
        ScriptedModel::new()
            .respond(Purpose::SemanticMap, SALES_MAP)
            .respond(
                Purpose::Routing,
                r#"{"intent": "Relational", "tables": ["Orders", "Customers"]}"#,
            )
            .respond(
                Purpose::Planning,
                r#"{"steps": ["Left join Orders with Customers on Orders.customer_id = Customers.customer_id", "Group by region and sum Amount"]}"#,
            )
            .respond(Purpose::CodeGeneration, REVENUE_BY_REGION)
            .respond(Purpose::Summary, "North leads with 170."),
    );
    let analyst = analyst(&model, 3);
    let session = analyst.open("memory", sales_store()).await;

    let outcome = analyst.analyze(&session, "revenue by region").await.unwrap();

    match &outcome {
        ExecutionOutcome::Success {
            artifact, result, ..
        } => {
            assert!(artifact.code.contains(r#""join_type": "Left""#));
            assert_eq!(result.columns, vec!["region", "revenue"]);
            assert_eq!(result.row_count(), 3);
            assert_eq!(result.cell(0, "region"), Some(&Value::from("North")));
            assert_eq!(result.cell(0, "revenue"), Some(&Value::Float(170.0)));
        }
        other => panic!("expected success, got {:?}", other),
    }
}

fn duplicate_key_store() -> TableStore {
    let ledger = Table::new(
        "Ledger",
        strings(&["account_id", "amount"]),
        (0..100).map(|i| vec![Value::Int(i), Value::Int(1)]).collect(),
    )
    .unwrap();

    // Keys 0, 1 and 2 appear twice; 97 to 99 never
    let mut keys: Vec<i64> = vec![0, 0, 1, 1, 2, 2];
    keys.extend(3..97);
    let accounts = Table::new(
        "Accounts",
        strings(&["account_id", "owner"]),
        keys.into_iter()
            .map(|k| vec![Value::Int(k), Value::from(format!("owner-{}", k))])
            .collect(),
    )
    .unwrap();
    assert_eq!(accounts.row_count(), 100);

    vec![ledger, accounts].into_iter().collect()
}

const LEDGER_MAP: &str = r#"{
  "nodes": [
    {"table": "Ledger", "description": "Ledger entries"},
    {"table": "Accounts", "description": "Account owners"}
  ],
  "edges": [{"from_col": "Ledger.account_id", "to_col": "Accounts.account_id", "confidence": 0.8}]
}"#;

const LEDGER_JOIN: &str = r#"{"pipeline": {"source": {"type": "Table", "name": "Ledger"},
  "ops": [{"op": "Join", "source": {"type": "Table", "name": "Accounts"}, "join_type": "Left",
           "on": {"type": "BinaryOp", "op": "Eq",
                  "left": {"type": "Column", "col": {"table": "Ledger", "column": "account_id"}},
                  "right": {"type": "Column", "col": {"table": "Accounts", "column": "account_id"}}}}]}}"#;

const LEDGER_PLAN: &str = r#"{"steps": ["Left join Ledger with Accounts on account_id", "Return every ledger row with its owner"]}"#;

#[tokio::test]
async fn test_duplicate_keys_are_a_logic_failure() {
    let model = Arc::new(
        ScriptedModel::new()
            .respond(Purpose::SemanticMap, LEDGER_MAP)
            .respond(Purpose::Routing, r#"{"intent": "Relational", "tables": ["Ledger", "Accounts"]}"#)
            .respond(Purpose::Planning, LEDGER_PLAN)
            .respond(Purpose::CodeGeneration, LEDGER_JOIN)
            .respond(Purpose::Planning, LEDGER_PLAN)
            .respond(Purpose::CodeGeneration, LEDGER_JOIN),
    );
    let analyst = analyst(&model, 2);
    let session = analyst.open("memory", duplicate_key_store()).await;

    let outcome = analyst
        .analyze(&session, "list ledger entries with owners")
        .await
        .unwrap();

    match &outcome {
        ExecutionOutcome::RetryExhausted {
            last,
            attempts,
            explanation,
        } => {
            assert_eq!(last.logic_reason(), Some(LogicReason::CartesianExpansion));
            let numbers: Vec<u32> = attempts.iter().map(|a| a.attempt()).collect();
            assert_eq!(numbers, vec![1, 2]);
            assert!(attempts
                .iter()
                .all(|a| a.logic_reason() == Some(LogicReason::CartesianExpansion)));
            assert!(explanation.contains("cartesian_expansion"));
        }
        other => panic!("expected exhausted retries, got {:?}", other),
    }
    // The failed join's code is surfaced, not a result
    assert!(outcome.artifact().code.contains("Accounts"));

    let planning = model.requests_for(Purpose::Planning);
    assert_eq!(planning.len(), 2);
    assert!(!planning[0].user_text().contains("previous attempt failed"));
    assert!(planning[1].user_text().contains("cartesian_expansion"));
    assert!(planning[1].user_text().contains("103 rows"));
    assert!(model.requests_for(Purpose::Summary).is_empty());
}

#[tokio::test]
async fn test_runtime_failure_hint_reaches_next_plan() {
    let bad_column = r#"{"pipeline": {"source": {"type": "Table", "name": "Orders"},
      "ops": [{"op": "GroupBy", "keys": [],
               "aggs": {"total": {"func": "sum", "args": [{"type": "Column", "col": {"column": "Amt"}}]}}}]}}"#;
    let model = Arc::new(
        ScriptedModel::new()
            .respond(Purpose::SemanticMap, SALES_MAP)
            .respond(Purpose::Routing, r#"{"intent": "Descriptive", "tables": ["Orders"]}"#)
            .respond(Purpose::Planning, r#"{"steps": ["Sum Orders.Amt"]}"#)
            .respond(Purpose::CodeGeneration, bad_column)
            .respond(Purpose::Planning, r#"{"steps": ["Sum Orders.Amount"]}"#)
            .respond(Purpose::CodeGeneration, SUM_AMOUNT)
            .respond(Purpose::Summary, "Total is 280.5."),
    );
    let analyst = analyst(&model, 3);
    let session = analyst.open("memory", sales_store()).await;

    let outcome = analyst.analyze(&session, "total amount").await.unwrap();
    assert!(outcome.is_success());
    assert_eq!(outcome.attempt(), 2);

    let planning = model.requests_for(Purpose::Planning);
    assert_eq!(planning.len(), 2);
    let retry_prompt = planning[1].user_text();
    assert!(retry_prompt.contains("Unknown column 'Amt'"));
    assert!(retry_prompt.contains("Attempt 1 raised a runtime error"));

    let generation = model.requests_for(Purpose::CodeGeneration);
    assert!(generation[1].user_text().contains("Unknown column 'Amt'"));
}

#[tokio::test]
async fn test_attempts_are_bounded_and_increasing() {
    let mut model = ScriptedModel::new()
        .respond(Purpose::SemanticMap, SALES_MAP)
        .respond(Purpose::Routing, r#"{"intent": "Descriptive", "tables": ["Orders"]}"#);
    for _ in 0..5 {
        model = model
            .respond(Purpose::Planning, r#"{"steps": ["Sum Amount"]}"#)
            .respond(Purpose::CodeGeneration, "orders['Amount'].sum()");
    }
    let model = Arc::new(model);
    let analyst = analyst(&model, 3);
    let session = analyst.open("memory", sales_store()).await;

    let outcome = analyst.analyze(&session, "total amount").await.unwrap();

    match &outcome {
        ExecutionOutcome::RetryExhausted { attempts, .. } => {
            let numbers: Vec<u32> = attempts.iter().map(|a| a.attempt()).collect();
            assert_eq!(numbers, vec![1, 2, 3]);
            assert!(attempts
                .iter()
                .all(|a| matches!(a, ExecutionOutcome::RuntimeFailure { .. })));
        }
        other => panic!("expected exhausted retries, got {:?}", other),
    }
    assert_eq!(model.requests_for(Purpose::Planning).len(), 3);
    assert_eq!(model.requests_for(Purpose::CodeGeneration).len(), 3);
}

#[tokio::test]
async fn test_zero_max_attempts_still_runs_once() {
    let model = Arc::new(
        ScriptedModel::new()
            .respond(Purpose::SemanticMap, SALES_MAP)
            .respond(Purpose::Routing, r#"{"intent": "Descriptive", "tables": ["Orders"]}"#)
            .respond(Purpose::Planning, r#"{"steps": ["Sum Amount"]}"#)
            .respond(Purpose::CodeGeneration, "not a program"),
    );
    let analyst = analyst(&model, 0);
    let session = analyst.open("memory", sales_store()).await;

    let outcome = analyst.analyze(&session, "total amount").await.unwrap();
    assert_eq!(outcome.kind(), "retry_exhausted");
    assert_eq!(outcome.attempt(), 1);
}

#[tokio::test]
async fn test_lexical_routing_excludes_unrelated_tables() {
    let model = Arc::new(
        ScriptedModel::new()
            .respond(Purpose::SemanticMap, SALES_MAP)
            .fail(Purpose::Routing, LlmError::Permanent("routing unavailable".to_string()))
            .respond(Purpose::Planning, r#"{"steps": ["Sum the Amount column of Orders"]}"#)
            .respond(Purpose::CodeGeneration, SUM_AMOUNT)
            .respond(Purpose::Summary, "ok"),
    );
    let analyst = analyst(&model, 3);
    let session = analyst.open("memory", sales_store()).await;

    let outcome = analyst
        .analyze(&session, "sum of column Amount in table Orders")
        .await
        .unwrap();
    assert!(outcome.is_success());

    let history = analyst.history(&session, 1);
    let tables: Vec<&str> = history[0].request.subgraph.table_names().collect();
    assert_eq!(tables, vec!["Orders"]);
    assert!(history[0].request.subgraph.edges.is_empty());
}

#[tokio::test]
async fn test_semantic_map_is_validated_and_cached() {
    let model = Arc::new(ScriptedModel::new().respond(Purpose::SemanticMap, SALES_MAP));
    let analyst = analyst(&model, 3);

    let first = analyst.open("a", sales_store()).await;
    let map = analyst.semantic_map(&first).await.unwrap();

    assert_eq!(map.nodes.len(), 3);
    assert_eq!(map.edges.len(), 1);
    let edge = &map.edges[0];
    assert_eq!(edge.from.to_string(), "Orders.customer_id");
    assert_eq!(edge.confidence, 1.0);
    for edge in &map.edges {
        assert!((0.0..=1.0).contains(&edge.confidence));
        assert!(map.node(&edge.from.table).is_some());
        assert!(map.node(&edge.to.table).is_some());
    }
    assert!(map.diagnostics.iter().any(|d| d.contains("Orders.rep_id")));

    // Same data in a second session reuses the map
    let second = analyst.open("b", sales_store()).await;
    analyst.semantic_map(&second).await.unwrap();
    assert_eq!(model.requests_for(Purpose::SemanticMap).len(), 1);
}

#[tokio::test]
async fn test_replacing_tables_rebuilds_the_map() {
    let model = Arc::new(
        ScriptedModel::new()
            .respond(Purpose::SemanticMap, SALES_MAP)
            .respond(Purpose::SemanticMap, LEDGER_MAP),
    );
    let analyst = analyst(&model, 3);
    let session = analyst.open("memory", sales_store()).await;

    analyst.semantic_map(&session).await.unwrap();
    analyst.replace_tables(&session, duplicate_key_store()).await;
    let map = analyst.semantic_map(&session).await.unwrap();

    assert_eq!(map.table_names().collect::<Vec<_>>(), vec!["Accounts", "Ledger"]);
    assert_eq!(model.requests_for(Purpose::SemanticMap).len(), 2);
}

#[tokio::test]
async fn test_planning_errors_propagate() {
    let model = Arc::new(
        ScriptedModel::new()
            .respond(Purpose::SemanticMap, SALES_MAP)
            .respond(Purpose::Routing, r#"{"intent": "Descriptive", "tables": ["Orders"]}"#)
            .fail(Purpose::Planning, LlmError::Permanent("invalid api key".to_string())),
    );
    let analyst = analyst(&model, 3);
    let session = analyst.open("memory", sales_store()).await;

    let err = analyst.analyze(&session, "total amount").await.unwrap_err();
    assert!(matches!(err, AnalysisError::Planning(_)));
    assert_eq!(analyst.history(&session, 10).len(), 0);
}

#[tokio::test]
async fn test_outcomes_are_recorded_and_persisted() {
    let model = Arc::new(
        ScriptedModel::new()
            .respond(Purpose::SemanticMap, SALES_MAP)
            .respond(Purpose::Routing, r#"{"intent": "Descriptive", "tables": ["Orders"]}"#)
            .respond(Purpose::Planning, r#"{"steps": ["Sum Amount"]}"#)
            .respond(Purpose::CodeGeneration, SUM_AMOUNT)
            .respond(Purpose::Summary, "Total is 280.5."),
    );
    let store = Arc::new(MemoryHistoryStore::new());
    let analyst = analyst(&model, 3).with_history(store.clone());
    let session = analyst.open("memory", sales_store()).await;

    analyst.analyze(&session, "total amount").await.unwrap();
    analyst.flush().await;

    let entries = analyst.history(&session, 10);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].request.attempt, 1);

    let records = store.recent(&session.id().to_string(), 10).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].query, "total amount");
    assert_eq!(records[0].outcome, "success");
    assert_eq!(records[0].summary, "Total is 280.5.");
    assert!(records[0].code.contains("total_amount"));

    let stored = analyst
        .stored_history(&session.id().to_string(), 10)
        .await
        .unwrap();
    assert_eq!(stored, records);
}
