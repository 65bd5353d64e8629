//! DuckDB executor for Tabsight programs
//!
//! Each execution opens a fresh in-memory DuckDB database, loads the tables a
//! program reads from a [`TableStore`] snapshot, and lowers every pipeline
//! step to one SQL statement over the previous step's table. The database is
//! locked before any program SQL runs: no extensions, no file or network
//! access, no configuration changes. Resource use is bounded by an
//! [`ExecutionBudget`].

use duckdb::Connection;
use tabsight_ir::Program;
use thiserror::Error;

mod compile;
mod exec;
mod key;
mod table;

pub use exec::{Execution, ExecutionTrace, JoinStats, StepTrace};
pub use key::ValueKey;
pub use table::{Table, TableError, TableStore};

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Database error: {0}")]
    Database(#[from] duckdb::Error),

    #[error("Invalid program JSON: {0}")]
    InvalidJson(String),

    #[error("Invalid program: {0}")]
    InvalidProgram(String),

    #[error("Unknown table '{name}'. Available tables: {available}")]
    UnknownTable { name: String, available: String },

    #[error("Unknown column '{column}'. Available columns: {available}")]
    UnknownColumn { column: String, available: String },

    #[error("Ambiguous column '{0}': qualify it with a table name or alias")]
    AmbiguousColumn(String),

    #[error("Unknown function '{0}'")]
    UnknownFunction(String),

    #[error("Budget exceeded: {0}")]
    BudgetExceeded(String),

    #[error("execution timed out after {0} ms")]
    Timeout(u64),
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionBudget {
    pub max_time_ms: Option<u64>,
    pub max_memory_mb: Option<u64>,
    pub max_rows: Option<u64>,
}

/// Settings applied to every execution database, lock last
const SANDBOX: &str = "SET preserve_insertion_order = true; \
SET autoinstall_known_extensions = false; \
SET autoload_known_extensions = false; \
SET enable_external_access = false; \
SET lock_configuration = true;";

/// Executor bound to one snapshot of tables
pub struct DuckExecutor {
    store: TableStore,
}

impl DuckExecutor {
    pub fn new(store: TableStore) -> Self {
        Self { store }
    }

    /// Parse a program from its JSON text and execute it
    pub fn execute_json(
        &self,
        code: &str,
        budget: Option<&ExecutionBudget>,
    ) -> Result<Execution, ExecutionError> {
        let program =
            Program::from_json(code).map_err(|e| ExecutionError::InvalidJson(e.to_string()))?;
        self.execute(&program, budget)
    }

    /// Execute a program, binding its output pipeline to `result`
    pub fn execute(
        &self,
        program: &Program,
        budget: Option<&ExecutionBudget>,
    ) -> Result<Execution, ExecutionError> {
        let budget = budget.cloned().unwrap_or_default();
        let conn = open_sandbox(&budget)?;
        let execution = exec::Run::new(&conn, &self.store, &budget).run(program)?;

        tracing::debug!(
            rows = execution.result.row_count(),
            steps = execution.trace.steps.len(),
            "Program executed"
        );

        Ok(execution)
    }

    pub fn store(&self) -> &TableStore {
        &self.store
    }
}

fn open_sandbox(budget: &ExecutionBudget) -> Result<Connection, ExecutionError> {
    let conn = Connection::open_in_memory()?;
    if let Some(max_memory_mb) = budget.max_memory_mb {
        conn.execute_batch(&format!("PRAGMA memory_limit='{}MB'", max_memory_mb))?;
    }
    conn.execute_batch(SANDBOX)?;
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sandbox_rejects_file_access_and_settings() {
        let conn = open_sandbox(&ExecutionBudget::default()).unwrap();

        assert!(conn
            .execute_batch("CREATE TABLE leak AS SELECT * FROM read_csv('/etc/passwd')")
            .is_err());
        assert!(conn.execute_batch("SET enable_external_access = true").is_err());

        conn.execute_batch("CREATE TABLE t (c0 BIGINT); INSERT INTO t VALUES (1)").unwrap();
        let n: i64 = conn.query_row("SELECT count(*) FROM t", [], |row| row.get(0)).unwrap();
        assert_eq!(n, 1);
    }
}
