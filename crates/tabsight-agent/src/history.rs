//! Conversation history persistence
//!
//! Append-only records keyed by session id. The analyst writes through the
//! [`HistoryStore`] trait only and never waits on a write.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::config::HistoryConfig;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Invalid store data: {0}")]
    InvalidData(String),

    #[error("Store task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub session_id: String,
    pub query: String,
    pub code: String,
    /// Outcome kind, e.g. `success` or `retry_exhausted`
    pub outcome: String,
    pub summary: String,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append(&self, record: HistoryRecord) -> Result<(), StoreError>;

    /// Up to `limit` records of `session_id`, newest first
    async fn recent(&self, session_id: &str, limit: usize) -> Result<Vec<HistoryRecord>, StoreError>;
}

#[derive(Default)]
pub struct MemoryHistoryStore {
    records: Mutex<Vec<HistoryRecord>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn append(&self, record: HistoryRecord) -> Result<(), StoreError> {
        self.records
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(record);
        Ok(())
    }

    async fn recent(&self, session_id: &str, limit: usize) -> Result<Vec<HistoryRecord>, StoreError> {
        let records = self.records.lock().unwrap_or_else(|p| p.into_inner());
        Ok(records
            .iter()
            .rev()
            .filter(|r| r.session_id == session_id)
            .take(limit)
            .cloned()
            .collect())
    }
}

/// Store for the configured database file, in memory when none is set
pub fn open_store(config: &HistoryConfig) -> Result<Arc<dyn HistoryStore>, StoreError> {
    match &config.database {
        Some(path) => Ok(Arc::new(SqliteHistoryStore::open(Path::new(path))?)),
        None => Ok(Arc::new(MemoryHistoryStore::new())),
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS conversations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    query TEXT NOT NULL,
    code TEXT NOT NULL,
    outcome TEXT NOT NULL,
    summary TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_conversations_session ON conversations(session_id, id);
";

pub struct SqliteHistoryStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteHistoryStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(|p| p.into_inner());
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

#[async_trait]
impl HistoryStore for SqliteHistoryStore {
    async fn append(&self, record: HistoryRecord) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO conversations (session_id, query, code, outcome, summary, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.session_id,
                    record.query,
                    record.code,
                    record.outcome,
                    record.summary,
                    record.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn recent(&self, session_id: &str, limit: usize) -> Result<Vec<HistoryRecord>, StoreError> {
        let session_id = session_id.to_string();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT session_id, query, code, outcome, summary, created_at
                 FROM conversations WHERE session_id = ?1
                 ORDER BY id DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![session_id, limit], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?;

            let mut records = Vec::new();
            for row in rows {
                let (session_id, query, code, outcome, summary, created_at) = row?;
                let created_at = DateTime::parse_from_rfc3339(&created_at)
                    .map_err(|e| StoreError::InvalidData(format!("created_at '{}': {}", created_at, e)))?
                    .with_timezone(&Utc);
                records.push(HistoryRecord {
                    session_id,
                    query,
                    code,
                    outcome,
                    summary,
                    created_at,
                });
            }
            Ok(records)
        })
        .await
    }
}
