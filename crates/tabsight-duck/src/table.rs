//! Named tables and the store programs read from

use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tabsight_ir::Value;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum TableError {
    #[error("Row {row} of table '{table}' has {actual} cells, expected {expected}")]
    RaggedRow {
        table: String,
        row: usize,
        expected: usize,
        actual: usize,
    },

    #[error("Table '{table}' has duplicate column '{column}'")]
    DuplicateColumn { table: String, column: String },
}

/// Rows of values under named columns
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Table {
    pub name: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl Table {
    pub fn new(
        name: impl Into<String>,
        columns: Vec<String>,
        rows: Vec<Vec<Value>>,
    ) -> Result<Self, TableError> {
        let name = name.into();

        let mut seen = HashSet::new();
        for column in &columns {
            if !seen.insert(column.as_str()) {
                return Err(TableError::DuplicateColumn {
                    table: name,
                    column: column.clone(),
                });
            }
        }

        for (row, cells) in rows.iter().enumerate() {
            if cells.len() != columns.len() {
                return Err(TableError::RaggedRow {
                    table: name,
                    row,
                    expected: columns.len(),
                    actual: cells.len(),
                });
            }
        }

        Ok(Self {
            name,
            columns,
            rows,
        })
    }

    pub fn empty(name: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            name: name.into(),
            columns,
            rows: Vec::new(),
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Values of one column, top to bottom
    pub fn column(&self, index: usize) -> impl Iterator<Item = &Value> + '_ {
        self.rows.iter().filter_map(move |row| row.get(index))
    }

    pub fn cell(&self, row: usize, column: &str) -> Option<&Value> {
        let index = self.column_index(column)?;
        self.rows.get(row).and_then(|r| r.get(index))
    }

    /// Single value of a one-row, one-column result
    pub fn scalar(&self) -> Option<&Value> {
        match (self.rows.as_slice(), self.columns.len()) {
            ([row], 1) => row.first(),
            _ => None,
        }
    }

    /// JSON shape used for persistence and API responses
    pub fn to_json(&self) -> serde_json::Value {
        let rows: Vec<serde_json::Value> = self
            .rows
            .iter()
            .map(|row| {
                let mut row_obj = serde_json::Map::new();
                for (i, col_name) in self.columns.iter().enumerate() {
                    if let Some(value) = row.get(i) {
                        row_obj.insert(
                            col_name.clone(),
                            serde_json::to_value(value).unwrap_or(serde_json::Value::Null),
                        );
                    }
                }
                serde_json::Value::Object(row_obj)
            })
            .collect();

        serde_json::json!({
            "columns": self.columns,
            "rows": rows,
            "row_count": self.rows.len()
        })
    }

    /// Pipe-separated text preview of the first `max_rows` rows
    pub fn render_preview(&self, max_rows: usize) -> String {
        let mut out = String::new();
        out.push_str(&self.columns.join(" | "));
        out.push('\n');
        for row in self.rows.iter().take(max_rows) {
            let cells: Vec<String> = row.iter().map(|v| v.to_string()).collect();
            out.push_str(&cells.join(" | "));
            out.push('\n');
        }
        if self.rows.len() > max_rows {
            out.push_str(&format!("... ({} more rows)\n", self.rows.len() - max_rows));
        }
        out
    }
}

/// Snapshot of named tables; clones share the underlying rows
#[derive(Debug, Clone, Default)]
pub struct TableStore {
    tables: BTreeMap<String, Arc<Table>>,
}

impl TableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, table: Table) {
        self.tables.insert(table.name.clone(), Arc::new(table));
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Table>> {
        self.tables.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.tables.keys().map(String::as_str)
    }

    pub fn tables(&self) -> impl Iterator<Item = &Arc<Table>> + '_ {
        self.tables.values()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Store restricted to the named tables; unknown names are skipped
    pub fn subset<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> TableStore {
        let tables = names
            .into_iter()
            .filter_map(|name| {
                self.tables
                    .get(name)
                    .map(|table| (name.to_string(), Arc::clone(table)))
            })
            .collect();
        TableStore { tables }
    }
}

impl FromIterator<Table> for TableStore {
    fn from_iter<I: IntoIterator<Item = Table>>(iter: I) -> Self {
        let mut store = TableStore::new();
        for table in iter {
            store.insert(table);
        }
        store
    }
}
