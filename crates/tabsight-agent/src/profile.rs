//! Column profiling
//!
//! Profiles are pure functions of a table and the sample size, so the same
//! table always yields the same [`TableProfile`].

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt::Write;
use std::sync::Arc;

use tabsight_duck::{Table, TableStore, ValueKey};
use tabsight_ir::{ColumnType, Value};

/// Statistical fingerprint of one column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnProfile {
    pub name: String,
    pub column_type: ColumnType,
    /// Fraction of null cells, 0 for an empty table
    pub null_rate: f64,
    /// Distinct non-null values
    pub distinct_count: usize,
    /// Most frequent non-null values, ties in first-seen order
    pub samples: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mean: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableProfile {
    pub table: String,
    pub row_count: usize,
    pub columns: Vec<ColumnProfile>,
}

impl TableProfile {
    pub fn column(&self, name: &str) -> Option<&ColumnProfile> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.columns.iter().map(|c| c.name.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Profiler {
    sample_size: usize,
}

impl Default for Profiler {
    fn default() -> Self {
        Self { sample_size: 10 }
    }
}

impl Profiler {
    pub fn new(sample_size: usize) -> Self {
        Self { sample_size }
    }

    pub fn sample_size(&self) -> usize {
        self.sample_size
    }

    pub fn profile_table(&self, table: &Table) -> TableProfile {
        let columns = (0..table.column_count())
            .map(|index| self.profile_column(table, index))
            .collect();

        TableProfile {
            table: table.name.clone(),
            row_count: table.row_count(),
            columns,
        }
    }

    /// Profiles of every table, ordered by table name
    pub fn profile_all(&self, store: &TableStore) -> Vec<TableProfile> {
        store.tables().map(|table| self.profile_table(table)).collect()
    }

    /// Profile each table on its own blocking task and merge by table name
    pub async fn profile_concurrently(&self, store: &TableStore) -> Vec<TableProfile> {
        let profiler = *self;
        let handles: Vec<_> = store
            .tables()
            .map(|table| {
                let name = table.name.clone();
                let table = Arc::clone(table);
                let handle =
                    tokio::task::spawn_blocking(move || profiler.profile_table(&table));
                (name, handle)
            })
            .collect();

        let mut profiles = Vec::with_capacity(handles.len());
        for (name, handle) in handles {
            match handle.await {
                Ok(profile) => profiles.push(profile),
                Err(err) => {
                    tracing::warn!(table = %name, error = %err, "Profiling task failed, profiling inline");
                    if let Some(table) = store.get(&name) {
                        profiles.push(self.profile_table(table));
                    }
                }
            }
        }

        profiles.sort_by(|a, b| a.table.cmp(&b.table));
        profiles
    }

    fn profile_column(&self, table: &Table, index: usize) -> ColumnProfile {
        let row_count = table.row_count();
        let mut nulls = 0usize;
        let mut column_type = ColumnType::Empty;
        // key -> (count, first seen, value)
        let mut frequencies: HashMap<ValueKey, (usize, usize, &Value)> = HashMap::new();
        let mut numeric = Vec::new();

        for (position, value) in table.column(index).enumerate() {
            let Some(value_type) = value.column_type() else {
                nulls += 1;
                continue;
            };
            column_type = column_type.merge(value_type);
            if let Some(x) = value.as_f64() {
                numeric.push(x);
            }
            frequencies
                .entry(ValueKey::from(value))
                .and_modify(|entry| entry.0 += 1)
                .or_insert((1, position, value));
        }

        let distinct_count = frequencies.len();
        let mut ranked: Vec<(usize, usize, &Value)> = frequencies.into_values().collect();
        ranked.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        let samples = ranked
            .into_iter()
            .take(self.sample_size)
            .map(|(_, _, value)| value.clone())
            .collect();

        let (min, max, mean) = if column_type.is_numeric() && !numeric.is_empty() {
            let min = numeric.iter().copied().fold(f64::INFINITY, f64::min);
            let max = numeric.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let mean = numeric.iter().sum::<f64>() / numeric.len() as f64;
            (Some(min), Some(max), Some(mean))
        } else {
            (None, None, None)
        };

        ColumnProfile {
            name: table.columns[index].clone(),
            column_type,
            null_rate: if row_count == 0 {
                0.0
            } else {
                nulls as f64 / row_count as f64
            },
            distinct_count,
            samples,
            min,
            max,
            mean,
        }
    }
}

/// SHA-256 over the profiles; identifies one dataset version
pub fn dataset_fingerprint(profiles: &[TableProfile]) -> String {
    let json = serde_json::to_string(profiles).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Compact text rendering used as model context
pub fn render_summary(profiles: &[TableProfile]) -> String {
    let mut out = String::new();
    for profile in profiles {
        let _ = writeln!(out, "## Table: {}", profile.table);
        let _ = writeln!(
            out,
            "Rows: {}, Columns: {}",
            profile.row_count,
            profile.columns.len()
        );
        for column in &profile.columns {
            let samples: Vec<String> = column
                .samples
                .iter()
                .take(5)
                .map(|v| match v {
                    Value::String(s) => format!("{:?}", s),
                    other => other.to_string(),
                })
                .collect();
            let _ = writeln!(out, "  - {} ({})", column.name, column.column_type);
            let _ = writeln!(
                out,
                "    null rate: {:.2}%, distinct: {}",
                column.null_rate * 100.0,
                column.distinct_count
            );
            let _ = writeln!(out, "    samples: [{}]", samples.join(", "));
            if let (Some(min), Some(max), Some(mean)) = (column.min, column.max, column.mean) {
                let _ = writeln!(out, "    range: [{:.2}, {:.2}], mean: {:.2}", min, max, mean);
            }
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orders() -> Table {
        Table::new(
            "Orders",
            vec!["region".to_string(), "Amount".to_string(), "note".to_string()],
            vec![
                vec![Value::from("South"), Value::Int(10), Value::Null],
                vec![Value::from("North"), Value::Float(2.5), Value::Null],
                vec![Value::from("North"), Value::Null, Value::Null],
                vec![Value::from("South"), Value::Int(10), Value::Null],
                vec![Value::from("East"), Value::Int(4), Value::from("rush")],
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_profile_statistics() {
        let profile = Profiler::new(2).profile_table(&orders());
        assert_eq!(profile.row_count, 5);

        let region = profile.column("region").unwrap();
        assert_eq!(region.column_type, ColumnType::String);
        assert_eq!(region.distinct_count, 3);
        assert_eq!(region.null_rate, 0.0);
        // Ties broken by first appearance: South before North
        assert_eq!(region.samples, vec![Value::from("South"), Value::from("North")]);
        assert_eq!(region.min, None);

        let amount = profile.column("Amount").unwrap();
        assert_eq!(amount.column_type, ColumnType::Float);
        assert_eq!(amount.null_rate, 0.2);
        assert_eq!(amount.distinct_count, 3);
        assert_eq!(amount.min, Some(2.5));
        assert_eq!(amount.max, Some(10.0));
        assert_eq!(amount.mean, Some(26.5 / 4.0));

        let note = profile.column("note").unwrap();
        assert_eq!(note.null_rate, 0.8);
        assert_eq!(note.samples, vec![Value::from("rush")]);
    }

    #[test]
    fn test_empty_table_profile() {
        let table = Table::empty("Empty", vec!["a".to_string(), "b".to_string()]);
        let profile = Profiler::default().profile_table(&table);

        assert_eq!(profile.row_count, 0);
        assert_eq!(profile.columns.len(), 2);
        for column in &profile.columns {
            assert_eq!(column.null_rate, 0.0);
            assert_eq!(column.distinct_count, 0);
            assert_eq!(column.column_type, ColumnType::Empty);
            assert!(column.samples.is_empty());
        }
    }

    #[test]
    fn test_profiling_is_idempotent() {
        let profiler = Profiler::default();
        let first = profiler.profile_table(&orders());
        let second = profiler.profile_table(&orders());

        assert_eq!(first, second);
        assert_eq!(
            dataset_fingerprint(&[first]),
            dataset_fingerprint(&[second])
        );
    }

    #[tokio::test]
    async fn test_concurrent_profiling_matches_sequential() {
        let store: TableStore = vec![
            orders(),
            Table::empty("Customers", vec!["id".to_string()]),
        ]
        .into_iter()
        .collect();
        let profiler = Profiler::default();

        let concurrent = profiler.profile_concurrently(&store).await;
        assert_eq!(concurrent, profiler.profile_all(&store));
        assert_eq!(concurrent[0].table, "Customers");
    }

    #[test]
    fn test_render_summary() {
        let summary = render_summary(&[Profiler::default().profile_table(&orders())]);

        assert!(summary.contains("## Table: Orders"));
        assert!(summary.contains("Rows: 5, Columns: 3"));
        assert!(summary.contains("  - Amount (float)"));
        assert!(summary.contains("null rate: 20.00%"));
        assert!(summary.contains("range: [2.50, 10.00]"));
    }
}
