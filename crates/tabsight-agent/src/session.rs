//! Sessions: one loaded dataset plus its conversation history

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, RwLock};
use tabsight_duck::TableStore;
use uuid::Uuid;

use crate::outcome::ExecutionOutcome;
use crate::profile::{dataset_fingerprint, TableProfile};
use crate::router::Intent;
use crate::semantic::SemanticMap;

/// One question on its way through the retry loop
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisRequest {
    pub query: String,
    pub intent: Intent,
    pub subgraph: SemanticMap,
    /// Last attempt started, 0 before the first
    pub attempt: u32,
}

impl AnalysisRequest {
    pub fn new(query: impl Into<String>, intent: Intent, subgraph: SemanticMap) -> Self {
        Self {
            query: query.into(),
            intent,
            subgraph,
            attempt: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub request: AnalysisRequest,
    pub outcome: ExecutionOutcome,
    pub at: DateTime<Utc>,
}

/// Immutable snapshot of the tables a session analyzes
#[derive(Debug, Clone)]
pub struct Dataset {
    pub store: TableStore,
    pub profiles: Vec<TableProfile>,
    pub fingerprint: String,
}

impl Dataset {
    pub fn new(store: TableStore, profiles: Vec<TableProfile>) -> Self {
        let fingerprint = dataset_fingerprint(&profiles);
        Self {
            store,
            profiles,
            fingerprint,
        }
    }

    /// Profiles of the named tables, in dataset order
    pub fn profiles_for<'a>(&self, tables: impl IntoIterator<Item = &'a str>) -> Vec<TableProfile> {
        let wanted: Vec<&str> = tables.into_iter().collect();
        self.profiles
            .iter()
            .filter(|p| wanted.contains(&p.table.as_str()))
            .cloned()
            .collect()
    }
}

#[derive(Debug)]
pub struct Session {
    id: Uuid,
    source: String,
    dataset: RwLock<Arc<Dataset>>,
    semantic_map: RwLock<Option<Arc<SemanticMap>>>,
    history: Mutex<Vec<HistoryEntry>>,
}

impl Session {
    pub fn new(source: impl Into<String>, dataset: Dataset) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: source.into(),
            dataset: RwLock::new(Arc::new(dataset)),
            semantic_map: RwLock::new(None),
            history: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn dataset(&self) -> Arc<Dataset> {
        self.dataset.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn semantic_map(&self) -> Option<Arc<SemanticMap>> {
        self.semantic_map
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// The installed map, only while the dataset still has `fingerprint`
    pub fn semantic_map_for(&self, fingerprint: &str) -> Option<Arc<SemanticMap>> {
        let dataset = self.dataset.read().unwrap_or_else(|p| p.into_inner());
        if dataset.fingerprint != fingerprint {
            return None;
        }
        self.semantic_map
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Install a map built for `fingerprint`.
    ///
    /// Returns false and keeps nothing when the dataset changed meanwhile.
    pub fn set_semantic_map(&self, fingerprint: &str, map: Arc<SemanticMap>) -> bool {
        let dataset = self.dataset.read().unwrap_or_else(|p| p.into_inner());
        if dataset.fingerprint != fingerprint {
            return false;
        }
        *self.semantic_map.write().unwrap_or_else(|p| p.into_inner()) = Some(map);
        true
    }

    /// Swap in reloaded tables; the semantic map is dropped, never patched
    pub fn replace_dataset(&self, dataset: Dataset) {
        let mut current = self.dataset.write().unwrap_or_else(|p| p.into_inner());
        tracing::info!(
            session_id = %self.id,
            old = %current.fingerprint,
            new = %dataset.fingerprint,
            "Dataset replaced, semantic map invalidated"
        );
        *current = Arc::new(dataset);
        *self.semantic_map.write().unwrap_or_else(|p| p.into_inner()) = None;
    }

    pub fn push(&self, entry: HistoryEntry) {
        self.history
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(entry);
    }

    /// The last `limit` entries, oldest first
    pub fn history(&self, limit: usize) -> Vec<HistoryEntry> {
        let history = self.history.lock().unwrap_or_else(|p| p.into_inner());
        let start = history.len().saturating_sub(limit);
        history[start..].to_vec()
    }

    pub fn history_len(&self) -> usize {
        self.history.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::CodeArtifact;
    use crate::planner::Plan;
    use crate::profile::Profiler;
    use tabsight_duck::Table;
    use tabsight_ir::Value;

    fn dataset(rows: i64) -> Dataset {
        let table = Table::new(
            "Orders",
            vec!["Amount".to_string()],
            (0..rows).map(|i| vec![Value::Int(i)]).collect(),
        )
        .unwrap();
        let store: TableStore = std::iter::once(table).collect();
        let profiles = Profiler::default().profile_all(&store);
        Dataset::new(store, profiles)
    }

    fn entry(query: &str) -> HistoryEntry {
        HistoryEntry {
            request: AnalysisRequest::new(query, Intent::Descriptive, SemanticMap::default()),
            outcome: ExecutionOutcome::RuntimeFailure {
                attempt: 1,
                artifact: CodeArtifact {
                    attempt: 1,
                    code: String::new(),
                    plan: Plan::new(vec![]),
                },
                error: "boom".to_string(),
            },
            at: Utc::now(),
        }
    }

    #[test]
    fn test_history_returns_most_recent_in_order() {
        let session = Session::new("orders.csv", dataset(3));
        for query in ["a", "b", "c"] {
            session.push(entry(query));
        }

        let recent: Vec<String> = session
            .history(2)
            .into_iter()
            .map(|e| e.request.query)
            .collect();
        assert_eq!(recent, vec!["b", "c"]);
        assert_eq!(session.history(10).len(), 3);
        assert!(session.history(0).is_empty());
    }

    #[test]
    fn test_reload_invalidates_map() {
        let session = Session::new("orders.csv", dataset(3));
        let fingerprint = session.dataset().fingerprint.clone();

        assert!(session.set_semantic_map(&fingerprint, Arc::new(SemanticMap::default())));
        assert!(session.semantic_map().is_some());

        session.replace_dataset(dataset(4));
        assert!(session.semantic_map().is_none());
        assert_ne!(session.dataset().fingerprint, fingerprint);

        // A map built for the old tables is refused
        assert!(!session.set_semantic_map(&fingerprint, Arc::new(SemanticMap::default())));
        assert!(session.semantic_map().is_none());
    }

    #[test]
    fn test_map_lookup_is_tied_to_a_snapshot() {
        let session = Session::new("orders.csv", dataset(3));
        let old = session.dataset();
        assert!(session.set_semantic_map(&old.fingerprint, Arc::new(SemanticMap::default())));
        assert!(session.semantic_map_for(&old.fingerprint).is_some());

        session.replace_dataset(dataset(4));
        let current = session.dataset();
        assert!(session.set_semantic_map(&current.fingerprint, Arc::new(SemanticMap::default())));

        // The new map is never handed out for the old snapshot
        assert!(session.semantic_map_for(&old.fingerprint).is_none());
        assert!(session.semantic_map_for(&current.fingerprint).is_some());
    }
}
