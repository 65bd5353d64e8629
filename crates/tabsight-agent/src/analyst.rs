//! Caller-facing entry point
//!
//! [`Analyst`] wires the stages together. Per dataset it profiles the tables
//! and builds the semantic map once; per query it routes, then hands the
//! request to the [`RetryController`].

use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tabsight_duck::TableStore;
use tokio::task::JoinHandle;

use crate::codegen::CodeGenerator;
use crate::config::Config;
use crate::error::AnalysisError;
use crate::history::{HistoryRecord, HistoryStore};
use crate::llm::{CallPolicy, LanguageModel, LlmCaller};
use crate::loader::{DataError, FileLoader, LoadedDataset, TableLoader};
use crate::log_event;
use crate::outcome::ExecutionOutcome;
use crate::planner::Planner;
use crate::profile::{render_summary, Profiler};
use crate::retry::RetryController;
use crate::router::IntentRouter;
use crate::semantic::{SemanticMap, SemanticMapper};
use crate::session::{AnalysisRequest, Dataset, HistoryEntry, Session};
use crate::verify::Verifier;

pub struct Analyst {
    profiler: Profiler,
    mapper: SemanticMapper,
    router: IntentRouter,
    controller: RetryController,
    loader: Arc<dyn TableLoader>,
    history: Option<Arc<dyn HistoryStore>>,
    /// Semantic maps by dataset fingerprint
    maps: Mutex<HashMap<String, Arc<SemanticMap>>>,
    pending_writes: Mutex<Vec<JoinHandle<()>>>,
}

impl Analyst {
    pub fn new(model: Arc<dyn LanguageModel>, config: &Config) -> Self {
        let caller = LlmCaller::new(model, CallPolicy::from(&config.llm));
        let thinking = config.llm.thinking;

        let controller = RetryController::new(
            Planner::new(caller.clone(), thinking),
            CodeGenerator::new(caller.clone(), thinking),
            Verifier::new(
                caller.clone(),
                &config.execution,
                config.analysis.expansion_tolerance,
            ),
            config.analysis.max_attempts,
        );

        Self {
            profiler: Profiler::new(config.profiler.sample_size),
            mapper: SemanticMapper::new(caller.clone()),
            router: IntentRouter::new(caller),
            controller,
            loader: Arc::new(FileLoader),
            history: None,
            maps: Mutex::new(HashMap::new()),
            pending_writes: Mutex::new(Vec::new()),
        }
    }

    pub fn with_loader(mut self, loader: Arc<dyn TableLoader>) -> Self {
        self.loader = loader;
        self
    }

    pub fn with_history(mut self, store: Arc<dyn HistoryStore>) -> Self {
        self.history = Some(store);
        self
    }

    /// Read tables from `path` and open a session over them
    pub async fn load_dataset(&self, path: impl AsRef<Path>) -> Result<Arc<Session>, AnalysisError> {
        let loaded = self.read(path.as_ref().to_path_buf()).await?;
        for warning in &loaded.warnings {
            tracing::warn!(source = %loaded.source, warning = %warning, "Load warning");
        }
        Ok(self.open(loaded.source, loaded.store).await)
    }

    /// Open a session over tables already in memory
    pub async fn open(&self, source: impl Into<String>, store: TableStore) -> Arc<Session> {
        let dataset = self.profile(store).await;
        let session = Session::new(source, dataset);
        tracing::info!(
            session_id = %session.id(),
            source = %session.source(),
            tables = session.dataset().profiles.len(),
            "Session opened"
        );
        Arc::new(session)
    }

    /// Re-read the session's source; the semantic map is rebuilt on next use
    pub async fn reload(&self, session: &Session) -> Result<(), AnalysisError> {
        let loaded = self.read(PathBuf::from(session.source())).await?;
        let dataset = self.profile(loaded.store).await;
        self.replace_dataset(session, dataset);
        Ok(())
    }

    /// Swap the session's tables for `store`
    pub async fn replace_tables(&self, session: &Session, store: TableStore) {
        let dataset = self.profile(store).await;
        self.replace_dataset(session, dataset);
    }

    /// Install `dataset` and drop the cached map of the data it replaces
    fn replace_dataset(&self, session: &Session, dataset: Dataset) {
        let previous = session.dataset();
        if previous.fingerprint != dataset.fingerprint {
            self.maps
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .remove(&previous.fingerprint);
        }
        session.replace_dataset(dataset);
    }

    async fn read(&self, path: PathBuf) -> Result<LoadedDataset, DataError> {
        let loader = Arc::clone(&self.loader);
        tokio::task::spawn_blocking(move || loader.load(&path))
            .await
            .map_err(|e| DataError::Task(e.to_string()))?
    }

    async fn profile(&self, store: TableStore) -> Dataset {
        let profiles = self.profiler.profile_concurrently(&store).await;
        Dataset::new(store, profiles)
    }

    /// The session's semantic map, built on first use.
    ///
    /// Maps are shared between sessions over identical data.
    pub async fn semantic_map(&self, session: &Session) -> Result<Arc<SemanticMap>, AnalysisError> {
        let dataset = session.dataset();
        self.map_for(session, &dataset).await
    }

    /// Map of one dataset snapshot; installed only if it is still current
    async fn map_for(&self, session: &Session, dataset: &Dataset) -> Result<Arc<SemanticMap>, AnalysisError> {
        if let Some(map) = session.semantic_map_for(&dataset.fingerprint) {
            return Ok(map);
        }

        let cached = self
            .maps
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&dataset.fingerprint)
            .cloned();

        let map = match cached {
            Some(map) => {
                tracing::debug!(fingerprint = %dataset.fingerprint, "Semantic map cache hit");
                map
            }
            None => {
                let map = Arc::new(self.mapper.build(&dataset.profiles).await?);
                self.maps
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .insert(dataset.fingerprint.clone(), Arc::clone(&map));
                map
            }
        };

        if !session.set_semantic_map(&dataset.fingerprint, Arc::clone(&map)) {
            tracing::debug!(session_id = %session.id(), "Dataset changed while mapping, map not installed");
        }
        Ok(map)
    }

    /// Answer `query` against the session's tables
    pub async fn analyze(&self, session: &Session, query: &str) -> Result<ExecutionOutcome, AnalysisError> {
        let dataset = session.dataset();
        let map = self.map_for(session, &dataset).await?;

        let summary = render_summary(&dataset.profiles);
        let route = self.router.route(query, &map, &summary).await;
        let mut request = AnalysisRequest::new(query, route.intent, route.subgraph);

        let outcome = self.controller.run(&mut request, &dataset).await?;

        log_event!(
            level: tracing::Level::INFO,
            event: "analysis_completed",
            session_id: session.id(),
            kind: outcome.kind(),
            attempts: outcome.attempt()
        );

        self.persist(session, &request, &outcome);
        session.push(HistoryEntry {
            request,
            outcome: outcome.clone(),
            at: Utc::now(),
        });
        Ok(outcome)
    }

    /// The last `limit` analyses of this session, oldest first
    pub fn history(&self, session: &Session, limit: usize) -> Vec<HistoryEntry> {
        session.history(limit)
    }

    /// Persisted records of a session, newest first; empty without a store
    pub async fn stored_history(&self, session_id: &str, limit: usize) -> Result<Vec<HistoryRecord>, AnalysisError> {
        match &self.history {
            Some(store) => Ok(store.recent(session_id, limit).await?),
            None => Ok(Vec::new()),
        }
    }

    fn persist(&self, session: &Session, request: &AnalysisRequest, outcome: &ExecutionOutcome) {
        let Some(store) = self.history.clone() else {
            return;
        };
        let record = HistoryRecord {
            session_id: session.id().to_string(),
            query: request.query.clone(),
            code: outcome.artifact().code.clone(),
            outcome: outcome.kind().to_string(),
            summary: outcome.summary(),
            created_at: Utc::now(),
        };
        let handle = tokio::spawn(async move {
            if let Err(err) = store.append(record).await {
                tracing::warn!(error = %err, "Failed to persist history record");
            }
        });

        let mut pending = self.pending_writes.lock().unwrap_or_else(|p| p.into_inner());
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
    }

    /// Wait for history writes still in flight
    pub async fn flush(&self) {
        let pending: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.pending_writes.lock().unwrap_or_else(|p| p.into_inner()));
        for handle in pending {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "History write task failed");
            }
        }
    }
}
