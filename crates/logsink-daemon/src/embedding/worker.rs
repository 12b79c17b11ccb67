//! Background embedding worker.
//!
//! The worker drains `pending` issues on a timer or an explicit
//! trigger. For each claimed issue it computes an embedding, looks for
//! a sufficiently similar non-pending neighbor in the same application,
//! and either merges into that neighbor or promotes the issue to
//! `open`. A provider failure drops the issue to `open` instead of
//! leaving it stuck in the queue.
//!
//! Only one tick runs at a time; a trigger while a tick is in flight
//! reports busy. The in-flight set guarantees the batch claimed by a
//! tick never overlaps with an explicitly triggered single-issue run.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use logsink_core::config::EmbeddingConfig;
use logsink_core::issue::{Issue, IssueState};
use logsink_core::{Result, SinkError};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::provider::{EmbeddingProvider, build_embedding_input};
use crate::store::{MergeStyle, Neighbor, Store};

/// Similarity score recorded on edges created by embedding merges.
const MERGE_EDGE_SCORE: f64 = 0.95;
/// How many neighbors the merge candidate search examines.
const NEIGHBOR_LIMIT: usize = 5;

/// What happened to one processed issue.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ItemOutcome {
    /// Merged into an existing similar issue.
    Merged {
        /// The surviving issue.
        target_id: Uuid,
        /// Cosine similarity to the target.
        similarity: f32,
    },
    /// Embedding stored, issue promoted to `open`.
    Promoted,
    /// Provider failed; issue fell back to `open` without an embedding.
    FellBack,
}

/// Result of one worker tick.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickSummary {
    /// Issues claimed from the pending queue.
    pub claimed: usize,
    /// Issues merged into neighbors.
    pub merged: usize,
    /// Issues promoted to `open` with an embedding.
    pub promoted: usize,
    /// Issues dropped to `open` after a provider failure.
    pub failed: usize,
}

/// Status surface for the worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    /// Whether embedding-based deduplication is enabled.
    pub enabled: bool,
    /// Provider model name, when enabled.
    pub model: Option<String>,
    /// Whether a tick is currently running.
    pub busy: bool,
    /// Issues waiting in the pending queue.
    pub pending: u32,
    /// Total issues processed since startup.
    pub processed: u64,
    /// Total merges since startup.
    pub merged: u64,
    /// Total promotions since startup.
    pub promoted: u64,
    /// Total provider failures since startup.
    pub errors: u64,
    /// When the last tick finished.
    pub last_tick: Option<DateTime<Utc>>,
}

/// The background embedding worker.
pub struct EmbeddingWorker {
    store: Store,
    provider: Option<Arc<dyn EmbeddingProvider>>,
    config: EmbeddingConfig,
    busy: AtomicBool,
    in_flight: Mutex<HashSet<Uuid>>,
    processed: AtomicU64,
    merged: AtomicU64,
    promoted: AtomicU64,
    errors: AtomicU64,
    last_tick: Mutex<Option<DateTime<Utc>>>,
}

impl EmbeddingWorker {
    /// Builds the worker. `provider` is `None` when the feature is
    /// disabled; the status surface still works.
    pub fn new(
        store: Store,
        provider: Option<Arc<dyn EmbeddingProvider>>,
        config: EmbeddingConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            provider,
            config,
            busy: AtomicBool::new(false),
            in_flight: Mutex::new(HashSet::new()),
            processed: AtomicU64::new(0),
            merged: AtomicU64::new(0),
            promoted: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            last_tick: Mutex::new(None),
        })
    }

    /// Runs the periodic loop until `shutdown` flips to `true`. Each
    /// interval elapse triggers one tick; a tick that reports busy
    /// (explicit trigger raced the timer) is skipped silently.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if !self.config.enabled {
            info!("embedding worker disabled");
            return;
        }
        info!(
            interval_secs = self.config.interval.as_secs(),
            batch_size = self.config.batch_size,
            "embedding worker started"
        );
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick of tokio's interval fires immediately; consume
        // it so the first drain happens one interval after startup.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.tick().await {
                        Ok(summary) if summary.claimed > 0 => {
                            info!(
                                claimed = summary.claimed,
                                merged = summary.merged,
                                promoted = summary.promoted,
                                failed = summary.failed,
                                "embedding tick complete"
                            );
                        },
                        Ok(_) => {},
                        Err(SinkError::Busy(_)) => {},
                        Err(err) => warn!(error = %err, "embedding tick failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("embedding worker shutting down");
                        return;
                    }
                }
            }
        }
    }

    /// Runs one tick: claims a batch of pending issues and processes
    /// them in order.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Unavailable`] when the feature is disabled
    /// and [`SinkError::Busy`] when a tick is already running.
    pub async fn tick(&self) -> Result<TickSummary> {
        let provider = self.require_provider()?;
        if self.busy.swap(true, Ordering::SeqCst) {
            return Err(SinkError::Busy("embedding processing"));
        }
        let result = self.process_batch(provider).await;
        self.busy.store(false, Ordering::SeqCst);
        if let Ok(mut last_tick) = self.last_tick.lock() {
            *last_tick = Some(Utc::now());
        }
        result
    }

    /// Processes one specific pending issue, outside the batch cycle.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Precondition`] when the issue is not
    /// pending and [`SinkError::Busy`] when the batch worker already
    /// holds it.
    pub async fn process_single(&self, id: Uuid) -> Result<ItemOutcome> {
        let provider = self.require_provider()?;
        let issue = self.store.get_issue_by_id(id)?;
        if !issue.state.is_pending() {
            return Err(SinkError::precondition(issue.state.as_str(), "pending"));
        }
        if !self.claim(id) {
            return Err(SinkError::Busy("embedding processing"));
        }
        let outcome = self.process_issue(provider, issue).await;
        self.release(id);
        outcome
    }

    async fn process_batch(&self, provider: &Arc<dyn EmbeddingProvider>) -> Result<TickSummary> {
        let claimed = {
            let in_flight = self
                .in_flight
                .lock()
                .map_err(|_| SinkError::Internal("in-flight set poisoned".into()))?;
            self.store.claim_pending(self.config.batch_size, &in_flight)?
        };

        let mut summary = TickSummary {
            claimed: claimed.len(),
            ..TickSummary::default()
        };
        for issue in claimed {
            let id = issue.id;
            if !self.claim(id) {
                continue;
            }
            let outcome = self.process_issue(provider, issue).await;
            self.release(id);
            match outcome {
                Ok(ItemOutcome::Merged { .. }) => summary.merged += 1,
                Ok(ItemOutcome::Promoted) => summary.promoted += 1,
                Ok(ItemOutcome::FellBack) => summary.failed += 1,
                Err(err) => {
                    summary.failed += 1;
                    warn!(issue_id = %id, error = %err, "embedding processing failed");
                },
            }
        }
        Ok(summary)
    }

    /// Embeds one issue and merges or promotes it. The in-flight claim
    /// is held by the caller; no lock is held across the provider call.
    async fn process_issue(
        &self,
        provider: &Arc<dyn EmbeddingProvider>,
        issue: Issue,
    ) -> Result<ItemOutcome> {
        self.processed.fetch_add(1, Ordering::Relaxed);

        let input = build_embedding_input(&issue);
        let embedded =
            match tokio::time::timeout(self.config.timeout, provider.embed(&input)).await {
                Ok(Ok(vector)) => Ok(vector),
                Ok(Err(err)) => Err(err),
                Err(_) => Err(SinkError::Provider("embedding call timed out".into())),
            };

        let vector = match embedded {
            Ok(vector) => vector,
            Err(err) => {
                // Fall back to open so the issue is not stuck pending.
                self.errors.fetch_add(1, Ordering::Relaxed);
                warn!(issue_id = %issue.id, error = %err, "embedding failed, promoting without vector");
                self.store
                    .with_issue(&issue.application_id, issue.id, |issue| {
                        if issue.state.is_pending() {
                            issue.state = IssueState::Open;
                        }
                        Ok(())
                    })?;
                return Ok(ItemOutcome::FellBack);
            },
        };

        let neighbors = self.store.nearest_neighbors(
            &issue.application_id,
            &vector,
            NEIGHBOR_LIMIT,
            Some(issue.id),
        )?;
        let candidate = neighbors
            .into_iter()
            .filter(|n| n.similarity >= self.config.similarity_threshold)
            .find(|n| n.issue.state.is_merge_target());

        if let Some(candidate) = candidate {
            let target = self.store.merge_into(
                candidate.issue.id,
                &issue,
                MERGE_EDGE_SCORE,
                "embedding similarity",
                MergeStyle::EMBEDDING,
            )?;
            self.merged.fetch_add(1, Ordering::Relaxed);
            info!(
                issue_id = %issue.id,
                target_id = %target.id,
                similarity = candidate.similarity,
                "merged duplicate issue"
            );
            return Ok(ItemOutcome::Merged {
                target_id: target.id,
                similarity: candidate.similarity,
            });
        }

        let model = provider.model().to_string();
        self.store
            .with_issue(&issue.application_id, issue.id, |issue| {
                // A concurrent close or merge may have moved the issue
                // out of pending; leave it alone in that case.
                if issue.state.is_pending() {
                    issue.state = IssueState::Open;
                    issue.embedding = Some(vector.clone());
                    issue.embedding_model = Some(model.clone());
                }
                Ok(())
            })?;
        self.promoted.fetch_add(1, Ordering::Relaxed);
        debug!(issue_id = %issue.id, "promoted pending issue");
        Ok(ItemOutcome::Promoted)
    }

    /// Issues similar to a stored issue. Uses the stored embedding when
    /// present, otherwise embeds the issue text on the fly.
    pub async fn similar_to(
        &self,
        application_id: &str,
        id: Uuid,
        limit: usize,
    ) -> Result<Vec<Neighbor>> {
        let issue = self.store.get_issue(application_id, id)?;
        let vector = match &issue.embedding {
            Some(vector) => vector.clone(),
            None => {
                let provider = self.require_provider()?;
                provider.embed(&build_embedding_input(&issue)).await?
            },
        };
        self.store
            .nearest_neighbors(application_id, &vector, limit, Some(id))
    }

    /// Free-text similarity search over one application's issues.
    pub async fn search(
        &self,
        application_id: &str,
        text: &str,
        limit: usize,
    ) -> Result<Vec<Neighbor>> {
        let provider = self.require_provider()?;
        let vector = provider.embed(text).await?;
        self.store
            .nearest_neighbors(application_id, &vector, limit, None)
    }

    /// The status surface.
    pub fn status(&self) -> Result<WorkerStatus> {
        Ok(WorkerStatus {
            enabled: self.config.enabled,
            model: self
                .provider
                .as_ref()
                .map(|p| p.model().to_string()),
            busy: self.busy.load(Ordering::SeqCst),
            pending: self.store.pending_count()?,
            processed: self.processed.load(Ordering::Relaxed),
            merged: self.merged.load(Ordering::Relaxed),
            promoted: self.promoted.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            last_tick: self.last_tick.lock().ok().and_then(|t| *t),
        })
    }

    fn require_provider(&self) -> Result<&Arc<dyn EmbeddingProvider>> {
        if !self.config.enabled {
            return Err(SinkError::Unavailable(
                "embedding deduplication is disabled".into(),
            ));
        }
        self.provider
            .as_ref()
            .ok_or_else(|| SinkError::Unavailable("no embedding provider configured".into()))
    }

    fn claim(&self, id: Uuid) -> bool {
        self.in_flight
            .lock()
            .map(|mut set| set.insert(id))
            .unwrap_or(false)
    }

    fn release(&self, id: Uuid) {
        if let Ok(mut set) = self.in_flight.lock() {
            set.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use crate::testutil::make_issue;

    use super::*;

    struct StubProvider {
        vector: Vec<f32>,
        fail: bool,
    }

    #[async_trait]
    impl EmbeddingProvider for StubProvider {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            if self.fail {
                return Err(SinkError::Provider("stub failure".into()));
            }
            Ok(self.vector.clone())
        }

        fn model(&self) -> &str {
            "stub-model"
        }
    }

    fn worker(store: &Store, vector: Vec<f32>, fail: bool) -> Arc<EmbeddingWorker> {
        let config = EmbeddingConfig {
            enabled: true,
            ..EmbeddingConfig::default()
        };
        EmbeddingWorker::new(
            store.clone(),
            Some(Arc::new(StubProvider { vector, fail })),
            config,
        )
    }

    #[tokio::test]
    async fn test_tick_merges_into_similar_neighbor() {
        let store = Store::open_in_memory().unwrap();
        let mut neighbor = make_issue("app", "db connection timeout", IssueState::Open);
        neighbor.embedding = Some(vec![1.0, 0.0, 0.0]);
        neighbor.embedding_model = Some("stub-model".into());
        store.insert_issue(&neighbor).unwrap();
        let pending = make_issue("app", "database timed out", IssueState::Pending);
        store.insert_issue(&pending).unwrap();

        let worker = worker(&store, vec![1.0, 0.0, 0.0], false);
        let summary = worker.tick().await.unwrap();
        assert_eq!(summary.claimed, 1);
        assert_eq!(summary.merged, 1);

        // The pending issue is gone; the neighbor absorbed it.
        assert!(store.get_issue("app", pending.id).is_err());
        let survivor = store.get_issue("app", neighbor.id).unwrap();
        assert_eq!(survivor.reopen_count, 1);
        assert_eq!(
            survivor.context["merged_from"],
            serde_json::Value::String(pending.id.to_string())
        );
        let edges = store.list_duplicates(neighbor.id).unwrap();
        assert_eq!(edges.len(), 1);
        assert!((edges[0].similarity_score - 0.95).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_tick_promotes_when_no_neighbor_close_enough() {
        let store = Store::open_in_memory().unwrap();
        let mut neighbor = make_issue("app", "unrelated", IssueState::Open);
        neighbor.embedding = Some(vec![0.0, 1.0, 0.0]);
        store.insert_issue(&neighbor).unwrap();
        let pending = make_issue("app", "fresh problem", IssueState::Pending);
        store.insert_issue(&pending).unwrap();

        let worker = worker(&store, vec![1.0, 0.0, 0.0], false);
        let summary = worker.tick().await.unwrap();
        assert_eq!(summary.promoted, 1);

        let promoted = store.get_issue("app", pending.id).unwrap();
        assert_eq!(promoted.state, IssueState::Open);
        assert_eq!(promoted.embedding, Some(vec![1.0, 0.0, 0.0]));
        assert_eq!(promoted.embedding_model.as_deref(), Some("stub-model"));
    }

    #[tokio::test]
    async fn test_provider_failure_falls_back_to_open() {
        let store = Store::open_in_memory().unwrap();
        let pending = make_issue("app", "boom", IssueState::Pending);
        store.insert_issue(&pending).unwrap();

        let worker = worker(&store, vec![], true);
        let summary = worker.tick().await.unwrap();
        assert_eq!(summary.failed, 1);

        let fallen = store.get_issue("app", pending.id).unwrap();
        assert_eq!(fallen.state, IssueState::Open);
        assert!(fallen.embedding.is_none());
        assert_eq!(worker.status().unwrap().errors, 1);
    }

    #[tokio::test]
    async fn test_revert_neighbors_are_not_merge_targets() {
        let store = Store::open_in_memory().unwrap();
        let mut neighbor = make_issue("app", "same problem", IssueState::Revert);
        neighbor.embedding = Some(vec![1.0, 0.0, 0.0]);
        store.insert_issue(&neighbor).unwrap();
        let pending = make_issue("app", "same problem again", IssueState::Pending);
        store.insert_issue(&pending).unwrap();

        let worker = worker(&store, vec![1.0, 0.0, 0.0], false);
        let summary = worker.tick().await.unwrap();
        // Identical vector, but revert issues never absorb merges.
        assert_eq!(summary.merged, 0);
        assert_eq!(summary.promoted, 1);
    }

    #[tokio::test]
    async fn test_disabled_worker_reports_unavailable() {
        let store = Store::open_in_memory().unwrap();
        let worker = EmbeddingWorker::new(store, None, EmbeddingConfig::default());
        assert!(matches!(
            worker.tick().await,
            Err(SinkError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_process_single_requires_pending() {
        let store = Store::open_in_memory().unwrap();
        let open = make_issue("app", "boom", IssueState::Open);
        store.insert_issue(&open).unwrap();

        let worker = worker(&store, vec![1.0], false);
        assert!(matches!(
            worker.process_single(open.id).await,
            Err(SinkError::Precondition { .. })
        ));
    }

    #[tokio::test]
    async fn test_search_ranks_by_similarity() {
        let store = Store::open_in_memory().unwrap();
        let mut near = make_issue("app", "near", IssueState::Open);
        near.embedding = Some(vec![1.0, 0.0]);
        store.insert_issue(&near).unwrap();
        let mut far = make_issue("app", "far", IssueState::Open);
        far.embedding = Some(vec![0.0, 1.0]);
        store.insert_issue(&far).unwrap();

        let worker = worker(&store, vec![1.0, 0.0], false);
        let results = worker.search("app", "anything", 10).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].issue.id, near.id);
    }
}
