//! Periodic cleanup engine.
//!
//! Three phases, in order: near-duplicate reconciliation across active
//! issues, age-based expiry of closed issues, and the orphan-image
//! sweep. Runs on a cron schedule plus an explicit trigger; only one
//! run at a time. Every phase records failures per item and keeps
//! going.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use cron::Schedule;
use logsink_core::config::CleanupConfig;
use logsink_core::issue::{Issue, IssueState};
use logsink_core::similarity::text_similarity;
use logsink_core::{Result, SinkError};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::images::ImageStore;
use crate::llm::SimilarityScorer;
use crate::store::{MergeStyle, Store};

/// Counters and timings from one cleanup run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    /// Near-duplicate pairs found at or above the threshold.
    pub duplicates_found: u64,
    /// Issues deleted by merging into a newer near-duplicate.
    pub duplicates_removed: u64,
    /// Closed issues deleted by age expiry.
    pub old_logs_removed: u64,
    /// Orphaned image files deleted by the sweep.
    pub orphaned_images_removed: u64,
    /// Per-item failures across all phases.
    pub failures: u64,
}

/// Status surface for the scheduler.
#[derive(Debug, Clone, Serialize)]
pub struct CleanupStatus {
    /// Whether scheduled runs are enabled.
    pub enabled: bool,
    /// Whether a run is currently in flight.
    pub busy: bool,
    /// The cron expression driving scheduled runs.
    pub schedule: String,
    /// When the last run finished.
    pub last_run: Option<DateTime<Utc>>,
    /// Duration of the last run in milliseconds.
    pub last_run_ms: Option<u64>,
    /// Completed runs since startup.
    pub runs: u64,
    /// Totals accumulated across all runs.
    pub totals: CleanupReport,
}

/// The cleanup scheduler.
pub struct CleanupScheduler {
    store: Store,
    images: ImageStore,
    config: CleanupConfig,
    scorer: Option<Arc<dyn SimilarityScorer>>,
    busy: AtomicBool,
    runs: AtomicU64,
    totals: Mutex<CleanupReport>,
    last_run: Mutex<Option<(DateTime<Utc>, u64)>>,
}

impl CleanupScheduler {
    /// Builds the scheduler. `scorer` is consulted only for pairs below
    /// the Levenshtein threshold and may be absent.
    pub fn new(
        store: Store,
        images: ImageStore,
        config: CleanupConfig,
        scorer: Option<Arc<dyn SimilarityScorer>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            images,
            config,
            scorer,
            busy: AtomicBool::new(false),
            runs: AtomicU64::new(0),
            totals: Mutex::new(CleanupReport::default()),
            last_run: Mutex::new(None),
        })
    }

    /// Parses the configured cron expression. Classic 5-field
    /// expressions get a seconds field prefixed.
    fn schedule(&self) -> Result<Schedule> {
        let expr = self.config.schedule.trim();
        let normalized = if expr.split_whitespace().count() == 5 {
            format!("0 {expr}")
        } else {
            expr.to_string()
        };
        Schedule::from_str(&normalized)
            .map_err(|e| SinkError::invalid(format!("bad cleanup schedule '{expr}': {e}")))
    }

    /// Runs the cron loop until `shutdown` flips to `true`.
    pub async fn run_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if !self.config.enabled {
            info!("cleanup scheduler disabled");
            return;
        }
        let schedule = match self.schedule() {
            Ok(schedule) => schedule,
            Err(err) => {
                warn!(error = %err, "cleanup scheduler not started");
                return;
            },
        };
        info!(schedule = %self.config.schedule, "cleanup scheduler started");

        loop {
            let Some(next) = schedule.upcoming(Utc).next() else {
                warn!("cleanup schedule has no upcoming run");
                return;
            };
            let wait = (next - Utc::now())
                .to_std()
                .unwrap_or(std::time::Duration::from_secs(1));
            debug!(next = %next, "cleanup sleeping until next scheduled run");

            tokio::select! {
                () = tokio::time::sleep(wait) => {
                    match self.run().await {
                        Ok(report) => {
                            info!(
                                duplicates_removed = report.duplicates_removed,
                                old_logs_removed = report.old_logs_removed,
                                orphaned_images_removed = report.orphaned_images_removed,
                                "scheduled cleanup complete"
                            );
                        },
                        Err(SinkError::Busy(_)) => {},
                        Err(err) => warn!(error = %err, "scheduled cleanup failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("cleanup scheduler shutting down");
                        return;
                    }
                }
            }
        }
    }

    /// Runs all three phases once.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Busy`] when a run is already in flight.
    /// Phase-level failures are counted, not propagated.
    pub async fn run(&self) -> Result<CleanupReport> {
        if self.busy.swap(true, Ordering::SeqCst) {
            return Err(SinkError::Busy("cleanup"));
        }
        let started = Instant::now();
        let report = self.run_phases().await;
        self.busy.store(false, Ordering::SeqCst);

        let elapsed_ms = started.elapsed().as_millis() as u64;
        self.runs.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut last_run) = self.last_run.lock() {
            *last_run = Some((Utc::now(), elapsed_ms));
        }
        if let Ok(mut totals) = self.totals.lock() {
            totals.duplicates_found += report.duplicates_found;
            totals.duplicates_removed += report.duplicates_removed;
            totals.old_logs_removed += report.old_logs_removed;
            totals.orphaned_images_removed += report.orphaned_images_removed;
            totals.failures += report.failures;
        }
        Ok(report)
    }

    async fn run_phases(&self) -> CleanupReport {
        let mut report = CleanupReport::default();

        if let Err(err) = self.reconcile_duplicates(&mut report).await {
            report.failures += 1;
            warn!(error = %err, "near-duplicate reconciliation failed");
        }
        if let Err(err) = self.expire_closed(&mut report) {
            report.failures += 1;
            warn!(error = %err, "closed-issue expiry failed");
        }
        if let Err(err) = self.sweep_orphans(&mut report) {
            report.failures += 1;
            warn!(error = %err, "orphan-image sweep failed");
        }
        report
    }

    /// Phase 1: collapse near-duplicate active issues per application.
    /// Candidates exclude `closed` and `pending`; the newer member of a
    /// matching pair survives.
    async fn reconcile_duplicates(&self, report: &mut CleanupReport) -> Result<()> {
        for app in self.store.list_applications()? {
            let mut candidates: Vec<Issue> = self
                .store
                .list_issues(&app)?
                .into_iter()
                .filter(|issue| {
                    !matches!(issue.state, IssueState::Closed | IssueState::Pending)
                })
                .take(self.config.batch_size)
                .collect();
            // list_issues returns newest first; keep that order so the
            // earlier member of any pair is the survivor.
            let mut removed = vec![false; candidates.len()];

            for i in 0..candidates.len() {
                if removed[i] {
                    continue;
                }
                for j in (i + 1)..candidates.len() {
                    if removed[j] {
                        continue;
                    }
                    let similarity = self
                        .pair_similarity(&candidates[i].message, &candidates[j].message)
                        .await;
                    if similarity < self.config.duplicate_threshold {
                        continue;
                    }

                    report.duplicates_found += 1;
                    let source = candidates[j].clone();
                    match self.store.merge_into(
                        candidates[i].id,
                        &source,
                        similarity,
                        "cleanup near-duplicate",
                        MergeStyle::CLEANUP,
                    ) {
                        Ok(updated) => {
                            report.duplicates_removed += 1;
                            removed[j] = true;
                            candidates[i] = updated;
                            debug!(
                                application_id = %app,
                                survivor = %candidates[i].id,
                                removed = %source.id,
                                similarity,
                                "merged near-duplicate issues"
                            );
                        },
                        Err(err) => {
                            report.failures += 1;
                            warn!(
                                survivor = %candidates[i].id,
                                removed = %source.id,
                                error = %err,
                                "near-duplicate merge failed"
                            );
                        },
                    }
                }
            }
        }
        Ok(())
    }

    /// Text similarity for one pair: exact match is 1.0, otherwise
    /// normalized Levenshtein, refined by the LLM scorer when the
    /// first estimate falls below the threshold.
    async fn pair_similarity(&self, a: &str, b: &str) -> f64 {
        let similarity = text_similarity(a, b);
        if similarity >= self.config.duplicate_threshold {
            return similarity;
        }
        let Some(scorer) = &self.scorer else {
            return similarity;
        };
        match scorer.score(a, b).await {
            Ok(refined) => refined,
            Err(err) => {
                debug!(error = %err, "LLM similarity refinement failed, keeping text score");
                similarity
            },
        }
    }

    /// Phase 2: delete closed issues older than the max age, together
    /// with their screenshots.
    fn expire_closed(&self, report: &mut CleanupReport) -> Result<()> {
        let max_age = chrono::Duration::from_std(self.config.max_age)
            .unwrap_or_else(|_| chrono::Duration::days(30));
        let cutoff = Utc::now() - max_age;
        let (removed, screenshots) = self.store.remove_expired_closed(cutoff)?;
        self.images.delete(&screenshots);
        report.old_logs_removed += removed as u64;
        Ok(())
    }

    /// Phase 3: delete image files no live issue references. The store
    /// is scanned before the directory, so a file written by an
    /// admission that has not committed its row yet is spared until the
    /// next run.
    fn sweep_orphans(&self, report: &mut CleanupReport) -> Result<()> {
        let referenced = self.store.referenced_screenshots()?;
        let removed = self.images.sweep_orphans(&referenced)?;
        report.orphaned_images_removed += u64::from(removed);
        Ok(())
    }

    /// The status surface.
    pub fn status(&self) -> CleanupStatus {
        let last = self.last_run.lock().ok().and_then(|v| *v);
        CleanupStatus {
            enabled: self.config.enabled,
            busy: self.busy.load(Ordering::SeqCst),
            schedule: self.config.schedule.clone(),
            last_run: last.map(|(at, _)| at),
            last_run_ms: last.map(|(_, ms)| ms),
            runs: self.runs.load(Ordering::Relaxed),
            totals: self
                .totals
                .lock()
                .map(|t| t.clone())
                .unwrap_or_default(),
        }
    }

    /// The active configuration, for the config surface.
    pub fn config(&self) -> &CleanupConfig {
        &self.config
    }
}
