//! Admission pipeline.
//!
//! Every incoming log entry passes through, in order: validation,
//! blacklist check, image extraction, exact-duplicate probe, and
//! persistence. The pipeline short-circuits on a blacklist hit with
//! nothing persisted. All store mutations run behind the store's
//! connection mutex, so admissions are serialized; two identical
//! admissions racing a `done` issue resolve sequentially (the first
//! reopens it, the second sees a non-`done` issue and creates a new
//! entry for the embedding worker to reconcile).
//!
//! Images are written to disk before the issue row is persisted. A
//! failed admission can therefore strand image files; the cleanup
//! orphan sweep reaps them on its next run.

use std::sync::Arc;

use chrono::Utc;
use logsink_core::blacklist::BlacklistMatch;
use logsink_core::context::{append_screenshots, deep_merge};
use logsink_core::issue::{dedup_key_text, Issue, IssueState, NewIssue};
use logsink_core::Result;
use tracing::{debug, info};
use uuid::Uuid;

use crate::blacklist_cache::BlacklistCache;
use crate::images::ImageStore;
use crate::store::Store;

/// What happened to an admitted entry.
#[derive(Debug)]
pub enum AdmissionOutcome {
    /// A fresh issue was created.
    Created(Issue),
    /// The entry matched a `done` issue's exact key; that issue was
    /// reopened and absorbed the entry.
    Reopened(Issue),
    /// A blacklist pattern matched; nothing was persisted.
    Blocked(BlacklistMatch),
}

/// The admission pipeline.
pub struct Admission {
    store: Store,
    images: ImageStore,
    blacklist: Arc<BlacklistCache>,
    embedding_enabled: bool,
}

impl Admission {
    /// Builds the pipeline.
    pub fn new(
        store: Store,
        images: ImageStore,
        blacklist: Arc<BlacklistCache>,
        embedding_enabled: bool,
    ) -> Self {
        Self {
            store,
            images,
            blacklist,
            embedding_enabled,
        }
    }

    /// Runs the pipeline for one entry.
    ///
    /// # Errors
    ///
    /// Returns [`logsink_core::SinkError::InvalidInput`] on missing
    /// fields and [`logsink_core::SinkError::Storage`] on persistence
    /// failure. A blacklist hit is a normal outcome, not an error.
    pub fn admit(&self, entry: NewIssue) -> Result<AdmissionOutcome> {
        entry.validate()?;

        if let Some(hit) = self
            .blacklist
            .check(&entry.message, &entry.application_id)?
        {
            info!(
                application_id = %entry.application_id,
                pattern = %hit.pattern,
                "admission blocked by blacklist"
            );
            return Ok(AdmissionOutcome::Blocked(hit));
        }

        let issue_id = Uuid::new_v4();
        let mut context = entry.context;
        let saved =
            self.images
                .extract(&entry.application_id, issue_id, &mut context);
        if !saved.is_empty() {
            debug!(
                issue_id = %issue_id,
                count = saved.len(),
                "extracted inline screenshots"
            );
        }

        let dedup_text = dedup_key_text(&entry.message, &context);
        if let Some(existing) = self.store.find_done_duplicate(
            &entry.application_id,
            &entry.message,
            &dedup_text,
        )? {
            let timestamp = entry.timestamp.unwrap_or_else(Utc::now);
            let (reopened, ()) =
                self.store
                    .with_issue(&entry.application_id, existing.id, |issue| {
                        deep_merge(&mut issue.context, context);
                        append_screenshots(&mut issue.screenshots, saved);
                        issue.state = IssueState::Open;
                        issue.reopen_count += 1;
                        issue.timestamp = timestamp;
                        issue.reopened_at = Some(Utc::now());
                        Ok(())
                    })?;
            info!(
                application_id = %reopened.application_id,
                issue_id = %reopened.id,
                reopen_count = reopened.reopen_count,
                "exact duplicate of a done issue, reopened"
            );
            return Ok(AdmissionOutcome::Reopened(reopened));
        }

        let now = Utc::now();
        let state = if self.embedding_enabled {
            IssueState::Pending
        } else {
            IssueState::Open
        };
        let issue = Issue {
            id: issue_id,
            application_id: entry.application_id,
            timestamp: entry.timestamp.unwrap_or(now),
            message: entry.message,
            context,
            screenshots: saved,
            state,
            reopen_count: 0,
            plan: entry.plan,
            issue_type: entry.issue_type,
            effort: entry.effort,
            llm_output: entry.llm_output,
            llm_message: None,
            git_commit: None,
            statistics: None,
            revert_reason: None,
            started_at: None,
            completed_at: None,
            reopened_at: None,
            reverted_at: None,
            created_at: now,
            updated_at: now,
            embedding: None,
            embedding_model: None,
        };
        self.store.insert_issue(&issue)?;
        info!(
            application_id = %issue.application_id,
            issue_id = %issue.id,
            state = %issue.state,
            "admitted new issue"
        );
        Ok(AdmissionOutcome::Created(issue))
    }
}
