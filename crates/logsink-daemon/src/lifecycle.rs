//! Lifecycle engine.
//!
//! All issue mutations after admission go through here. Each operation
//! checks the state-machine guard inside the store's read-modify-write
//! transaction, so a stale caller gets a precondition error rather than
//! clobbering a concurrent transition. Destructive operations return
//! the screenshots they orphaned after deleting the files.

use chrono::Utc;
use logsink_core::context::deep_merge;
use logsink_core::issue::{Completion, Effort, Issue, IssueState, IssueType};
use logsink_core::{Result, SinkError};
use serde_json::{Map, Value};
use tracing::info;
use uuid::Uuid;

use crate::images::ImageStore;
use crate::store::Store;

/// State-scoped mutations over issues.
pub struct Lifecycle {
    store: Store,
    images: ImageStore,
}

impl Lifecycle {
    /// Builds the engine.
    pub fn new(store: Store, images: ImageStore) -> Self {
        Self { store, images }
    }

    /// `open | revert → in_progress`: a worker claims the issue.
    pub fn start_progress(&self, application_id: &str, id: Uuid) -> Result<Issue> {
        let (issue, ()) = self.store.with_issue(application_id, id, |issue| {
            if !issue.state.can_start() {
                return Err(SinkError::precondition(issue.state.as_str(), "open or revert"));
            }
            issue.state = IssueState::InProgress;
            issue.started_at = Some(Utc::now());
            Ok(())
        })?;
        info!(application_id, issue_id = %issue.id, "issue claimed");
        Ok(issue)
    }

    /// `open | in_progress → done`: a worker reports completion.
    pub fn set_done(
        &self,
        application_id: &str,
        id: Uuid,
        completion: Completion,
    ) -> Result<Issue> {
        let (issue, ()) = self.store.with_issue(application_id, id, |issue| {
            if !issue.state.can_complete() {
                return Err(SinkError::precondition(
                    issue.state.as_str(),
                    "open or in_progress",
                ));
            }
            issue.state = IssueState::Done;
            issue.completed_at = Some(Utc::now());
            if completion.llm_message.is_some() {
                issue.llm_message = completion.llm_message;
            }
            if completion.git_commit.is_some() {
                issue.git_commit = completion.git_commit;
            }
            if completion.statistics.is_some() {
                issue.statistics = completion.statistics;
            }
            Ok(())
        })?;
        info!(application_id, issue_id = %issue.id, "issue done");
        Ok(issue)
    }

    /// `done → revert`: a completed fix was rejected.
    pub fn revert(
        &self,
        application_id: &str,
        id: Uuid,
        revert_reason: Option<String>,
    ) -> Result<Issue> {
        let (issue, ()) = self.store.with_issue(application_id, id, |issue| {
            if !issue.state.can_revert() {
                return Err(SinkError::precondition(issue.state.as_str(), "done"));
            }
            issue.state = IssueState::Revert;
            issue.reverted_at = Some(Utc::now());
            issue.revert_reason = revert_reason;
            Ok(())
        })?;
        info!(application_id, issue_id = %issue.id, "issue reverted");
        Ok(issue)
    }

    /// `any ≠ open → open`: forced reopen. The reject reason is merged
    /// into the context; the reopen counter is untouched, forced
    /// reopens are corrections rather than new sightings.
    pub fn reopen(
        &self,
        application_id: &str,
        id: Uuid,
        reject_reason: Option<String>,
    ) -> Result<Issue> {
        let (issue, ()) = self.store.with_issue(application_id, id, |issue| {
            if !issue.state.can_reopen() {
                return Err(SinkError::precondition(issue.state.as_str(), "a non-open"));
            }
            issue.state = IssueState::Open;
            if let Some(reason) = reject_reason {
                let mut incoming = Map::new();
                incoming.insert("reject_reason".to_string(), Value::String(reason));
                deep_merge(&mut issue.context, incoming);
            }
            Ok(())
        })?;
        info!(application_id, issue_id = %issue.id, "issue force-reopened");
        Ok(issue)
    }

    /// `any ≠ closed → closed`. The issue's screenshots are deleted
    /// from disk and cleared from the row.
    pub fn close(&self, application_id: &str, id: Uuid) -> Result<Issue> {
        let (issue, screenshots) = self.store.with_issue(application_id, id, |issue| {
            if !issue.state.can_close() {
                return Err(SinkError::precondition(issue.state.as_str(), "a non-closed"));
            }
            issue.state = IssueState::Closed;
            Ok(std::mem::take(&mut issue.screenshots))
        })?;
        let removed = self.images.delete(&screenshots);
        info!(
            application_id,
            issue_id = %issue.id,
            screenshots_removed = removed,
            "issue closed"
        );
        Ok(issue)
    }

    /// Records or replaces the worker plan. Plan changes never promote
    /// a pending issue; promotion is the embedding worker's job.
    pub fn set_plan(&self, application_id: &str, id: Uuid, plan: String) -> Result<Issue> {
        let (issue, ()) = self.store.with_issue(application_id, id, |issue| {
            issue.plan = Some(plan);
            Ok(())
        })?;
        Ok(issue)
    }

    /// Partial update of the issue-management fields.
    pub fn set_issue_fields(
        &self,
        application_id: &str,
        id: Uuid,
        issue_type: Option<IssueType>,
        effort: Option<Effort>,
        plan: Option<String>,
        llm_output: Option<String>,
    ) -> Result<Issue> {
        let (issue, ()) = self.store.with_issue(application_id, id, |issue| {
            if issue_type.is_some() {
                issue.issue_type = issue_type;
            }
            if effort.is_some() {
                issue.effort = effort;
            }
            if plan.is_some() {
                issue.plan = plan;
            }
            if llm_output.is_some() {
                issue.llm_output = llm_output;
            }
            Ok(())
        })?;
        Ok(issue)
    }

    /// Deletes every issue of an application and its screenshot files.
    pub fn purge_all(&self, application_id: &str) -> Result<usize> {
        let (removed, screenshots) = self.store.remove_all_issues(application_id)?;
        self.images.delete(&screenshots);
        info!(application_id, removed, "purged all issues");
        Ok(removed)
    }

    /// Deletes only `closed` issues of an application and their
    /// screenshot files.
    pub fn purge_closed(&self, application_id: &str) -> Result<usize> {
        let (removed, screenshots) = self.store.remove_closed_issues(application_id)?;
        self.images.delete(&screenshots);
        info!(application_id, removed, "purged closed issues");
        Ok(removed)
    }
}
