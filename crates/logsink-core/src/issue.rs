//! Issue model and lifecycle state machine.
//!
//! An issue is the primary entity of the sink: one admitted log entry,
//! identified by a stable UUID across every transition. The state
//! machine here is pure; the daemon's lifecycle engine consults the
//! guard predicates before mutating the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::SinkError;

/// Lifecycle states of an issue.
///
/// `Pending` is only reachable when the embedding feature is enabled;
/// issues wait there until the embedding worker either merges them into
/// a similar neighbor or promotes them to `Open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueState {
    /// Awaiting embedding-based deduplication.
    Pending,
    /// Actionable; visible to polling workers.
    Open,
    /// Claimed by a worker.
    InProgress,
    /// Resolved by a worker.
    Done,
    /// A completed fix was rejected and must be redone.
    Revert,
    /// Closed; retained until cleanup expiry.
    Closed,
}

impl IssueState {
    /// Stable string form used in the store and over the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Revert => "revert",
            Self::Closed => "closed",
        }
    }

    /// Whether a worker may start progress from this state.
    #[must_use]
    pub const fn can_start(self) -> bool {
        matches!(self, Self::Open | Self::Revert)
    }

    /// Whether the issue may be marked done from this state.
    #[must_use]
    pub const fn can_complete(self) -> bool {
        matches!(self, Self::Open | Self::InProgress)
    }

    /// Whether a completed fix may be reverted from this state.
    #[must_use]
    pub const fn can_revert(self) -> bool {
        matches!(self, Self::Done)
    }

    /// Whether a forced reopen is meaningful from this state.
    #[must_use]
    pub const fn can_reopen(self) -> bool {
        !matches!(self, Self::Open)
    }

    /// Whether the issue may be closed from this state.
    #[must_use]
    pub const fn can_close(self) -> bool {
        !matches!(self, Self::Closed)
    }

    /// Whether the embedding worker may merge or promote this issue.
    #[must_use]
    pub const fn is_pending(self) -> bool {
        matches!(self, Self::Pending)
    }

    /// States eligible to absorb a merge from a pending duplicate.
    #[must_use]
    pub const fn is_merge_target(self) -> bool {
        matches!(self, Self::Open | Self::InProgress | Self::Done)
    }
}

impl std::fmt::Display for IssueState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for IssueState {
    type Err = SinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "open" => Ok(Self::Open),
            "in_progress" => Ok(Self::InProgress),
            "done" => Ok(Self::Done),
            "revert" => Ok(Self::Revert),
            "closed" => Ok(Self::Closed),
            other => Err(SinkError::invalid(format!("unknown issue state: {other}"))),
        }
    }
}

/// Classification of the work an issue calls for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueType {
    /// A defect to fix.
    Bugfix,
    /// New functionality.
    Feature,
    /// Documentation work.
    Documentation,
}

impl IssueType {
    /// Stable string form used in the store.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Bugfix => "bugfix",
            Self::Feature => "feature",
            Self::Documentation => "documentation",
        }
    }
}

impl std::str::FromStr for IssueType {
    type Err = SinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bugfix" => Ok(Self::Bugfix),
            "feature" => Ok(Self::Feature),
            "documentation" => Ok(Self::Documentation),
            other => Err(SinkError::invalid(format!("unknown issue type: {other}"))),
        }
    }
}

/// Estimated effort for resolving an issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effort {
    /// Small change.
    Low,
    /// Moderate change.
    Medium,
    /// Large change.
    High,
    /// Urgent and large.
    Critical,
}

impl Effort {
    /// Stable string form used in the store.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl std::str::FromStr for Effort {
    type Err = SinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(SinkError::invalid(format!("unknown effort: {other}"))),
        }
    }
}

/// The primary entity: one admitted log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    /// Stable identity across all transitions.
    pub id: Uuid,
    /// Scope key; every query is scoped by application.
    pub application_id: String,
    /// Caller-supplied event time, or admission time.
    pub timestamp: DateTime<Utc>,
    /// The log message; together with `application_id` this is the
    /// exact-duplicate key.
    pub message: String,
    /// Free-form context tree. Inline images are rewritten to filenames
    /// during admission.
    pub context: Map<String, Value>,
    /// Filenames of extracted screenshots, append-only across merges.
    pub screenshots: Vec<String>,
    /// Current lifecycle state.
    pub state: IssueState,
    /// Number of times this identity has been reopened or merged into.
    pub reopen_count: u32,
    /// Worker-recorded plan of attack.
    pub plan: Option<String>,
    /// Issue classification.
    pub issue_type: Option<IssueType>,
    /// Estimated effort.
    pub effort: Option<Effort>,
    /// Raw output from an automated triage pass.
    pub llm_output: Option<String>,
    /// Completion message, set on done.
    pub llm_message: Option<String>,
    /// Commit that resolved the issue, set on done.
    pub git_commit: Option<String>,
    /// Free-form completion statistics, set on done.
    pub statistics: Option<Value>,
    /// Reason the fix was rejected, set on revert.
    pub revert_reason: Option<String>,
    /// When a worker claimed the issue.
    pub started_at: Option<DateTime<Utc>>,
    /// When the issue was marked done.
    pub completed_at: Option<DateTime<Utc>>,
    /// When the issue was last reopened.
    pub reopened_at: Option<DateTime<Utc>>,
    /// When the fix was reverted.
    pub reverted_at: Option<DateTime<Utc>>,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
    /// Bumped on every mutation.
    pub updated_at: DateTime<Utc>,
    /// Semantic embedding of the issue, absent while pending.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Model that produced the embedding.
    pub embedding_model: Option<String>,
}

impl Issue {
    /// The text used for exact-duplicate comparison: the message,
    /// concatenated with `context.message` when present.
    #[must_use]
    pub fn dedup_key_text(&self) -> String {
        dedup_key_text(&self.message, &self.context)
    }
}

/// Builds the exact-duplicate comparison text from a message and its
/// context. A `context.message` string field participates in the key so
/// that entries differing only in contextual detail stay distinct.
#[must_use]
pub fn dedup_key_text(message: &str, context: &Map<String, Value>) -> String {
    match context.get("message").and_then(Value::as_str) {
        Some(ctx_msg) if !ctx_msg.is_empty() => format!("{message}\n{ctx_msg}"),
        _ => message.to_string(),
    }
}

/// Fields accepted when admitting a new log entry.
#[derive(Debug, Clone, Default)]
pub struct NewIssue {
    /// Scope key, required and non-empty.
    pub application_id: String,
    /// The log message, required and non-empty.
    pub message: String,
    /// Caller-supplied event time.
    pub timestamp: Option<DateTime<Utc>>,
    /// Free-form context tree.
    pub context: Map<String, Value>,
    /// Optional classification.
    pub issue_type: Option<IssueType>,
    /// Optional effort estimate.
    pub effort: Option<Effort>,
    /// Optional worker plan.
    pub plan: Option<String>,
    /// Optional triage output.
    pub llm_output: Option<String>,
}

impl NewIssue {
    /// Validates the required fields.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::InvalidInput`] when `application_id` or
    /// `message` is empty.
    pub fn validate(&self) -> Result<(), SinkError> {
        if self.application_id.trim().is_empty() {
            return Err(SinkError::invalid("applicationId is required"));
        }
        if self.message.trim().is_empty() {
            return Err(SinkError::invalid("message is required"));
        }
        Ok(())
    }
}

/// A recorded deduplication event: `duplicate_log_id` was absorbed into
/// `original_log_id`. Edges are informational history; they never affect
/// issue queries. The duplicate endpoint names an issue that no longer
/// exists, so edges live and die with their surviving owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateEdge {
    /// Store-assigned id.
    pub id: i64,
    /// The surviving issue.
    pub original_log_id: Uuid,
    /// The absorbed issue.
    pub duplicate_log_id: Uuid,
    /// Similarity score recorded at detection time, in `[0, 1]`.
    pub similarity_score: f64,
    /// When the duplicate was detected.
    pub detected_at: DateTime<Utc>,
}

/// Fields recorded when a worker marks an issue done.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    /// Human-readable completion message.
    pub llm_message: Option<String>,
    /// Commit that carries the fix.
    pub git_commit: Option<String>,
    /// Free-form statistics from the worker run.
    pub statistics: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trips_through_str() {
        for state in [
            IssueState::Pending,
            IssueState::Open,
            IssueState::InProgress,
            IssueState::Done,
            IssueState::Revert,
            IssueState::Closed,
        ] {
            assert_eq!(state.as_str().parse::<IssueState>().unwrap(), state);
        }
    }

    #[test]
    fn test_start_guard_accepts_open_and_revert_only() {
        assert!(IssueState::Open.can_start());
        assert!(IssueState::Revert.can_start());
        assert!(!IssueState::Pending.can_start());
        assert!(!IssueState::InProgress.can_start());
        assert!(!IssueState::Done.can_start());
        assert!(!IssueState::Closed.can_start());
    }

    #[test]
    fn test_complete_guard_accepts_open_and_in_progress() {
        assert!(IssueState::Open.can_complete());
        assert!(IssueState::InProgress.can_complete());
        assert!(!IssueState::Done.can_complete());
        assert!(!IssueState::Revert.can_complete());
    }

    #[test]
    fn test_revert_guard_accepts_done_only() {
        assert!(IssueState::Done.can_revert());
        assert!(!IssueState::Open.can_revert());
        assert!(!IssueState::Closed.can_revert());
    }

    #[test]
    fn test_close_guard_rejects_closed() {
        assert!(IssueState::Done.can_close());
        assert!(IssueState::Pending.can_close());
        assert!(!IssueState::Closed.can_close());
    }

    #[test]
    fn test_merge_targets_exclude_pending_revert_closed() {
        assert!(IssueState::Open.is_merge_target());
        assert!(IssueState::InProgress.is_merge_target());
        assert!(IssueState::Done.is_merge_target());
        assert!(!IssueState::Pending.is_merge_target());
        assert!(!IssueState::Revert.is_merge_target());
        assert!(!IssueState::Closed.is_merge_target());
    }

    #[test]
    fn test_dedup_key_includes_context_message() {
        let mut context = Map::new();
        context.insert("message".into(), Value::String("stack".into()));
        assert_eq!(dedup_key_text("boom", &context), "boom\nstack");

        let empty = Map::new();
        assert_eq!(dedup_key_text("boom", &empty), "boom");
    }

    #[test]
    fn test_new_issue_validation() {
        let mut entry = NewIssue {
            application_id: "app".into(),
            message: "m".into(),
            ..NewIssue::default()
        };
        assert!(entry.validate().is_ok());

        entry.message = "  ".into();
        assert!(matches!(
            entry.validate(),
            Err(SinkError::InvalidInput(_))
        ));
    }
}
