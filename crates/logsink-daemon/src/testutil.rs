//! Shared helpers for unit tests.

use chrono::Utc;
use logsink_core::issue::{Issue, IssueState};
use serde_json::Map;
use uuid::Uuid;

/// Builds a bare issue in the given state.
pub fn make_issue(app: &str, message: &str, state: IssueState) -> Issue {
    let now = Utc::now();
    Issue {
        id: Uuid::new_v4(),
        application_id: app.to_string(),
        timestamp: now,
        message: message.to_string(),
        context: Map::new(),
        screenshots: Vec::new(),
        state,
        reopen_count: 0,
        plan: None,
        issue_type: None,
        effort: None,
        llm_output: None,
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
    }
}
