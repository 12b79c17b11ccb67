//! Handlers for the `/log` surface.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use logsink_core::issue::{Completion, Effort, Issue, IssueState, IssueType, NewIssue};
use logsink_core::SinkError;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use super::error::ApiError;
use super::ApiJson;
use crate::admission::AdmissionOutcome;
use crate::state::AppState;

type HandlerResult = Result<Json<Value>, ApiError>;

/// Serializes an issue together with its duplicate edges.
fn issue_view(state: &AppState, issue: &Issue) -> Result<Value, ApiError> {
    let mut value = serde_json::to_value(issue)
        .map_err(|e| ApiError(SinkError::Internal(format!("serialize issue: {e}"))))?;
    let edges = state.store.list_duplicates(issue.id)?;
    value["duplicates"] = serde_json::to_value(edges)
        .map_err(|e| ApiError(SinkError::Internal(format!("serialize edges: {e}"))))?;
    Ok(value)
}

fn listing(state: &AppState, app: &str, issues: &[Issue]) -> HandlerResult {
    let logs = issues
        .iter()
        .map(|issue| issue_view(state, issue))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Json(json!({
        "applicationId": app,
        "totalLogs": logs.len(),
        "logs": logs,
    })))
}

fn parse_id(raw: &str) -> Result<Uuid, ApiError> {
    // An unparseable id can't name any issue.
    Uuid::parse_str(raw).map_err(|_| ApiError(SinkError::not_found("log")))
}

/// Body of `POST /log`.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmitRequest {
    application_id: Option<String>,
    message: Option<String>,
    timestamp: Option<DateTime<Utc>>,
    context: Option<Map<String, Value>>,
    #[serde(rename = "type")]
    issue_type: Option<IssueType>,
    effort: Option<Effort>,
    plan: Option<String>,
    llm_output: Option<String>,
}

/// `POST /log` — admit a log entry.
pub async fn admit(
    State(state): State<Arc<AppState>>,
    ApiJson(body): ApiJson<AdmitRequest>,
) -> HandlerResult {
    let entry = NewIssue {
        application_id: body.application_id.unwrap_or_default(),
        message: body.message.unwrap_or_default(),
        timestamp: body.timestamp,
        context: body.context.unwrap_or_default(),
        issue_type: body.issue_type,
        effort: body.effort,
        plan: body.plan,
        llm_output: body.llm_output,
    };

    match state.admission.admit(entry)? {
        AdmissionOutcome::Created(issue) => Ok(Json(json!({
            "success": true,
            "logged": issue_view(&state, &issue)?,
            "deduplicated": false,
            "action": "created_new",
        }))),
        AdmissionOutcome::Reopened(issue) => Ok(Json(json!({
            "success": true,
            "logged": issue_view(&state, &issue)?,
            "deduplicated": true,
            "action": "reopened_existing",
        }))),
        AdmissionOutcome::Blocked(hit) => Err(ApiError(SinkError::Blocked {
            pattern: hit.pattern,
            reason: hit.reason,
        })),
    }
}

/// `GET /log/:app` — every issue, newest first.
pub async fn list_all(
    State(state): State<Arc<AppState>>,
    Path(app): Path<String>,
) -> HandlerResult {
    let issues = state.store.list_issues(&app)?;
    listing(&state, &app, &issues)
}

/// `GET /log/:app/open` — the worker view: `revert` first, then
/// `open`.
pub async fn list_open(
    State(state): State<Arc<AppState>>,
    Path(app): Path<String>,
) -> HandlerResult {
    let issues = state.store.list_actionable(&app)?;
    listing(&state, &app, &issues)
}

/// `GET /log/:app/pending`
pub async fn list_pending(
    State(state): State<Arc<AppState>>,
    Path(app): Path<String>,
) -> HandlerResult {
    let issues = state
        .store
        .list_issues_in_state(&app, IssueState::Pending)?;
    listing(&state, &app, &issues)
}

/// `GET /log/:app/in-progress`
pub async fn list_in_progress(
    State(state): State<Arc<AppState>>,
    Path(app): Path<String>,
) -> HandlerResult {
    let issues = state
        .store
        .list_issues_in_state(&app, IssueState::InProgress)?;
    listing(&state, &app, &issues)
}

/// `GET /log/:app/done`
pub async fn list_done(
    State(state): State<Arc<AppState>>,
    Path(app): Path<String>,
) -> HandlerResult {
    let issues = state.store.list_issues_in_state(&app, IssueState::Done)?;
    listing(&state, &app, &issues)
}

/// `GET /log/:app/statistics` — counts grouped by state.
pub async fn statistics(
    State(state): State<Arc<AppState>>,
    Path(app): Path<String>,
) -> HandlerResult {
    let counts = state.store.count_by_state(&app)?;
    Ok(Json(json!({
        "applicationId": app,
        "statistics": counts,
    })))
}

/// `PATCH /log/:app/:id/in-progress` — a worker claims the issue.
pub async fn start_progress(
    State(state): State<Arc<AppState>>,
    Path((app, id)): Path<(String, String)>,
) -> HandlerResult {
    let issue = state.lifecycle.start_progress(&app, parse_id(&id)?)?;
    Ok(Json(json!({
        "success": true,
        "state": "in_progress",
        "logged": issue_view(&state, &issue)?,
    })))
}

/// Body of `PUT /log/:app/:id`.
#[derive(Deserialize)]
pub struct DoneRequest {
    message: Option<String>,
    error: Option<String>,
    #[serde(alias = "gitCommit")]
    git_commit: Option<String>,
    statistics: Option<Value>,
}

/// `PUT /log/:app/:id` — mark done.
pub async fn set_done(
    State(state): State<Arc<AppState>>,
    Path((app, id)): Path<(String, String)>,
    body: Option<ApiJson<DoneRequest>>,
) -> HandlerResult {
    let completion = body.map_or_else(Completion::default, |ApiJson(body)| Completion {
        llm_message: body.message.or(body.error),
        git_commit: body.git_commit,
        statistics: body.statistics,
    });
    let issue = state.lifecycle.set_done(&app, parse_id(&id)?, completion)?;
    Ok(Json(json!({
        "success": true,
        "state": "done",
        "logged": issue_view(&state, &issue)?,
    })))
}

/// Body of `PATCH /log/:app/:id/revert`.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevertRequest {
    revert_reason: Option<String>,
}

/// `PATCH /log/:app/:id/revert` — `done → revert`.
pub async fn revert(
    State(state): State<Arc<AppState>>,
    Path((app, id)): Path<(String, String)>,
    body: Option<ApiJson<RevertRequest>>,
) -> HandlerResult {
    let reason = body.and_then(|ApiJson(body)| body.revert_reason);
    let issue = state.lifecycle.revert(&app, parse_id(&id)?, reason)?;
    Ok(Json(json!({
        "success": true,
        "state": "revert",
        "logged": issue_view(&state, &issue)?,
    })))
}

/// Body of `POST /log/:app/:id`.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReopenRequest {
    reject_reason: Option<String>,
}

/// `POST /log/:app/:id` — forced reopen.
pub async fn reopen(
    State(state): State<Arc<AppState>>,
    Path((app, id)): Path<(String, String)>,
    body: Option<ApiJson<ReopenRequest>>,
) -> HandlerResult {
    let reason = body.and_then(|ApiJson(body)| body.reject_reason);
    let issue = state.lifecycle.reopen(&app, parse_id(&id)?, reason)?;
    Ok(Json(json!({
        "success": true,
        "state": "open",
        "logged": issue_view(&state, &issue)?,
    })))
}

/// `DELETE /log/:app/:id` — close the issue and drop its screenshots.
pub async fn close(
    State(state): State<Arc<AppState>>,
    Path((app, id)): Path<(String, String)>,
) -> HandlerResult {
    state.lifecycle.close(&app, parse_id(&id)?)?;
    Ok(Json(json!({"success": true, "state": "closed"})))
}

/// `DELETE /log/:app` — purge every issue of an application.
pub async fn purge_all(
    State(state): State<Arc<AppState>>,
    Path(app): Path<String>,
) -> HandlerResult {
    let deleted = state.lifecycle.purge_all(&app)?;
    Ok(Json(json!({"success": true, "deleted": deleted})))
}

/// `DELETE /log/:app/closed` — purge only closed issues.
pub async fn purge_closed(
    State(state): State<Arc<AppState>>,
    Path(app): Path<String>,
) -> HandlerResult {
    let deleted = state.lifecycle.purge_closed(&app)?;
    Ok(Json(json!({"success": true, "deleted": deleted})))
}

/// Body of `PATCH /log/:app/:id/plan`.
#[derive(Deserialize)]
pub struct PlanRequest {
    plan: String,
}

/// `PATCH /log/:app/:id/plan` — record the worker plan.
pub async fn set_plan(
    State(state): State<Arc<AppState>>,
    Path((app, id)): Path<(String, String)>,
    ApiJson(body): ApiJson<PlanRequest>,
) -> HandlerResult {
    if body.plan.trim().is_empty() {
        return Err(ApiError(SinkError::invalid("plan is required")));
    }
    let issue = state.lifecycle.set_plan(&app, parse_id(&id)?, body.plan)?;
    Ok(Json(json!({
        "success": true,
        "logged": issue_view(&state, &issue)?,
    })))
}

/// Body of `PATCH /log/:app/:id/issue-fields`.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueFieldsRequest {
    #[serde(rename = "type")]
    issue_type: Option<IssueType>,
    effort: Option<Effort>,
    plan: Option<String>,
    llm_output: Option<String>,
}

/// `PATCH /log/:app/:id/issue-fields` — partial update of the
/// issue-management fields.
pub async fn set_issue_fields(
    State(state): State<Arc<AppState>>,
    Path((app, id)): Path<(String, String)>,
    ApiJson(body): ApiJson<IssueFieldsRequest>,
) -> HandlerResult {
    let issue = state.lifecycle.set_issue_fields(
        &app,
        parse_id(&id)?,
        body.issue_type,
        body.effort,
        body.plan,
        body.llm_output,
    )?;
    Ok(Json(json!({
        "success": true,
        "logged": issue_view(&state, &issue)?,
    })))
}

fn content_type_for(filename: &str) -> &'static str {
    match filename.rsplit('.').next() {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    }
}

/// `GET /log/:app/img/:filename` — stream a stored screenshot. The
/// filename must carry the application's image prefix, which also rules
/// out path traversal.
pub async fn serve_image(
    State(state): State<Arc<AppState>>,
    Path((app, filename)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    if !filename.starts_with(&format!("{app}-img-"))
        || filename.contains('/')
        || filename.contains('\\')
        || filename.contains("..")
    {
        return Err(ApiError(SinkError::invalid("invalid image filename")));
    }
    let bytes = state.images.read(&filename)?;
    Ok((
        [(CONTENT_TYPE, content_type_for(&filename))],
        bytes,
    )
        .into_response())
}
