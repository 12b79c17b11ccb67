//! Handlers for the `/blacklist` surface.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use logsink_core::blacklist::PatternType;
use logsink_core::SinkError;
use serde::Deserialize;
use serde_json::{json, Value};

use super::error::ApiError;
use super::ApiJson;
use crate::state::AppState;

type HandlerResult = Result<Json<Value>, ApiError>;

/// Query string of `GET /blacklist`.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    application_id: Option<String>,
}

/// `GET /blacklist[?applicationId]` — list patterns, optionally scoped.
pub async fn list(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> HandlerResult {
    let patterns = state.store.list_patterns(query.application_id.as_deref())?;
    Ok(Json(json!({
        "total": patterns.len(),
        "patterns": patterns,
    })))
}

/// Body of `POST /blacklist` and `PUT /blacklist/:id`.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternRequest {
    pattern: Option<String>,
    pattern_type: Option<PatternType>,
    application_id: Option<String>,
    reason: Option<String>,
}

impl PatternRequest {
    fn validated(self) -> Result<(String, PatternType, Option<String>, Option<String>), ApiError> {
        let pattern = self
            .pattern
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| ApiError(SinkError::invalid("pattern is required")))?;
        let pattern_type = self
            .pattern_type
            .ok_or_else(|| ApiError(SinkError::invalid("patternType is required")))?;
        Ok((pattern, pattern_type, self.application_id, self.reason))
    }
}

/// `POST /blacklist` — create a pattern. Duplicate `(pattern, scope)`
/// yields 409.
pub async fn create(
    State(state): State<Arc<AppState>>,
    ApiJson(body): ApiJson<PatternRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let (pattern, pattern_type, application_id, reason) = body.validated()?;
    let (stored, auto_deleted) = state.blacklist.add_pattern(
        &pattern,
        pattern_type,
        application_id.as_deref(),
        reason.as_deref(),
    )?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "pattern": stored,
            "autoDeleted": auto_deleted,
        })),
    ))
}

/// `PUT /blacklist/:id` — update a pattern in place.
pub async fn update(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    ApiJson(body): ApiJson<PatternRequest>,
) -> HandlerResult {
    let (pattern, pattern_type, application_id, reason) = body.validated()?;
    let (stored, auto_deleted) = state.blacklist.update_pattern(
        id,
        &pattern,
        pattern_type,
        application_id.as_deref(),
        reason.as_deref(),
    )?;
    Ok(Json(json!({
        "success": true,
        "pattern": stored,
        "autoDeleted": auto_deleted,
    })))
}

/// `DELETE /blacklist/:id`
pub async fn remove(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> HandlerResult {
    state.blacklist.delete_pattern(id)?;
    Ok(Json(json!({"success": true})))
}

/// `DELETE /blacklist` — remove every pattern.
pub async fn clear(State(state): State<Arc<AppState>>) -> HandlerResult {
    let deleted = state.blacklist.clear()?;
    Ok(Json(json!({"success": true, "deleted": deleted})))
}

/// Body of `POST /blacklist/test`.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRequest {
    message: Option<String>,
    application_id: Option<String>,
}

/// `POST /blacklist/test` — probe a message against the live cache;
/// consistent with admission blocking by construction.
pub async fn test(
    State(state): State<Arc<AppState>>,
    ApiJson(body): ApiJson<TestRequest>,
) -> HandlerResult {
    let message = body
        .message
        .filter(|m| !m.is_empty())
        .ok_or_else(|| ApiError(SinkError::invalid("message is required")))?;
    let app = body.application_id.unwrap_or_default();

    match state.blacklist.check(&message, &app)? {
        Some(hit) => Ok(Json(json!({
            "isBlacklisted": true,
            "pattern": hit.pattern,
            "reason": hit.reason,
        }))),
        None => Ok(Json(json!({"isBlacklisted": false}))),
    }
}

/// `GET /blacklist/statistics` — counts by type and scope.
pub async fn statistics(State(state): State<Arc<AppState>>) -> HandlerResult {
    let patterns = state.store.list_patterns(None)?;
    let mut exact = 0u32;
    let mut substring = 0u32;
    let mut regex = 0u32;
    let mut global = 0u32;
    for pattern in &patterns {
        match pattern.pattern_type {
            PatternType::Exact => exact += 1,
            PatternType::Substring => substring += 1,
            PatternType::Regex => regex += 1,
        }
        if pattern.application_id.is_none() {
            global += 1;
        }
    }
    Ok(Json(json!({
        "total": patterns.len(),
        "byType": {"exact": exact, "substring": substring, "regex": regex},
        "global": global,
        "applicationScoped": patterns.len() as u32 - global,
    })))
}

/// `POST /blacklist/refresh` — force a cache rebuild.
pub async fn refresh(State(state): State<Arc<AppState>>) -> HandlerResult {
    let set = state.blacklist.refresh()?;
    Ok(Json(json!({"success": true, "patterns": set.len()})))
}
