//! Handlers for the cleanup, embedding, health, and API-description
//! surfaces.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use logsink_core::SinkError;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use super::error::ApiError;
use super::ApiJson;
use crate::state::AppState;

type HandlerResult = Result<Json<Value>, ApiError>;

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value, ApiError> {
    serde_json::to_value(value)
        .map_err(|e| ApiError(SinkError::Internal(format!("serialize response: {e}"))))
}

/// `GET /cleanup/status`
pub async fn cleanup_status(State(state): State<Arc<AppState>>) -> HandlerResult {
    Ok(Json(to_json(&state.cleanup.status())?))
}

/// `GET /cleanup/config`
pub async fn cleanup_config(State(state): State<Arc<AppState>>) -> HandlerResult {
    Ok(Json(to_json(state.cleanup.config())?))
}

/// `POST /cleanup/run` — explicit trigger; 409 when a run is in
/// flight.
pub async fn cleanup_run(State(state): State<Arc<AppState>>) -> HandlerResult {
    let report = state.cleanup.run().await?;
    Ok(Json(json!({"success": true, "report": to_json(&report)?})))
}

/// `GET /embedding/status`
pub async fn embedding_status(State(state): State<Arc<AppState>>) -> HandlerResult {
    Ok(Json(to_json(&state.embedding.status()?)?))
}

/// `GET /embedding/pending` — the oldest entries in the queue.
pub async fn embedding_pending(State(state): State<Arc<AppState>>) -> HandlerResult {
    let total = state.store.pending_count()?;
    let logs = state.store.list_pending(50)?;
    Ok(Json(json!({
        "totalPending": total,
        "logs": to_json(&logs)?,
    })))
}

/// `POST /embedding/process` — force one worker tick; 409 when busy.
pub async fn embedding_process(State(state): State<Arc<AppState>>) -> HandlerResult {
    let summary = state.embedding.tick().await?;
    Ok(Json(json!({"success": true, "summary": to_json(&summary)?})))
}

/// `POST /embedding/process/:log_id` — process one pending issue.
pub async fn embedding_process_one(
    State(state): State<Arc<AppState>>,
    Path(log_id): Path<String>,
) -> HandlerResult {
    let id = Uuid::parse_str(&log_id).map_err(|_| ApiError(SinkError::not_found("log")))?;
    let outcome = state.embedding.process_single(id).await?;
    Ok(Json(json!({"success": true, "result": to_json(&outcome)?})))
}

/// Query string of `GET /embedding/similar/:app/:id`.
#[derive(Deserialize)]
pub struct LimitQuery {
    limit: Option<usize>,
}

fn neighbors_json(neighbors: Vec<crate::store::Neighbor>) -> Result<Vec<Value>, ApiError> {
    neighbors
        .into_iter()
        .map(|n| {
            let mut value = to_json(&n.issue)?;
            value["similarity"] = json!(n.similarity);
            Ok(value)
        })
        .collect()
}

/// `GET /embedding/similar/:app/:id?limit` — nearest neighbors of a
/// stored issue.
pub async fn embedding_similar(
    State(state): State<Arc<AppState>>,
    Path((app, id)): Path<(String, String)>,
    Query(query): Query<LimitQuery>,
) -> HandlerResult {
    let id = Uuid::parse_str(&id).map_err(|_| ApiError(SinkError::not_found("log")))?;
    let limit = query.limit.unwrap_or(5).clamp(1, 50);
    let neighbors = state.embedding.similar_to(&app, id, limit).await?;
    Ok(Json(json!({
        "applicationId": app,
        "similar": neighbors_json(neighbors)?,
    })))
}

/// Body of `POST /embedding/search/:app`.
#[derive(Deserialize)]
pub struct SearchRequest {
    text: Option<String>,
    limit: Option<usize>,
}

/// `POST /embedding/search/:app` — free-text similarity search.
pub async fn embedding_search(
    State(state): State<Arc<AppState>>,
    Path(app): Path<String>,
    ApiJson(body): ApiJson<SearchRequest>,
) -> HandlerResult {
    let text = body
        .text
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| ApiError(SinkError::invalid("text is required")))?;
    let limit = body.limit.unwrap_or(10).clamp(1, 50);
    let neighbors = state.embedding.search(&app, &text, limit).await?;
    Ok(Json(json!({
        "applicationId": app,
        "results": neighbors_json(neighbors)?,
    })))
}

/// `GET /health` — unauthenticated liveness probe.
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "logsink",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// `GET /openapi.json` — unauthenticated machine-readable API
/// description.
pub async fn openapi() -> Json<Value> {
    Json(json!({
        "openapi": "3.0.3",
        "info": {
            "title": "logsink",
            "description": "Issue-sink service: admits application errors, deduplicates them, and drives them through a resolution workflow.",
            "version": env!("CARGO_PKG_VERSION"),
        },
        "components": {
            "securitySchemes": {
                "apiKey": {"type": "apiKey", "in": "header", "name": "X-API-Key"},
                "bearer": {"type": "http", "scheme": "bearer"},
            }
        },
        "security": [{"apiKey": []}, {"bearer": []}],
        "paths": {
            "/log": {
                "post": {"summary": "Admit a log entry", "responses": {
                    "200": {"description": "Created or reopened"},
                    "400": {"description": "Validation failure"},
                    "403": {"description": "Blocked by blacklist"},
                }},
            },
            "/log/{app}": {
                "get": {"summary": "All issues for an application"},
                "delete": {"summary": "Purge all issues"},
            },
            "/log/{app}/open": {"get": {"summary": "Open and revert issues, revert first"}},
            "/log/{app}/pending": {"get": {"summary": "Issues awaiting deduplication"}},
            "/log/{app}/in-progress": {"get": {"summary": "Claimed issues"}},
            "/log/{app}/done": {"get": {"summary": "Resolved issues"}},
            "/log/{app}/closed": {"delete": {"summary": "Purge closed issues"}},
            "/log/{app}/statistics": {"get": {"summary": "Counts grouped by state"}},
            "/log/{app}/img/{filename}": {"get": {"summary": "Stream a stored screenshot"}},
            "/log/{app}/{id}": {
                "put": {"summary": "Mark done"},
                "post": {"summary": "Forced reopen"},
                "delete": {"summary": "Close"},
            },
            "/log/{app}/{id}/in-progress": {"patch": {"summary": "Start progress"}},
            "/log/{app}/{id}/revert": {"patch": {"summary": "Revert a completed fix"}},
            "/log/{app}/{id}/plan": {"patch": {"summary": "Record the worker plan"}},
            "/log/{app}/{id}/issue-fields": {"patch": {"summary": "Update issue-management fields"}},
            "/blacklist": {
                "get": {"summary": "List patterns"},
                "post": {"summary": "Create a pattern"},
                "delete": {"summary": "Remove every pattern"},
            },
            "/blacklist/{id}": {
                "put": {"summary": "Update a pattern"},
                "delete": {"summary": "Remove a pattern"},
            },
            "/blacklist/test": {"post": {"summary": "Probe a message against the blacklist"}},
            "/blacklist/statistics": {"get": {"summary": "Pattern counts"}},
            "/blacklist/refresh": {"post": {"summary": "Force a cache rebuild"}},
            "/cleanup/status": {"get": {"summary": "Cleanup scheduler status"}},
            "/cleanup/config": {"get": {"summary": "Cleanup configuration"}},
            "/cleanup/run": {"post": {"summary": "Trigger a cleanup run"}},
            "/embedding/status": {"get": {"summary": "Embedding worker status"}},
            "/embedding/pending": {"get": {"summary": "Pending queue"}},
            "/embedding/process": {"post": {"summary": "Trigger a worker tick"}},
            "/embedding/process/{logId}": {"post": {"summary": "Process one pending issue"}},
            "/embedding/similar/{app}/{id}": {"get": {"summary": "Nearest neighbors of an issue"}},
            "/embedding/search/{app}": {"post": {"summary": "Free-text similarity search"}},
            "/health": {"get": {"summary": "Liveness probe", "security": []}},
            "/openapi.json": {"get": {"summary": "This document", "security": []}},
        },
    }))
}
