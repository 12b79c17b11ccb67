//! HTTP surface.
//!
//! One router over the shared [`AppState`]. Every route except
//! `/health` and `/openapi.json` sits behind the API-key middleware.
//! Handlers stay thin: parse, call into the engines, serialize.

pub mod blacklist;
pub mod error;
pub mod logs;
pub mod system;

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderValue, Method};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{delete, get, patch, post, put};
use axum::Router;
use logsink_core::config::CorsConfig;
use logsink_core::SinkError;
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use crate::state::AppState;
use error::ApiError;

/// JSON extractor that renders malformed bodies as the taxonomy's
/// `invalid-input` instead of axum's default rejection.
pub struct ApiJson<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for ApiJson<T>
where
    axum::Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match axum::Json::<T>::from_request(req, state).await {
            Ok(axum::Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(ApiError(SinkError::invalid(rejection.body_text()))),
        }
    }
}

/// API-key middleware: `X-API-Key: <key>` or
/// `Authorization: Bearer <key>`. When no key is configured, auth is
/// disabled.
async fn require_api_key(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = &state.config.server.api_key else {
        return Ok(next.run(req).await);
    };

    let headers = req.headers();
    let presented = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| {
            headers
                .get(AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(str::to_string)
        });

    match presented {
        Some(key) if key == *expected => Ok(next.run(req).await),
        _ => Err(ApiError(SinkError::Unauthenticated)),
    }
}

fn cors_layer(config: &CorsConfig) -> CorsLayer {
    let mut layer = CorsLayer::new();
    layer = if config.origin == "*" {
        layer.allow_origin(Any)
    } else {
        match config.origin.parse::<HeaderValue>() {
            Ok(origin) => layer.allow_origin(origin),
            Err(_) => {
                warn!(origin = %config.origin, "unparseable CORS origin, allowing any");
                layer.allow_origin(Any)
            },
        }
    };

    let methods: Vec<Method> = config
        .methods
        .iter()
        .filter_map(|m| m.parse().ok())
        .collect();
    layer = if methods.is_empty() {
        layer.allow_methods(Any)
    } else {
        layer.allow_methods(methods)
    };

    let headers: Vec<axum::http::HeaderName> = config
        .headers
        .iter()
        .filter_map(|h| h.parse().ok())
        .collect();
    if headers.is_empty() {
        layer.allow_headers(Any)
    } else {
        layer.allow_headers(headers)
    }
}

/// Builds the full router.
pub fn router(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route("/log", post(logs::admit))
        .route("/log/:app", get(logs::list_all).delete(logs::purge_all))
        .route("/log/:app/closed", delete(logs::purge_closed))
        .route("/log/:app/open", get(logs::list_open))
        .route("/log/:app/pending", get(logs::list_pending))
        .route("/log/:app/in-progress", get(logs::list_in_progress))
        .route("/log/:app/done", get(logs::list_done))
        .route("/log/:app/statistics", get(logs::statistics))
        .route("/log/:app/img/:filename", get(logs::serve_image))
        .route(
            "/log/:app/:id",
            put(logs::set_done).post(logs::reopen).delete(logs::close),
        )
        .route("/log/:app/:id/in-progress", patch(logs::start_progress))
        .route("/log/:app/:id/revert", patch(logs::revert))
        .route("/log/:app/:id/plan", patch(logs::set_plan))
        .route("/log/:app/:id/issue-fields", patch(logs::set_issue_fields))
        .route(
            "/blacklist",
            get(blacklist::list)
                .post(blacklist::create)
                .delete(blacklist::clear),
        )
        .route("/blacklist/test", post(blacklist::test))
        .route("/blacklist/statistics", get(blacklist::statistics))
        .route("/blacklist/refresh", post(blacklist::refresh))
        .route(
            "/blacklist/:id",
            put(blacklist::update).delete(blacklist::remove),
        )
        .route("/cleanup/status", get(system::cleanup_status))
        .route("/cleanup/config", get(system::cleanup_config))
        .route("/cleanup/run", post(system::cleanup_run))
        .route("/embedding/status", get(system::embedding_status))
        .route("/embedding/pending", get(system::embedding_pending))
        .route("/embedding/process", post(system::embedding_process))
        .route(
            "/embedding/process/:log_id",
            post(system::embedding_process_one),
        )
        .route(
            "/embedding/similar/:app/:id",
            get(system::embedding_similar),
        )
        .route("/embedding/search/:app", post(system::embedding_search))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            require_api_key,
        ));

    Router::new()
        .route("/health", get(system::health))
        .route("/openapi.json", get(system::openapi))
        .merge(protected)
        .layer(cors_layer(&state.config.cors))
        .with_state(state)
}
