//! Shared helpers for HTTP-level integration tests.

// Each test binary compiles this module separately and uses a subset.
#![allow(dead_code)]

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use logsink_core::Config;
use logsink_daemon::http;
use logsink_daemon::store::Store;
use logsink_daemon::AppState;
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

/// A daemon wired against an in-memory store and a scratch image
/// directory.
pub struct TestApp {
    pub state: Arc<AppState>,
    pub router: Router,
    pub images_dir: TempDir,
}

pub fn test_app(api_key: Option<&str>, embedding_enabled: bool) -> TestApp {
    let images_dir = TempDir::new().expect("temp dir");
    let mut config = Config::default();
    config.server.api_key = api_key.map(str::to_string);
    config.storage.images_dir = images_dir.path().to_path_buf();
    config.embedding.enabled = embedding_enabled;

    let store = Store::open_in_memory().expect("in-memory store");
    let state = AppState::build_with_store(config, store).expect("app state");
    let router = http::router(Arc::clone(&state));
    TestApp {
        state,
        router,
        images_dir,
    }
}

/// Sends one JSON request through the router and returns status plus
/// parsed body.
pub async fn request(
    app: &TestApp,
    method: Method,
    path: &str,
    api_key: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(path);
    if let Some(key) = api_key {
        builder = builder.header("x-api-key", key);
    }
    let request = match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .expect("request"),
        None => builder.body(Body::empty()).expect("request"),
    };

    let response = app
        .router
        .clone()
        .oneshot(request)
        .await
        .expect("router response");
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body");
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

/// Admits one entry and returns the created issue's id.
pub async fn admit(app: &TestApp, application_id: &str, message: &str) -> String {
    let (status, body) = request(
        app,
        Method::POST,
        "/log",
        None,
        Some(serde_json::json!({"applicationId": application_id, "message": message})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "admission failed: {body}");
    body["logged"]["id"]
        .as_str()
        .expect("issue id in response")
        .to_string()
}
