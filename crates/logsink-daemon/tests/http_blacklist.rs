//! Blacklist CRUD and probe surface.

mod common;

use axum::http::{Method, StatusCode};
use serde_json::json;

use common::{request, test_app};

#[tokio::test]
async fn test_crud_round_trip() {
    let app = test_app(None, false);

    let (status, body) = request(
        &app,
        Method::POST,
        "/blacklist",
        None,
        Some(json!({
            "pattern": "heartbeat",
            "patternType": "substring",
            "applicationId": "A",
            "reason": "monitoring noise",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = body["pattern"]["id"].as_i64().expect("pattern id");
    assert_eq!(body["pattern"]["application_id"], json!("A"));

    let (_, listed) = request(&app, Method::GET, "/blacklist", None, None).await;
    assert_eq!(listed["total"], json!(1));

    let (status, body) = request(
        &app,
        Method::PUT,
        &format!("/blacklist/{id}"),
        None,
        Some(json!({"pattern": "keepalive", "patternType": "exact"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["pattern"]["pattern"], json!("keepalive"));
    assert_eq!(body["pattern"]["application_id"], json!(null));

    let (status, _) = request(
        &app,
        Method::DELETE,
        &format!("/blacklist/{id}"),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, listed) = request(&app, Method::GET, "/blacklist", None, None).await;
    assert_eq!(listed["total"], json!(0));
}

#[tokio::test]
async fn test_duplicate_pattern_conflict() {
    let app = test_app(None, false);
    let body = json!({"pattern": "spam", "patternType": "substring"});

    let (status, _) = request(&app, Method::POST, "/blacklist", None, Some(body.clone())).await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, response) = request(&app, Method::POST, "/blacklist", None, Some(body)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(response["error"].is_string());
}

#[tokio::test]
async fn test_missing_fields_rejected() {
    let app = test_app(None, false);
    let (status, _) = request(
        &app,
        Method::POST,
        "/blacklist",
        None,
        Some(json!({"patternType": "substring"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = request(
        &app,
        Method::POST,
        "/blacklist",
        None,
        Some(json!({"pattern": "x", "patternType": "nonsense"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unknown_pattern_404() {
    let app = test_app(None, false);
    let (status, _) = request(&app, Method::DELETE, "/blacklist/999", None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = request(
        &app,
        Method::PUT,
        "/blacklist/999",
        None,
        Some(json!({"pattern": "x", "patternType": "exact"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_scoped_listing_includes_global() {
    let app = test_app(None, false);
    request(
        &app,
        Method::POST,
        "/blacklist",
        None,
        Some(json!({"pattern": "global noise", "patternType": "substring"})),
    )
    .await;
    request(
        &app,
        Method::POST,
        "/blacklist",
        None,
        Some(json!({"pattern": "app noise", "patternType": "substring", "applicationId": "A"})),
    )
    .await;
    request(
        &app,
        Method::POST,
        "/blacklist",
        None,
        Some(json!({"pattern": "other noise", "patternType": "substring", "applicationId": "B"})),
    )
    .await;

    let (_, body) = request(&app, Method::GET, "/blacklist?applicationId=A", None, None).await;
    assert_eq!(body["total"], json!(2));

    let (_, body) = request(&app, Method::GET, "/blacklist", None, None).await;
    assert_eq!(body["total"], json!(3));
}

#[tokio::test]
async fn test_statistics_and_refresh() {
    let app = test_app(None, false);
    request(
        &app,
        Method::POST,
        "/blacklist",
        None,
        Some(json!({"pattern": "a", "patternType": "exact"})),
    )
    .await;
    request(
        &app,
        Method::POST,
        "/blacklist",
        None,
        Some(json!({"pattern": "b", "patternType": "regex", "applicationId": "A"})),
    )
    .await;

    let (status, body) = request(&app, Method::GET, "/blacklist/statistics", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], json!(2));
    assert_eq!(body["byType"]["exact"], json!(1));
    assert_eq!(body["byType"]["regex"], json!(1));
    assert_eq!(body["global"], json!(1));

    let (status, body) = request(&app, Method::POST, "/blacklist/refresh", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["patterns"], json!(2));
}

#[tokio::test]
async fn test_clear_removes_everything() {
    let app = test_app(None, false);
    for pattern in ["one", "two", "three"] {
        request(
            &app,
            Method::POST,
            "/blacklist",
            None,
            Some(json!({"pattern": pattern, "patternType": "exact"})),
        )
        .await;
    }

    let (status, body) = request(&app, Method::DELETE, "/blacklist", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deleted"], json!(3));

    // Admission goes through again.
    let (status, _) = request(
        &app,
        Method::POST,
        "/log",
        None,
        Some(json!({"applicationId": "A", "message": "one"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}
