//! Lifecycle transitions over the HTTP surface.

mod common;

use axum::http::{Method, StatusCode};
use serde_json::json;

use common::{admit, request, test_app};

#[tokio::test]
async fn test_invalid_transition_from_pending() {
    let app = test_app(None, true);
    let id = admit(&app, "A", "m1").await;

    let (status, body) = request(
        &app,
        Method::PATCH,
        &format!("/log/A/{id}/in-progress"),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let message = body["error"].as_str().unwrap_or_default();
    assert!(message.contains("pending"), "error names current state: {message}");
    assert!(
        message.contains("open or revert"),
        "error names requested state: {message}"
    );
}

#[tokio::test]
async fn test_unknown_issue_is_404() {
    let app = test_app(None, false);
    let missing = uuid::Uuid::new_v4();
    for (method, path) in [
        (Method::PATCH, format!("/log/A/{missing}/in-progress")),
        (Method::PATCH, format!("/log/A/{missing}/revert")),
        (Method::PUT, format!("/log/A/{missing}")),
        (Method::DELETE, format!("/log/A/{missing}")),
    ] {
        let (status, _) = request(&app, method, &path, None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "path: {path}");
    }

    // Malformed ids cannot name an issue either.
    let (status, _) = request(
        &app,
        Method::PATCH,
        "/log/A/not-a-uuid/in-progress",
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_revert_round_trip_keeps_reopen_count() {
    let app = test_app(None, false);
    let id = admit(&app, "A", "m1").await;

    // in-progress -> done -> revert -> in-progress -> done
    request(&app, Method::PATCH, &format!("/log/A/{id}/in-progress"), None, None).await;
    request(
        &app,
        Method::PUT,
        &format!("/log/A/{id}"),
        None,
        Some(json!({"message": "first pass"})),
    )
    .await;
    let (status, body) = request(
        &app,
        Method::PATCH,
        &format!("/log/A/{id}/revert"),
        None,
        Some(json!({"revertReason": "broke prod"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["logged"]["revert_reason"], json!("broke prod"));

    let (status, _) = request(
        &app,
        Method::PATCH,
        &format!("/log/A/{id}/in-progress"),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = request(&app, Method::PUT, &format!("/log/A/{id}"), None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], json!("done"));
    // Revert is not a reopen.
    assert_eq!(body["logged"]["reopen_count"], json!(0));
}

#[tokio::test]
async fn test_done_from_open_without_claim() {
    let app = test_app(None, false);
    let id = admit(&app, "A", "m1").await;
    let (status, body) = request(&app, Method::PUT, &format!("/log/A/{id}"), None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], json!("done"));
}

#[tokio::test]
async fn test_revert_requires_done() {
    let app = test_app(None, false);
    let id = admit(&app, "A", "m1").await;
    let (status, _) = request(
        &app,
        Method::PATCH,
        &format!("/log/A/{id}/revert"),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_forced_reopen_merges_reject_reason() {
    let app = test_app(None, false);
    let id = admit(&app, "A", "m1").await;
    request(&app, Method::PUT, &format!("/log/A/{id}"), None, None).await;

    let (status, body) = request(
        &app,
        Method::POST,
        &format!("/log/A/{id}"),
        None,
        Some(json!({"rejectReason": "tests missing"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], json!("open"));
    assert_eq!(
        body["logged"]["context"]["reject_reason"],
        json!("tests missing")
    );
}

#[tokio::test]
async fn test_open_view_orders_revert_first() {
    let app = test_app(None, false);
    let open_id = admit(&app, "A", "plain open").await;
    let revert_id = admit(&app, "A", "will be reverted").await;
    request(&app, Method::PUT, &format!("/log/A/{revert_id}"), None, None).await;
    request(
        &app,
        Method::PATCH,
        &format!("/log/A/{revert_id}/revert"),
        None,
        None,
    )
    .await;

    let (status, body) = request(&app, Method::GET, "/log/A/open", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["totalLogs"], json!(2));
    assert_eq!(body["logs"][0]["id"].as_str(), Some(revert_id.as_str()));
    assert_eq!(body["logs"][0]["state"], json!("revert"));
    assert_eq!(body["logs"][1]["id"].as_str(), Some(open_id.as_str()));
}

#[tokio::test]
async fn test_state_scoped_listings() {
    let app = test_app(None, false);
    let a = admit(&app, "A", "first").await;
    let _b = admit(&app, "A", "second").await;
    request(&app, Method::PATCH, &format!("/log/A/{a}/in-progress"), None, None).await;

    let (_, body) = request(&app, Method::GET, "/log/A/in-progress", None, None).await;
    assert_eq!(body["totalLogs"], json!(1));
    assert_eq!(body["logs"][0]["id"].as_str(), Some(a.as_str()));

    let (_, body) = request(&app, Method::GET, "/log/A/done", None, None).await;
    assert_eq!(body["totalLogs"], json!(0));
}

#[tokio::test]
async fn test_statistics_counts_by_state() {
    let app = test_app(None, false);
    let a = admit(&app, "A", "first").await;
    admit(&app, "A", "second").await;
    request(&app, Method::PUT, &format!("/log/A/{a}"), None, None).await;

    let (status, body) = request(&app, Method::GET, "/log/A/statistics", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["statistics"]["total"], json!(2));
    assert_eq!(body["statistics"]["open"], json!(1));
    assert_eq!(body["statistics"]["done"], json!(1));
}

#[tokio::test]
async fn test_plan_and_issue_fields_updates() {
    let app = test_app(None, false);
    let id = admit(&app, "A", "m1").await;

    let (status, body) = request(
        &app,
        Method::PATCH,
        &format!("/log/A/{id}/plan"),
        None,
        Some(json!({"plan": "bisect the release"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["logged"]["plan"], json!("bisect the release"));

    let (status, body) = request(
        &app,
        Method::PATCH,
        &format!("/log/A/{id}/issue-fields"),
        None,
        Some(json!({"type": "bugfix", "effort": "high"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["logged"]["issue_type"], json!("bugfix"));
    assert_eq!(body["logged"]["effort"], json!("high"));
    // Earlier fields survive a partial update.
    assert_eq!(body["logged"]["plan"], json!("bisect the release"));

    let (status, _) = request(
        &app,
        Method::PATCH,
        &format!("/log/A/{id}/plan"),
        None,
        Some(json!({"plan": ""})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_purge_all_and_closed() {
    let app = test_app(None, false);
    let a = admit(&app, "A", "first").await;
    admit(&app, "A", "second").await;
    request(&app, Method::DELETE, &format!("/log/A/{a}"), None, None).await;

    let (status, body) = request(&app, Method::DELETE, "/log/A/closed", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deleted"], json!(1));

    let (status, body) = request(&app, Method::DELETE, "/log/A", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deleted"], json!(1));

    let (_, body) = request(&app, Method::GET, "/log/A", None, None).await;
    assert_eq!(body["totalLogs"], json!(0));
}
