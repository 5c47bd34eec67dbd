//! Integration tests for the local HTTP API.
//! Tests auth + tier gating, workflow command routes, the public session
//! status route, and the auto-pause behavior when the driver is unreachable.

use approvion::api::app;
use approvion::config::AppConfig;
use approvion::state::{ApiState, AppState};
use axum::http::StatusCode;
use std::time::Duration;
use tower::ServiceExt;

/// Config pointing the driver at a dead endpoint so runs auto-pause fast.
fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.driver.endpoint = "http://127.0.0.1:1".to_string();
    config.driver.ready_timeout_ms = 100;
    config.workflow.inter_item_delay_ms = 1;
    config.workflow.pause_poll_ms = 5;
    config.workflow.item_timeout_ms = 500;
    config
}

fn make_state() -> ApiState {
    AppState::new(test_config())
}

fn json_body(val: &serde_json::Value) -> axum::body::Body {
    axum::body::Body::from(serde_json::to_vec(val).unwrap())
}

async fn send(
    state: &ApiState,
    method: &str,
    uri: &str,
    token: Option<&str>,
    body: Option<serde_json::Value>,
) -> (StatusCode, serde_json::Value) {
    let mut builder = axum::http::Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {}", token));
    }
    let req = match body {
        Some(v) => builder
            .header("content-type", "application/json")
            .body(json_body(&v))
            .unwrap(),
        None => builder.body(axum::body::Body::empty()).unwrap(),
    };

    let res = app(state.clone()).oneshot(req).await.unwrap();
    let status = res.status();
    let bytes = axum::body::to_bytes(res.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, json)
}

/// Verify both tiers for a fresh session and return its token.
async fn login(state: &ApiState) -> String {
    let (status, body) = send(
        state,
        "POST",
        "/auth/a/connect",
        None,
        Some(serde_json::json!({ "principal": "alice" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let token = body["token"].as_str().unwrap().to_string();

    let (status, body) = send(
        state,
        "POST",
        "/auth/b/connect",
        Some(&token),
        Some(serde_json::json!({ "principal": "alice" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["token"].as_str().unwrap(), token, "token reused");
    token
}

// ---------------------------------------------------------------------------
// Health + auth gating
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_api_health() {
    let state = make_state();
    let req = axum::http::Request::builder()
        .uri("/health")
        .body(axum::body::Body::empty())
        .unwrap();
    let res = app(state).oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = axum::body::to_bytes(res.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&body[..], b"ok");
}

#[tokio::test]
async fn test_workflow_status_requires_token() {
    let state = make_state();
    let (status, _) = send(&state, "GET", "/workflows/manager/status", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(
        &state,
        "GET",
        "/workflows/manager/status",
        Some("bogus-token"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_unknown_workflow_type() {
    let state = make_state();
    let token = login(&state).await;
    let (status, _) = send(
        &state,
        "GET",
        "/workflows/managerial/status",
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_start_requires_both_tiers() {
    let state = make_state();

    // Only tier A verified.
    let (status, body) = send(
        &state,
        "POST",
        "/auth/a/connect",
        None,
        Some(serde_json::json!({ "principal": "alice" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let token = body["token"].as_str().unwrap().to_string();

    let (status, _) = send(
        &state,
        "POST",
        "/workflows/manager/start",
        Some(&token),
        Some(serde_json::json!({ "item_ids": ["REQ-1"] })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // A 403 never mutates workflow state.
    let (status, body) = send(
        &state,
        "GET",
        "/workflows/manager/status",
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "idle");
}

#[tokio::test]
async fn test_unknown_tier_is_not_found() {
    let state = make_state();
    let (status, _) = send(
        &state,
        "POST",
        "/auth/c/connect",
        None,
        Some(serde_json::json!({ "principal": "alice" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_connect_rejects_empty_principal() {
    let state = make_state();
    let (status, _) = send(
        &state,
        "POST",
        "/auth/a/connect",
        None,
        Some(serde_json::json!({ "principal": "  " })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// ---------------------------------------------------------------------------
// Session status (public, never extends)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_session_status_public() {
    let state = make_state();
    let (status, body) = send(&state, "GET", "/session/status", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["valid"], false);

    let token = login(&state).await;
    let (status, body) = send(&state, "GET", "/session/status", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["valid"], true);
    assert_eq!(body["tier_a_verified"], true);
    assert_eq!(body["tier_b_verified"], true);
    assert!(body["ms_remaining"].as_u64().unwrap() > 0);
}

// ---------------------------------------------------------------------------
// Workflow commands
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_start_rejects_empty_item_list() {
    let state = make_state();
    let token = login(&state).await;
    let (status, _) = send(
        &state,
        "POST",
        "/workflows/manager/start",
        Some(&token),
        Some(serde_json::json!({ "item_ids": [] })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

async fn poll_status_until(
    state: &ApiState,
    token: &str,
    kind: &str,
    want: &str,
) -> serde_json::Value {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let uri = format!("/workflows/{}/status", kind);
        let (status, body) = send(state, "GET", &uri, Some(token), None).await;
        assert_eq!(status, StatusCode::OK);
        if body["status"] == want {
            return body;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("run never reached {}; last = {}", want, body);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_run_auto_pauses_when_driver_unreachable_then_stops() {
    let state = make_state();
    let token = login(&state).await;

    let (status, body) = send(
        &state,
        "POST",
        "/workflows/manager/start",
        Some(&token),
        Some(serde_json::json!({ "item_ids": ["REQ-1", "REQ-2"] })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["accepted"], true);

    // A second start is rejected while the first run is live.
    let (status, body) = send(
        &state,
        "POST",
        "/workflows/manager/start",
        Some(&token),
        Some(serde_json::json!({ "item_ids": ["REQ-9"] })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["accepted"], false);

    // No driver at the endpoint: the run pauses itself with the fixed
    // disconnect code instead of erroring out.
    let body = poll_status_until(&state, &token, "manager", "paused").await;
    assert_eq!(body["results"]["pause_reason"], "driver-disconnected");

    let (status, _) = send(
        &state,
        "POST",
        "/workflows/manager/stop",
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    poll_status_until(&state, &token, "manager", "cancelled").await;

    // Reset returns the slot to idle.
    let (status, _) = send(
        &state,
        "POST",
        "/workflows/manager/reset",
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (_, body) = send(
        &state,
        "GET",
        "/workflows/manager/status",
        Some(&token),
        None,
    )
    .await;
    assert_eq!(body["status"], "idle");
}

#[tokio::test]
async fn test_reset_rejected_while_run_live() {
    let state = make_state();
    let token = login(&state).await;

    let (status, _) = send(
        &state,
        "POST",
        "/workflows/other/start",
        Some(&token),
        Some(serde_json::json!({ "item_ids": ["REQ-1"] })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, _) = send(
        &state,
        "POST",
        "/workflows/other/reset",
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    // Clean up the background run.
    let (_, _) = send(
        &state,
        "POST",
        "/workflows/other/stop",
        Some(&token),
        None,
    )
    .await;
    poll_status_until(&state, &token, "other", "cancelled").await;
}

// ---------------------------------------------------------------------------
// Tier lifecycle + logout
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_disconnect_tier_then_commands_forbidden() {
    let state = make_state();
    let token = login(&state).await;

    let (status, _) = send(&state, "POST", "/auth/b/disconnect", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(
        &state,
        "POST",
        "/workflows/manager/start",
        Some(&token),
        Some(serde_json::json!({ "item_ids": ["REQ-1"] })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // Token itself remains valid for unprivileged reads.
    let (status, body) = send(&state, "GET", "/session/status", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["valid"], true);
    assert_eq!(body["tier_b_verified"], false);
}

#[tokio::test]
async fn test_logout_invalidates_token() {
    let state = make_state();
    let token = login(&state).await;

    let (status, _) = send(&state, "POST", "/auth/logout", Some(&token), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = send(
        &state,
        "GET",
        "/workflows/manager/status",
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (_, body) = send(&state, "GET", "/session/status", Some(&token), None).await;
    assert_eq!(body["valid"], false);
}
