//! Local HTTP API: workflow commands, session status, tier auth, and the
//! push-channel handshake.
//!
//! Authorization failures never touch workflow state. Orchestrator-internal
//! errors never cross this boundary from background work; only command
//! acceptance is reported synchronously.

use crate::session::{Peek, Session, Tier};
use crate::state::{ApiState, AppState};
use crate::workflow::{WorkflowRun, WorkflowType};
use axum::{
    extract::{Path as AxumPath, State},
    http::{header, HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

pub fn app(state: ApiState) -> Router {
    Router::new()
        // Workflow commands
        .route("/workflows/:kind/status", get(workflow_status))
        .route("/workflows/:kind/start", post(workflow_start))
        .route("/workflows/:kind/pause", post(workflow_pause))
        .route("/workflows/:kind/resume", post(workflow_resume))
        .route("/workflows/:kind/stop", post(workflow_stop))
        .route("/workflows/:kind/reset", post(workflow_reset))
        // Session + auth
        .route("/session/status", get(session_status))
        .route("/auth/:tier/connect", post(auth_connect))
        .route("/auth/:tier/disconnect", post(auth_disconnect))
        .route("/auth/logout", post(auth_logout))
        // Push channel
        .route("/ws", get(crate::push::ws_handler))
        // Utility
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run_server(state: ApiState, port: u16) -> crate::error::Result<()> {
    let addr = format!("127.0.0.1:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("API server listening on {}", addr);

    let shutdown_state = Arc::clone(&state);
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
            shutdown_state.shutdown();
        })
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Auth helpers
// ---------------------------------------------------------------------------

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(|s| s.trim().to_string())
}

fn require_session(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<Session, (StatusCode, String)> {
    let token = bearer_token(headers)
        .ok_or((StatusCode::UNAUTHORIZED, "missing bearer token".to_string()))?;
    state.sessions.validate(&token).ok_or((
        StatusCode::UNAUTHORIZED,
        "invalid or expired token".to_string(),
    ))
}

/// Workflow commands drive both backends, so both tiers must be verified.
fn require_tiers(session: &Session) -> Result<(), (StatusCode, String)> {
    if session.tier_a.verified && session.tier_b.verified {
        Ok(())
    } else {
        Err((
            StatusCode::FORBIDDEN,
            "both capability tiers must be verified".to_string(),
        ))
    }
}

fn parse_kind(kind: &str) -> Result<WorkflowType, (StatusCode, String)> {
    WorkflowType::from_path(kind).ok_or((
        StatusCode::NOT_FOUND,
        format!("unknown workflow type: {}", kind),
    ))
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

async fn health() -> &'static str {
    "ok"
}

// ---------------------------------------------------------------------------
// Workflow commands
// ---------------------------------------------------------------------------

async fn workflow_status(
    State(state): State<ApiState>,
    AxumPath(kind): AxumPath<String>,
    headers: HeaderMap,
) -> Result<Json<WorkflowRun>, (StatusCode, String)> {
    require_session(&state, &headers)?;
    let kind = parse_kind(&kind)?;
    Ok(Json(state.orchestrator(kind).get_status()))
}

#[derive(Deserialize)]
pub struct StartRequest {
    pub item_ids: Vec<String>,
    #[serde(default)]
    pub context_hint: Option<String>,
}

async fn workflow_start(
    State(state): State<ApiState>,
    AxumPath(kind): AxumPath<String>,
    headers: HeaderMap,
    Json(req): Json<StartRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), (StatusCode, String)> {
    let session = require_session(&state, &headers)?;
    require_tiers(&session)?;
    let kind = parse_kind(&kind)?;
    if req.item_ids.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "item_ids must not be empty".to_string(),
        ));
    }

    match state
        .orchestrator(kind)
        .start(req.item_ids, session.token.clone(), req.context_hint)
    {
        Ok(()) => Ok((StatusCode::ACCEPTED, Json(json!({ "accepted": true })))),
        Err(e) => Ok((
            StatusCode::CONFLICT,
            Json(json!({ "accepted": false, "error": e })),
        )),
    }
}

#[derive(Deserialize, Default)]
pub struct PauseRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

async fn workflow_pause(
    State(state): State<ApiState>,
    AxumPath(kind): AxumPath<String>,
    headers: HeaderMap,
    body: Option<Json<PauseRequest>>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let session = require_session(&state, &headers)?;
    require_tiers(&session)?;
    let kind = parse_kind(&kind)?;
    let reason = body.and_then(|Json(b)| b.reason);
    state.orchestrator(kind).pause(reason);
    Ok(Json(json!({ "ok": true })))
}

async fn workflow_resume(
    State(state): State<ApiState>,
    AxumPath(kind): AxumPath<String>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let session = require_session(&state, &headers)?;
    require_tiers(&session)?;
    let kind = parse_kind(&kind)?;
    state.orchestrator(kind).resume();
    Ok(Json(json!({ "ok": true })))
}

async fn workflow_stop(
    State(state): State<ApiState>,
    AxumPath(kind): AxumPath<String>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let session = require_session(&state, &headers)?;
    require_tiers(&session)?;
    let kind = parse_kind(&kind)?;
    state.orchestrator(kind).stop();
    Ok(Json(json!({ "ok": true })))
}

async fn workflow_reset(
    State(state): State<ApiState>,
    AxumPath(kind): AxumPath<String>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let session = require_session(&state, &headers)?;
    require_tiers(&session)?;
    let kind = parse_kind(&kind)?;
    state
        .orchestrator(kind)
        .reset()
        .map_err(|e| (StatusCode::CONFLICT, e))?;
    Ok(Json(json!({ "ok": true })))
}

// ---------------------------------------------------------------------------
// Session + auth
// ---------------------------------------------------------------------------

/// Public, read-only: reports validity without extending the session.
async fn session_status(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Json<serde_json::Value> {
    let token = bearer_token(&headers).unwrap_or_default();
    match state.sessions.peek(&token) {
        Peek::Valid {
            ms_remaining,
            tier_a_verified,
            tier_b_verified,
        } => Json(json!({
            "valid": true,
            "ms_remaining": ms_remaining,
            "tier_a_verified": tier_a_verified,
            "tier_b_verified": tier_b_verified,
        })),
        _ => Json(json!({ "valid": false, "ms_remaining": 0 })),
    }
}

#[derive(Deserialize)]
pub struct ConnectRequest {
    pub principal: String,
}

async fn auth_connect(
    State(state): State<ApiState>,
    AxumPath(tier): AxumPath<String>,
    headers: HeaderMap,
    Json(req): Json<ConnectRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let tier = Tier::from_path(&tier)
        .ok_or((StatusCode::NOT_FOUND, format!("unknown tier: {}", tier)))?;
    if req.principal.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "principal must not be empty".to_string(),
        ));
    }

    let check = match tier {
        Tier::A => state.query_engine.connect(&req.principal).await,
        Tier::B => state.record_interface.connect(&req.principal).await,
    };
    check.map_err(|e| {
        (
            StatusCode::UNAUTHORIZED,
            format!("backend rejected principal: {}", e),
        )
    })?;

    let existing = bearer_token(&headers);
    let token = state
        .sessions
        .upgrade(tier, &req.principal, existing.as_deref());
    Ok(Json(json!({ "token": token })))
}

async fn auth_disconnect(
    State(state): State<ApiState>,
    AxumPath(tier): AxumPath<String>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let tier = Tier::from_path(&tier)
        .ok_or((StatusCode::NOT_FOUND, format!("unknown tier: {}", tier)))?;
    let session = require_session(&state, &headers)?;
    state.sessions.downgrade(&session.token, tier);
    Ok(Json(json!({ "ok": true })))
}

async fn auth_logout(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<StatusCode, (StatusCode, String)> {
    let session = require_session(&state, &headers)?;
    state.sessions.remove(&session.token);
    state.connections.close_all_for(
        &session.token,
        crate::push::CLOSE_LOGGED_OUT,
        "logged-out",
    );
    Ok(StatusCode::NO_CONTENT)
}
