//! Admin API for pool management
//!
//! Endpoints:
//! - GET    /accounts                  list accounts in insertion order
//! - POST   /accounts                  register an account (409 on duplicate email)
//! - PATCH  /accounts/{id}             partial update (409 if the new email is taken)
//! - DELETE /accounts/{id}             remove account, its rotation slot and assignments
//! - GET    /switch-config             current switching behaviour
//! - PATCH  /switch-config             merge a partial switch config
//! - POST   /sessions/{id}/assign      bind a session (default account, or `accountId`)
//! - DELETE /sessions/{id}/assign      unbind a session
//! - POST   /recovery/poll             run one recovery pass now

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use serde::Deserialize;
use tracing::info;

use account_pool::{AccountRegistry, NewAccount, RecoveryPoller, SessionAssigner};
use account_store::{AccountPatch, SwitchConfigPatch};

use crate::error::{ApiError, Result};

/// Shared state for admin API handlers.
#[derive(Clone)]
pub struct AdminState {
    registry: Arc<AccountRegistry>,
    assigner: Arc<SessionAssigner>,
    poller: Arc<RecoveryPoller>,
}

impl AdminState {
    pub fn new(
        registry: Arc<AccountRegistry>,
        assigner: Arc<SessionAssigner>,
        poller: Arc<RecoveryPoller>,
    ) -> Self {
        Self {
            registry,
            assigner,
            poller,
        }
    }
}

/// Build the admin router with all pool management endpoints.
pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/accounts", get(list_accounts).post(add_account))
        .route(
            "/accounts/{id}",
            patch(update_account).delete(delete_account),
        )
        .route(
            "/switch-config",
            get(get_switch_config).patch(update_switch_config),
        )
        .route(
            "/sessions/{id}/assign",
            post(assign_session).delete(unassign_session),
        )
        .route("/recovery/poll", post(poll_recovery))
        .with_state(state)
}

async fn list_accounts(State(state): State<AdminState>) -> Result<impl IntoResponse> {
    let accounts = state.registry.get_all().await?;
    Ok(Json(serde_json::json!({ "accounts": accounts })))
}

async fn add_account(
    State(state): State<AdminState>,
    Json(body): Json<NewAccount>,
) -> Result<impl IntoResponse> {
    let profile = state.registry.add(body).await?;
    Ok((StatusCode::CREATED, Json(profile)))
}

async fn update_account(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    Json(body): Json<AccountPatch>,
) -> Result<impl IntoResponse> {
    match state.registry.update(&id, body).await? {
        Some(profile) => Ok(Json(profile)),
        None => Err(ApiError::NotFound(format!("account {id}"))),
    }
}

async fn delete_account(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    if !state.registry.remove(&id).await? {
        return Err(ApiError::NotFound(format!("account {id}")));
    }
    Ok(Json(serde_json::json!({ "id": id, "status": "removed" })))
}

async fn get_switch_config(State(state): State<AdminState>) -> Result<impl IntoResponse> {
    Ok(Json(state.registry.get_switch_config().await?))
}

async fn update_switch_config(
    State(state): State<AdminState>,
    Json(body): Json<SwitchConfigPatch>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.registry.update_switch_config(body).await?))
}

/// Body for an explicit assignment. Empty body assigns the default account.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssignRequest {
    account_id: Option<String>,
    #[serde(default)]
    automatic: bool,
}

async fn assign_session(
    State(state): State<AdminState>,
    Path(session_id): Path<String>,
    body: axum::body::Bytes,
) -> Result<impl IntoResponse> {
    let request: AssignRequest = if body.iter().all(u8::is_ascii_whitespace) {
        AssignRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::BadRequest(format!("invalid assign request: {e}")))?
    };

    let assignment = match request.account_id {
        Some(account_id) => state
            .assigner
            .execute_switch(&session_id, &account_id, request.automatic)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("account {account_id}")))?,
        None => state
            .assigner
            .assign_default(&session_id)
            .await?
            .ok_or_else(|| ApiError::Unavailable("no active account to assign".into()))?,
    };
    Ok(Json(assignment))
}

async fn unassign_session(
    State(state): State<AdminState>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse> {
    if !state.registry.remove_assignment(&session_id).await? {
        return Err(ApiError::NotFound(format!("assignment for session {session_id}")));
    }
    info!(session_id, "session unassigned");
    Ok(StatusCode::NO_CONTENT)
}

async fn poll_recovery(State(state): State<AdminState>) -> impl IntoResponse {
    let recovered = state.poller.poll().await;
    Json(serde_json::json!({ "recoveredAccountIds": recovered }))
}
