//! Access-check HTTP surface: the only externally reachable contract of the
//! core. Entity CRUD and admin tooling live elsewhere and call into
//! [`crate::storage`] directly.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};

use crate::authz::engine::Engine;
use crate::authz::errors::AuthzError;
use crate::authz::types::{CheckAccessRequest, ConditionsRequest, PermittedActionsRequest};

#[derive(Clone)]
pub struct AuthzState {
    pub engine: Arc<Engine>,
    pub request_timeout: Duration,
}

pub fn router(state: AuthzState) -> Router {
    Router::new()
        .route("/v1/access/check", post(handle_check_access))
        .route("/v1/access/conditions", post(handle_conditions))
        .route("/v1/access/permitted-actions", post(handle_permitted_actions))
        .route("/healthz", get(health))
        .with_state(state)
}

async fn handle_check_access(
    State(state): State<AuthzState>,
    Json(req): Json<CheckAccessRequest>,
) -> impl IntoResponse {
    match with_deadline(state.request_timeout, state.engine.check_access(&req)).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn handle_conditions(
    State(state): State<AuthzState>,
    Json(req): Json<ConditionsRequest>,
) -> impl IntoResponse {
    match with_deadline(state.request_timeout, state.engine.authorization_conditions(&req)).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn handle_permitted_actions(
    State(state): State<AuthzState>,
    Json(req): Json<PermittedActionsRequest>,
) -> impl IntoResponse {
    match with_deadline(state.request_timeout, state.engine.permitted_actions(&req)).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => e.into_response(),
    }
}

/// Enforce the per-request deadline. Dropping the inner future cancels any
/// outstanding store queries; no audit entry is emitted for a timed-out item.
async fn with_deadline<T>(
    timeout: Duration,
    fut: impl std::future::Future<Output = Result<T, AuthzError>>,
) -> Result<T, AuthzError> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(AuthzError::Timeout(format!(
            "deadline of {}s exceeded",
            timeout.as_secs()
        ))),
    }
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
