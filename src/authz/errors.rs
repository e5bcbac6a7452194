use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use miette::Diagnostic;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum AuthzError {
    #[error("Invalid policy: {0}")]
    #[diagnostic(
        code(floodgate::authz::invalid_policy),
        help("A condition tree is a JSON object with an `op` field; logical nodes carry `conditions`, leaf nodes carry `source`/`attr`/`val` and optionally `args`")
    )]
    InvalidPolicy(String),

    #[error("Unknown entity: {0}")]
    #[diagnostic(
        code(floodgate::authz::unknown_entity),
        help("Symbolic names are resolved per realm; check realm, action, resource-type and role spelling")
    )]
    UnknownEntity(String),

    #[error("Ambiguous external id: {0}")]
    #[diagnostic(
        code(floodgate::authz::ambiguous_external_id),
        help("External resource ids are only meaningful within a (realm, resource_type) scope")
    )]
    AmbiguousExternalId(String),

    #[error("Resource exhausted: {0}")]
    #[diagnostic(code(floodgate::authz::resource_exhausted))]
    ResourceExhausted(String),

    #[error("Store failure: {0}")]
    #[diagnostic(code(floodgate::authz::store_failure))]
    StoreFailure(String),

    #[error("Request timed out: {0}")]
    #[diagnostic(code(floodgate::authz::timeout))]
    Timeout(String),
}

impl AuthzError {
    /// True when the runner may retry the failed store call once.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AuthzError::StoreFailure(_))
    }
}

impl From<sea_orm::DbErr> for AuthzError {
    fn from(err: sea_orm::DbErr) -> Self {
        match err {
            sea_orm::DbErr::ConnectionAcquire(e) => {
                AuthzError::ResourceExhausted(format!("store pool exhausted: {e}"))
            }
            other => AuthzError::StoreFailure(other.to_string()),
        }
    }
}

impl From<std::sync::Arc<AuthzError>> for AuthzError {
    fn from(err: std::sync::Arc<AuthzError>) -> Self {
        // Shared errors come out of single-flight cache population.
        match &*err {
            AuthzError::InvalidPolicy(m) => AuthzError::InvalidPolicy(m.clone()),
            AuthzError::UnknownEntity(m) => AuthzError::UnknownEntity(m.clone()),
            AuthzError::AmbiguousExternalId(m) => AuthzError::AmbiguousExternalId(m.clone()),
            AuthzError::ResourceExhausted(m) => AuthzError::ResourceExhausted(m.clone()),
            AuthzError::StoreFailure(m) => AuthzError::StoreFailure(m.clone()),
            AuthzError::Timeout(m) => AuthzError::Timeout(m.clone()),
        }
    }
}

impl IntoResponse for AuthzError {
    fn into_response(self) -> Response {
        let status = match &self {
            AuthzError::InvalidPolicy(_) | AuthzError::AmbiguousExternalId(_) => {
                StatusCode::BAD_REQUEST
            }
            AuthzError::UnknownEntity(_) => StatusCode::NOT_FOUND,
            AuthzError::ResourceExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            AuthzError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AuthzError::StoreFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({ "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}
