//! Request/response types of the access-check surface.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::authz::condition::Condition;

// ─── check_access ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct CheckAccessRequest {
    pub realm_name: String,
    /// Username within the realm; absent means the anonymous principal.
    #[serde(default)]
    pub principal_name: Option<String>,
    pub req_access: Vec<AccessItem>,
    /// Restricts the active roles to the intersection of the principal's
    /// assigned roles and this list.
    #[serde(default)]
    pub role_names: Option<Vec<String>>,
    #[serde(default)]
    pub auth_context: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccessItem {
    pub resource_type_name: String,
    pub action_name: String,
    #[serde(default)]
    pub return_type: ReturnType,
    #[serde(default)]
    pub external_resource_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReturnType {
    #[default]
    Decision,
    IdList,
}

/// Either a boolean decision or the authorized external ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AccessAnswer {
    Decision(bool),
    IdList(Vec<String>),
}

#[derive(Debug, Clone, Serialize)]
pub struct AccessResponseItem {
    pub resource_type_name: String,
    pub action_name: String,
    pub answer: AccessAnswer,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckAccessResponse {
    pub results: Vec<AccessResponseItem>,
}

// ─── get_authorization_conditions ───────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct ConditionsRequest {
    pub realm_name: String,
    #[serde(default)]
    pub principal_name: Option<String>,
    pub resource_type_name: String,
    pub action_name: String,
    #[serde(default)]
    pub role_names: Option<Vec<String>>,
    #[serde(default)]
    pub auth_context: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterType {
    GrantedAll,
    DeniedAll,
    Conditions,
}

/// The residual filter for one `(type, action)` pair: either a short-circuit
/// verdict or a DSL tree referencing only the resource, ready to be merged
/// with an application query.
#[derive(Debug, Clone, Serialize)]
pub struct AuthorizationConditions {
    pub filter_type: FilterType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions_dsl: Option<Condition>,
    /// Whether any contributing rule bound request state before
    /// simplification; such filters must not be reused across requests.
    pub has_context_refs: bool,
}

// ─── get_permitted_actions ──────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct PermittedActionsRequest {
    pub realm_name: String,
    #[serde(default)]
    pub principal_name: Option<String>,
    pub resources: Vec<PermittedActionsItem>,
    #[serde(default)]
    pub role_names: Option<Vec<String>>,
    #[serde(default)]
    pub auth_context: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PermittedActionsItem {
    pub resource_type_name: String,
    #[serde(default)]
    pub external_resource_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PermittedActionsResponseItem {
    pub resource_type_name: String,
    pub external_resource_id: Option<String>,
    pub actions: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PermittedActionsResponse {
    pub results: Vec<PermittedActionsResponseItem>,
}
