use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// A single access rule: `(resource_type, action, subject)` with an optional
/// resource scope and an optional condition tree.
///
/// Exactly one of `principal_id` / `role_id` is set; `principal_id = 0` is the
/// anonymous grant. `resource_id = NULL` makes the rule type-scoped.
///
/// `compiled_sql`, `compiled_params` and `compiled_hash` are derived from
/// `conditions` on every mutation and must never be edited independently.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "acl_rule")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub realm_id: i32,
    pub resource_type_id: i32,
    pub action_id: i32,
    pub principal_id: Option<i32>,
    pub role_id: Option<i32>,
    pub resource_id: Option<i32>,
    pub conditions: Option<Json>,
    pub compiled_sql: Option<String>,
    pub compiled_params: Option<Json>,
    pub compiled_hash: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
