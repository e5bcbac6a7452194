//! Store access: connection pool setup plus the entity operations the core
//! and its tooling need. Every mutation invalidates the matching cache slice
//! so readers converge within one request.
//!
//! Rule writes are the compilation trigger: the condition tree is validated,
//! compiled and hashed before the row is touched. A failed compile surfaces
//! `InvalidPolicy` and leaves any existing row (and its active fragment)
//! intact.

use chrono::{Duration as ChronoDuration, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectOptions, Database, DatabaseConnection, EntityTrait,
    IntoActiveModel, NotSet, QueryFilter, Set,
};
use serde_json::Value;
use std::time::Duration;

use crate::authz::cache::AuthzCache;
use crate::authz::compiler;
use crate::authz::condition::Condition;
use crate::authz::errors::AuthzError;
use crate::authz::geometry;
use crate::entities;
use crate::errors::FloodgateError;
use crate::settings::Database as DbCfg;

pub async fn init(cfg: &DbCfg) -> Result<DatabaseConnection, FloodgateError> {
    let mut options = ConnectOptions::new(&cfg.url);
    options
        .max_connections(cfg.max_connections)
        .min_connections(cfg.min_connections)
        .acquire_timeout(Duration::from_secs(cfg.acquire_timeout_secs))
        .test_before_acquire(true)
        .sqlx_logging(false);
    let db = Database::connect(options).await?;
    Ok(db)
}

// ─── Realms ─────────────────────────────────────────────────────────────

pub async fn create_realm(
    db: &DatabaseConnection,
    name: &str,
    description: Option<String>,
) -> Result<entities::realm::Model, FloodgateError> {
    let realm = entities::realm::ActiveModel {
        id: NotSet,
        name: Set(name.to_string()),
        description: Set(description),
        is_active: Set(true),
    };
    Ok(realm.insert(db).await?)
}

pub async fn get_realm_by_name(
    db: &DatabaseConnection,
    name: &str,
) -> Result<Option<entities::realm::Model>, FloodgateError> {
    Ok(entities::Realm::find()
        .filter(entities::realm::Column::Name.eq(name))
        .one(db)
        .await?)
}

/// Deleting a realm cascades to every child row via foreign keys.
pub async fn delete_realm(
    db: &DatabaseConnection,
    cache: &AuthzCache,
    name: &str,
) -> Result<bool, FloodgateError> {
    let Some(realm) = get_realm_by_name(db, name).await? else {
        return Ok(false);
    };
    entities::Realm::delete_by_id(realm.id).exec(db).await?;
    cache.invalidate_realm(name).await;
    Ok(true)
}

// ─── Resource types / actions / roles ───────────────────────────────────

pub async fn create_resource_type(
    db: &DatabaseConnection,
    cache: &AuthzCache,
    realm_name: &str,
    realm_id: i32,
    name: &str,
    is_public: bool,
) -> Result<entities::resource_type::Model, FloodgateError> {
    let row = entities::resource_type::ActiveModel {
        id: NotSet,
        realm_id: Set(realm_id),
        name: Set(name.to_string()),
        is_public: Set(is_public),
    };
    let model = row.insert(db).await?;
    cache.invalidate_realm(realm_name).await;
    Ok(model)
}

/// Toggling the public flag must drop the cached entry before the next
/// request observes the old waterfall level.
pub async fn set_resource_type_public(
    db: &DatabaseConnection,
    cache: &AuthzCache,
    realm_name: &str,
    type_id: i32,
    is_public: bool,
) -> Result<(), FloodgateError> {
    let Some(row) = entities::ResourceType::find_by_id(type_id).one(db).await? else {
        return Err(AuthzError::UnknownEntity(format!("resource type id {type_id}")).into());
    };
    let mut active = row.into_active_model();
    active.is_public = Set(is_public);
    active.update(db).await?;
    cache.invalidate_realm(realm_name).await;
    Ok(())
}

pub async fn create_action(
    db: &DatabaseConnection,
    cache: &AuthzCache,
    realm_name: &str,
    realm_id: i32,
    name: &str,
) -> Result<entities::action::Model, FloodgateError> {
    let row = entities::action::ActiveModel {
        id: NotSet,
        realm_id: Set(realm_id),
        name: Set(name.to_string()),
    };
    let model = row.insert(db).await?;
    cache.invalidate_realm(realm_name).await;
    Ok(model)
}

pub async fn create_role(
    db: &DatabaseConnection,
    cache: &AuthzCache,
    realm_name: &str,
    realm_id: i32,
    name: &str,
    attributes: Option<Value>,
) -> Result<entities::auth_role::Model, FloodgateError> {
    let row = entities::auth_role::ActiveModel {
        id: NotSet,
        realm_id: Set(realm_id),
        name: Set(name.to_string()),
        attributes: Set(attributes),
    };
    let model = row.insert(db).await?;
    cache.invalidate_realm(realm_name).await;
    Ok(model)
}

// ─── Principals ─────────────────────────────────────────────────────────

pub async fn create_principal(
    db: &DatabaseConnection,
    cache: &AuthzCache,
    realm_id: i32,
    username: &str,
    attributes: Value,
) -> Result<entities::principal::Model, FloodgateError> {
    let row = entities::principal::ActiveModel {
        id: NotSet,
        realm_id: Set(realm_id),
        username: Set(username.to_string()),
        attributes: Set(attributes),
    };
    let model = row.insert(db).await?;
    cache.invalidate_principal(realm_id, username).await;
    Ok(model)
}

pub async fn get_principal_by_username(
    db: &DatabaseConnection,
    realm_id: i32,
    username: &str,
) -> Result<Option<entities::principal::Model>, FloodgateError> {
    Ok(entities::Principal::find()
        .filter(entities::principal::Column::RealmId.eq(realm_id))
        .filter(entities::principal::Column::Username.eq(username))
        .one(db)
        .await?)
}

pub async fn update_principal_attributes(
    db: &DatabaseConnection,
    cache: &AuthzCache,
    realm_id: i32,
    username: &str,
    attributes: Value,
) -> Result<(), FloodgateError> {
    let Some(row) = get_principal_by_username(db, realm_id, username).await? else {
        return Err(AuthzError::UnknownEntity(format!("principal `{username}`")).into());
    };
    let mut active = row.into_active_model();
    active.attributes = Set(attributes);
    active.update(db).await?;
    cache.invalidate_principal(realm_id, username).await;
    Ok(())
}

pub async fn assign_role(
    db: &DatabaseConnection,
    cache: &AuthzCache,
    realm_id: i32,
    username: &str,
    principal_id: i32,
    role_id: i32,
) -> Result<(), FloodgateError> {
    let exists = entities::PrincipalRole::find_by_id((principal_id, role_id))
        .one(db)
        .await?;
    if exists.is_none() {
        entities::principal_role::ActiveModel {
            principal_id: Set(principal_id),
            role_id: Set(role_id),
        }
        .insert(db)
        .await?;
    }
    cache.invalidate_principal(realm_id, username).await;
    Ok(())
}

// ─── Resources ──────────────────────────────────────────────────────────

/// Create a resource, normalizing any geometry input to the canonical
/// projection and registering its external ids.
pub async fn create_resource(
    db: &DatabaseConnection,
    cache: &AuthzCache,
    realm_id: i32,
    type_id: i32,
    attributes: Value,
    geometry_input: Option<&Value>,
    input_srid: Option<i32>,
    external_ids: &[String],
) -> Result<entities::resource::Model, FloodgateError> {
    let geometry_ewkt = match geometry_input {
        None => None,
        Some(value) => {
            let geom = geometry::parse_value(value, input_srid)?;
            Some(geometry::to_ewkt(&geom))
        }
    };

    let row = entities::resource::ActiveModel {
        id: NotSet,
        realm_id: Set(realm_id),
        resource_type_id: Set(type_id),
        geometry: Set(geometry_ewkt),
        attributes: Set(attributes),
    };
    let model = row.insert(db).await?;

    for ext in external_ids {
        add_external_id(db, cache, realm_id, type_id, model.id, ext).await?;
    }
    Ok(model)
}

pub async fn add_external_id(
    db: &DatabaseConnection,
    cache: &AuthzCache,
    realm_id: i32,
    type_id: i32,
    resource_id: i32,
    external_id: &str,
) -> Result<(), FloodgateError> {
    entities::external_id::ActiveModel {
        realm_id: Set(realm_id),
        resource_type_id: Set(type_id),
        external_id: Set(external_id.to_string()),
        resource_id: Set(resource_id),
    }
    .insert(db)
    .await?;
    cache.invalidate_external_id(realm_id, type_id, external_id).await;
    Ok(())
}

pub async fn delete_resource(
    db: &DatabaseConnection,
    cache: &AuthzCache,
    realm_id: i32,
    type_id: i32,
    resource_id: i32,
) -> Result<bool, FloodgateError> {
    let deleted = entities::Resource::delete_by_id(resource_id).exec(db).await?;
    cache.invalidate_external_ids_for_type(realm_id, type_id);
    Ok(deleted.rows_affected > 0)
}

// ─── Rules ──────────────────────────────────────────────────────────────

/// Everything needed to place a rule; the subject is exactly one of
/// `principal_id` / `role_id` (`principal_id = 0` is the anonymous grant).
#[derive(Debug, Clone)]
pub struct RuleSpec {
    pub realm_id: i32,
    pub resource_type_id: i32,
    pub action_id: i32,
    pub principal_id: Option<i32>,
    pub role_id: Option<i32>,
    pub resource_external_id: Option<String>,
    pub conditions: Option<Value>,
}

/// Create or update a rule. The canonical scope key is
/// `(realm, type, action, subject, resource)`; re-creating an existing scope
/// supersedes the old row's conditions and compiled fragment.
pub async fn upsert_rule(
    db: &DatabaseConnection,
    spec: RuleSpec,
) -> Result<entities::acl_rule::Model, FloodgateError> {
    if spec.principal_id.is_some() == spec.role_id.is_some() {
        return Err(AuthzError::InvalidPolicy(
            "a rule binds exactly one subject: principal or role".into(),
        )
        .into());
    }

    // Validate and compile before touching the row; a failed compile keeps
    // the prior fragment active.
    let compiled = match &spec.conditions {
        None => None,
        Some(raw) if raw.is_null() => None,
        Some(raw) => {
            let tree = Condition::from_value(raw)?;
            let fragment = compiler::compile(&tree)?;
            Some((tree.compiled_hash(), fragment))
        }
    };

    let resource_id = match &spec.resource_external_id {
        None => None,
        Some(ext) => {
            let row = entities::ExternalId::find()
                .filter(entities::external_id::Column::RealmId.eq(spec.realm_id))
                .filter(entities::external_id::Column::ResourceTypeId.eq(spec.resource_type_id))
                .filter(entities::external_id::Column::ExternalId.eq(ext.as_str()))
                .one(db)
                .await?;
            match row {
                Some(mapping) => Some(mapping.resource_id),
                None => {
                    return Err(AuthzError::UnknownEntity(format!(
                        "external resource id `{ext}`"
                    ))
                    .into())
                }
            }
        }
    };

    let mut scope = entities::AclRule::find()
        .filter(entities::acl_rule::Column::RealmId.eq(spec.realm_id))
        .filter(entities::acl_rule::Column::ResourceTypeId.eq(spec.resource_type_id))
        .filter(entities::acl_rule::Column::ActionId.eq(spec.action_id));
    scope = match spec.principal_id {
        Some(pid) => scope.filter(entities::acl_rule::Column::PrincipalId.eq(pid)),
        None => scope.filter(entities::acl_rule::Column::PrincipalId.is_null()),
    };
    scope = match spec.role_id {
        Some(rid) => scope.filter(entities::acl_rule::Column::RoleId.eq(rid)),
        None => scope.filter(entities::acl_rule::Column::RoleId.is_null()),
    };
    scope = match resource_id {
        Some(rid) => scope.filter(entities::acl_rule::Column::ResourceId.eq(rid)),
        None => scope.filter(entities::acl_rule::Column::ResourceId.is_null()),
    };
    let existing = scope.one(db).await?;

    let (conditions, compiled_sql, compiled_params, compiled_hash) = match compiled {
        None => (None, None, None, None),
        Some((hash, compiled)) => (
            spec.conditions.clone(),
            Some(compiled.fragment),
            Some(Value::Array(compiled.placeholders)),
            Some(hash),
        ),
    };

    let model = match existing {
        Some(row) => {
            let mut active = row.into_active_model();
            active.conditions = Set(conditions);
            active.compiled_sql = Set(compiled_sql);
            active.compiled_params = Set(compiled_params);
            active.compiled_hash = Set(compiled_hash);
            active.update(db).await?
        }
        None => {
            entities::acl_rule::ActiveModel {
                id: NotSet,
                realm_id: Set(spec.realm_id),
                resource_type_id: Set(spec.resource_type_id),
                action_id: Set(spec.action_id),
                principal_id: Set(spec.principal_id),
                role_id: Set(spec.role_id),
                resource_id: Set(resource_id),
                conditions: Set(conditions),
                compiled_sql: Set(compiled_sql),
                compiled_params: Set(compiled_params),
                compiled_hash: Set(compiled_hash),
            }
            .insert(db)
            .await?
        }
    };

    tracing::info!(
        rule = model.id,
        realm = spec.realm_id,
        hash = model.compiled_hash.as_deref().unwrap_or("-"),
        "Rule compiled and stored"
    );
    Ok(model)
}

/// Retire a rule; subsequent requests no longer consider it.
pub async fn delete_rule(
    db: &DatabaseConnection,
    realm_id: i32,
    rule_id: i32,
) -> Result<bool, FloodgateError> {
    let deleted = entities::AclRule::delete_many()
        .filter(entities::acl_rule::Column::Id.eq(rule_id))
        .filter(entities::acl_rule::Column::RealmId.eq(realm_id))
        .exec(db)
        .await?;
    Ok(deleted.rows_affected > 0)
}

// ─── Maintenance ────────────────────────────────────────────────────────

pub async fn purge_authorization_logs(
    db: &DatabaseConnection,
    retention_days: i64,
) -> Result<u64, FloodgateError> {
    let horizon = Utc::now() - ChronoDuration::days(retention_days);
    let deleted = entities::AuthorizationLog::delete_many()
        .filter(entities::authorization_log::Column::Timestamp.lt(horizon))
        .exec(db)
        .await?;
    Ok(deleted.rows_affected)
}
