//! Per-realm name→id resolution cache and external-id mapping cache.
//!
//! The cache is an owned structure handed to the engine and to every storage
//! mutation path by capability; tests instantiate isolated caches. Entries
//! carry a bounded TTL and are replaced wholesale per key (`Arc` swap), so
//! readers never observe a half-updated map. Population runs under moka's
//! single-flight guarantee: concurrent misses for one key issue one store
//! fetch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use serde_json::Value;

use crate::authz::errors::AuthzError;
use crate::entities;

/// Cached identity of a resource type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeEntry {
    pub id: i32,
    pub is_public: bool,
}

/// One realm's symbolic-name maps.
#[derive(Debug, Clone, Default)]
pub struct RealmMap {
    pub realm_id: i32,
    pub actions: HashMap<String, i32>,
    pub types: HashMap<String, TypeEntry>,
    pub roles: HashMap<String, i32>,
}

impl RealmMap {
    pub fn action_id(&self, name: &str) -> Result<i32, AuthzError> {
        self.actions
            .get(name)
            .copied()
            .ok_or_else(|| AuthzError::UnknownEntity(format!("action `{name}`")))
    }

    pub fn type_entry(&self, name: &str) -> Result<TypeEntry, AuthzError> {
        self.types
            .get(name)
            .copied()
            .ok_or_else(|| AuthzError::UnknownEntity(format!("resource type `{name}`")))
    }

    pub fn role_id(&self, name: &str) -> Option<i32> {
        self.roles.get(name).copied()
    }
}

/// Cached principal identity: attributes plus assigned role ids.
#[derive(Debug, Clone)]
pub struct PrincipalEntry {
    pub id: i32,
    pub username: String,
    pub attributes: Value,
    pub role_ids: Vec<i32>,
}

pub struct AuthzCache {
    realms: Cache<String, Arc<RealmMap>>,
    principals: Cache<(i32, String), Arc<PrincipalEntry>>,
    external_ids: Cache<(i32, i32, String), i32>,
}

impl AuthzCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            realms: Cache::builder()
                .time_to_live(ttl)
                .max_capacity(10_000)
                .build(),
            principals: Cache::builder()
                .time_to_live(ttl)
                .max_capacity(100_000)
                .build(),
            external_ids: Cache::builder()
                .time_to_live(ttl)
                .max_capacity(1_000_000)
                .support_invalidation_closures()
                .build(),
        }
    }

    // ─── Realm maps ─────────────────────────────────────────────────────

    pub async fn realm_map(
        &self,
        db: &DatabaseConnection,
        realm_name: &str,
    ) -> Result<Arc<RealmMap>, AuthzError> {
        let db = db.clone();
        let name = realm_name.to_string();
        self.realms
            .try_get_with(name.clone(), async move { load_realm_map(&db, &name).await })
            .await
            .map_err(AuthzError::from)
    }

    pub async fn invalidate_realm(&self, realm_name: &str) {
        self.realms.invalidate(realm_name).await;
    }

    // ─── Principals ─────────────────────────────────────────────────────

    pub async fn principal(
        &self,
        db: &DatabaseConnection,
        realm_id: i32,
        username: &str,
    ) -> Result<Arc<PrincipalEntry>, AuthzError> {
        let db = db.clone();
        let user = username.to_string();
        self.principals
            .try_get_with((realm_id, user.clone()), async move {
                load_principal(&db, realm_id, &user).await
            })
            .await
            .map_err(AuthzError::from)
    }

    pub async fn invalidate_principal(&self, realm_id: i32, username: &str) {
        self.principals
            .invalidate(&(realm_id, username.to_string()))
            .await;
    }

    // ─── External ids ───────────────────────────────────────────────────

    /// Cache-only batch lookup; the caller fetches misses from the store and
    /// feeds them back through [`AuthzCache::insert_external_ids`].
    pub async fn get_external_ids(
        &self,
        realm_id: i32,
        type_id: i32,
        external_ids: &[String],
    ) -> HashMap<String, i32> {
        let mut hits = HashMap::new();
        for ext in external_ids {
            if let Some(resource_id) = self
                .external_ids
                .get(&(realm_id, type_id, ext.clone()))
                .await
            {
                hits.insert(ext.clone(), resource_id);
            }
        }
        hits
    }

    pub async fn insert_external_ids(
        &self,
        realm_id: i32,
        type_id: i32,
        mappings: &HashMap<String, i32>,
    ) {
        for (ext, resource_id) in mappings {
            self.external_ids
                .insert((realm_id, type_id, ext.clone()), *resource_id)
                .await;
        }
    }

    pub async fn invalidate_external_id(&self, realm_id: i32, type_id: i32, external_id: &str) {
        self.external_ids
            .invalidate(&(realm_id, type_id, external_id.to_string()))
            .await;
    }

    /// Drop every cached mapping of one `(realm, type)` scope, e.g. when the
    /// type is deleted.
    pub fn invalidate_external_ids_for_type(&self, realm_id: i32, type_id: i32) {
        let _ = self
            .external_ids
            .invalidate_entries_if(move |(rid, tid, _), _| *rid == realm_id && *tid == type_id);
    }
}

async fn load_realm_map(
    db: &DatabaseConnection,
    realm_name: &str,
) -> Result<Arc<RealmMap>, AuthzError> {
    let realm = entities::Realm::find()
        .filter(entities::realm::Column::Name.eq(realm_name))
        .one(db)
        .await?
        .ok_or_else(|| AuthzError::UnknownEntity(format!("realm `{realm_name}`")))?;

    let mut map = RealmMap {
        realm_id: realm.id,
        ..RealmMap::default()
    };

    for action in entities::Action::find()
        .filter(entities::action::Column::RealmId.eq(realm.id))
        .all(db)
        .await?
    {
        map.actions.insert(action.name, action.id);
    }
    for rt in entities::ResourceType::find()
        .filter(entities::resource_type::Column::RealmId.eq(realm.id))
        .all(db)
        .await?
    {
        map.types.insert(
            rt.name,
            TypeEntry {
                id: rt.id,
                is_public: rt.is_public,
            },
        );
    }
    for role in entities::AuthRole::find()
        .filter(entities::auth_role::Column::RealmId.eq(realm.id))
        .all(db)
        .await?
    {
        map.roles.insert(role.name, role.id);
    }

    tracing::debug!(
        realm = realm_name,
        actions = map.actions.len(),
        types = map.types.len(),
        roles = map.roles.len(),
        "Populated realm map"
    );

    Ok(Arc::new(map))
}

async fn load_principal(
    db: &DatabaseConnection,
    realm_id: i32,
    username: &str,
) -> Result<Arc<PrincipalEntry>, AuthzError> {
    let principal = entities::Principal::find()
        .filter(entities::principal::Column::RealmId.eq(realm_id))
        .filter(entities::principal::Column::Username.eq(username))
        .one(db)
        .await?
        .ok_or_else(|| AuthzError::UnknownEntity(format!("principal `{username}`")))?;

    let role_ids: Vec<i32> = entities::PrincipalRole::find()
        .filter(entities::principal_role::Column::PrincipalId.eq(principal.id))
        .all(db)
        .await?
        .into_iter()
        .map(|row| row.role_id)
        .collect();

    Ok(Arc::new(PrincipalEntry {
        id: principal.id,
        username: principal.username,
        attributes: principal.attributes,
        role_ids,
    }))
}
