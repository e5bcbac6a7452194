//! Idempotent principal/role sync from a JSON file.
//!
//! The identity-provider scheduler lives outside the core; from the engine's
//! point of view it is just another writer whose contract is entity rows plus
//! cache invalidation. This module exercises exactly that contract from the
//! CLI, which also makes it useful for seeding test realms.

use crate::authz::cache::AuthzCache;
use crate::errors::FloodgateError;
use crate::storage;
use miette::{IntoDiagnostic, Result};
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fs;

/// Principal definition from the JSON file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrincipalDefinition {
    /// Username (unique within the realm)
    pub username: String,
    /// Attribute map visible to policies via `$principal.*`
    #[serde(default)]
    pub attributes: Option<Value>,
    /// Role names to assign; unknown names are created first
    #[serde(default)]
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleDefinition {
    pub name: String,
    #[serde(default)]
    pub attributes: Option<Value>,
}

/// Root structure of the sync file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncFile {
    pub realm: String,
    #[serde(default)]
    pub roles: Vec<RoleDefinition>,
    #[serde(default)]
    pub principals: Vec<PrincipalDefinition>,
}

/// Sync principals and roles from a JSON file into a realm (idempotent)
pub async fn sync_from_file(
    db: &DatabaseConnection,
    cache: &AuthzCache,
    file_path: &str,
) -> Result<()> {
    tracing::info!("Loading principals from {}", file_path);

    let content = fs::read_to_string(file_path)
        .into_diagnostic()
        .map_err(|e| miette::miette!("Failed to read sync file at '{}': {}", file_path, e))?;

    let sync_file: SyncFile = serde_json::from_str(&content)
        .into_diagnostic()
        .map_err(|e| {
            miette::miette!(
                "Failed to parse sync JSON file: {}\n\nExpected format:\n{{\n  \"realm\": \"tenant-a\",\n  \"roles\": [{{ \"name\": \"editor\" }}],\n  \"principals\": [\n    {{\n      \"username\": \"alice\",\n      \"attributes\": {{ \"dept\": \"Sales\" }},\n      \"roles\": [\"editor\"]\n    }}\n  ]\n}}",
                e
            )
        })?;

    let realm = match storage::get_realm_by_name(db, &sync_file.realm)
        .await
        .map_err(to_miette)?
    {
        Some(realm) => realm,
        None => {
            tracing::info!("Creating realm: {}", sync_file.realm);
            storage::create_realm(db, &sync_file.realm, None)
                .await
                .map_err(to_miette)?
        }
    };

    // Roles first, so assignments below can resolve them.
    let mut role_ids = std::collections::HashMap::new();
    for role_def in &sync_file.roles {
        let map = cache
            .realm_map(db, &sync_file.realm)
            .await
            .map_err(FloodgateError::from)
            .map_err(to_miette)?;
        let id = match map.role_id(&role_def.name) {
            Some(id) => id,
            None => {
                tracing::info!("Creating role: {}", role_def.name);
                storage::create_role(
                    db,
                    cache,
                    &sync_file.realm,
                    realm.id,
                    &role_def.name,
                    role_def.attributes.clone(),
                )
                .await
                .map_err(to_miette)?
                .id
            }
        };
        role_ids.insert(role_def.name.clone(), id);
    }

    let mut created = 0;
    let mut updated = 0;
    let mut unchanged = 0;

    for principal_def in &sync_file.principals {
        match sync_principal(db, cache, realm.id, principal_def, &role_ids).await? {
            SyncResult::Created => created += 1,
            SyncResult::Updated => updated += 1,
            SyncResult::Unchanged => unchanged += 1,
        }
    }

    tracing::info!(
        "Principal sync complete: {} created, {} updated, {} unchanged",
        created,
        updated,
        unchanged
    );

    Ok(())
}

#[derive(Debug)]
enum SyncResult {
    Created,
    Updated,
    Unchanged,
}

async fn sync_principal(
    db: &DatabaseConnection,
    cache: &AuthzCache,
    realm_id: i32,
    def: &PrincipalDefinition,
    role_ids: &std::collections::HashMap<String, i32>,
) -> Result<SyncResult> {
    let attributes = def.attributes.clone().unwrap_or_else(|| json!({}));

    let existing = storage::get_principal_by_username(db, realm_id, &def.username)
        .await
        .map_err(to_miette)?;

    let (principal, result) = match existing {
        None => {
            tracing::info!("Creating principal: {}", def.username);
            let model =
                storage::create_principal(db, cache, realm_id, &def.username, attributes)
                    .await
                    .map_err(to_miette)?;
            (model, SyncResult::Created)
        }
        Some(existing) => {
            if existing.attributes != attributes {
                tracing::info!("Updating principal: {}", def.username);
                storage::update_principal_attributes(
                    db,
                    cache,
                    realm_id,
                    &def.username,
                    attributes,
                )
                .await
                .map_err(to_miette)?;
                (existing, SyncResult::Updated)
            } else {
                (existing, SyncResult::Unchanged)
            }
        }
    };

    for role_name in &def.roles {
        let Some(role_id) = role_ids.get(role_name) else {
            return Err(miette::miette!(
                "Principal `{}` references undefined role `{}`",
                def.username,
                role_name
            ));
        };
        storage::assign_role(db, cache, realm_id, &def.username, principal.id, *role_id)
            .await
            .map_err(to_miette)?;
    }

    Ok(result)
}

fn to_miette(err: FloodgateError) -> miette::Report {
    miette::miette!("{err}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::cache::AuthzCache;
    use sea_orm::Database;
    use sea_orm_migration::MigratorTrait;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::{NamedTempFile, TempDir};

    async fn test_db(dir: &TempDir) -> sea_orm::DatabaseConnection {
        let path = dir.path().join("sync.db");
        let url = format!("sqlite://{}?mode=rwc", path.display());
        let db = Database::connect(&url).await.unwrap();
        migration::Migrator::up(&db, None).await.unwrap();
        db
    }

    fn sync_file(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[tokio::test]
    async fn test_sync_creates_realm_roles_and_principals() {
        let dir = TempDir::new().unwrap();
        let db = test_db(&dir).await;
        let cache = AuthzCache::new(Duration::from_secs(60));

        let file = sync_file(
            r#"{
                "realm": "tenant-a",
                "roles": [{ "name": "editor" }],
                "principals": [
                    { "username": "alice", "attributes": { "dept": "Sales" }, "roles": ["editor"] }
                ]
            }"#,
        );

        sync_from_file(&db, &cache, file.path().to_str().unwrap())
            .await
            .unwrap();

        let realm = storage::get_realm_by_name(&db, "tenant-a").await.unwrap().unwrap();
        let alice = storage::get_principal_by_username(&db, realm.id, "alice")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(alice.attributes["dept"], "Sales");

        let entry = cache.principal(&db, realm.id, "alice").await.unwrap();
        assert_eq!(entry.role_ids.len(), 1);
    }

    #[tokio::test]
    async fn test_sync_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let db = test_db(&dir).await;
        let cache = AuthzCache::new(Duration::from_secs(60));

        let file = sync_file(
            r#"{
                "realm": "tenant-a",
                "principals": [{ "username": "bob" }]
            }"#,
        );

        sync_from_file(&db, &cache, file.path().to_str().unwrap())
            .await
            .unwrap();
        sync_from_file(&db, &cache, file.path().to_str().unwrap())
            .await
            .unwrap();

        let realm = storage::get_realm_by_name(&db, "tenant-a").await.unwrap().unwrap();
        assert!(storage::get_principal_by_username(&db, realm.id, "bob")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_sync_rejects_undefined_role() {
        let dir = TempDir::new().unwrap();
        let db = test_db(&dir).await;
        let cache = AuthzCache::new(Duration::from_secs(60));

        let file = sync_file(
            r#"{
                "realm": "tenant-a",
                "principals": [{ "username": "carol", "roles": ["ghost"] }]
            }"#,
        );

        assert!(sync_from_file(&db, &cache, file.path().to_str().unwrap())
            .await
            .is_err());
    }
}
