//! Engine pipeline tests over a scripted (mock) Postgres store, covering the
//! paths that execute compiled fragments: EXISTS decisions, id selection and
//! predicate assembly.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use sea_orm::{DatabaseBackend, DatabaseConnection, MockDatabase, Value as DbValue};
use serde_json::json;

use floodgate::audit::AuditSink;
use floodgate::authz::cache::AuthzCache;
use floodgate::authz::engine::Engine;
use floodgate::authz::types::*;
use floodgate::entities;

const REALM_ID: i32 = 7;
const TYPE_ID: i32 = 11;
const ACTION_ID: i32 = 1;
const ROLE_ID: i32 = 21;

/// Scripted realm bootstrap: realm row, actions, types, roles, in the exact
/// order the cache populates its maps in.
fn realm_bootstrap(mock: MockDatabase) -> MockDatabase {
    mock.append_query_results([vec![entities::realm::Model {
        id: REALM_ID,
        name: "tenant-a".into(),
        description: None,
        is_active: true,
    }]])
    .append_query_results([vec![entities::action::Model {
        id: ACTION_ID,
        realm_id: REALM_ID,
        name: "view".into(),
    }]])
    .append_query_results([vec![entities::resource_type::Model {
        id: TYPE_ID,
        realm_id: REALM_ID,
        name: "secrets".into(),
        is_public: false,
    }]])
    .append_query_results([vec![entities::auth_role::Model {
        id: ROLE_ID,
        realm_id: REALM_ID,
        name: "editor".into(),
        attributes: None,
    }]])
}

fn rule_row(
    conditions: serde_json::Value,
    compiled_sql: &str,
    compiled_params: serde_json::Value,
    resource_id: Option<i32>,
) -> entities::acl_rule::Model {
    entities::acl_rule::Model {
        id: 1,
        realm_id: REALM_ID,
        resource_type_id: TYPE_ID,
        action_id: ACTION_ID,
        principal_id: Some(0),
        role_id: None,
        resource_id,
        conditions: Some(conditions),
        compiled_sql: Some(compiled_sql.to_string()),
        compiled_params: Some(compiled_params),
        compiled_hash: Some("deadbeef".to_string()),
    }
}

fn engine_for(db: DatabaseConnection) -> Engine {
    let cache = Arc::new(AuthzCache::new(Duration::from_secs(300)));
    let (sink, _rx) = AuditSink::new(64);
    Engine::new(db, cache, sink, 1)
}

fn anonymous_request(item: AccessItem) -> CheckAccessRequest {
    CheckAccessRequest {
        realm_name: "tenant-a".to_string(),
        principal_name: None,
        req_access: vec![item],
        role_names: None,
        auth_context: None,
    }
}

#[tokio::test]
async fn test_public_type_decision_fetches_no_rules() {
    // Only the realm bootstrap is scripted: a rule fetch or predicate query
    // would hit the end of the mock and fail the check.
    let db = MockDatabase::new(DatabaseBackend::Postgres)
        .append_query_results([vec![entities::realm::Model {
            id: REALM_ID,
            name: "tenant-a".into(),
            description: None,
            is_active: true,
        }]])
        .append_query_results([vec![entities::action::Model {
            id: ACTION_ID,
            realm_id: REALM_ID,
            name: "view".into(),
        }]])
        .append_query_results([vec![entities::resource_type::Model {
            id: TYPE_ID,
            realm_id: REALM_ID,
            name: "public_docs".into(),
            is_public: true,
        }]])
        .append_query_results([Vec::<entities::auth_role::Model>::new()])
        .into_connection();

    let engine = engine_for(db);
    let resp = engine
        .check_access(&anonymous_request(AccessItem {
            resource_type_name: "public_docs".to_string(),
            action_name: "view".to_string(),
            return_type: ReturnType::Decision,
            external_resource_ids: None,
        }))
        .await
        .unwrap();

    assert_eq!(resp.results[0].answer, AccessAnswer::Decision(true));
}

#[tokio::test]
async fn test_decision_executes_exists_over_stored_fragment() {
    let mut exists_row = BTreeMap::new();
    exists_row.insert("granted", DbValue::from(true));

    let db = realm_bootstrap(MockDatabase::new(DatabaseBackend::Postgres))
        .append_query_results([vec![rule_row(
            json!({ "op": "=", "attr": "status", "val": "active" }),
            "resource.attributes->>'status' = ?",
            json!(["active"]),
            None,
        )]])
        .append_query_results([vec![exists_row]])
        .into_connection();

    let engine = engine_for(db.clone());
    let resp = engine
        .check_access(&anonymous_request(AccessItem {
            resource_type_name: "secrets".to_string(),
            action_name: "view".to_string(),
            return_type: ReturnType::Decision,
            external_resource_ids: None,
        }))
        .await
        .unwrap();

    assert_eq!(resp.results[0].answer, AccessAnswer::Decision(true));
    drop(engine);

    // The assembled statement pins the partition, renumbers the stored
    // placeholder and never inlines the literal.
    let log = format!("{:?}", db.into_transaction_log());
    assert!(log.contains("SELECT EXISTS("));
    assert!(log.contains("resource.realm_id = $2 AND resource.resource_type_id = $3"));
    assert!(log.contains("resource.attributes->>'status' = $4"));
    assert!(!log.contains("'active'"));
}

#[tokio::test]
async fn test_id_list_selects_and_reverse_maps() {
    let mut row1 = BTreeMap::new();
    row1.insert("id", DbValue::from(101i32));
    let mut row2 = BTreeMap::new();
    row2.insert("id", DbValue::from(103i32));

    let db = realm_bootstrap(MockDatabase::new(DatabaseBackend::Postgres))
        .append_query_results([vec![rule_row(
            json!({ "op": "=", "attr": "status", "val": "active" }),
            "resource.attributes->>'status' = ?",
            json!(["active"]),
            None,
        )]])
        .append_query_results([vec![row1, row2]])
        .append_query_results([vec![
            entities::external_id::Model {
                realm_id: REALM_ID,
                resource_type_id: TYPE_ID,
                external_id: "doc-1".into(),
                resource_id: 101,
            },
            entities::external_id::Model {
                realm_id: REALM_ID,
                resource_type_id: TYPE_ID,
                external_id: "doc-3".into(),
                resource_id: 103,
            },
        ]])
        .into_connection();

    let engine = engine_for(db);
    let resp = engine
        .check_access(&anonymous_request(AccessItem {
            resource_type_name: "secrets".to_string(),
            action_name: "view".to_string(),
            return_type: ReturnType::IdList,
            external_resource_ids: None,
        }))
        .await
        .unwrap();

    assert_eq!(
        resp.results[0].answer,
        AccessAnswer::IdList(vec!["doc-1".to_string(), "doc-3".to_string()])
    );
}

#[tokio::test]
async fn test_spatial_rule_compiles_context_binding_into_predicate() {
    // Rule: resource within 5km of the caller-supplied location. The residual
    // evaluator substitutes $context.loc with a canonical-projection literal
    // and the fresh fragment uses the EWKT constructor.
    let mut exists_row = BTreeMap::new();
    exists_row.insert("granted", DbValue::from(true));

    let db = realm_bootstrap(MockDatabase::new(DatabaseBackend::Postgres))
        .append_query_results([vec![rule_row(
            json!({
                "op": "st_dwithin", "attr": "geometry",
                "val": "$context.loc", "args": 5000
            }),
            "ST_DWithin(resource.geometry, floodgate_parse_geometry((ctx->'context'->'loc')::text), ?)",
            json!([5000.0]),
            None,
        )]])
        .append_query_results([vec![exists_row]])
        .into_connection();

    let engine = engine_for(db.clone());
    let resp = engine
        .check_access(&CheckAccessRequest {
            realm_name: "tenant-a".to_string(),
            principal_name: None,
            req_access: vec![AccessItem {
                resource_type_name: "secrets".to_string(),
                action_name: "view".to_string(),
                return_type: ReturnType::Decision,
                external_resource_ids: None,
            }],
            role_names: None,
            auth_context: Some(json!({ "loc": "POINT(23.7275 37.9838)" })),
        })
        .await
        .unwrap();

    assert_eq!(resp.results[0].answer, AccessAnswer::Decision(true));
    drop(engine);

    let log = format!("{:?}", db.into_transaction_log());
    assert!(log.contains("ST_DWithin(resource.geometry, ST_GeomFromEWKT($4), $5)"));
    // The bound literal is the normalized web-mercator point.
    assert!(log.contains("SRID=3857;POINT"));
}

#[tokio::test]
async fn test_resource_scoped_conditional_clause_pins_resource_id() {
    let mut exists_row = BTreeMap::new();
    exists_row.insert("granted", DbValue::from(false));

    let db = realm_bootstrap(MockDatabase::new(DatabaseBackend::Postgres))
        .append_query_results([vec![rule_row(
            json!({ "op": "=", "attr": "status", "val": "active" }),
            "resource.attributes->>'status' = ?",
            json!(["active"]),
            Some(42),
        )]])
        .append_query_results([vec![exists_row]])
        .into_connection();

    let engine = engine_for(db.clone());
    let resp = engine
        .check_access(&anonymous_request(AccessItem {
            resource_type_name: "secrets".to_string(),
            action_name: "view".to_string(),
            return_type: ReturnType::Decision,
            external_resource_ids: None,
        }))
        .await
        .unwrap();

    assert_eq!(resp.results[0].answer, AccessAnswer::Decision(false));
    drop(engine);

    let log = format!("{:?}", db.into_transaction_log());
    assert!(log.contains("(resource.id = $4 AND (resource.attributes->>'status' = $5))"));
}
