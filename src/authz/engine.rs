//! The authorization runner: per request it resolves symbolic names through
//! the cache, applies the three-level waterfall (public type → type-scoped
//! rules → resource-scoped rules), partially evaluates rule conditions
//! against the bound request, and either short-circuits to a verdict or
//! pushes the assembled predicate into the store.
//!
//! Access items within one request run concurrently with bounded parallelism
//! and their results are reassembled in request order. Rules are disjoined:
//! any match grants; absence of a match denies. There is no explicit deny.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use sea_orm::{
    ColumnTrait, Condition as SqlCond, ConnectionTrait, DatabaseConnection, EntityTrait,
    QueryFilter, Statement,
};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::audit::{AuditEntry, AuditSink};
use crate::authz::cache::{AuthzCache, PrincipalEntry, RealmMap, TypeEntry};
use crate::authz::compiler::{self, CompiledSql};
use crate::authz::condition::{Condition, LeafNode, LeafOp, LogicalNode, LogicalOp, Source};
use crate::authz::errors::AuthzError;
use crate::authz::residual::{residualize, RequestContext, Residual};
use crate::authz::types::*;
use crate::entities;

/// Reserved id of the anonymous principal. It is part of every request's
/// subject set, so explicit anonymous grants apply to authenticated and
/// unauthenticated callers alike.
pub const ANONYMOUS_PRINCIPAL_ID: i32 = 0;

pub struct Engine {
    db: DatabaseConnection,
    cache: Arc<AuthzCache>,
    audit: AuditSink,
    item_concurrency: usize,
}

#[derive(Debug, Clone)]
struct SubjectSet {
    principal_id: i32,
    role_ids: Vec<i32>,
}

/// Per-item mapping between external and internal ids, in request order.
#[derive(Debug, Default, Clone)]
struct ResolvedIds {
    internal: Vec<i32>,
    external_by_internal: HashMap<i32, String>,
}

impl Engine {
    pub fn new(
        db: DatabaseConnection,
        cache: Arc<AuthzCache>,
        audit: AuditSink,
        item_concurrency: usize,
    ) -> Self {
        Self {
            db,
            cache,
            audit,
            item_concurrency: item_concurrency.max(1),
        }
    }

    // ─── check_access ───────────────────────────────────────────────────

    pub async fn check_access(
        &self,
        req: &CheckAccessRequest,
    ) -> Result<CheckAccessResponse, AuthzError> {
        let map = self.cache.realm_map(&self.db, &req.realm_name).await?;

        let (subjects, ctx) = match self
            .bind_request(&map, req.principal_name.as_deref(), req.role_names.as_deref(), req.auth_context.clone())
            .await
        {
            Ok(bound) => bound,
            Err(AuthzError::UnknownEntity(what)) => {
                // An unresolvable principal denies every item rather than
                // faulting the request.
                warn!(realm = %req.realm_name, "{what} not found, denying all items");
                let results = req
                    .req_access
                    .iter()
                    .map(|item| AccessResponseItem {
                        resource_type_name: item.resource_type_name.clone(),
                        action_name: item.action_name.clone(),
                        answer: deny_answer(item.return_type),
                    })
                    .collect();
                return Ok(CheckAccessResponse { results });
            }
            Err(other) => return Err(other),
        };

        let preresolved = self.batch_resolve_external_ids(&map, &req.req_access).await?;

        let outcomes: Vec<Result<(AccessResponseItem, AuditEntry), AuthzError>> =
            stream::iter(req.req_access.iter().map(|item| {
                self.process_item(item, &map, &subjects, &ctx, &preresolved)
            }))
            .buffered(self.item_concurrency)
            .collect()
            .await;

        let mut results = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            let (result, audit) = outcome?;
            self.audit.record(audit);
            results.push(result);
        }
        Ok(CheckAccessResponse { results })
    }

    async fn process_item(
        &self,
        item: &AccessItem,
        map: &RealmMap,
        subjects: &SubjectSet,
        ctx: &RequestContext,
        preresolved: &HashMap<String, HashMap<String, i32>>,
    ) -> Result<(AccessResponseItem, AuditEntry), AuthzError> {
        let denied = |answer: AccessAnswer| {
            (
                AccessResponseItem {
                    resource_type_name: item.resource_type_name.clone(),
                    action_name: item.action_name.clone(),
                    answer,
                },
                AuditEntry {
                    realm_id: map.realm_id,
                    principal_id: subjects.principal_id,
                    action_name: Some(item.action_name.clone()),
                    resource_type_name: Some(item.resource_type_name.clone()),
                    decision: false,
                    resource_ids: None,
                    external_resource_ids: None,
                },
            )
        };

        // Name resolution; unresolved names deny the item, they never fault.
        let type_entry = match map.type_entry(&item.resource_type_name) {
            Ok(entry) => entry,
            Err(err) => {
                if item.external_resource_ids.is_some() {
                    warn!(
                        "{}",
                        AuthzError::AmbiguousExternalId(format!(
                            "external ids supplied for unknown type `{}`",
                            item.resource_type_name
                        ))
                    );
                } else {
                    debug!("{err}, denying item");
                }
                return Ok(denied(deny_answer(item.return_type)));
            }
        };
        let action_id = match map.action_id(&item.action_name) {
            Ok(id) => id,
            Err(err) => {
                debug!("{err}, denying item");
                return Ok(denied(deny_answer(item.return_type)));
            }
        };

        let resolved = resolve_item_ids(item, &item.resource_type_name, preresolved);

        // Level 1: a public type grants without touching rules.
        if type_entry.is_public {
            return Ok(self.answer_granted(item, map, subjects, type_entry, &resolved, true).await?);
        }

        // Levels 2 and 3: fetch candidate rules and residualize each.
        let rules = self
            .fetch_candidate_rules(map.realm_id, type_entry.id, Some(action_id), subjects)
            .await?;

        let mut type_granted = false;
        let mut direct_ids: Vec<i32> = Vec::new();
        let mut clauses: Vec<(Option<i32>, CompiledSql)> = Vec::new();

        for rule in &rules {
            match residualize_rule(rule, ctx) {
                None => continue, // malformed or denied
                Some(RuleResidual::Granted) => match rule.resource_id {
                    None => type_granted = true,
                    Some(rid) => {
                        if item.external_resource_ids.is_some() {
                            // Resolution already proved existence; no store
                            // round trip needed.
                            direct_ids.push(rid);
                        } else {
                            clauses.push((Some(rid), CompiledSql::always_true()));
                        }
                    }
                },
                Some(RuleResidual::Conditional(compiled)) => {
                    clauses.push((rule.resource_id, compiled));
                }
            }
            if type_granted {
                break;
            }
        }

        if type_granted {
            return Ok(self
                .answer_granted(item, map, subjects, type_entry, &resolved, false)
                .await?);
        }

        // External ids were requested but none resolved and nothing grants
        // at type level: deny without a store query.
        if item.external_resource_ids.is_some() && resolved.internal.is_empty() {
            return Ok(denied(deny_answer(item.return_type)));
        }

        let mut authorized: HashSet<i32> = HashSet::new();
        if item.external_resource_ids.is_some() {
            let requested: HashSet<i32> = resolved.internal.iter().copied().collect();
            authorized.extend(direct_ids.iter().copied().filter(|id| requested.contains(id)));
        }

        let mut exists_answer = None;
        if !clauses.is_empty() {
            let id_filter = item
                .external_resource_ids
                .as_ref()
                .map(|_| resolved.internal.as_slice());
            let use_exists =
                item.return_type == ReturnType::Decision && id_filter.is_none() && authorized.is_empty();
            let stmt = self.build_predicate_query(
                map.realm_id,
                type_entry.id,
                &ctx.document(),
                &clauses,
                id_filter,
                use_exists,
            );
            if use_exists {
                let row = self.query_one_retry(stmt).await?;
                let granted = match row {
                    Some(row) => row.try_get::<bool>("", "granted").unwrap_or(false),
                    None => false,
                };
                exists_answer = Some(granted);
            } else {
                for row in self.query_all_retry(stmt).await? {
                    if let Ok(id) = row.try_get::<i32>("", "id") {
                        authorized.insert(id);
                    }
                }
            }
        }

        // Produce the answer.
        let (answer, decision, external_out, internal_out) = match item.return_type {
            ReturnType::Decision => {
                let granted = exists_answer.unwrap_or(false) || !authorized.is_empty();
                (AccessAnswer::Decision(granted), granted, None, None)
            }
            ReturnType::IdList => {
                let externals = if item.external_resource_ids.is_some() {
                    // Request order, unresolved and unauthorized ids omitted.
                    resolved
                        .internal
                        .iter()
                        .filter(|id| authorized.contains(id))
                        .filter_map(|id| resolved.external_by_internal.get(id).cloned())
                        .collect::<Vec<_>>()
                } else {
                    self.reverse_map_external_ids(map.realm_id, type_entry.id, &authorized)
                        .await?
                };
                let decision = !externals.is_empty();
                let internal: Vec<i32> = authorized.iter().copied().collect();
                (
                    AccessAnswer::IdList(externals.clone()),
                    decision,
                    Some(externals),
                    Some(internal),
                )
            }
        };

        let audit = AuditEntry {
            realm_id: map.realm_id,
            principal_id: subjects.principal_id,
            action_name: Some(item.action_name.clone()),
            resource_type_name: Some(item.resource_type_name.clone()),
            decision,
            resource_ids: if item.external_resource_ids.is_none() {
                internal_out.filter(|ids| !ids.is_empty())
            } else {
                None
            },
            external_resource_ids: external_out.filter(|ids| !ids.is_empty()),
        };

        Ok((
            AccessResponseItem {
                resource_type_name: item.resource_type_name.clone(),
                action_name: item.action_name.clone(),
                answer,
            },
            audit,
        ))
    }

    /// Terminal answer for Level-1 public access and type-scoped grants.
    async fn answer_granted(
        &self,
        item: &AccessItem,
        map: &RealmMap,
        subjects: &SubjectSet,
        type_entry: TypeEntry,
        resolved: &ResolvedIds,
        public: bool,
    ) -> Result<(AccessResponseItem, AuditEntry), AuthzError> {
        let externals: Vec<String> = match &item.external_resource_ids {
            Some(requested) => {
                if resolved.internal.is_empty() && !public {
                    // A type-scoped grant covers resources the store has never
                    // seen; echo the requested ids back.
                    requested.clone()
                } else {
                    resolved
                        .internal
                        .iter()
                        .filter_map(|id| resolved.external_by_internal.get(id).cloned())
                        .collect()
                }
            }
            None => match item.return_type {
                ReturnType::Decision => Vec::new(),
                ReturnType::IdList => {
                    self.all_external_ids(map.realm_id, type_entry.id).await?
                }
            },
        };

        let (answer, decision) = match item.return_type {
            ReturnType::Decision => {
                let granted = item.external_resource_ids.is_none() || !externals.is_empty();
                (AccessAnswer::Decision(granted), granted)
            }
            ReturnType::IdList => {
                let decision = !externals.is_empty();
                (AccessAnswer::IdList(externals.clone()), decision)
            }
        };

        Ok((
            AccessResponseItem {
                resource_type_name: item.resource_type_name.clone(),
                action_name: item.action_name.clone(),
                answer,
            },
            AuditEntry {
                realm_id: map.realm_id,
                principal_id: subjects.principal_id,
                action_name: Some(item.action_name.clone()),
                resource_type_name: Some(item.resource_type_name.clone()),
                decision,
                resource_ids: None,
                external_resource_ids: if externals.is_empty() {
                    None
                } else {
                    Some(externals)
                },
            },
        ))
    }

    // ─── get_authorization_conditions ───────────────────────────────────

    /// Resolve the `(type, action)` pair to a verdict or a residual filter
    /// DSL without executing any predicate query.
    pub async fn authorization_conditions(
        &self,
        req: &ConditionsRequest,
    ) -> Result<AuthorizationConditions, AuthzError> {
        let map = self.cache.realm_map(&self.db, &req.realm_name).await?;
        let type_entry = map.type_entry(&req.resource_type_name)?;
        let action_id = map.action_id(&req.action_name)?;

        if type_entry.is_public {
            return Ok(AuthorizationConditions {
                filter_type: FilterType::GrantedAll,
                conditions_dsl: None,
                has_context_refs: false,
            });
        }

        let (subjects, ctx) = match self
            .bind_request(&map, req.principal_name.as_deref(), req.role_names.as_deref(), req.auth_context.clone())
            .await
        {
            Ok(bound) => bound,
            Err(AuthzError::UnknownEntity(_)) => {
                return Ok(AuthorizationConditions {
                    filter_type: FilterType::DeniedAll,
                    conditions_dsl: None,
                    has_context_refs: false,
                });
            }
            Err(other) => return Err(other),
        };

        let rules = self
            .fetch_candidate_rules(map.realm_id, type_entry.id, Some(action_id), &subjects)
            .await?;

        let mut has_context_refs = false;
        let mut branches: Vec<Condition> = Vec::new();
        // (rule resource id, residual) pairs waiting for their external id.
        let mut resource_branches: Vec<(i32, Option<Condition>)> = Vec::new();

        for rule in &rules {
            // Both SQL NULL and a stored JSON null mean "no conditions".
            let no_conditions = rule.conditions.as_ref().map_or(true, Value::is_null);
            if no_conditions && rule.resource_id.is_none() {
                // Type-scoped blanket grant short-circuits everything.
                return Ok(AuthorizationConditions {
                    filter_type: FilterType::GrantedAll,
                    conditions_dsl: None,
                    has_context_refs: false,
                });
            }

            let residual = match &rule.conditions {
                None => Residual::GrantedAll,
                Some(raw) if raw.is_null() => Residual::GrantedAll,
                Some(raw) => match Condition::from_value(raw) {
                    Ok(tree) => {
                        has_context_refs |= tree.has_context_refs();
                        residualize(&tree, &ctx)
                    }
                    Err(err) => {
                        warn!(rule = rule.id, "skipping malformed rule conditions: {err}");
                        continue;
                    }
                },
            };

            match (rule.resource_id, residual) {
                (_, Residual::DeniedAll) => {}
                (None, Residual::GrantedAll) => {
                    // A context-conditional type rule fully satisfied by this
                    // request grants everything.
                    return Ok(AuthorizationConditions {
                        filter_type: FilterType::GrantedAll,
                        conditions_dsl: None,
                        has_context_refs,
                    });
                }
                (None, Residual::Conditions(tree)) => branches.push(tree),
                (Some(rid), Residual::GrantedAll) => resource_branches.push((rid, None)),
                (Some(rid), Residual::Conditions(tree)) => {
                    resource_branches.push((rid, Some(tree)))
                }
            }
        }

        // Resource-scoped branches are expressed through external ids; rules
        // whose resource has no external id cannot appear in the filter and
        // are omitted.
        if !resource_branches.is_empty() {
            let ids: Vec<i32> = resource_branches.iter().map(|(rid, _)| *rid).collect();
            let ext_by_internal = self
                .external_ids_for_resources(map.realm_id, type_entry.id, &ids)
                .await?;
            let mut unconditional_ext: Vec<String> = Vec::new();
            for (rid, tree) in resource_branches {
                let Some(ext) = ext_by_internal.get(&rid) else {
                    continue;
                };
                match tree {
                    None => unconditional_ext.push(ext.clone()),
                    Some(tree) => branches.push(Condition::Logical(LogicalNode {
                        op: LogicalOp::And,
                        conditions: vec![external_id_leaf(LeafOp::Eq, json!(ext)), tree],
                    })),
                }
            }
            if !unconditional_ext.is_empty() {
                branches.push(external_id_leaf(LeafOp::In, json!(unconditional_ext)));
            }
        }

        Ok(match branches.len() {
            0 => AuthorizationConditions {
                filter_type: FilterType::DeniedAll,
                conditions_dsl: None,
                has_context_refs: false,
            },
            1 => AuthorizationConditions {
                filter_type: FilterType::Conditions,
                conditions_dsl: branches.into_iter().next(),
                has_context_refs,
            },
            _ => AuthorizationConditions {
                filter_type: FilterType::Conditions,
                conditions_dsl: Some(Condition::Logical(LogicalNode {
                    op: LogicalOp::Or,
                    conditions: branches,
                })),
                has_context_refs,
            },
        })
    }

    // ─── get_permitted_actions ──────────────────────────────────────────

    /// For each requested resource (or the bare type), the set of action
    /// names whose rules grant access to this request.
    pub async fn permitted_actions(
        &self,
        req: &PermittedActionsRequest,
    ) -> Result<PermittedActionsResponse, AuthzError> {
        let map = self.cache.realm_map(&self.db, &req.realm_name).await?;
        let (subjects, ctx) = match self
            .bind_request(&map, req.principal_name.as_deref(), req.role_names.as_deref(), req.auth_context.clone())
            .await
        {
            Ok(bound) => bound,
            Err(AuthzError::UnknownEntity(_)) => {
                let results = req
                    .resources
                    .iter()
                    .flat_map(empty_action_rows)
                    .collect();
                return Ok(PermittedActionsResponse { results });
            }
            Err(other) => return Err(other),
        };

        let action_names: HashMap<i32, &String> =
            map.actions.iter().map(|(name, id)| (*id, name)).collect();

        let mut results = Vec::new();
        for res_item in &req.resources {
            let Ok(type_entry) = map.type_entry(&res_item.resource_type_name) else {
                results.extend(empty_action_rows(res_item));
                continue;
            };

            if type_entry.is_public {
                // Level-1 access is action-independent.
                let mut all: Vec<String> = map.actions.keys().cloned().collect();
                all.sort();
                results.extend(action_rows(res_item, |_| all.clone()));
                continue;
            }

            let resolved = self
                .resolve_external_ids(map.realm_id, type_entry.id, res_item.external_resource_ids.as_deref())
                .await?;

            let rules = self
                .fetch_candidate_rules(map.realm_id, type_entry.id, None, &subjects)
                .await?;

            let mut type_level: HashSet<String> = HashSet::new();
            let mut per_resource: HashMap<i32, HashSet<String>> = HashMap::new();
            let mut conditional: HashMap<i32, Vec<(Option<i32>, CompiledSql)>> = HashMap::new();

            for rule in &rules {
                let Some(action_name) = action_names.get(&rule.action_id) else {
                    continue;
                };
                match residualize_rule(rule, &ctx) {
                    None => {}
                    Some(RuleResidual::Granted) => match rule.resource_id {
                        None => {
                            type_level.insert((*action_name).clone());
                        }
                        Some(rid) => {
                            per_resource.entry(rid).or_default().insert((*action_name).clone());
                        }
                    },
                    Some(RuleResidual::Conditional(compiled)) => {
                        conditional
                            .entry(rule.action_id)
                            .or_default()
                            .push((rule.resource_id, compiled));
                    }
                }
            }

            // Conditional rules need the store; restrict to the resolved ids.
            if !resolved.internal.is_empty() {
                for (action_id, clauses) in &conditional {
                    let Some(action_name) = action_names.get(action_id) else {
                        continue;
                    };
                    let stmt = self.build_predicate_query(
                        map.realm_id,
                        type_entry.id,
                        &ctx.document(),
                        clauses,
                        Some(resolved.internal.as_slice()),
                        false,
                    );
                    for row in self.query_all_retry(stmt).await? {
                        if let Ok(id) = row.try_get::<i32>("", "id") {
                            per_resource.entry(id).or_default().insert((*action_name).clone());
                        }
                    }
                }
            }

            match &res_item.external_resource_ids {
                Some(requested) => {
                    for ext in requested {
                        let mut actions: HashSet<String> = type_level.clone();
                        if let Some(internal) = resolved
                            .external_by_internal
                            .iter()
                            .find_map(|(id, e)| (e == ext).then_some(*id))
                        {
                            if let Some(extra) = per_resource.get(&internal) {
                                actions.extend(extra.iter().cloned());
                            }
                        }
                        let mut actions: Vec<String> = actions.into_iter().collect();
                        actions.sort();
                        self.audit.record(AuditEntry {
                            realm_id: map.realm_id,
                            principal_id: subjects.principal_id,
                            action_name: None,
                            resource_type_name: Some(res_item.resource_type_name.clone()),
                            decision: !actions.is_empty(),
                            resource_ids: None,
                            external_resource_ids: Some(vec![ext.clone()]),
                        });
                        results.push(PermittedActionsResponseItem {
                            resource_type_name: res_item.resource_type_name.clone(),
                            external_resource_id: Some(ext.clone()),
                            actions,
                        });
                    }
                }
                None => {
                    let mut actions: Vec<String> = type_level.into_iter().collect();
                    actions.sort();
                    self.audit.record(AuditEntry {
                        realm_id: map.realm_id,
                        principal_id: subjects.principal_id,
                        action_name: None,
                        resource_type_name: Some(res_item.resource_type_name.clone()),
                        decision: !actions.is_empty(),
                        resource_ids: None,
                        external_resource_ids: None,
                    });
                    results.push(PermittedActionsResponseItem {
                        resource_type_name: res_item.resource_type_name.clone(),
                        external_resource_id: None,
                        actions,
                    });
                }
            }
        }

        Ok(PermittedActionsResponse { results })
    }

    // ─── Request binding ────────────────────────────────────────────────

    async fn bind_request(
        &self,
        map: &RealmMap,
        principal_name: Option<&str>,
        role_names: Option<&[String]>,
        auth_context: Option<Value>,
    ) -> Result<(SubjectSet, RequestContext), AuthzError> {
        let principal: Option<Arc<PrincipalEntry>> = match principal_name {
            None => None,
            Some(name) => Some(self.cache.principal(&self.db, map.realm_id, name).await?),
        };

        let assigned: Vec<i32> = principal.as_ref().map(|p| p.role_ids.clone()).unwrap_or_default();
        let role_ids = match role_names {
            None => assigned,
            Some(names) => {
                // The override restricts, never extends: only roles the
                // principal actually holds survive the intersection.
                let mut requested: Vec<i32> =
                    names.iter().filter_map(|n| map.role_id(n)).collect();
                requested.retain(|id| assigned.contains(id));
                requested
            }
        };

        let subjects = SubjectSet {
            principal_id: principal.as_ref().map(|p| p.id).unwrap_or(ANONYMOUS_PRINCIPAL_ID),
            role_ids,
        };

        let principal_doc = match &principal {
            None => json!({
                "id": ANONYMOUS_PRINCIPAL_ID,
                "username": "anonymous",
                "realm_id": map.realm_id,
                "is_anonymous": true,
            }),
            Some(p) => {
                let mut doc = match &p.attributes {
                    Value::Object(attrs) => Value::Object(attrs.clone()),
                    _ => json!({}),
                };
                doc["id"] = json!(p.id);
                doc["username"] = json!(p.username);
                doc["realm_id"] = json!(map.realm_id);
                doc
            }
        };

        let ctx = RequestContext::new(principal_doc, auth_context.unwrap_or_else(|| json!({})));
        Ok((subjects, ctx))
    }

    // ─── Store access ───────────────────────────────────────────────────

    async fn fetch_candidate_rules(
        &self,
        realm_id: i32,
        type_id: i32,
        action_id: Option<i32>,
        subjects: &SubjectSet,
    ) -> Result<Vec<entities::acl_rule::Model>, AuthzError> {
        let mut subject_cond = SqlCond::any().add(
            entities::acl_rule::Column::PrincipalId
                .is_in(vec![subjects.principal_id, ANONYMOUS_PRINCIPAL_ID]),
        );
        if !subjects.role_ids.is_empty() {
            subject_cond =
                subject_cond.add(entities::acl_rule::Column::RoleId.is_in(subjects.role_ids.clone()));
        }

        let mut query = entities::AclRule::find()
            .filter(entities::acl_rule::Column::RealmId.eq(realm_id))
            .filter(entities::acl_rule::Column::ResourceTypeId.eq(type_id))
            .filter(subject_cond);
        if let Some(action_id) = action_id {
            query = query.filter(entities::acl_rule::Column::ActionId.eq(action_id));
        }
        Ok(query.all(&self.db).await?)
    }

    /// Resolve every external id in the request up front: cache first, then
    /// one batched store query per resource type for the misses.
    async fn batch_resolve_external_ids(
        &self,
        map: &RealmMap,
        items: &[AccessItem],
    ) -> Result<HashMap<String, HashMap<String, i32>>, AuthzError> {
        let mut wanted: HashMap<String, (i32, Vec<String>)> = HashMap::new();
        for item in items {
            let Some(ext_ids) = &item.external_resource_ids else {
                continue;
            };
            let Ok(entry) = map.type_entry(&item.resource_type_name) else {
                continue;
            };
            let slot = wanted
                .entry(item.resource_type_name.clone())
                .or_insert_with(|| (entry.id, Vec::new()));
            for ext in ext_ids {
                if !slot.1.contains(ext) {
                    slot.1.push(ext.clone());
                }
            }
        }

        let mut result = HashMap::new();
        for (type_name, (type_id, ext_ids)) in wanted {
            let mut mappings = self
                .cache
                .get_external_ids(map.realm_id, type_id, &ext_ids)
                .await;
            let misses: Vec<String> = ext_ids
                .iter()
                .filter(|e| !mappings.contains_key(*e))
                .cloned()
                .collect();
            if !misses.is_empty() {
                let rows = entities::ExternalId::find()
                    .filter(entities::external_id::Column::RealmId.eq(map.realm_id))
                    .filter(entities::external_id::Column::ResourceTypeId.eq(type_id))
                    .filter(entities::external_id::Column::ExternalId.is_in(misses))
                    .all(&self.db)
                    .await?;
                let mut fetched = HashMap::new();
                for row in rows {
                    fetched.insert(row.external_id.clone(), row.resource_id);
                }
                self.cache
                    .insert_external_ids(map.realm_id, type_id, &fetched)
                    .await;
                mappings.extend(fetched);
            }
            result.insert(type_name, mappings);
        }
        Ok(result)
    }

    async fn resolve_external_ids(
        &self,
        realm_id: i32,
        type_id: i32,
        ext_ids: Option<&[String]>,
    ) -> Result<ResolvedIds, AuthzError> {
        let Some(ext_ids) = ext_ids else {
            return Ok(ResolvedIds::default());
        };
        let mut mappings = self.cache.get_external_ids(realm_id, type_id, ext_ids).await;
        let misses: Vec<String> = ext_ids
            .iter()
            .filter(|e| !mappings.contains_key(*e))
            .cloned()
            .collect();
        if !misses.is_empty() {
            let rows = entities::ExternalId::find()
                .filter(entities::external_id::Column::RealmId.eq(realm_id))
                .filter(entities::external_id::Column::ResourceTypeId.eq(type_id))
                .filter(entities::external_id::Column::ExternalId.is_in(misses))
                .all(&self.db)
                .await?;
            let mut fetched = HashMap::new();
            for row in rows {
                fetched.insert(row.external_id.clone(), row.resource_id);
            }
            self.cache.insert_external_ids(realm_id, type_id, &fetched).await;
            mappings.extend(fetched);
        }

        let mut resolved = ResolvedIds::default();
        for ext in ext_ids {
            if let Some(id) = mappings.get(ext) {
                if !resolved.internal.contains(id) {
                    resolved.internal.push(*id);
                }
                resolved.external_by_internal.insert(*id, ext.clone());
            }
        }
        Ok(resolved)
    }

    async fn reverse_map_external_ids(
        &self,
        realm_id: i32,
        type_id: i32,
        internal: &HashSet<i32>,
    ) -> Result<Vec<String>, AuthzError> {
        if internal.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<i32> = internal.iter().copied().collect();
        let rows = entities::ExternalId::find()
            .filter(entities::external_id::Column::RealmId.eq(realm_id))
            .filter(entities::external_id::Column::ResourceTypeId.eq(type_id))
            .filter(entities::external_id::Column::ResourceId.is_in(ids))
            .all(&self.db)
            .await?;
        let mut externals: Vec<String> = rows.into_iter().map(|row| row.external_id).collect();
        externals.sort();
        Ok(externals)
    }

    async fn all_external_ids(&self, realm_id: i32, type_id: i32) -> Result<Vec<String>, AuthzError> {
        let rows = entities::ExternalId::find()
            .filter(entities::external_id::Column::RealmId.eq(realm_id))
            .filter(entities::external_id::Column::ResourceTypeId.eq(type_id))
            .all(&self.db)
            .await?;
        let mut externals: Vec<String> = rows.into_iter().map(|row| row.external_id).collect();
        externals.sort();
        Ok(externals)
    }

    async fn external_ids_for_resources(
        &self,
        realm_id: i32,
        type_id: i32,
        resource_ids: &[i32],
    ) -> Result<HashMap<i32, String>, AuthzError> {
        let rows = entities::ExternalId::find()
            .filter(entities::external_id::Column::RealmId.eq(realm_id))
            .filter(entities::external_id::Column::ResourceTypeId.eq(type_id))
            .filter(entities::external_id::Column::ResourceId.is_in(resource_ids.to_vec()))
            .all(&self.db)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.resource_id, row.external_id))
            .collect())
    }

    // ─── Predicate assembly ─────────────────────────────────────────────

    /// Assemble the final row-filtering query. Parameter layout: `$1` is the
    /// bound context document, `$2`/`$3` pin the realm/type partition, then
    /// each clause's placeholders in order, then the optional id filter.
    fn build_predicate_query(
        &self,
        realm_id: i32,
        type_id: i32,
        ctx_doc: &Value,
        clauses: &[(Option<i32>, CompiledSql)],
        id_filter: Option<&[i32]>,
        exists: bool,
    ) -> Statement {
        let mut values: Vec<sea_orm::Value> =
            vec![ctx_doc.clone().into(), realm_id.into(), type_id.into()];
        let mut next_param = 4usize;

        let mut parts = Vec::with_capacity(clauses.len());
        for (resource_id, compiled) in clauses {
            match resource_id {
                Some(rid) => {
                    let slot = next_param;
                    next_param += 1;
                    values.push((*rid).into());
                    let frag =
                        compiler::finalize_for_postgres(&compiled.fragment, 1, &mut next_param);
                    values.extend(compiled.placeholders.iter().map(json_param));
                    parts.push(format!("(resource.id = ${slot} AND ({frag}))"));
                }
                None => {
                    let frag =
                        compiler::finalize_for_postgres(&compiled.fragment, 1, &mut next_param);
                    values.extend(compiled.placeholders.iter().map(json_param));
                    parts.push(format!("({frag})"));
                }
            }
        }

        let predicate = parts.join(" OR ");
        let mut sql = format!(
            "SELECT resource.id FROM resource \
             WHERE resource.realm_id = $2 AND resource.resource_type_id = $3 AND ({predicate})"
        );
        if let Some(ids) = id_filter {
            sql.push_str(&format!(" AND resource.id = ANY(${next_param})"));
            values.push(ids.to_vec().into());
        }
        if exists {
            sql = format!("SELECT EXISTS({sql}) AS granted");
        }

        Statement::from_sql_and_values(self.db.get_database_backend(), sql, values)
    }

    async fn query_all_retry(
        &self,
        stmt: Statement,
    ) -> Result<Vec<sea_orm::QueryResult>, AuthzError> {
        match self.db.query_all(stmt.clone()).await {
            Ok(rows) => Ok(rows),
            Err(err) => {
                let authz = AuthzError::from(err);
                if !authz.is_retryable() {
                    return Err(authz);
                }
                warn!(error = %authz, "predicate query failed, retrying once");
                self.db.query_all(stmt).await.map_err(Into::into)
            }
        }
    }

    async fn query_one_retry(
        &self,
        stmt: Statement,
    ) -> Result<Option<sea_orm::QueryResult>, AuthzError> {
        match self.db.query_one(stmt.clone()).await {
            Ok(row) => Ok(row),
            Err(err) => {
                let authz = AuthzError::from(err);
                if !authz.is_retryable() {
                    return Err(authz);
                }
                warn!(error = %authz, "predicate query failed, retrying once");
                self.db.query_one(stmt).await.map_err(Into::into)
            }
        }
    }
}

// ─── Helpers ────────────────────────────────────────────────────────────

enum RuleResidual {
    Granted,
    Conditional(CompiledSql),
}

/// Residualize one rule against the bound request. `None` means the rule
/// contributes nothing (denied, or malformed, which is an implicit deny, never a fault).
fn residualize_rule(rule: &entities::acl_rule::Model, ctx: &RequestContext) -> Option<RuleResidual> {
    let Some(raw) = &rule.conditions else {
        return Some(RuleResidual::Granted);
    };
    if raw.is_null() {
        return Some(RuleResidual::Granted);
    }
    let tree = match Condition::from_value(raw) {
        Ok(tree) => tree,
        Err(err) => {
            warn!(rule = rule.id, "skipping malformed rule conditions: {err}");
            return None;
        }
    };
    match residualize(&tree, ctx) {
        Residual::GrantedAll => Some(RuleResidual::Granted),
        Residual::DeniedAll => None,
        Residual::Conditions(residual_tree) => {
            // Unchanged trees reuse the fragment compiled at write time; a
            // simplified tree is recompiled on the spot.
            if residual_tree == tree {
                if let (Some(sql), Some(params)) = (&rule.compiled_sql, &rule.compiled_params) {
                    if let Some(placeholders) = params.as_array() {
                        return Some(RuleResidual::Conditional(CompiledSql {
                            fragment: sql.clone(),
                            placeholders: placeholders.clone(),
                        }));
                    }
                }
            }
            match compiler::compile(&residual_tree) {
                Ok(compiled) => Some(RuleResidual::Conditional(compiled)),
                Err(err) => {
                    warn!(rule = rule.id, "failed to compile residual: {err}");
                    None
                }
            }
        }
    }
}

fn resolve_item_ids(
    item: &AccessItem,
    type_name: &str,
    preresolved: &HashMap<String, HashMap<String, i32>>,
) -> ResolvedIds {
    let mut resolved = ResolvedIds::default();
    let Some(requested) = &item.external_resource_ids else {
        return resolved;
    };
    let Some(mappings) = preresolved.get(type_name) else {
        return resolved;
    };
    for ext in requested {
        if let Some(id) = mappings.get(ext) {
            if !resolved.internal.contains(id) {
                resolved.internal.push(*id);
            }
            resolved.external_by_internal.insert(*id, ext.clone());
        }
    }
    resolved
}

fn deny_answer(return_type: ReturnType) -> AccessAnswer {
    match return_type {
        ReturnType::Decision => AccessAnswer::Decision(false),
        ReturnType::IdList => AccessAnswer::IdList(Vec::new()),
    }
}

fn external_id_leaf(op: LeafOp, val: Value) -> Condition {
    Condition::Leaf(LeafNode {
        op,
        source: Source::Resource,
        attr: "external_id".to_string(),
        val,
        args: None,
    })
}

fn empty_action_rows(item: &PermittedActionsItem) -> Vec<PermittedActionsResponseItem> {
    action_rows(item, |_| Vec::new())
}

fn action_rows(
    item: &PermittedActionsItem,
    actions: impl Fn(Option<&String>) -> Vec<String>,
) -> Vec<PermittedActionsResponseItem> {
    match &item.external_resource_ids {
        Some(ids) => ids
            .iter()
            .map(|ext| PermittedActionsResponseItem {
                resource_type_name: item.resource_type_name.clone(),
                external_resource_id: Some(ext.clone()),
                actions: actions(Some(ext)),
            })
            .collect(),
        None => vec![PermittedActionsResponseItem {
            resource_type_name: item.resource_type_name.clone(),
            external_resource_id: None,
            actions: actions(None),
        }],
    }
}

fn json_param(v: &Value) -> sea_orm::Value {
    match v {
        Value::String(s) => s.clone().into(),
        Value::Bool(b) => (*b).into(),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.into()
            } else {
                n.as_f64().unwrap_or(0.0).into()
            }
        }
        Value::Null => sea_orm::Value::String(None),
        other => other.clone().into(),
    }
}
