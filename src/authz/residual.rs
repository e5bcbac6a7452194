//! Partial evaluation of condition trees against a bound request.
//!
//! Leaves whose `source` is `principal` or `context` are decided here, in
//! process; what survives is a simplified tree that references only the
//! resource. A missing principal/context attribute makes its leaf false;
//! uncertainty never grants.

use serde_json::{json, Value};

use crate::authz::condition::{Condition, LeafNode, LeafOp, LogicalNode, LogicalOp, Source};
use crate::authz::geometry;
use crate::authz::reference::Reference;

// ─── Bound request ──────────────────────────────────────────────────────

/// The unified evaluation context: principal attributes (with the static
/// `id`/`username` fields merged in) plus the caller-supplied auth context.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub principal: Value,
    pub context: Value,
}

impl RequestContext {
    pub fn new(principal: Value, context: Value) -> Self {
        Self { principal, context }
    }

    /// The JSONB document bound as `ctx` in compiled fragments.
    pub fn document(&self) -> Value {
        json!({ "principal": self.principal, "context": self.context })
    }

    fn resolve(&self, reference: &Reference) -> Option<&Value> {
        let doc = match reference.source {
            Source::Principal => &self.principal,
            Source::Context => &self.context,
            Source::Resource => return None,
        };
        let mut current = doc;
        for segment in &reference.path {
            current = current.get(segment)?;
        }
        Some(current)
    }

    fn attr(&self, source: Source, attr: &str) -> Option<&Value> {
        let doc = match source {
            Source::Principal => &self.principal,
            Source::Context => &self.context,
            Source::Resource => return None,
        };
        let mut current = doc;
        for segment in attr.split('.') {
            current = current.get(segment)?;
        }
        Some(current)
    }
}

// ─── Residual ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Residual {
    GrantedAll,
    DeniedAll,
    /// A simplified tree containing only `source = resource` leaves (unless a
    /// resource-to-resource reference kept a leaf symbolic).
    Conditions(Condition),
}

impl Residual {
    fn from_bool(b: bool) -> Self {
        if b {
            Residual::GrantedAll
        } else {
            Residual::DeniedAll
        }
    }
}

/// Partially evaluate `cond` against the request and simplify.
pub fn residualize(cond: &Condition, ctx: &RequestContext) -> Residual {
    match cond {
        Condition::Logical(node) => residualize_logical(node, ctx),
        Condition::Leaf(leaf) => residualize_leaf(leaf, ctx),
    }
}

fn residualize_logical(node: &LogicalNode, ctx: &RequestContext) -> Residual {
    match node.op {
        LogicalOp::Not => match residualize(&node.conditions[0], ctx) {
            Residual::GrantedAll => Residual::DeniedAll,
            Residual::DeniedAll => Residual::GrantedAll,
            Residual::Conditions(inner) => Residual::Conditions(Condition::Logical(LogicalNode {
                op: LogicalOp::Not,
                conditions: vec![inner],
            })),
        },
        LogicalOp::And => {
            let mut rest = Vec::new();
            for child in &node.conditions {
                match residualize(child, ctx) {
                    Residual::DeniedAll => return Residual::DeniedAll,
                    Residual::GrantedAll => {}
                    Residual::Conditions(c) => rest.push(c),
                }
            }
            match rest.len() {
                0 => Residual::GrantedAll,
                1 => Residual::Conditions(rest.into_iter().next().expect("len checked")),
                _ => Residual::Conditions(Condition::Logical(LogicalNode {
                    op: LogicalOp::And,
                    conditions: rest,
                })),
            }
        }
        LogicalOp::Or => {
            let mut rest = Vec::new();
            for child in &node.conditions {
                match residualize(child, ctx) {
                    Residual::GrantedAll => return Residual::GrantedAll,
                    Residual::DeniedAll => {}
                    Residual::Conditions(c) => rest.push(c),
                }
            }
            match rest.len() {
                0 => Residual::DeniedAll,
                1 => Residual::Conditions(rest.into_iter().next().expect("len checked")),
                _ => Residual::Conditions(Condition::Logical(LogicalNode {
                    op: LogicalOp::Or,
                    conditions: rest,
                })),
            }
        }
    }
}

fn residualize_leaf(leaf: &LeafNode, ctx: &RequestContext) -> Residual {
    let val_ref = Reference::from_value(&leaf.val);

    match leaf.source {
        Source::Resource => match val_ref {
            // A request-bound reference in the value slot is substituted with
            // its literal, turning the leaf into a pure resource condition.
            Some(r) if matches!(r.source, Source::Principal | Source::Context) => {
                let Some(resolved) = ctx.resolve(&r) else {
                    return Residual::DeniedAll;
                };
                let val = if leaf.op.is_spatial() {
                    // Re-tag the runtime geometry so the literal keeps its
                    // meaning under the rule-literal projection default.
                    match geometry::parse_value(resolved, None) {
                        Ok(geom) => Value::String(geometry::to_ewkt(&geom)),
                        Err(_) => return Residual::DeniedAll,
                    }
                } else {
                    resolved.clone()
                };
                Residual::Conditions(Condition::Leaf(LeafNode {
                    val,
                    ..leaf.clone()
                }))
            }
            _ => Residual::Conditions(Condition::Leaf(leaf.clone())),
        },
        Source::Principal | Source::Context => {
            let Some(lhs) = ctx.attr(leaf.source, &leaf.attr) else {
                return Residual::DeniedAll;
            };

            match val_ref {
                Some(r) if r.source == Source::Resource => mirror_onto_resource(leaf, lhs, &r),
                Some(r) => {
                    let Some(rhs) = ctx.resolve(&r) else {
                        return Residual::DeniedAll;
                    };
                    Residual::from_bool(eval_leaf(leaf.op, lhs, rhs, leaf.args, true))
                }
                None => Residual::from_bool(eval_leaf(leaf.op, lhs, &leaf.val, leaf.args, false)),
            }
        }
    }
}

/// `principal.x <op> $resource.y` is flipped into a resource-sourced leaf with
/// the bound value as its literal, when the operator has a mirror.
fn mirror_onto_resource(leaf: &LeafNode, lhs: &Value, reference: &Reference) -> Residual {
    let Some(mirrored) = mirror_op(leaf.op) else {
        // No mirror (st_covers); leave the leaf for the compiler, which
        // lowers the principal/context side through `ctx`.
        return Residual::Conditions(Condition::Leaf(leaf.clone()));
    };
    let val = if leaf.op.is_spatial() {
        match geometry::parse_value(lhs, None) {
            Ok(geom) => Value::String(geometry::to_ewkt(&geom)),
            Err(_) => return Residual::DeniedAll,
        }
    } else {
        lhs.clone()
    };
    Residual::Conditions(Condition::Leaf(LeafNode {
        op: mirrored,
        source: Source::Resource,
        attr: reference.path.join("."),
        val,
        args: leaf.args,
    }))
}

fn mirror_op(op: LeafOp) -> Option<LeafOp> {
    match op {
        LeafOp::Eq => Some(LeafOp::Eq),
        LeafOp::Ne => Some(LeafOp::Ne),
        LeafOp::Gt => Some(LeafOp::Lt),
        LeafOp::Ge => Some(LeafOp::Le),
        LeafOp::Lt => Some(LeafOp::Gt),
        LeafOp::Le => Some(LeafOp::Ge),
        LeafOp::StDwithin => Some(LeafOp::StDwithin),
        LeafOp::StIntersects => Some(LeafOp::StIntersects),
        LeafOp::StContains => Some(LeafOp::StWithin),
        LeafOp::StWithin => Some(LeafOp::StContains),
        _ => None,
    }
}

// ─── Leaf evaluation ────────────────────────────────────────────────────

/// Apply a leaf operator to two bound values. `rhs_runtime` tells the spatial
/// path whether the right side came from the request (WGS84 default) or from
/// the rule body (canonical default).
fn eval_leaf(op: LeafOp, lhs: &Value, rhs: &Value, args: Option<f64>, rhs_runtime: bool) -> bool {
    match op {
        LeafOp::Eq => eq_values(lhs, rhs),
        LeafOp::Ne => !eq_values(lhs, rhs),
        LeafOp::Gt | LeafOp::Ge | LeafOp::Lt | LeafOp::Le => ord_compare(op, lhs, rhs),
        LeafOp::In => rhs
            .as_array()
            .is_some_and(|items| items.iter().any(|item| eq_values(lhs, item))),
        LeafOp::NotIn => rhs
            .as_array()
            .is_some_and(|items| !items.iter().any(|item| eq_values(lhs, item))),
        LeafOp::All => match (lhs.as_array(), rhs.as_array()) {
            (Some(have), Some(want)) => want
                .iter()
                .all(|w| have.iter().any(|h| eq_values(h, w))),
            _ => false,
        },
        _ => eval_spatial(op, lhs, rhs, args, rhs_runtime),
    }
}

fn eval_spatial(op: LeafOp, lhs: &Value, rhs: &Value, args: Option<f64>, rhs_runtime: bool) -> bool {
    let Ok(a) = geometry::parse_value(lhs, None) else {
        return false;
    };
    let b = if rhs_runtime {
        geometry::parse_value(rhs, None)
    } else {
        geometry::parse_rule_literal(rhs)
    };
    let Ok(b) = b else {
        return false;
    };

    match op {
        LeafOp::StDwithin => geometry::dwithin(&a, &b, args.unwrap_or(0.0)),
        LeafOp::StContains => geometry::contains(&a, &b),
        LeafOp::StWithin => geometry::within(&a, &b),
        LeafOp::StIntersects => geometry::intersects(&a, &b),
        LeafOp::StCovers => geometry::covers(&a, &b),
        _ => false,
    }
}

fn eq_values(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Numbers compare numerically, strings compare bytewise; mixed types never
/// satisfy an ordering.
fn ord_compare(op: LeafOp, a: &Value, b: &Value) -> bool {
    let ordering = match (a, b) {
        (Value::String(x), Value::String(y)) => x.as_bytes().cmp(y.as_bytes()),
        _ => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => match x.partial_cmp(&y) {
                Some(o) => o,
                None => return false,
            },
            _ => return false,
        },
    };
    match op {
        LeafOp::Gt => ordering.is_gt(),
        LeafOp::Ge => ordering.is_ge(),
        LeafOp::Lt => ordering.is_lt(),
        LeafOp::Le => ordering.is_le(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cond(v: Value) -> Condition {
        Condition::from_value(&v).unwrap()
    }

    fn ctx(principal: Value, context: Value) -> RequestContext {
        RequestContext::new(principal, context)
    }

    #[test]
    fn test_principal_leaf_decides_and_drops_out() {
        let tree = cond(json!({
            "op": "and",
            "conditions": [
                { "op": "=", "source": "principal", "attr": "dept", "val": "Sales" },
                { "op": "=", "attr": "status", "val": "active" }
            ]
        }));

        let sales = ctx(json!({ "dept": "Sales" }), json!({}));
        match residualize(&tree, &sales) {
            Residual::Conditions(c) => {
                assert_eq!(c, cond(json!({ "op": "=", "attr": "status", "val": "active" })));
            }
            other => panic!("expected residual conditions, got {other:?}"),
        }

        let hr = ctx(json!({ "dept": "HR" }), json!({}));
        assert_eq!(residualize(&tree, &hr), Residual::DeniedAll);
    }

    #[test]
    fn test_missing_attribute_denies() {
        let tree = cond(json!({
            "op": "=", "source": "principal", "attr": "clearance.level", "val": 3
        }));
        let empty = ctx(json!({}), json!({}));
        assert_eq!(residualize(&tree, &empty), Residual::DeniedAll);
    }

    #[test]
    fn test_fully_bound_tree_short_circuits() {
        let tree = cond(json!({
            "op": "and",
            "conditions": [
                { "op": ">=", "source": "context", "attr": "hour", "val": 9 },
                { "op": "<", "source": "context", "attr": "hour", "val": 17 }
            ]
        }));
        assert_eq!(
            residualize(&tree, &ctx(json!({}), json!({ "hour": 14 }))),
            Residual::GrantedAll
        );
        assert_eq!(
            residualize(&tree, &ctx(json!({}), json!({ "hour": 20 }))),
            Residual::DeniedAll
        );
    }

    #[test]
    fn test_or_keeps_resource_branch() {
        let tree = cond(json!({
            "op": "or",
            "conditions": [
                { "op": "=", "source": "principal", "attr": "role", "val": "auditor" },
                { "op": "=", "attr": "visibility", "val": "public" }
            ]
        }));

        // Principal branch true: the whole disjunction is granted.
        assert_eq!(
            residualize(&tree, &ctx(json!({ "role": "auditor" }), json!({}))),
            Residual::GrantedAll
        );

        // Principal branch false: only the resource branch remains.
        match residualize(&tree, &ctx(json!({ "role": "clerk" }), json!({}))) {
            Residual::Conditions(c) => {
                assert_eq!(
                    c,
                    cond(json!({ "op": "=", "attr": "visibility", "val": "public" }))
                );
            }
            other => panic!("expected conditions, got {other:?}"),
        }
    }

    #[test]
    fn test_not_folds_over_bound_leaves() {
        let tree = cond(json!({
            "op": "not",
            "conditions": [
                { "op": "=", "source": "context", "attr": "embargo", "val": true }
            ]
        }));
        assert_eq!(
            residualize(&tree, &ctx(json!({}), json!({ "embargo": true }))),
            Residual::DeniedAll
        );
        assert_eq!(
            residualize(&tree, &ctx(json!({}), json!({ "embargo": false }))),
            Residual::GrantedAll
        );
    }

    #[test]
    fn test_not_with_not_in_composite() {
        // not( deleted = true AND status not_in [published, active] )
        let tree = cond(json!({
            "op": "not",
            "conditions": [{
                "op": "and",
                "conditions": [
                    { "op": "=", "source": "context", "attr": "deleted", "val": true },
                    { "op": "not_in", "source": "context", "attr": "status",
                      "val": ["published", "active"] }
                ]
            }]
        }));
        assert_eq!(
            residualize(&tree, &ctx(json!({}), json!({ "deleted": false, "status": "draft" }))),
            Residual::GrantedAll
        );
        assert_eq!(
            residualize(&tree, &ctx(json!({}), json!({ "deleted": true, "status": "draft" }))),
            Residual::DeniedAll
        );
    }

    #[test]
    fn test_in_and_all_operators() {
        let tree = cond(json!({
            "op": "in", "source": "principal", "attr": "region", "val": ["eu", "us"]
        }));
        assert_eq!(
            residualize(&tree, &ctx(json!({ "region": "eu" }), json!({}))),
            Residual::GrantedAll
        );
        assert_eq!(
            residualize(&tree, &ctx(json!({ "region": "apac" }), json!({}))),
            Residual::DeniedAll
        );

        let tree = cond(json!({
            "op": "all", "source": "principal", "attr": "groups", "val": ["sec", "ops"]
        }));
        assert_eq!(
            residualize(&tree, &ctx(json!({ "groups": ["ops", "sec", "dev"] }), json!({}))),
            Residual::GrantedAll
        );
        assert_eq!(
            residualize(&tree, &ctx(json!({ "groups": ["ops"] }), json!({}))),
            Residual::DeniedAll
        );
    }

    #[test]
    fn test_numeric_equality_crosses_int_and_float() {
        let tree = cond(json!({
            "op": "=", "source": "context", "attr": "limit", "val": 5
        }));
        assert_eq!(
            residualize(&tree, &ctx(json!({}), json!({ "limit": 5.0 }))),
            Residual::GrantedAll
        );
    }

    #[test]
    fn test_principal_to_principal_reference() {
        let tree = cond(json!({
            "op": "=", "source": "principal", "attr": "team", "val": "$context.team"
        }));
        assert_eq!(
            residualize(
                &tree,
                &ctx(json!({ "team": "core" }), json!({ "team": "core" }))
            ),
            Residual::GrantedAll
        );
        assert_eq!(
            residualize(
                &tree,
                &ctx(json!({ "team": "core" }), json!({ "team": "infra" }))
            ),
            Residual::DeniedAll
        );
    }

    #[test]
    fn test_context_reference_substituted_into_resource_leaf() {
        let tree = cond(json!({
            "op": "st_dwithin", "attr": "geometry", "val": "$context.loc", "args": 5000
        }));
        let bound = residualize(
            &tree,
            &ctx(json!({}), json!({ "loc": "POINT(23.7275 37.9838)" })),
        );
        match bound {
            Residual::Conditions(Condition::Leaf(leaf)) => {
                assert_eq!(leaf.source, Source::Resource);
                let Value::String(s) = &leaf.val else {
                    panic!("expected EWKT string");
                };
                assert!(s.starts_with("SRID=3857;POINT"));
            }
            other => panic!("expected substituted leaf, got {other:?}"),
        }

        // Missing context attribute denies instead of leaking a dangling ref.
        assert_eq!(
            residualize(&tree, &ctx(json!({}), json!({}))),
            Residual::DeniedAll
        );
    }

    #[test]
    fn test_spatial_context_leaf_evaluates_in_process() {
        let tree = cond(json!({
            "op": "st_dwithin", "source": "context", "attr": "loc",
            "val": "SRID=3857;POINT(0 0)", "args": 100
        }));
        assert_eq!(
            residualize(&tree, &ctx(json!({}), json!({ "loc": "SRID=3857;POINT(0 50)" }))),
            Residual::GrantedAll
        );
        assert_eq!(
            residualize(&tree, &ctx(json!({}), json!({ "loc": "SRID=3857;POINT(0 5000)" }))),
            Residual::DeniedAll
        );
    }

    #[test]
    fn test_principal_leaf_with_resource_reference_is_mirrored() {
        let tree = cond(json!({
            "op": ">", "source": "principal", "attr": "clearance", "val": "$resource.min_clearance"
        }));
        match residualize(&tree, &ctx(json!({ "clearance": 3 }), json!({}))) {
            Residual::Conditions(Condition::Leaf(leaf)) => {
                assert_eq!(leaf.op, LeafOp::Lt);
                assert_eq!(leaf.source, Source::Resource);
                assert_eq!(leaf.attr, "min_clearance");
                assert_eq!(leaf.val, json!(3));
            }
            other => panic!("expected mirrored leaf, got {other:?}"),
        }
    }
}
