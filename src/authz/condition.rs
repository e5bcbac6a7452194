//! Condition DSL: the tagged tree language of access rules.
//!
//! Two node families:
//! - Logical nodes: `{"op": "and"|"or"|"not", "conditions": [...]}`.
//!   An empty `and` is `true`, an empty `or` is `false`, `not` takes exactly
//!   one child.
//! - Leaf nodes: `{"op": <operator>, "source": "resource"|"principal"|"context",
//!   "attr": "dotted.path", "val": <scalar|list|reference>, "args": <number>}`.
//!   `source` defaults to `resource`; `args` is the distance in meters for
//!   `st_dwithin`.
//!
//! Any `val` may be a reference string `$<source>.<dotted.path>` which is
//! resolved lazily: `principal`/`context` references bind from the request,
//! `resource` references lower to a column path at compile time. References
//! are one hop: a value produced by resolving a reference is never treated
//! as a reference again.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::authz::errors::AuthzError;
use crate::authz::geometry;
use crate::authz::reference::Reference;

// ─── Model ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Condition {
    Logical(LogicalNode),
    Leaf(LeafNode),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicalNode {
    pub op: LogicalOp,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeafNode {
    pub op: LeafOp,
    #[serde(default)]
    pub source: Source,
    pub attr: String,
    #[serde(default)]
    pub val: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogicalOp {
    And,
    Or,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeafOp {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "not_in")]
    NotIn,
    #[serde(rename = "all")]
    All,
    #[serde(rename = "st_dwithin")]
    StDwithin,
    #[serde(rename = "st_contains")]
    StContains,
    #[serde(rename = "st_within")]
    StWithin,
    #[serde(rename = "st_intersects")]
    StIntersects,
    #[serde(rename = "st_covers")]
    StCovers,
}

impl LeafOp {
    pub fn is_spatial(self) -> bool {
        matches!(
            self,
            LeafOp::StDwithin
                | LeafOp::StContains
                | LeafOp::StWithin
                | LeafOp::StIntersects
                | LeafOp::StCovers
        )
    }

    pub fn is_set(self) -> bool {
        matches!(self, LeafOp::In | LeafOp::NotIn | LeafOp::All)
    }

    pub fn is_ordering(self) -> bool {
        matches!(self, LeafOp::Gt | LeafOp::Ge | LeafOp::Lt | LeafOp::Le)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    #[default]
    Resource,
    Principal,
    Context,
}

/// The attribute name of the dedicated geometry column. Every other attribute
/// lives inside the JSON attribute map.
pub const GEOMETRY_ATTR: &str = "geometry";

// ─── Parsing / canonical form ───────────────────────────────────────────

impl Condition {
    /// Parse and validate a condition tree from its JSON representation.
    pub fn from_value(value: &Value) -> Result<Self, AuthzError> {
        let cond: Condition = serde_json::from_value(value.clone())
            .map_err(|e| AuthzError::InvalidPolicy(format!("malformed condition tree: {e}")))?;
        cond.validate()?;
        Ok(cond)
    }

    /// Canonical JSON rendering: fixed field order, `source` always explicit,
    /// nested object keys sorted. Structurally equal trees render identically,
    /// which makes the hash below usable as a cache key.
    pub fn canonical_json(&self) -> String {
        serde_json::to_string(self).expect("condition trees always serialize")
    }

    /// Hex SHA-256 of the canonical rendering; persisted with the compiled
    /// fragment.
    pub fn compiled_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical_json().as_bytes());
        let digest = hasher.finalize();
        let mut out = String::with_capacity(64);
        for byte in digest {
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }

    /// Whether any leaf binds against the request (`principal`/`context`
    /// source, or a `$principal.`/`$context.` reference value).
    pub fn has_context_refs(&self) -> bool {
        match self {
            Condition::Logical(node) => node.conditions.iter().any(Condition::has_context_refs),
            Condition::Leaf(leaf) => {
                if matches!(leaf.source, Source::Principal | Source::Context) {
                    return true;
                }
                match Reference::from_value(&leaf.val) {
                    Some(r) => matches!(r.source, Source::Principal | Source::Context),
                    None => false,
                }
            }
        }
    }

    // ─── Validation ─────────────────────────────────────────────────────

    pub fn validate(&self) -> Result<(), AuthzError> {
        match self {
            Condition::Logical(node) => {
                if node.op == LogicalOp::Not && node.conditions.len() != 1 {
                    return Err(AuthzError::InvalidPolicy(format!(
                        "`not` takes exactly one child condition, got {}",
                        node.conditions.len()
                    )));
                }
                for child in &node.conditions {
                    child.validate()?;
                }
                Ok(())
            }
            Condition::Leaf(leaf) => leaf.validate(),
        }
    }
}

impl LeafNode {
    /// Segments of the dotted attribute path.
    pub fn attr_segments(&self) -> Vec<&str> {
        self.attr.split('.').collect()
    }

    fn validate(&self) -> Result<(), AuthzError> {
        if self.attr.is_empty() {
            return Err(AuthzError::InvalidPolicy("empty attribute path".into()));
        }
        if self.attr.split('.').any(str::is_empty) {
            return Err(AuthzError::InvalidPolicy(format!(
                "attribute path `{}` contains an empty segment",
                self.attr
            )));
        }

        if let Value::String(s) = &self.val {
            // Only strings naming one of the three sources are references;
            // anything else starting with `$` is plain data.
            let looks_like_ref = s.starts_with("$principal.")
                || s.starts_with("$context.")
                || s.starts_with("$resource.");
            if looks_like_ref {
                // Must be a well-formed one-hop reference.
                Reference::parse(s)?;
                if self.op.is_set() {
                    return Err(AuthzError::InvalidPolicy(format!(
                        "`{}` requires a literal list value, not a reference",
                        op_name(self.op)
                    )));
                }
            }
        }

        if self.op.is_set() && !self.val.is_array() {
            return Err(AuthzError::InvalidPolicy(format!(
                "`{}` requires a list value",
                op_name(self.op)
            )));
        }

        if self.args.is_some() && self.op != LeafOp::StDwithin {
            return Err(AuthzError::InvalidPolicy(format!(
                "`args` is only meaningful for `st_dwithin`, not `{}`",
                op_name(self.op)
            )));
        }

        if self.op.is_spatial() {
            // The resource side must target the dedicated geometry column;
            // principal/context geometries arrive as WKT/GeoJSON values and
            // are parsed at evaluation time.
            if self.source == Source::Resource && self.attr != GEOMETRY_ATTR {
                return Err(AuthzError::InvalidPolicy(format!(
                    "spatial operator `{}` requires the geometry attribute, got `{}`",
                    op_name(self.op),
                    self.attr
                )));
            }
            if let Some(d) = self.args {
                if !d.is_finite() || d < 0.0 {
                    return Err(AuthzError::InvalidPolicy(
                        "spatial distance must be a non-negative number".into(),
                    ));
                }
            }
            // Non-reference literals must be a recognizable geometry.
            if Reference::from_value(&self.val).is_none() {
                geometry::parse_rule_literal(&self.val).map_err(|e| {
                    AuthzError::InvalidPolicy(format!("invalid geometry literal: {e}"))
                })?;
            }
        }

        Ok(())
    }
}

pub(crate) fn op_name(op: LeafOp) -> &'static str {
    match op {
        LeafOp::Eq => "=",
        LeafOp::Ne => "!=",
        LeafOp::Gt => ">",
        LeafOp::Ge => ">=",
        LeafOp::Lt => "<",
        LeafOp::Le => "<=",
        LeafOp::In => "in",
        LeafOp::NotIn => "not_in",
        LeafOp::All => "all",
        LeafOp::StDwithin => "st_dwithin",
        LeafOp::StContains => "st_contains",
        LeafOp::StWithin => "st_within",
        LeafOp::StIntersects => "st_intersects",
        LeafOp::StCovers => "st_covers",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_leaf_with_default_source() {
        let cond = Condition::from_value(&json!({
            "op": "=", "attr": "status", "val": "active"
        }))
        .unwrap();
        match cond {
            Condition::Leaf(leaf) => {
                assert_eq!(leaf.op, LeafOp::Eq);
                assert_eq!(leaf.source, Source::Resource);
                assert_eq!(leaf.attr, "status");
            }
            _ => panic!("expected leaf"),
        }
    }

    #[test]
    fn test_parse_logical_tree() {
        let cond = Condition::from_value(&json!({
            "op": "and",
            "conditions": [
                { "op": "=", "source": "principal", "attr": "dept", "val": "Sales" },
                { "op": "=", "attr": "status", "val": "active" }
            ]
        }))
        .unwrap();
        match cond {
            Condition::Logical(node) => {
                assert_eq!(node.op, LogicalOp::And);
                assert_eq!(node.conditions.len(), 2);
            }
            _ => panic!("expected logical node"),
        }
    }

    #[test]
    fn test_not_is_distinct_from_not_in() {
        let not_node = Condition::from_value(&json!({
            "op": "not",
            "conditions": [{ "op": "=", "attr": "deleted", "val": true }]
        }))
        .unwrap();
        assert!(matches!(not_node, Condition::Logical(_)));

        let not_in_leaf = Condition::from_value(&json!({
            "op": "not_in", "attr": "status", "val": ["deleted", "archived"]
        }))
        .unwrap();
        assert!(matches!(not_in_leaf, Condition::Leaf(_)));
    }

    #[test]
    fn test_not_arity_enforced() {
        let err = Condition::from_value(&json!({
            "op": "not",
            "conditions": [
                { "op": "=", "attr": "a", "val": 1 },
                { "op": "=", "attr": "b", "val": 2 }
            ]
        }))
        .unwrap_err();
        assert!(matches!(err, AuthzError::InvalidPolicy(_)));
    }

    #[test]
    fn test_unknown_op_rejected() {
        assert!(Condition::from_value(&json!({
            "op": "matches", "attr": "name", "val": "x"
        }))
        .is_err());
    }

    #[test]
    fn test_set_op_requires_list() {
        let err = Condition::from_value(&json!({
            "op": "in", "attr": "status", "val": "active"
        }))
        .unwrap_err();
        assert!(matches!(err, AuthzError::InvalidPolicy(_)));
    }

    #[test]
    fn test_empty_path_segment_rejected() {
        let err = Condition::from_value(&json!({
            "op": "=", "attr": "a..b", "val": 1
        }))
        .unwrap_err();
        assert!(matches!(err, AuthzError::InvalidPolicy(_)));
    }

    #[test]
    fn test_spatial_requires_geometry_attr() {
        let err = Condition::from_value(&json!({
            "op": "st_dwithin", "attr": "location", "val": "POINT(0 0)", "args": 100
        }))
        .unwrap_err();
        assert!(matches!(err, AuthzError::InvalidPolicy(_)));

        assert!(Condition::from_value(&json!({
            "op": "st_dwithin", "attr": "geometry", "val": "POINT(0 0)", "args": 100
        }))
        .is_ok());
    }

    #[test]
    fn test_spatial_rejects_garbage_literal() {
        let err = Condition::from_value(&json!({
            "op": "st_intersects", "attr": "geometry", "val": "not a geometry"
        }))
        .unwrap_err();
        assert!(matches!(err, AuthzError::InvalidPolicy(_)));
    }

    #[test]
    fn test_reference_value_accepted() {
        assert!(Condition::from_value(&json!({
            "op": "=", "attr": "owner", "val": "$principal.username"
        }))
        .is_ok());
        // Empty reference path is invalid.
        assert!(Condition::from_value(&json!({
            "op": "=", "attr": "owner", "val": "$principal."
        }))
        .is_err());
        // A dollar string that names no source is plain data.
        assert!(Condition::from_value(&json!({
            "op": "=", "attr": "price", "val": "$100"
        }))
        .is_ok());
    }

    #[test]
    fn test_canonical_hash_ignores_source_spelling() {
        let implicit = Condition::from_value(&json!({
            "op": "=", "attr": "status", "val": "active"
        }))
        .unwrap();
        let explicit = Condition::from_value(&json!({
            "op": "=", "source": "resource", "attr": "status", "val": "active"
        }))
        .unwrap();
        assert_eq!(implicit.compiled_hash(), explicit.compiled_hash());
    }

    #[test]
    fn test_canonical_hash_distinguishes_content() {
        let a = Condition::from_value(&json!({ "op": "=", "attr": "x", "val": 1 })).unwrap();
        let b = Condition::from_value(&json!({ "op": "=", "attr": "x", "val": 2 })).unwrap();
        assert_ne!(a.compiled_hash(), b.compiled_hash());
    }

    #[test]
    fn test_has_context_refs() {
        let plain = Condition::from_value(&json!({
            "op": "=", "attr": "status", "val": "active"
        }))
        .unwrap();
        assert!(!plain.has_context_refs());

        let by_source = Condition::from_value(&json!({
            "op": "=", "source": "context", "attr": "tenant", "val": "acme"
        }))
        .unwrap();
        assert!(by_source.has_context_refs());

        let by_reference = Condition::from_value(&json!({
            "op": "=", "attr": "owner", "val": "$principal.username"
        }))
        .unwrap();
        assert!(by_reference.has_context_refs());
    }
}
