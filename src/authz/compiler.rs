//! Lowers a validated condition tree to a SQL boolean expression.
//!
//! The produced fragment uses exactly two free identifiers:
//!
//! - `resource`: a row alias exposing `id`, `attributes` and `geometry`;
//! - `ctx`: a bound JSONB document with `principal` and `context` objects.
//!
//! Every literal from `val`/`args` becomes a `?` placeholder; nothing
//! user-supplied is concatenated into the fragment outside a quoted JSON path
//! key (which is escaped). Structurally equal trees produce byte-identical
//! fragments, so the fragment is cacheable under the tree's canonical hash.
//!
//! Fragments are stored with the rule row. At request time
//! [`finalize_for_postgres`] renumbers placeholders and substitutes the `ctx`
//! token with a positional parameter.

use serde_json::Value;

use crate::authz::condition::{
    op_name, Condition, LeafNode, LeafOp, LogicalOp, Source, GEOMETRY_ATTR,
};
use crate::authz::errors::AuthzError;
use crate::authz::geometry::{self, LiteralKind, CANONICAL_SRID};
use crate::authz::reference::Reference;

/// SQL helper installed by the migrations on Postgres deployments; parses
/// WKT/EWKT/GeoJSON text into a canonical-projection geometry.
pub const PARSE_GEOMETRY_FN: &str = "floodgate_parse_geometry";

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledSql {
    pub fragment: String,
    pub placeholders: Vec<Value>,
}

impl CompiledSql {
    /// A fragment that matches every row. Used for rules without conditions.
    pub fn always_true() -> Self {
        CompiledSql {
            fragment: "TRUE".to_string(),
            placeholders: Vec::new(),
        }
    }
}

/// Compile a condition tree into a parameterized SQL fragment.
pub fn compile(cond: &Condition) -> Result<CompiledSql, AuthzError> {
    cond.validate()?;
    let mut placeholders = Vec::new();
    let fragment = emit(cond, &mut placeholders)?;
    Ok(CompiledSql {
        fragment,
        placeholders,
    })
}

fn emit(cond: &Condition, params: &mut Vec<Value>) -> Result<String, AuthzError> {
    match cond {
        Condition::Logical(node) => match node.op {
            LogicalOp::Not => {
                let inner = emit(&node.conditions[0], params)?;
                Ok(format!("NOT ({inner})"))
            }
            LogicalOp::And | LogicalOp::Or => {
                if node.conditions.is_empty() {
                    // Empty conjunction is vacuously true, empty disjunction
                    // is unsatisfiable.
                    return Ok(match node.op {
                        LogicalOp::And => "TRUE".to_string(),
                        _ => "FALSE".to_string(),
                    });
                }
                let joiner = match node.op {
                    LogicalOp::And => " AND ",
                    _ => " OR ",
                };
                let parts: Vec<String> = node
                    .conditions
                    .iter()
                    .map(|c| emit(c, params))
                    .collect::<Result<_, _>>()?;
                Ok(format!("({})", parts.join(joiner)))
            }
        },
        Condition::Leaf(leaf) => emit_leaf(leaf, params),
    }
}

// ─── Leaf lowering ──────────────────────────────────────────────────────

fn emit_leaf(leaf: &LeafNode, params: &mut Vec<Value>) -> Result<String, AuthzError> {
    if leaf.op.is_spatial() {
        return emit_spatial(leaf, params);
    }

    // `all` compares JSONB containment, everything else compares text scalars.
    let jsonb_lhs = leaf.op == LeafOp::All;
    let lhs = lhs_expr(leaf, jsonb_lhs);

    match leaf.op {
        LeafOp::In | LeafOp::NotIn => emit_membership(leaf, lhs, params),
        LeafOp::All => {
            let list = leaf.val.clone();
            params.push(Value::String(
                serde_json::to_string(&list).expect("lists always serialize"),
            ));
            Ok(format!("({lhs}) @> (?)::jsonb"))
        }
        _ => emit_comparison(leaf, lhs, params),
    }
}

fn emit_comparison(
    leaf: &LeafNode,
    lhs: String,
    params: &mut Vec<Value>,
) -> Result<String, AuthzError> {
    let sql_op = comparison_sql_op(leaf.op);

    if let Some(reference) = Reference::from_value(&leaf.val) {
        // References lower to a JSON path, never a placeholder.
        let rhs = reference_expr(&reference, false);
        return Ok(format!("{lhs} {sql_op} {rhs}"));
    }

    match &leaf.val {
        Value::Null => match leaf.op {
            LeafOp::Eq => Ok(format!("{lhs} IS NULL")),
            LeafOp::Ne => Ok(format!("{lhs} IS NOT NULL")),
            _ => Err(AuthzError::InvalidPolicy(format!(
                "`{}` cannot compare against null",
                op_name(leaf.op)
            ))),
        },
        Value::Number(_) => {
            params.push(leaf.val.clone());
            Ok(format!("({lhs})::numeric {sql_op} (?)::numeric"))
        }
        Value::Bool(_) => {
            params.push(leaf.val.clone());
            Ok(format!("({lhs})::boolean {sql_op} (?)::boolean"))
        }
        Value::String(_) => {
            params.push(leaf.val.clone());
            Ok(format!("{lhs} {sql_op} ?"))
        }
        other => Err(AuthzError::InvalidPolicy(format!(
            "`{}` cannot compare against {other}",
            op_name(leaf.op)
        ))),
    }
}

fn emit_membership(
    leaf: &LeafNode,
    lhs: String,
    params: &mut Vec<Value>,
) -> Result<String, AuthzError> {
    let items = leaf
        .val
        .as_array()
        .expect("validated: membership val is a list");

    if items.is_empty() {
        // IN () is not valid SQL; fold to the operator's identity.
        return Ok(match leaf.op {
            LeafOp::In => "FALSE".to_string(),
            _ => "TRUE".to_string(),
        });
    }

    let numeric = items.iter().all(Value::is_number);
    let mut slots = Vec::with_capacity(items.len());
    for item in items {
        if numeric {
            params.push(item.clone());
            slots.push("(?)::numeric".to_string());
        } else {
            params.push(as_text_param(item));
            slots.push("?".to_string());
        }
    }

    let lhs = if numeric { format!("({lhs})::numeric") } else { lhs };
    let list = slots.join(", ");
    Ok(match leaf.op {
        LeafOp::In => format!("{lhs} IN ({list})"),
        _ => format!("{lhs} NOT IN ({list})"),
    })
}

fn emit_spatial(leaf: &LeafNode, params: &mut Vec<Value>) -> Result<String, AuthzError> {
    let raw_lhs = lhs_expr(leaf, true);
    // Anything that is not the dedicated geometry column arrives as JSON text
    // and goes through the store-side parse helper.
    let lhs = if raw_lhs == "resource.geometry" {
        raw_lhs
    } else {
        format!("{PARSE_GEOMETRY_FN}(({raw_lhs})::text)")
    };

    let rhs = if let Some(reference) = Reference::from_value(&leaf.val) {
        let path = reference_expr(&reference, true);
        format!("{PARSE_GEOMETRY_FN}(({path})::text)")
    } else {
        let (kind, text) = geometry::classify_literal(&leaf.val)?;
        params.push(Value::String(text));
        match kind {
            LiteralKind::GeoJson { srid } if srid == CANONICAL_SRID => {
                format!("ST_SetSRID(ST_GeomFromGeoJSON(?), {CANONICAL_SRID})")
            }
            LiteralKind::GeoJson { srid } => {
                format!("ST_Transform(ST_SetSRID(ST_GeomFromGeoJSON(?), {srid}), {CANONICAL_SRID})")
            }
            LiteralKind::Ewkt { srid } if srid == CANONICAL_SRID => {
                "ST_GeomFromEWKT(?)".to_string()
            }
            LiteralKind::Ewkt { .. } => {
                format!("ST_Transform(ST_GeomFromEWKT(?), {CANONICAL_SRID})")
            }
            // Untagged rule literals are read as already-canonical.
            LiteralKind::Wkt => format!("ST_SetSRID(ST_GeomFromText(?), {CANONICAL_SRID})"),
        }
    };

    Ok(match leaf.op {
        LeafOp::StDwithin => {
            params.push(
                serde_json::Number::from_f64(leaf.args.unwrap_or(0.0))
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
            );
            format!("ST_DWithin({lhs}, {rhs}, ?)")
        }
        LeafOp::StContains => format!("ST_Contains({lhs}, {rhs})"),
        LeafOp::StWithin => format!("ST_Within({lhs}, {rhs})"),
        LeafOp::StIntersects => format!("ST_Intersects({lhs}, {rhs})"),
        LeafOp::StCovers => format!("ST_Covers({lhs}, {rhs})"),
        _ => unreachable!("spatial dispatch"),
    })
}

// ─── Path expressions ───────────────────────────────────────────────────

fn lhs_expr(leaf: &LeafNode, jsonb: bool) -> String {
    match leaf.source {
        Source::Resource => {
            if leaf.attr == GEOMETRY_ATTR {
                "resource.geometry".to_string()
            } else {
                json_path("resource.attributes", &leaf.attr_segments(), jsonb)
            }
        }
        Source::Principal => json_path("ctx->'principal'", &leaf.attr_segments(), jsonb),
        Source::Context => json_path("ctx->'context'", &leaf.attr_segments(), jsonb),
    }
}

fn reference_expr(reference: &Reference, jsonb: bool) -> String {
    let segments: Vec<&str> = reference.path.iter().map(String::as_str).collect();
    match reference.source {
        Source::Principal => json_path("ctx->'principal'", &segments, jsonb),
        Source::Context => json_path("ctx->'context'", &segments, jsonb),
        Source::Resource => {
            if segments.len() == 1 && segments[0] == GEOMETRY_ATTR {
                "resource.geometry".to_string()
            } else {
                json_path("resource.attributes", &segments, jsonb)
            }
        }
    }
}

/// `base->'a'->'b'->>'c'`; intermediate segments keep JSONB, the final one
/// extracts text unless the caller needs JSONB (spatial, containment).
fn json_path(base: &str, segments: &[&str], jsonb_final: bool) -> String {
    let mut out = base.to_string();
    for (i, segment) in segments.iter().enumerate() {
        let arrow = if i + 1 == segments.len() && !jsonb_final {
            "->>"
        } else {
            "->"
        };
        out.push_str(arrow);
        out.push_str(&quote_key(segment));
    }
    out
}

fn quote_key(key: &str) -> String {
    format!("'{}'", key.replace('\'', "''"))
}

fn as_text_param(val: &Value) -> Value {
    match val {
        Value::String(_) => val.clone(),
        other => Value::String(other.to_string()),
    }
}

fn comparison_sql_op(op: LeafOp) -> &'static str {
    match op {
        LeafOp::Eq => "=",
        LeafOp::Ne => "!=",
        LeafOp::Gt => ">",
        LeafOp::Ge => ">=",
        LeafOp::Lt => "<",
        LeafOp::Le => "<=",
        _ => unreachable!("comparison dispatch"),
    }
}

// ─── Request-time finalization ──────────────────────────────────────────

/// Rewrite a stored fragment for execution: each `?` becomes the next `$n`
/// positional parameter and every free `ctx` token becomes the bound context
/// parameter. Quoted path keys are left untouched, so neither marker can be
/// forged from inside user-supplied attribute names.
pub fn finalize_for_postgres(fragment: &str, ctx_param: usize, next_param: &mut usize) -> String {
    let bytes = fragment.as_bytes();
    let mut out = String::with_capacity(fragment.len() + 16);
    let mut in_quote = false;
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;
        if in_quote {
            out.push(c);
            if c == '\'' {
                // Either the closing quote or the first half of an escaped
                // quote; peek to tell them apart.
                if i + 1 < bytes.len() && bytes[i + 1] == b'\'' {
                    out.push('\'');
                    i += 1;
                } else {
                    in_quote = false;
                }
            }
            i += 1;
            continue;
        }

        match c {
            '\'' => {
                in_quote = true;
                out.push(c);
                i += 1;
            }
            '?' => {
                out.push_str(&format!("${next_param}"));
                *next_param += 1;
                i += 1;
            }
            'c' if is_ctx_token(bytes, i) => {
                out.push_str(&format!("(${ctx_param}::jsonb)"));
                i += 3;
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }

    out
}

fn is_ctx_token(bytes: &[u8], i: usize) -> bool {
    if i + 3 > bytes.len() || &bytes[i..i + 3] != b"ctx" {
        return false;
    }
    let before_ok = i == 0 || !is_ident_char(bytes[i - 1]);
    let after_ok = i + 3 == bytes.len() || !is_ident_char(bytes[i + 3]);
    before_ok && after_ok
}

fn is_ident_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn compile_json(v: serde_json::Value) -> CompiledSql {
        let cond = Condition::from_value(&v).unwrap();
        compile(&cond).unwrap()
    }

    #[test]
    fn test_string_equality() {
        let out = compile_json(json!({ "op": "=", "attr": "status", "val": "active" }));
        assert_eq!(out.fragment, "resource.attributes->>'status' = ?");
        assert_eq!(out.placeholders, vec![json!("active")]);
    }

    #[test]
    fn test_numeric_cast_both_sides() {
        let out = compile_json(json!({ "op": ">", "attr": "size", "val": 100 }));
        assert_eq!(
            out.fragment,
            "(resource.attributes->>'size')::numeric > (?)::numeric"
        );
        assert_eq!(out.placeholders, vec![json!(100)]);
    }

    #[test]
    fn test_boolean_cast() {
        let out = compile_json(json!({ "op": "=", "attr": "deleted", "val": true }));
        assert_eq!(
            out.fragment,
            "(resource.attributes->>'deleted')::boolean = (?)::boolean"
        );
    }

    #[test]
    fn test_null_comparison_uses_is_null() {
        let out = compile_json(json!({ "op": "=", "attr": "archived_at", "val": null }));
        assert_eq!(out.fragment, "resource.attributes->>'archived_at' IS NULL");
        assert!(out.placeholders.is_empty());

        let out = compile_json(json!({ "op": "!=", "attr": "archived_at", "val": null }));
        assert_eq!(
            out.fragment,
            "resource.attributes->>'archived_at' IS NOT NULL"
        );
    }

    #[test]
    fn test_dotted_path_lowering() {
        let out = compile_json(json!({ "op": "=", "attr": "a.b.c", "val": "x" }));
        assert_eq!(out.fragment, "resource.attributes->'a'->'b'->>'c' = ?");
    }

    #[test]
    fn test_principal_source_lowering() {
        let out = compile_json(json!({
            "op": "=", "source": "principal", "attr": "dept", "val": "Sales"
        }));
        assert_eq!(out.fragment, "ctx->'principal'->>'dept' = ?");
    }

    #[test]
    fn test_reference_is_a_path_not_a_placeholder() {
        let out = compile_json(json!({
            "op": "=", "attr": "owner", "val": "$principal.x.y"
        }));
        assert_eq!(
            out.fragment,
            "resource.attributes->>'owner' = ctx->'principal'->'x'->>'y'"
        );
        assert!(out.placeholders.is_empty());
    }

    #[test]
    fn test_membership_operators() {
        let out = compile_json(json!({
            "op": "in", "attr": "status", "val": ["published", "active"]
        }));
        assert_eq!(out.fragment, "resource.attributes->>'status' IN (?, ?)");
        assert_eq!(out.placeholders, vec![json!("published"), json!("active")]);

        let out = compile_json(json!({
            "op": "not_in", "attr": "status", "val": ["deleted"]
        }));
        assert_eq!(out.fragment, "resource.attributes->>'status' NOT IN (?)");
    }

    #[test]
    fn test_numeric_membership_casts_elements() {
        let out = compile_json(json!({ "op": "in", "attr": "tier", "val": [1, 2] }));
        assert_eq!(
            out.fragment,
            "(resource.attributes->>'tier')::numeric IN ((?)::numeric, (?)::numeric)"
        );
    }

    #[test]
    fn test_empty_membership_folds() {
        let out = compile_json(json!({ "op": "in", "attr": "status", "val": [] }));
        assert_eq!(out.fragment, "FALSE");
        let out = compile_json(json!({ "op": "not_in", "attr": "status", "val": [] }));
        assert_eq!(out.fragment, "TRUE");
    }

    #[test]
    fn test_all_uses_jsonb_containment() {
        let out = compile_json(json!({
            "op": "all", "attr": "roles", "val": ["admin", "moderator"]
        }));
        assert_eq!(out.fragment, "(resource.attributes->'roles') @> (?)::jsonb");
        assert_eq!(out.placeholders, vec![json!("[\"admin\",\"moderator\"]")]);
    }

    #[test]
    fn test_logical_folding() {
        let out = compile_json(json!({ "op": "and", "conditions": [] }));
        assert_eq!(out.fragment, "TRUE");
        let out = compile_json(json!({ "op": "or", "conditions": [] }));
        assert_eq!(out.fragment, "FALSE");

        let out = compile_json(json!({
            "op": "not",
            "conditions": [{ "op": "=", "attr": "deleted", "val": true }]
        }));
        assert_eq!(
            out.fragment,
            "NOT ((resource.attributes->>'deleted')::boolean = (?)::boolean)"
        );
    }

    #[test]
    fn test_conjunction_parenthesized() {
        let out = compile_json(json!({
            "op": "and",
            "conditions": [
                { "op": "=", "attr": "a", "val": "1" },
                { "op": "=", "attr": "b", "val": "2" }
            ]
        }));
        assert_eq!(
            out.fragment,
            "(resource.attributes->>'a' = ? AND resource.attributes->>'b' = ?)"
        );
    }

    #[test]
    fn test_spatial_dwithin_with_context_reference() {
        let out = compile_json(json!({
            "op": "st_dwithin", "attr": "geometry", "val": "$context.loc", "args": 5000
        }));
        assert_eq!(
            out.fragment,
            "ST_DWithin(resource.geometry, \
             floodgate_parse_geometry((ctx->'context'->'loc')::text), ?)"
        );
        assert_eq!(out.placeholders, vec![json!(5000.0)]);
    }

    #[test]
    fn test_spatial_literal_constructors() {
        let out = compile_json(json!({
            "op": "st_intersects", "attr": "geometry", "val": "SRID=3857;POINT(1 2)"
        }));
        assert_eq!(
            out.fragment,
            "ST_Intersects(resource.geometry, ST_GeomFromEWKT(?))"
        );

        let out = compile_json(json!({
            "op": "st_intersects", "attr": "geometry", "val": "SRID=4326;POINT(1 2)"
        }));
        assert_eq!(
            out.fragment,
            "ST_Intersects(resource.geometry, ST_Transform(ST_GeomFromEWKT(?), 3857))"
        );

        let out = compile_json(json!({
            "op": "st_contains", "attr": "geometry", "val": "POLYGON((0 0, 1 0, 1 1, 0 0))"
        }));
        assert_eq!(
            out.fragment,
            "ST_Contains(resource.geometry, ST_SetSRID(ST_GeomFromText(?), 3857))"
        );

        let out = compile_json(json!({
            "op": "st_within", "attr": "geometry",
            "val": { "type": "Point", "coordinates": [23.7275, 37.9838] }
        }));
        assert_eq!(
            out.fragment,
            "ST_Within(resource.geometry, \
             ST_Transform(ST_SetSRID(ST_GeomFromGeoJSON(?), 4326), 3857))"
        );
    }

    #[test]
    fn test_determinism_across_spellings() {
        let implicit = compile_json(json!({ "op": "=", "attr": "x", "val": "1" }));
        let explicit = compile_json(json!({
            "op": "=", "source": "resource", "attr": "x", "val": "1"
        }));
        assert_eq!(implicit, explicit);
    }

    #[test]
    fn test_injection_via_attr_is_escaped() {
        let out = compile_json(json!({
            "op": "=", "attr": "sta'tus", "val": "x' OR '1'='1"
        }));
        assert_eq!(out.fragment, "resource.attributes->>'sta''tus' = ?");
        // The malicious value only exists as a placeholder.
        assert!(!out.fragment.contains("OR '1'"));
        assert_eq!(out.placeholders, vec![json!("x' OR '1'='1")]);
    }

    #[test]
    fn test_finalize_renumbers_and_binds_ctx() {
        let mut next = 4;
        let sql = finalize_for_postgres(
            "ctx->'principal'->>'dept' = ? AND resource.attributes->>'a' = ?",
            1,
            &mut next,
        );
        assert_eq!(
            sql,
            "($1::jsonb)->'principal'->>'dept' = $4 AND resource.attributes->>'a' = $5"
        );
        assert_eq!(next, 6);
    }

    #[test]
    fn test_finalize_ignores_quoted_markers() {
        let mut next = 2;
        let sql = finalize_for_postgres(
            "resource.attributes->>'wh?t' = ? AND resource.attributes->>'ctx' = ?",
            1,
            &mut next,
        );
        assert_eq!(
            sql,
            "resource.attributes->>'wh?t' = $2 AND resource.attributes->>'ctx' = $3"
        );
    }

    #[test]
    fn test_finalize_handles_escaped_quotes() {
        let mut next = 1;
        let sql = finalize_for_postgres("resource.attributes->>'a''?b' = ?", 9, &mut next);
        assert_eq!(sql, "resource.attributes->>'a''?b' = $1");
    }
}
