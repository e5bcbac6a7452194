//! Lazy value references: `$principal.<path>`, `$context.<path>`,
//! `$resource.<path>`.
//!
//! A reference names a dotted path under one of the three sources. Principal
//! and context references are bound from the request at evaluation time;
//! resource references lower to a column/JSON path at compile time.

use serde_json::Value;

use crate::authz::condition::Source;
use crate::authz::errors::AuthzError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub source: Source,
    pub path: Vec<String>,
}

impl Reference {
    /// Parse `$<source>.<dotted.path>`. Fails on unknown sources, empty paths
    /// and empty path segments.
    pub fn parse(raw: &str) -> Result<Self, AuthzError> {
        let body = raw.strip_prefix('$').ok_or_else(|| {
            AuthzError::InvalidPolicy(format!("reference `{raw}` must start with `$`"))
        })?;

        let (source, rest) = if let Some(rest) = body.strip_prefix("principal.") {
            (Source::Principal, rest)
        } else if let Some(rest) = body.strip_prefix("context.") {
            (Source::Context, rest)
        } else if let Some(rest) = body.strip_prefix("resource.") {
            (Source::Resource, rest)
        } else {
            return Err(AuthzError::InvalidPolicy(format!(
                "reference `{raw}` must name a source: principal, context or resource"
            )));
        };

        if rest.is_empty() {
            return Err(AuthzError::InvalidPolicy(format!(
                "reference `{raw}` has an empty path"
            )));
        }
        let path: Vec<String> = rest.split('.').map(str::to_string).collect();
        if path.iter().any(String::is_empty) {
            return Err(AuthzError::InvalidPolicy(format!(
                "reference `{raw}` contains an empty path segment"
            )));
        }

        Ok(Reference { source, path })
    }

    /// Non-failing detection for values that may or may not be references.
    /// Returns `None` for anything that is not a well-formed reference string.
    pub fn from_value(val: &Value) -> Option<Self> {
        match val {
            Value::String(s) if s.starts_with('$') => Self::parse(s).ok(),
            _ => None,
        }
    }

    /// Walk the dotted path inside a JSON document. Any missing step yields
    /// `None`; the caller decides what a miss means (the evaluator denies).
    pub fn lookup<'a>(&self, doc: &'a Value) -> Option<&'a Value> {
        let mut current = doc;
        for segment in &self.path {
            current = current.get(segment)?;
        }
        Some(current)
    }
}
