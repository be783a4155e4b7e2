//! Evaluation context and payload template resolution.
//!
//! `EvaluationContext` is the read-only view a node handler evaluates
//! against: the instance variables, a snapshot of the subject, and the
//! trigger payload. Field paths are dot paths rooted at `vars`, `subject`
//! or `trigger`; numeric segments index into arrays.

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use thiserror::Error;

/// Roots a field path may start with.
pub const PATH_ROOTS: [&str; 3] = ["vars", "subject", "trigger"];

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// A condition or template could not be evaluated.
///
/// Distinct from a predicate evaluating to `false`: a missing attribute
/// never silently routes down a negative branch.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EvaluationError {
    #[error("field '{0}' could not be resolved")]
    UnresolvedField(String),

    #[error("field '{field}' is {found}, expected {expected}")]
    TypeMismatch {
        field: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("invalid field path '{0}'")]
    InvalidPath(String),

    #[error("malformed template: {0}")]
    Template(String),
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Borrowed view over the data a node may read.
#[derive(Debug, Clone, Copy)]
pub struct EvaluationContext<'a> {
    pub vars: &'a BTreeMap<String, Value>,
    pub subject: &'a Value,
    pub trigger: &'a Value,
}

impl<'a> EvaluationContext<'a> {
    pub fn new(
        vars: &'a BTreeMap<String, Value>,
        subject: &'a Value,
        trigger: &'a Value,
    ) -> Self {
        Self {
            vars,
            subject,
            trigger,
        }
    }

    /// Resolve a rooted dot path to a value.
    pub fn resolve(&self, path: &str) -> Result<&'a Value, EvaluationError> {
        let (root, rest) = split_path(path)?;
        match root {
            "vars" => {
                let mut segments = rest.into_iter();
                let name = segments
                    .next()
                    .ok_or_else(|| EvaluationError::InvalidPath(path.to_string()))?;
                let start = self
                    .vars
                    .get(name)
                    .ok_or_else(|| EvaluationError::UnresolvedField(path.to_string()))?;
                walk(start, segments, path)
            }
            "subject" => walk(self.subject, rest.into_iter(), path),
            "trigger" => walk(self.trigger, rest.into_iter(), path),
            _ => Err(EvaluationError::InvalidPath(path.to_string())),
        }
    }

    /// Resolve `{{ path }}` templates in every string leaf of `template`.
    ///
    /// A leaf that is exactly one template is replaced by the resolved value
    /// with its JSON type preserved. Templates embedded in longer strings are
    /// interpolated as text.
    pub fn render(&self, template: &Value) -> Result<Value, EvaluationError> {
        match template {
            Value::String(s) => self.render_str(s),
            Value::Array(items) => items
                .iter()
                .map(|v| self.render(v))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), self.render(v)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }

    fn render_str(&self, s: &str) -> Result<Value, EvaluationError> {
        let trimmed = s.trim();
        if let Some(inner) = whole_template(trimmed) {
            return self.resolve(inner).cloned();
        }
        if !s.contains("{{") {
            return Ok(Value::String(s.to_string()));
        }

        let mut out = String::with_capacity(s.len());
        let mut rest = s;
        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after
                .find("}}")
                .ok_or_else(|| EvaluationError::Template(format!("unclosed '{{{{' in '{s}'")))?;
            let value = self.resolve(after[..end].trim())?;
            out.push_str(&value_to_string(value));
            rest = &after[end + 2..];
        }
        out.push_str(rest);
        Ok(Value::String(out))
    }
}

/// Every template path referenced by string leaves of `template`.
pub fn template_paths(template: &Value) -> Vec<String> {
    let mut out = Vec::new();
    collect_template_paths(template, &mut out);
    out
}

fn collect_template_paths(template: &Value, out: &mut Vec<String>) {
    match template {
        Value::String(s) => {
            let mut rest = s.as_str();
            while let Some(start) = rest.find("{{") {
                let after = &rest[start + 2..];
                match after.find("}}") {
                    Some(end) => {
                        out.push(after[..end].trim().to_string());
                        rest = &after[end + 2..];
                    }
                    None => break,
                }
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_template_paths(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_template_paths(v, out)),
        _ => {}
    }
}

/// Split a field path into its root and remaining segments.
///
/// Fails for empty paths, empty segments, or roots outside `PATH_ROOTS`.
pub fn split_path(path: &str) -> Result<(&str, Vec<&str>), EvaluationError> {
    let mut segments = path.split('.');
    let root = segments.next().unwrap_or_default();
    if !PATH_ROOTS.contains(&root) {
        return Err(EvaluationError::InvalidPath(path.to_string()));
    }
    let rest: Vec<&str> = segments.collect();
    if rest.iter().any(|s| s.is_empty()) {
        return Err(EvaluationError::InvalidPath(path.to_string()));
    }
    Ok((root, rest))
}

fn walk<'v, 'p>(
    start: &'v Value,
    segments: impl Iterator<Item = &'p str>,
    path: &str,
) -> Result<&'v Value, EvaluationError> {
    let mut current = start;
    for segment in segments {
        let next = match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        current = next.ok_or_else(|| EvaluationError::UnresolvedField(path.to_string()))?;
    }
    Ok(current)
}

/// Look up an unrooted dot path (`lead.score`, `items.0`) inside `value`.
pub fn lookup<'v>(value: &'v Value, path: &str) -> Option<&'v Value> {
    if path.is_empty() {
        return Some(value);
    }
    walk(value, path.split('.'), path).ok()
}

fn whole_template(s: &str) -> Option<&str> {
    let inner = s.strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim())
}

/// Render a JSON value as template text. Strings are inserted unquoted.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Human-readable name of a JSON value's type.
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
