//! JEXL evaluator for trigger `when` clauses.
//!
//! Wraps `jexl_eval::Evaluator` with a small set of string transforms. The
//! inbound event is always passed as a context object and never
//! interpolated into expression text.

use cadence_types::event::InboundEvent;
use serde_json::{Value, json};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during expression evaluation.
#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("expression evaluation failed: {0}")]
    EvalFailed(String),

    #[error("invalid context: {0}")]
    InvalidContext(String),
}

// ---------------------------------------------------------------------------
// TriggerEvaluator
// ---------------------------------------------------------------------------

/// JEXL evaluator used to filter events against trigger nodes.
///
/// Expressions see `event` (the payload), `event_type` and `subject_id`,
/// e.g. `event.source == 'web' && event.score|default(0) > 10`.
pub struct TriggerEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl TriggerEvaluator {
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            .with_transform("lower", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_uppercase()))
            })
            .with_transform("trim", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.trim()))
            })
            .with_transform("contains", |args: &[Value]| {
                let found = match (args.first(), args.get(1)) {
                    (Some(Value::String(s)), Some(Value::String(needle))) => {
                        s.contains(needle.as_str())
                    }
                    (Some(Value::Array(items)), Some(needle)) => items.contains(needle),
                    _ => false,
                };
                Ok(json!(found))
            })
            .with_transform("startsWith", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let prefix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.starts_with(prefix)))
            })
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.chars().count(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            })
            .with_transform("default", |args: &[Value]| {
                let value = args.first().cloned().unwrap_or(Value::Null);
                if value.is_null() {
                    Ok(args.get(1).cloned().unwrap_or(Value::Null))
                } else {
                    Ok(value)
                }
            });

        Self { evaluator }
    }

    /// Evaluate an optional `when` clause for an event. `None` matches.
    pub fn matches(
        &self,
        when: Option<&str>,
        event: &InboundEvent,
    ) -> Result<bool, ExpressionError> {
        let Some(expr) = when.map(str::trim).filter(|e| !e.is_empty()) else {
            return Ok(true);
        };
        self.evaluate_bool(expr, &Self::event_context(event))
    }

    /// Evaluate an expression to a boolean, using JavaScript-like truthiness.
    pub fn evaluate_bool(&self, expression: &str, context: &Value) -> Result<bool, ExpressionError> {
        let result = self.evaluate_value(expression, context)?;
        Ok(value_to_bool(&result))
    }

    /// Evaluate an expression and return the raw JSON value.
    pub fn evaluate_value(&self, expression: &str, context: &Value) -> Result<Value, ExpressionError> {
        if !context.is_object() {
            return Err(ExpressionError::InvalidContext(
                "context must be a JSON object".to_string(),
            ));
        }
        self.evaluator
            .eval_in_context(expression, context)
            .map_err(|e| ExpressionError::EvalFailed(e.to_string()))
    }

    /// The context object a `when` clause is evaluated against.
    pub fn event_context(event: &InboundEvent) -> Value {
        json!({
            "event": event.payload,
            "event_type": event.event_type,
            "subject_id": event.subject_id,
        })
    }
}

impl Default for TriggerEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TriggerEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerEvaluator").finish_non_exhaustive()
    }
}

fn value_to_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
