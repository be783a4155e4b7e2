//! Pure predicate evaluation for condition branches and loop guards.
//!
//! `evaluate_predicate` never performs I/O and is deterministic for
//! identical inputs. An unresolvable field is an `EvaluationError`, not
//! `false`.

use std::cmp::Ordering;

use cadence_types::workflow::{Comparator, Predicate};
use serde_json::Value;

use super::context::{EvaluationContext, EvaluationError, type_name};

/// Evaluate `predicate` against `ctx`.
///
/// `And` / `Or` short-circuit left to right, so an error in an operand
/// after the deciding one is not reported.
pub fn evaluate_predicate(
    predicate: &Predicate,
    ctx: &EvaluationContext<'_>,
) -> Result<bool, EvaluationError> {
    match predicate {
        Predicate::Always => Ok(true),
        Predicate::Exists { field } => match ctx.resolve(field) {
            Ok(_) => Ok(true),
            Err(EvaluationError::UnresolvedField(_)) => Ok(false),
            Err(e) => Err(e),
        },
        Predicate::Compare { field, cmp, value } => {
            let actual = ctx.resolve(field)?;
            compare(field, actual, *cmp, value)
        }
        Predicate::In { field, values } => {
            let actual = ctx.resolve(field)?;
            Ok(values.iter().any(|v| json_eq(actual, v)))
        }
        Predicate::Contains { field, value } => {
            let actual = ctx.resolve(field)?;
            match (actual, value) {
                (Value::String(haystack), Value::String(needle)) => {
                    Ok(haystack.contains(needle.as_str()))
                }
                (Value::Array(items), needle) => Ok(items.iter().any(|v| json_eq(v, needle))),
                (other, _) => Err(EvaluationError::TypeMismatch {
                    field: field.clone(),
                    expected: "a string or an array",
                    found: type_name(other),
                }),
            }
        }
        Predicate::And { all } => {
            for p in all {
                if !evaluate_predicate(p, ctx)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Predicate::Or { any } => {
            for p in any {
                if evaluate_predicate(p, ctx)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Predicate::Not { predicate } => evaluate_predicate(predicate, ctx).map(|b| !b),
    }
}

fn compare(
    field: &str,
    actual: &Value,
    cmp: Comparator,
    expected: &Value,
) -> Result<bool, EvaluationError> {
    let accept: fn(Ordering) -> bool = match cmp {
        Comparator::Eq => return Ok(json_eq(actual, expected)),
        Comparator::Ne => return Ok(!json_eq(actual, expected)),
        Comparator::Gt => |o| o == Ordering::Greater,
        Comparator::Gte => |o| o != Ordering::Less,
        Comparator::Lt => |o| o == Ordering::Less,
        Comparator::Lte => |o| o != Ordering::Greater,
    };

    let ordering = match (actual, expected) {
        (Value::Number(a), Value::Number(b)) => {
            let (a, b) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
            a.partial_cmp(&b)
        }
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (other, Value::Number(_)) => {
            return Err(EvaluationError::TypeMismatch {
                field: field.to_string(),
                expected: "a number",
                found: type_name(other),
            });
        }
        (other, Value::String(_)) => {
            return Err(EvaluationError::TypeMismatch {
                field: field.to_string(),
                expected: "a string",
                found: type_name(other),
            });
        }
        (_, other) => {
            return Err(EvaluationError::TypeMismatch {
                field: field.to_string(),
                expected: "a number or a string operand",
                found: type_name(other),
            });
        }
    };

    // NaN compares false
    Ok(ordering.is_some_and(accept))
}

/// JSON equality that treats `90` and `90.0` as equal.
fn json_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        _ => a == b,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
