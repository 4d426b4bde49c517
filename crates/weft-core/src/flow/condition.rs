//! `when` clause evaluation for nodes and edges.
//!
//! Structured conditions (`equals`, `not`, `and`, `or`) are walked directly;
//! string conditions are JEXL expressions evaluated by `ExpressionEvaluator`.
//! Both forms see the same `BindingContext`.
//!
//! Payloads are always passed as context objects, never interpolated into
//! expression strings.

use std::sync::LazyLock;

use serde_json::{json, Value};
use weft_types::error::ErrorCode;
use weft_types::flow::Condition;

use super::binding::BindingContext;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during expression evaluation.
#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("Expression evaluation failed: {0}")]
    EvalFailed(String),

    #[error("Invalid context: {0}")]
    InvalidContext(String),
}

impl ExpressionError {
    pub fn code(&self) -> ErrorCode {
        ErrorCode::SchemaValidationError
    }
}

// ---------------------------------------------------------------------------
// ExpressionEvaluator
// ---------------------------------------------------------------------------

/// JEXL expression evaluator with standard transforms pre-registered.
pub struct ExpressionEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl ExpressionEvaluator {
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
            .with_transform("not", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                Ok(json!(!truthy(&val)))
            })
            .with_transform("contains", |args: &[Value]| {
                let found = match args.first() {
                    Some(Value::String(s)) => {
                        let needle = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                        s.contains(needle)
                    }
                    Some(Value::Array(items)) => {
                        let needle = args.get(1).cloned().unwrap_or(Value::Null);
                        items.iter().any(|item| deep_equal(item, &needle))
                    }
                    _ => false,
                };
                Ok(json!(found))
            })
            .with_transform("startsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let prefix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.starts_with(prefix)))
            })
            .with_transform("endsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let suffix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.ends_with(suffix)))
            })
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.chars().count(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            });

        Self { evaluator }
    }

    /// Evaluate an expression to a boolean using JavaScript-like truthiness.
    pub fn evaluate_bool(&self, expression: &str, context: &Value) -> Result<bool, ExpressionError> {
        self.evaluate_value(expression, context).map(|v| truthy(&v))
    }

    /// Evaluate an expression and return the raw JSON value.
    pub fn evaluate_value(&self, expression: &str, context: &Value) -> Result<Value, ExpressionError> {
        if !context.is_object() {
            return Err(ExpressionError::InvalidContext(
                "context must be a JSON object".to_string(),
            ));
        }

        self.evaluator
            .eval_in_context(strip_braces(expression), context)
            .map_err(|e| ExpressionError::EvalFailed(e.to_string()))
    }
}

/// Built once; transforms are registered on first use.
static SHARED_EVALUATOR: LazyLock<ExpressionEvaluator> = LazyLock::new(ExpressionEvaluator::new);

impl ExpressionEvaluator {
    /// The process-wide evaluator used for `when` clauses.
    pub fn shared() -> &'static ExpressionEvaluator {
        &SHARED_EVALUATOR
    }
}

impl Default for ExpressionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

/// `"{{ a > 1 }}"` and `"a > 1"` are the same condition.
fn strip_braces(expression: &str) -> &str {
    let trimmed = expression.trim();
    trimmed
        .strip_prefix("{{")
        .and_then(|s| s.strip_suffix("}}"))
        .map(str::trim)
        .unwrap_or(trimmed)
}

/// JavaScript-like truthiness.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

// ---------------------------------------------------------------------------
// Condition evaluation
// ---------------------------------------------------------------------------

/// Evaluate an optional `when` clause. Absence means "always".
pub fn evaluate_when(condition: Option<&Condition>, ctx: &BindingContext) -> bool {
    condition.is_none_or(|c| evaluate_condition(c, ctx))
}

/// Evaluate a condition against the binding context.
///
/// An unresolvable `equals` variable is `false`. An expression that fails to
/// evaluate is `false` and logged.
pub fn evaluate_condition(condition: &Condition, ctx: &BindingContext) -> bool {
    match condition {
        Condition::Literal(b) => *b,
        Condition::Equals { equals } => ctx
            .lookup(&equals.var)
            .is_some_and(|found| deep_equal(found, &equals.value)),
        Condition::Not { not } => !evaluate_condition(not, ctx),
        Condition::And { and } => and.iter().all(|c| evaluate_condition(c, ctx)),
        Condition::Or { or } => or.iter().any(|c| evaluate_condition(c, ctx)),
        Condition::Expression(expression) => {
            match ExpressionEvaluator::shared().evaluate_bool(expression, ctx.as_value()) {
                Ok(result) => result,
                Err(e) => {
                    tracing::warn!(expression = expression.as_str(), error = %e, "condition evaluation failed");
                    false
                }
            }
        }
    }
}

/// Recursive structural equality. Numbers compare by value (`1 == 1.0`).
pub fn deep_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| deep_equal(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(k, x)| ys.get(k).is_some_and(|y| deep_equal(x, y)))
        }
        _ => a == b,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
