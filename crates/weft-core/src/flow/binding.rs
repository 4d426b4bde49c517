//! Template binding resolution.
//!
//! Node inputs and `forEach.in` values are templates containing `{{ expr }}`
//! segments. Expressions are dot/bracket paths (`a.value`, `list.value[0]`,
//! `outputs["node-id"].text`) resolved against a `BindingContext`.
//!
//! A template that is exactly one segment ("pure") yields the native value;
//! anything else ("mixed") is concatenated into a string.

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

/// One step of a binding path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// Parse `a.b[0]["c-d"]` into segments. Returns `None` for anything that is
/// not a plain path.
pub fn parse_path(expr: &str) -> Option<Vec<PathSegment>> {
    let expr = expr.trim();
    let chars: Vec<char> = expr.chars().collect();
    let mut segments = Vec::new();
    let mut i = 0;
    let mut expect_key = true;

    while i < chars.len() {
        match chars[i] {
            '.' => {
                if expect_key {
                    return None;
                }
                expect_key = true;
                i += 1;
            }
            '[' => {
                let close = chars[i..].iter().position(|c| *c == ']')? + i;
                let inner: String = chars[i + 1..close].iter().collect();
                let inner = inner.trim();
                let segment = if let Some(quoted) = strip_quotes(inner) {
                    PathSegment::Key(quoted.to_string())
                } else {
                    PathSegment::Index(inner.parse().ok()?)
                };
                if expect_key && !segments.is_empty() {
                    return None;
                }
                segments.push(segment);
                expect_key = false;
                i = close + 1;
            }
            c if is_key_char(c) => {
                if !expect_key {
                    return None;
                }
                let start = i;
                while i < chars.len() && is_key_char(chars[i]) {
                    i += 1;
                }
                segments.push(PathSegment::Key(chars[start..i].iter().collect()));
                expect_key = false;
            }
            _ => return None,
        }
    }

    if segments.is_empty() || expect_key {
        return None;
    }
    Some(segments)
}

fn is_key_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '-' || c == '$'
}

fn strip_quotes(s: &str) -> Option<&str> {
    let bytes = s.as_bytes();
    if bytes.len() >= 2
        && (bytes[0] == b'"' || bytes[0] == b'\'')
        && bytes[bytes.len() - 1] == bytes[0]
    {
        Some(&s[1..s.len() - 1])
    } else {
        None
    }
}

fn walk<'a>(root: &'a Value, segments: &[PathSegment]) -> Option<&'a Value> {
    segments.iter().try_fold(root, |current, segment| match segment {
        PathSegment::Key(key) => match current {
            Value::Object(map) => map.get(key),
            Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        },
        PathSegment::Index(index) => current.as_array().and_then(|items| items.get(*index)),
    })
}

// ---------------------------------------------------------------------------
// BindingContext
// ---------------------------------------------------------------------------

/// The object every binding path resolves against.
///
/// Layered, later layers winning:
/// 1. top-level keys of the flow input (when it is an object)
/// 2. `input`, `state`, `outputs`
/// 3. each completed node's output under its node id
/// 4. the loop variable and `loop: {index, sessionId}` inside an iteration
#[derive(Debug, Clone, Default)]
pub struct BindingContext {
    root: Value,
}

impl BindingContext {
    pub fn new(input: &Value, state: &Value, outputs: &BTreeMap<String, Value>) -> Self {
        let mut root = Map::new();
        if let Value::Object(fields) = input {
            for (key, value) in fields {
                root.insert(key.clone(), value.clone());
            }
        }
        root.insert("input".to_string(), input.clone());
        root.insert("state".to_string(), state.clone());
        let outputs_map: Map<String, Value> = outputs
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        root.insert("outputs".to_string(), Value::Object(outputs_map));
        for (node_id, output) in outputs {
            root.insert(node_id.clone(), output.clone());
        }
        Self {
            root: Value::Object(root),
        }
    }

    /// Bind the loop variable for one `forEach` iteration.
    pub fn with_loop(self, binding: &str, item: Value, index: usize, session_id: Uuid) -> Self {
        self.with_var(binding, item).with_var(
            "loop",
            serde_json::json!({ "index": index, "sessionId": session_id }),
        )
    }

    pub fn with_var(mut self, key: impl Into<String>, value: Value) -> Self {
        if let Value::Object(map) = &mut self.root {
            map.insert(key.into(), value);
        }
        self
    }

    /// The whole context as a JSON object (used by expression conditions).
    pub fn as_value(&self) -> &Value {
        &self.root
    }

    /// Resolve a path expression; `None` when any step is missing.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let segments = parse_path(path)?;
        walk(&self.root, &segments)
    }

    /// Resolve one template string.
    ///
    /// Pure templates return the native value (or `None` when unresolved).
    /// Mixed templates always return a string.
    pub fn resolve_template(&self, template: &str) -> Option<Value> {
        // Surrounding whitespace does not make a single binding mixed.
        if let [Segment::Expr(expr)] = split_template(template.trim()).as_slice() {
            return self.resolve_expr(expr).cloned();
        }
        let segments = split_template(template);
        match segments.as_slice() {
            _ if segments.iter().all(|s| matches!(s, Segment::Text(_))) => {
                Some(Value::String(template.to_string()))
            }
            _ => {
                let mut out = String::new();
                for segment in &segments {
                    match segment {
                        Segment::Text(text) => out.push_str(text),
                        Segment::Expr(expr) => {
                            if let Some(value) = self.resolve_expr(expr) {
                                out.push_str(&stringify(value));
                            }
                        }
                    }
                }
                Some(Value::String(out))
            }
        }
    }

    /// Resolve a template value recursively. Non-string leaves pass through.
    ///
    /// Unresolved pure bindings are dropped from objects, become `null` in
    /// arrays, and make the top-level result `None`.
    pub fn resolve_value(&self, value: &Value) -> Option<Value> {
        match value {
            Value::String(template) => self.resolve_template(template),
            Value::Array(items) => Some(Value::Array(
                items
                    .iter()
                    .map(|item| self.resolve_value(item).unwrap_or(Value::Null))
                    .collect(),
            )),
            Value::Object(map) => Some(Value::Object(
                map.iter()
                    .filter_map(|(k, v)| self.resolve_value(v).map(|v| (k.clone(), v)))
                    .collect(),
            )),
            other => Some(other.clone()),
        }
    }

    /// Resolve a node's input template into the object passed to `run`.
    pub fn resolve_input(&self, input: &BTreeMap<String, Value>) -> Value {
        Value::Object(
            input
                .iter()
                .filter_map(|(k, v)| self.resolve_value(v).map(|v| (k.clone(), v)))
                .collect(),
        )
    }

    fn resolve_expr(&self, expr: &str) -> Option<&Value> {
        let resolved = self.lookup(expr);
        if resolved.is_none() && parse_path(expr).is_none() {
            tracing::warn!(expression = expr, "binding is not a path expression");
        }
        resolved
    }
}

// ---------------------------------------------------------------------------
// Template parsing
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq)]
enum Segment<'a> {
    Text(&'a str),
    Expr(&'a str),
}

fn split_template(template: &str) -> Vec<Segment<'_>> {
    let mut segments = Vec::new();
    let mut rest = template;
    while let Some(open) = rest.find("{{") {
        let Some(close) = rest[open + 2..].find("}}") else {
            break;
        };
        if open > 0 {
            segments.push(Segment::Text(&rest[..open]));
        }
        segments.push(Segment::Expr(rest[open + 2..open + 2 + close].trim()));
        rest = &rest[open + 2 + close + 2..];
    }
    if !rest.is_empty() {
        segments.push(Segment::Text(rest));
    }
    segments
}

/// Mixed-mode stringification.
///
/// Strings verbatim, scalars via display, `null` as empty, arrays joined
/// with `,`, objects as compact JSON.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(items) => items.iter().map(stringify).collect::<Vec<_>>().join(","),
        Value::Object(_) => value.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
