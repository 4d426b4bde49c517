//! Structural JSON-schema subset, compiled once at registration.
//!
//! Supports `type` (single or list), `properties`, `required`,
//! `additionalProperties`, `items`, `enum`, `const`, `anyOf`/`oneOf`/`allOf`,
//! `$ref` into `$defs`/`definitions`, numeric bounds and length bounds.
//! Unknown keywords (`title`, `format`, `description`, ...) are ignored.

use std::collections::HashMap;
use std::fmt;

use serde_json::{Map, Value};

use crate::flow::condition::deep_equal;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A schema document that cannot be compiled.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("invalid schema at {path}: {message}")]
    Invalid { path: String, message: String },

    #[error("unresolved $ref '{0}'")]
    UnresolvedRef(String),
}

/// One way a value fails its schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaViolation {
    /// JSON-pointer-like location, `/` for the root.
    pub path: String,
    pub message: String,
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Join violations into one diagnostic line.
pub fn describe(violations: &[SchemaViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

// ---------------------------------------------------------------------------
// Compiled form
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JsonType {
    Null,
    Boolean,
    Object,
    Array,
    Number,
    Integer,
    String,
}

impl JsonType {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "null" => JsonType::Null,
            "boolean" => JsonType::Boolean,
            "object" => JsonType::Object,
            "array" => JsonType::Array,
            "number" => JsonType::Number,
            "integer" => JsonType::Integer,
            "string" => JsonType::String,
            _ => return None,
        })
    }

    fn matches(&self, value: &Value) -> bool {
        match (self, value) {
            (JsonType::Null, Value::Null) => true,
            (JsonType::Boolean, Value::Bool(_)) => true,
            (JsonType::Object, Value::Object(_)) => true,
            (JsonType::Array, Value::Array(_)) => true,
            (JsonType::Number, Value::Number(_)) => true,
            (JsonType::Integer, Value::Number(n)) => {
                n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0)
            }
            (JsonType::String, Value::String(_)) => true,
            _ => false,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            JsonType::Null => "null",
            JsonType::Boolean => "boolean",
            JsonType::Object => "object",
            JsonType::Array => "array",
            JsonType::Number => "number",
            JsonType::Integer => "integer",
            JsonType::String => "string",
        }
    }
}

#[derive(Debug, Clone)]
enum SchemaNode {
    Any,
    Never,
    Ref(String),
    Rules(Box<Rules>),
}

#[derive(Debug, Clone, Default)]
struct Rules {
    types: Option<Vec<JsonType>>,
    properties: Vec<(String, SchemaNode)>,
    required: Vec<String>,
    /// `None` allows any extra property.
    additional: Option<SchemaNode>,
    items: Option<SchemaNode>,
    enum_values: Option<Vec<Value>>,
    const_value: Option<Value>,
    any_of: Vec<SchemaNode>,
    one_of: Vec<SchemaNode>,
    all_of: Vec<SchemaNode>,
    minimum: Option<f64>,
    maximum: Option<f64>,
    min_length: Option<usize>,
    max_length: Option<usize>,
    min_items: Option<usize>,
    max_items: Option<usize>,
}

/// A compiled schema.
#[derive(Debug, Clone)]
pub struct Schema {
    root: SchemaNode,
    defs: HashMap<String, SchemaNode>,
}

impl Schema {
    /// Accepts every value.
    pub fn any() -> Self {
        Self {
            root: SchemaNode::Any,
            defs: HashMap::new(),
        }
    }

    /// Compile a JSON-schema document.
    pub fn compile(document: &Value) -> Result<Self, SchemaError> {
        let mut defs = HashMap::new();
        if let Value::Object(map) = document {
            for key in ["$defs", "definitions"] {
                if let Some(Value::Object(entries)) = map.get(key) {
                    for (name, def) in entries {
                        let node = compile_node(def, &format!("/{key}/{name}"))?;
                        defs.insert(name.clone(), node);
                    }
                }
            }
        }
        let root = compile_node(document, "/")?;
        let schema = Self { root, defs };
        schema.check_refs(&schema.root)?;
        for node in schema.defs.values() {
            schema.check_refs(node)?;
        }
        Ok(schema)
    }

    /// Validate a value, collecting every violation.
    pub fn validate(&self, value: &Value) -> Result<(), Vec<SchemaViolation>> {
        let mut violations = Vec::new();
        self.check(&self.root, value, "/", &mut violations, 0);
        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }

    pub fn is_valid(&self, value: &Value) -> bool {
        self.validate(value).is_ok()
    }

    fn check_refs(&self, node: &SchemaNode) -> Result<(), SchemaError> {
        match node {
            SchemaNode::Any | SchemaNode::Never => Ok(()),
            SchemaNode::Ref(name) => {
                if self.defs.contains_key(name) {
                    Ok(())
                } else {
                    Err(SchemaError::UnresolvedRef(name.clone()))
                }
            }
            SchemaNode::Rules(rules) => {
                let children = rules
                    .properties
                    .iter()
                    .map(|(_, n)| n)
                    .chain(rules.additional.iter())
                    .chain(rules.items.iter())
                    .chain(rules.any_of.iter())
                    .chain(rules.one_of.iter())
                    .chain(rules.all_of.iter());
                for child in children {
                    self.check_refs(child)?;
                }
                Ok(())
            }
        }
    }

    fn check(
        &self,
        node: &SchemaNode,
        value: &Value,
        path: &str,
        out: &mut Vec<SchemaViolation>,
        depth: usize,
    ) {
        if depth > 64 {
            out.push(violation(path, "schema nesting too deep"));
            return;
        }
        let rules = match node {
            SchemaNode::Any => return,
            SchemaNode::Never => {
                out.push(violation(path, "no value is allowed here"));
                return;
            }
            SchemaNode::Ref(name) => {
                if let Some(target) = self.defs.get(name) {
                    self.check(target, value, path, out, depth + 1);
                }
                return;
            }
            SchemaNode::Rules(rules) => rules,
        };

        if let Some(types) = &rules.types {
            if !types.iter().any(|t| t.matches(value)) {
                let expected: Vec<&str> = types.iter().map(JsonType::name).collect();
                out.push(violation(
                    path,
                    format!("expected {}, got {}", expected.join(" | "), type_name(value)),
                ));
                return;
            }
        }

        if let Some(expected) = &rules.const_value {
            if !deep_equal(expected, value) {
                out.push(violation(path, format!("expected constant {expected}")));
            }
        }
        if let Some(options) = &rules.enum_values {
            if !options.iter().any(|o| deep_equal(o, value)) {
                out.push(violation(path, format!("{value} is not one of the allowed values")));
            }
        }

        match value {
            Value::Number(n) => {
                let n = n.as_f64().unwrap_or(f64::NAN);
                if let Some(min) = rules.minimum {
                    if n < min {
                        out.push(violation(path, format!("{n} is less than minimum {min}")));
                    }
                }
                if let Some(max) = rules.maximum {
                    if n > max {
                        out.push(violation(path, format!("{n} is greater than maximum {max}")));
                    }
                }
            }
            Value::String(s) => {
                let len = s.chars().count();
                if rules.min_length.is_some_and(|min| len < min) {
                    out.push(violation(path, format!("string shorter than {}", rules.min_length.unwrap_or(0))));
                }
                if rules.max_length.is_some_and(|max| len > max) {
                    out.push(violation(path, format!("string longer than {}", rules.max_length.unwrap_or(0))));
                }
            }
            Value::Array(items) => {
                if rules.min_items.is_some_and(|min| items.len() < min) {
                    out.push(violation(path, format!("fewer than {} items", rules.min_items.unwrap_or(0))));
                }
                if rules.max_items.is_some_and(|max| items.len() > max) {
                    out.push(violation(path, format!("more than {} items", rules.max_items.unwrap_or(0))));
                }
                if let Some(item_schema) = &rules.items {
                    for (i, item) in items.iter().enumerate() {
                        self.check(item_schema, item, &child_path(path, &i.to_string()), out, depth + 1);
                    }
                }
            }
            Value::Object(map) => {
                for key in &rules.required {
                    if !map.contains_key(key) {
                        out.push(violation(path, format!("missing required property '{key}'")));
                    }
                }
                for (key, field) in map {
                    let declared = rules.properties.iter().find(|(name, _)| name == key);
                    match (declared, &rules.additional) {
                        (Some((_, schema)), _) => {
                            self.check(schema, field, &child_path(path, key), out, depth + 1)
                        }
                        (None, Some(SchemaNode::Never)) => {
                            out.push(violation(path, format!("unexpected property '{key}'")))
                        }
                        (None, Some(schema)) => {
                            self.check(schema, field, &child_path(path, key), out, depth + 1)
                        }
                        (None, None) => {}
                    }
                }
            }
            _ => {}
        }

        for schema in &rules.all_of {
            self.check(schema, value, path, out, depth + 1);
        }
        if !rules.any_of.is_empty()
            && !rules.any_of.iter().any(|s| self.passes(s, value, depth))
        {
            out.push(violation(path, "value matches none of anyOf"));
        }
        if !rules.one_of.is_empty() {
            let matched = rules.one_of.iter().filter(|s| self.passes(s, value, depth)).count();
            if matched != 1 {
                out.push(violation(
                    path,
                    format!("value matches {matched} of oneOf, expected exactly 1"),
                ));
            }
        }
    }

    fn passes(&self, node: &SchemaNode, value: &Value, depth: usize) -> bool {
        let mut scratch = Vec::new();
        self.check(node, value, "/", &mut scratch, depth + 1);
        scratch.is_empty()
    }
}

impl Default for Schema {
    fn default() -> Self {
        Self::any()
    }
}

// ---------------------------------------------------------------------------
// Compilation
// ---------------------------------------------------------------------------

fn compile_node(doc: &Value, path: &str) -> Result<SchemaNode, SchemaError> {
    let map = match doc {
        Value::Bool(true) => return Ok(SchemaNode::Any),
        Value::Bool(false) => return Ok(SchemaNode::Never),
        Value::Object(map) => map,
        other => return Err(invalid(path, format!("expected object or boolean, got {}", type_name(other)))),
    };

    if let Some(reference) = map.get("$ref") {
        let reference = reference
            .as_str()
            .ok_or_else(|| invalid(path, "$ref must be a string"))?;
        let name = reference
            .strip_prefix("#/$defs/")
            .or_else(|| reference.strip_prefix("#/definitions/"))
            .ok_or_else(|| invalid(path, format!("unsupported $ref '{reference}'")))?;
        return Ok(SchemaNode::Ref(name.to_string()));
    }

    let mut rules = Rules::default();
    let mut constrained = false;

    if let Some(ty) = map.get("type") {
        let names: Vec<&str> = match ty {
            Value::String(s) => vec![s.as_str()],
            Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
            _ => return Err(invalid(path, "type must be a string or list of strings")),
        };
        let types = names
            .iter()
            .map(|n| JsonType::parse(n).ok_or_else(|| invalid(path, format!("unknown type '{n}'"))))
            .collect::<Result<Vec<_>, _>>()?;
        rules.types = Some(types);
        constrained = true;
    }

    if let Some(props) = map.get("properties") {
        let props = props
            .as_object()
            .ok_or_else(|| invalid(path, "properties must be an object"))?;
        for (name, schema) in props {
            let node = compile_node(schema, &child_path(path, name))?;
            rules.properties.push((name.clone(), node));
        }
        constrained = true;
    }

    if let Some(required) = map.get("required") {
        let required = required
            .as_array()
            .ok_or_else(|| invalid(path, "required must be an array"))?;
        rules.required = required
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect();
        constrained = true;
    }

    if let Some(additional) = map.get("additionalProperties") {
        rules.additional = match compile_node(additional, &child_path(path, "additionalProperties"))? {
            SchemaNode::Any => None,
            node => Some(node),
        };
        constrained = true;
    }

    if let Some(items) = map.get("items") {
        rules.items = Some(compile_node(items, &child_path(path, "items"))?);
        constrained = true;
    }

    if let Some(values) = map.get("enum") {
        let values = values
            .as_array()
            .ok_or_else(|| invalid(path, "enum must be an array"))?;
        rules.enum_values = Some(values.clone());
        constrained = true;
    }

    if let Some(value) = map.get("const") {
        rules.const_value = Some(value.clone());
        constrained = true;
    }

    for (key, target) in [
        ("anyOf", &mut rules.any_of),
        ("oneOf", &mut rules.one_of),
        ("allOf", &mut rules.all_of),
    ] {
        if let Some(list) = map.get(key) {
            let list = list
                .as_array()
                .ok_or_else(|| invalid(path, format!("{key} must be an array")))?;
            for (i, schema) in list.iter().enumerate() {
                target.push(compile_node(schema, &child_path(path, &format!("{key}/{i}")))?);
            }
            constrained = true;
        }
    }

    rules.minimum = number(map, "minimum", path)?;
    rules.maximum = number(map, "maximum", path)?;
    rules.min_length = count(map, "minLength", path)?;
    rules.max_length = count(map, "maxLength", path)?;
    rules.min_items = count(map, "minItems", path)?;
    rules.max_items = count(map, "maxItems", path)?;
    constrained |= rules.minimum.is_some()
        || rules.maximum.is_some()
        || rules.min_length.is_some()
        || rules.max_length.is_some()
        || rules.min_items.is_some()
        || rules.max_items.is_some();

    if constrained {
        Ok(SchemaNode::Rules(Box::new(rules)))
    } else {
        Ok(SchemaNode::Any)
    }
}

fn number(map: &Map<String, Value>, key: &str, path: &str) -> Result<Option<f64>, SchemaError> {
    match map.get(key) {
        None => Ok(None),
        Some(v) => v
            .as_f64()
            .map(Some)
            .ok_or_else(|| invalid(path, format!("{key} must be a number"))),
    }
}

fn count(map: &Map<String, Value>, key: &str, path: &str) -> Result<Option<usize>, SchemaError> {
    match map.get(key) {
        None => Ok(None),
        Some(v) => v
            .as_u64()
            .map(|n| Some(n as usize))
            .ok_or_else(|| invalid(path, format!("{key} must be a non-negative integer"))),
    }
}

fn invalid(path: &str, message: impl Into<String>) -> SchemaError {
    SchemaError::Invalid {
        path: path.to_string(),
        message: message.into(),
    }
}

fn violation(path: &str, message: impl Into<String>) -> SchemaViolation {
    SchemaViolation {
        path: path.to_string(),
        message: message.into(),
    }
}

fn child_path(parent: &str, key: &str) -> String {
    if parent == "/" {
        format!("/{key}")
    } else {
        format!("{parent}/{key}")
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
