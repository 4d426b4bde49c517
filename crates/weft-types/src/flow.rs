//! Flow document types.
//!
//! `FlowDefinition` is the canonical in-memory form of a flow document. YAML
//! and JSON documents both deserialize into it; it is immutable for the
//! duration of a run.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Flow Definition
// ---------------------------------------------------------------------------

/// A declared graph of nodes and edges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDefinition {
    /// Header: name, version, required node packs.
    pub flow: FlowHeader,
    /// Optional user state seeded at run start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<StateSpec>,
    /// Ordered node declarations. Declaration order is the tie-breaker for
    /// topological ordering.
    pub nodes: Vec<NodeDefinition>,
    /// Dependencies between nodes.
    #[serde(default)]
    pub edges: Vec<EdgeDefinition>,
}

/// Top-level `flow:` block of a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowHeader {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Node-type packs this flow requires. The engine refuses to run a flow
    /// naming a pack it has not registered.
    #[serde(default)]
    pub node_packs: Vec<String>,
}

/// User state declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSpec {
    #[serde(default = "empty_object")]
    pub initial: Value,
    /// JSON-schema subset validated against `initial` before the run starts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

impl FlowDefinition {
    /// Start a definition with the given name and no nodes.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            flow: FlowHeader {
                name: name.into(),
                version: None,
                description: None,
                node_packs: Vec::new(),
            },
            state: None,
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.flow.name
    }

    pub fn with_pack(mut self, pack: impl Into<String>) -> Self {
        self.flow.node_packs.push(pack.into());
        self
    }

    pub fn with_node(mut self, node: NodeDefinition) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_edge(mut self, edge: EdgeDefinition) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn with_state(mut self, initial: Value) -> Self {
        self.state = Some(StateSpec {
            initial,
            schema: None,
        });
        self
    }

    pub fn node(&self, id: &str) -> Option<&NodeDefinition> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

// ---------------------------------------------------------------------------
// Node Definition
// ---------------------------------------------------------------------------

/// One unit of work in a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDefinition {
    /// Unique within the flow.
    pub id: String,
    /// Registered node-type identifier.
    #[serde(rename = "type")]
    pub node_type: String,
    /// Input template: each value may contain `{{ expr }}` bindings.
    #[serde(default)]
    pub input: BTreeMap<String, Value>,
    /// Run only when this condition holds. Absent means always.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<NodePolicy>,
}

impl NodeDefinition {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            input: BTreeMap::new(),
            when: None,
            policy: None,
        }
    }

    pub fn with_input(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.input.insert(key.into(), value.into());
        self
    }

    pub fn with_when(mut self, condition: Condition) -> Self {
        self.when = Some(condition);
        self
    }

    pub fn with_policy(mut self, policy: NodePolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Whether a failure of this node is isolated to its dependents.
    pub fn continues_on_error(&self) -> bool {
        self.policy.as_ref().is_some_and(|p| p.continue_on_error)
    }
}

// ---------------------------------------------------------------------------
// Edge Definition
// ---------------------------------------------------------------------------

/// How the incoming edges of a node combine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gate {
    /// One firing edge of the any-group suffices.
    Any,
    /// Required: the edge must fire.
    #[default]
    All,
}

/// Iterate the target once per element of `in`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForEach {
    /// Template resolving to a sequence, e.g. `"{{ list.value }}"`.
    #[serde(rename = "in")]
    pub items: String,
    /// Name the current item is bound to inside the iteration.
    #[serde(rename = "as")]
    pub binding: String,
}

/// A dependency/data-flow link between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<Condition>,
    #[serde(default)]
    pub gate: Gate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub for_each: Option<ForEach>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
}

impl EdgeDefinition {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            id: None,
            from: from.into(),
            to: to.into(),
            when: None,
            gate: Gate::All,
            for_each: None,
            max_iterations: None,
        }
    }

    /// Explicit id, or `"<from>-><to>"`.
    pub fn edge_id(&self) -> String {
        self.id
            .clone()
            .unwrap_or_else(|| format!("{}->{}", self.from, self.to))
    }

    pub fn with_gate(mut self, gate: Gate) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_when(mut self, condition: Condition) -> Self {
        self.when = Some(condition);
        self
    }

    pub fn with_for_each(mut self, items: impl Into<String>, binding: impl Into<String>) -> Self {
        self.for_each = Some(ForEach {
            items: items.into(),
            binding: binding.into(),
        });
        self
    }

    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = Some(max);
        self
    }
}

// ---------------------------------------------------------------------------
// Conditions
// ---------------------------------------------------------------------------

/// A `when` clause: structured AST or a boolean-expression string.
///
/// ```yaml
/// when: { equals: { var: flags.enabled, value: false } }
/// when: { and: [ "count > 2", { not: { equals: { var: mode, value: dry } } } ] }
/// when: "steps.length > 0"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Condition {
    Literal(bool),
    Expression(String),
    Equals { equals: EqualsClause },
    Not { not: Box<Condition> },
    And { and: Vec<Condition> },
    Or { or: Vec<Condition> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EqualsClause {
    /// Binding path, e.g. `flags.enabled`.
    pub var: String,
    pub value: Value,
}

impl Condition {
    pub fn equals(var: impl Into<String>, value: impl Into<Value>) -> Self {
        Condition::Equals {
            equals: EqualsClause {
                var: var.into(),
                value: value.into(),
            },
        }
    }

    pub fn expr(expression: impl Into<String>) -> Self {
        Condition::Expression(expression.into())
    }

    pub fn negate(inner: Condition) -> Self {
        Condition::Not {
            not: Box::new(inner),
        }
    }
}

// ---------------------------------------------------------------------------
// Policies
// ---------------------------------------------------------------------------

/// Retry configuration for a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Total attempts including the first (>= 1).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Wait between failed attempts.
    #[serde(default)]
    pub backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    1
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: 0,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_ms: u64) -> Self {
        Self {
            max_attempts,
            backoff_ms,
        }
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

/// Node-level SLA.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// `<= 0` or absent means unlimited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<i64>,
    /// Isolate a failure to this node's dependents instead of failing the run.
    #[serde(default)]
    pub continue_on_error: bool,
}

impl NodePolicy {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms
            .filter(|ms| *ms > 0)
            .map(|ms| Duration::from_millis(ms as u64))
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: i64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn continue_on_error(mut self) -> Self {
        self.continue_on_error = true;
        self
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
