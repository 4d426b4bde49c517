//! Event types for the weft Hub.
//!
//! `FlowEvent` enumerates the lifecycle events the engine itself emits. On the
//! wire every event is an `Event` (`{type, ...payload}`), which also covers
//! custom events emitted by node implementations (`agent:start`, ...). The Hub
//! wraps each one into an immutable `EnrichedEvent`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::NodeError;

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Ambient context attached to every emitted event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<PhaseContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<TaskContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentContext>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseContext {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskContext {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentContext {
    pub name: String,
}

impl EventContext {
    pub fn session(session_id: Uuid) -> Self {
        Self {
            session_id: Some(session_id),
            ..Default::default()
        }
    }

    pub fn phase(name: impl Into<String>) -> Self {
        Self {
            phase: Some(PhaseContext {
                name: name.into(),
                number: None,
            }),
            ..Default::default()
        }
    }

    pub fn task(id: impl Into<String>) -> Self {
        Self {
            task: Some(TaskContext { id: id.into() }),
            ..Default::default()
        }
    }

    pub fn agent(name: impl Into<String>) -> Self {
        Self {
            agent: Some(AgentContext { name: name.into() }),
            ..Default::default()
        }
    }

    /// Shallow merge: every key set in `inner` wins over `self`.
    pub fn merge(&self, inner: &EventContext) -> EventContext {
        EventContext {
            session_id: inner.session_id.or(self.session_id),
            run_id: inner.run_id.or(self.run_id),
            node_id: inner.node_id.clone().or_else(|| self.node_id.clone()),
            phase: inner.phase.clone().or_else(|| self.phase.clone()),
            task: inner.task.clone().or_else(|| self.task.clone()),
            agent: inner.agent.clone().or_else(|| self.agent.clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// Event (wire form)
// ---------------------------------------------------------------------------

/// Payload key that takes a caller's own `type` field, since `type` carries
/// the event name on the wire.
pub const PAYLOAD_TYPE_KEY: &str = "payloadType";

/// A bare event: a type name plus flattened payload fields.
///
/// The payload must not hold a `type` key. `Event::new` moves one to
/// [`PAYLOAD_TYPE_KEY`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub name: String,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Event {
    /// Build an event from a name and a payload. Non-object payloads are
    /// stored under a `value` key; a payload `type` field is renamed to
    /// `payloadType`.
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        let payload = match payload {
            Value::Object(mut map) => {
                if let Some(kind) = map.remove("type") {
                    map.insert(PAYLOAD_TYPE_KEY.to_string(), kind);
                }
                map
            }
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        Self {
            name: name.into(),
            payload,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }
}

impl From<FlowEvent> for Event {
    fn from(event: FlowEvent) -> Self {
        let name = event.name().to_string();
        let payload = match serde_json::to_value(&event) {
            Ok(Value::Object(mut map)) => {
                map.remove("type");
                map
            }
            _ => Map::new(),
        };
        Event { name, payload }
    }
}

// ---------------------------------------------------------------------------
// Engine lifecycle events
// ---------------------------------------------------------------------------

/// Lifecycle events emitted by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum FlowEvent {
    #[serde(rename = "flow:start")]
    FlowStart { run_id: Uuid, flow_name: String },

    #[serde(rename = "flow:complete")]
    FlowComplete {
        run_id: Uuid,
        flow_name: String,
        duration_ms: u64,
    },

    #[serde(rename = "flow:failed")]
    FlowFailed {
        run_id: Uuid,
        flow_name: String,
        error: NodeError,
        failed_nodes: Vec<String>,
    },

    #[serde(rename = "flow:aborted")]
    FlowAborted {
        run_id: Uuid,
        flow_name: String,
        reason: String,
    },

    #[serde(rename = "node:start")]
    NodeStart {
        run_id: Uuid,
        node_id: String,
        node_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        iteration: Option<usize>,
    },

    #[serde(rename = "node:complete")]
    NodeComplete {
        run_id: Uuid,
        node_id: String,
        attempts: u32,
        duration_ms: u64,
    },

    #[serde(rename = "node:failed")]
    NodeFailed {
        run_id: Uuid,
        node_id: String,
        error: NodeError,
    },

    #[serde(rename = "node:skipped")]
    NodeSkipped {
        run_id: Uuid,
        node_id: String,
        reason: String,
    },

    #[serde(rename = "node:retry")]
    NodeRetry {
        run_id: Uuid,
        node_id: String,
        attempt: u32,
        error: String,
        backoff_ms: u64,
    },

    #[serde(rename = "edge:fire")]
    EdgeFire {
        run_id: Uuid,
        edge_id: String,
        from: String,
        to: String,
    },

    #[serde(rename = "edge:skip")]
    EdgeSkip {
        run_id: Uuid,
        edge_id: String,
        from: String,
        to: String,
    },

    #[serde(rename = "session:start")]
    SessionStart {
        session_id: Uuid,
        node_id: String,
        index: usize,
    },

    #[serde(rename = "session:end")]
    SessionEnd {
        session_id: Uuid,
        node_id: String,
        index: usize,
        success: bool,
    },
}

impl FlowEvent {
    pub fn name(&self) -> &'static str {
        match self {
            FlowEvent::FlowStart { .. } => "flow:start",
            FlowEvent::FlowComplete { .. } => "flow:complete",
            FlowEvent::FlowFailed { .. } => "flow:failed",
            FlowEvent::FlowAborted { .. } => "flow:aborted",
            FlowEvent::NodeStart { .. } => "node:start",
            FlowEvent::NodeComplete { .. } => "node:complete",
            FlowEvent::NodeFailed { .. } => "node:failed",
            FlowEvent::NodeSkipped { .. } => "node:skipped",
            FlowEvent::NodeRetry { .. } => "node:retry",
            FlowEvent::EdgeFire { .. } => "edge:fire",
            FlowEvent::EdgeSkip { .. } => "edge:skip",
            FlowEvent::SessionStart { .. } => "session:start",
            FlowEvent::SessionEnd { .. } => "session:end",
        }
    }
}

// ---------------------------------------------------------------------------
// Enriched event (envelope)
// ---------------------------------------------------------------------------

/// An immutable, context-tagged occurrence published on the Hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub context: EventContext,
    pub event: Event,
}

impl EnrichedEvent {
    pub fn name(&self) -> &str {
        &self.event.name
    }
}
