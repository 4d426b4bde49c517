//! Run-state types: statuses, node results and the final snapshot.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::command::InboundMessage;
use crate::error::NodeError;

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

/// Overall status of a run: `idle -> running -> {complete | failed | aborted}`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Idle,
    Running,
    Complete,
    Failed,
    Aborted,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Complete | RunStatus::Failed | RunStatus::Aborted)
    }
}

/// Per-node status: `pending -> running -> {done | failed | skipped}`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    #[default]
    Pending,
    Running,
    Done,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeStatus::Done | NodeStatus::Failed | NodeStatus::Skipped)
    }
}

/// Per-edge status: `pending -> {fired | skipped}`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeStatus {
    #[default]
    Pending,
    Fired,
    Skipped,
}

// ---------------------------------------------------------------------------
// Node results
// ---------------------------------------------------------------------------

/// Outcome of one node invocation (all attempts included).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeExecutionResult {
    pub node_id: String,
    pub run_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<NodeError>,
    /// Number of times the node's run function was invoked.
    pub attempts: u32,
    pub duration_ms: u64,
}

impl NodeExecutionResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// One `forEach` iteration, in input order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IterationRecord {
    pub item: Value,
    pub session_id: Uuid,
    pub output: Value,
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// The externally observable truth of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSnapshot {
    pub run_id: Uuid,
    pub flow_name: String,
    pub status: RunStatus,
    /// Node id -> output. Iterated nodes hold `{ "iterations": [...] }`.
    pub outputs: BTreeMap<String, Value>,
    /// User state.
    pub state: Value,
    pub node_status: BTreeMap<String, NodeStatus>,
    pub edge_status: BTreeMap<String, EdgeStatus>,
    /// Edge id -> executed iterations.
    pub loop_counters: BTreeMap<String, u32>,
    /// Inbound messages addressed to this run that no node consumed.
    pub pending_commands: Vec<InboundMessage>,
    /// Every node failure, in the order they were observed.
    pub failures: Vec<NodeError>,
    /// The error that ended the run, if it failed or was aborted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<NodeError>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl RunSnapshot {
    pub fn node(&self, node_id: &str) -> NodeStatus {
        self.node_status.get(node_id).copied().unwrap_or_default()
    }

    pub fn edge(&self, edge_id: &str) -> EdgeStatus {
        self.edge_status.get(edge_id).copied().unwrap_or_default()
    }

    pub fn output(&self, node_id: &str) -> Option<&Value> {
        self.outputs.get(node_id)
    }

    /// Ids of nodes that ended `failed`.
    pub fn failed_nodes(&self) -> Vec<&str> {
        self.node_status
            .iter()
            .filter(|(_, status)| **status == NodeStatus::Failed)
            .map(|(id, _)| id.as_str())
            .collect()
    }
}
