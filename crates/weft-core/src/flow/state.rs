//! Mutable run state, owned by the scheduler.
//!
//! Node implementations never see this type; they get a read-only snapshot
//! of prior outputs through `NodeContext`.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;
use weft_types::command::InboundMessage;
use weft_types::error::NodeError;
use weft_types::flow::Gate;
use weft_types::run::{EdgeStatus, NodeStatus, RunSnapshot, RunStatus};

use super::binding::BindingContext;
use super::compiler::CompiledFlow;

/// Whether a node may start, given its incoming edges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Waiting,
    Skip(String),
}

#[derive(Debug, Clone)]
pub struct RunState {
    pub run_id: Uuid,
    pub flow_name: String,
    pub status: RunStatus,
    input: Value,
    state: Value,
    outputs: BTreeMap<String, Value>,
    node_status: BTreeMap<String, NodeStatus>,
    edge_status: BTreeMap<String, EdgeStatus>,
    loop_counters: BTreeMap<String, u32>,
    failures: Vec<NodeError>,
    error: Option<NodeError>,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl RunState {
    /// Every node and edge starts `pending`.
    pub fn new(run_id: Uuid, flow: &CompiledFlow, input: Value, state: Value) -> Self {
        Self {
            run_id,
            flow_name: flow.name().to_string(),
            status: RunStatus::Idle,
            input,
            state,
            outputs: BTreeMap::new(),
            node_status: flow
                .order()
                .iter()
                .map(|id| (id.clone(), NodeStatus::Pending))
                .collect(),
            edge_status: flow
                .edge_ids()
                .iter()
                .map(|id| (id.clone(), EdgeStatus::Pending))
                .collect(),
            loop_counters: BTreeMap::new(),
            failures: Vec::new(),
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    // -----------------------------------------------------------------------
    // Nodes and edges
    // -----------------------------------------------------------------------

    pub fn node(&self, node_id: &str) -> NodeStatus {
        self.node_status.get(node_id).copied().unwrap_or_default()
    }

    pub fn set_node(&mut self, node_id: &str, status: NodeStatus) {
        self.node_status.insert(node_id.to_string(), status);
    }

    pub fn edge(&self, edge_id: &str) -> EdgeStatus {
        self.edge_status.get(edge_id).copied().unwrap_or_default()
    }

    pub fn set_edge(&mut self, edge_id: &str, status: EdgeStatus) {
        self.edge_status.insert(edge_id.to_string(), status);
    }

    /// Apply the gate rule to `node`'s incoming edges.
    ///
    /// `all` edges are each required; `any` edges form one group of which
    /// one must fire.
    pub fn readiness(&self, flow: &CompiledFlow, node_id: &str) -> Readiness {
        let mut any_group = 0;
        let mut any_fired = false;
        let mut any_skipped = 0;
        let mut waiting = false;

        for &i in flow.incoming(node_id) {
            let edge_id = flow.edge_id(i);
            let status = self.edge(edge_id);
            match flow.edge(i).gate {
                Gate::All => match status {
                    EdgeStatus::Skipped => {
                        return Readiness::Skip(format!("required edge '{edge_id}' was skipped"));
                    }
                    EdgeStatus::Pending => waiting = true,
                    EdgeStatus::Fired => {}
                },
                Gate::Any => {
                    any_group += 1;
                    match status {
                        EdgeStatus::Fired => any_fired = true,
                        EdgeStatus::Skipped => any_skipped += 1,
                        EdgeStatus::Pending => {}
                    }
                }
            }
        }

        if any_group > 0 && any_skipped == any_group {
            return Readiness::Skip("no incoming edge fired".to_string());
        }
        if waiting || (any_group > 0 && !any_fired) {
            Readiness::Waiting
        } else {
            Readiness::Ready
        }
    }

    // -----------------------------------------------------------------------
    // Outputs and failures
    // -----------------------------------------------------------------------

    pub fn record_output(&mut self, node_id: &str, output: Value) {
        self.outputs.insert(node_id.to_string(), output);
    }

    pub fn output(&self, node_id: &str) -> Option<&Value> {
        self.outputs.get(node_id)
    }

    pub fn record_failure(&mut self, error: NodeError) {
        self.failures.push(error);
    }

    pub fn bump_loop_counter(&mut self, edge_id: &str, iterations: u32) {
        *self.loop_counters.entry(edge_id.to_string()).or_insert(0) += iterations;
    }

    /// Read-only copy of the outputs so far, for `NodeContext`.
    pub fn outputs_snapshot(&self) -> Arc<BTreeMap<String, Value>> {
        Arc::new(self.outputs.clone())
    }

    /// Binding context over the live input, state and outputs.
    pub fn binding_context(&self) -> BindingContext {
        BindingContext::new(&self.input, &self.state, &self.outputs)
    }

    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }

    /// Close the run with a terminal status.
    pub fn finish(&mut self, status: RunStatus, error: Option<NodeError>) {
        self.status = status;
        self.error = error;
        self.completed_at = Some(Utc::now());
    }

    pub fn snapshot(&self, pending_commands: Vec<InboundMessage>) -> RunSnapshot {
        RunSnapshot {
            run_id: self.run_id,
            flow_name: self.flow_name.clone(),
            status: self.status,
            outputs: self.outputs.clone(),
            state: self.state.clone(),
            node_status: self.node_status.clone(),
            edge_status: self.edge_status.clone(),
            loop_counters: self.loop_counters.clone(),
            pending_commands,
            failures: self.failures.clone(),
            error: self.error.clone(),
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::compiler::compile_graph;
    use serde_json::json;
    use weft_types::error::ErrorCode;
    use weft_types::flow::{EdgeDefinition, FlowDefinition, NodeDefinition};

    fn diamond(gate: Gate) -> CompiledFlow {
        let def = FlowDefinition::new("d")
            .with_node(NodeDefinition::new("a", "echo"))
            .with_node(NodeDefinition::new("b", "echo"))
            .with_node(NodeDefinition::new("c", "echo"))
            .with_edge(EdgeDefinition::new("a", "c").with_gate(gate))
            .with_edge(EdgeDefinition::new("b", "c").with_gate(gate));
        compile_graph(&def).unwrap()
    }

    fn state(flow: &CompiledFlow) -> RunState {
        RunState::new(Uuid::nil(), flow, json!({}), json!({}))
    }

    #[test]
    fn test_roots_are_ready() {
        let flow = diamond(Gate::All);
        let s = state(&flow);
        assert_eq!(s.readiness(&flow, "a"), Readiness::Ready);
        assert_eq!(s.readiness(&flow, "c"), Readiness::Waiting);
        assert_eq!(s.node("c"), NodeStatus::Pending);
    }

    #[test]
    fn test_all_gate_needs_every_edge() {
        let flow = diamond(Gate::All);
        let mut s = state(&flow);
        s.set_edge("a->c", EdgeStatus::Fired);
        assert_eq!(s.readiness(&flow, "c"), Readiness::Waiting);
        s.set_edge("b->c", EdgeStatus::Fired);
        assert_eq!(s.readiness(&flow, "c"), Readiness::Ready);
    }

    #[test]
    fn test_all_gate_skips_on_any_skipped_edge() {
        let flow = diamond(Gate::All);
        let mut s = state(&flow);
        s.set_edge("b->c", EdgeStatus::Skipped);
        assert!(matches!(s.readiness(&flow, "c"), Readiness::Skip(_)));
    }

    #[test]
    fn test_any_gate_needs_one_edge() {
        let flow = diamond(Gate::Any);
        let mut s = state(&flow);
        s.set_edge("a->c", EdgeStatus::Skipped);
        assert_eq!(s.readiness(&flow, "c"), Readiness::Waiting);
        s.set_edge("b->c", EdgeStatus::Fired);
        assert_eq!(s.readiness(&flow, "c"), Readiness::Ready);
    }

    #[test]
    fn test_any_gate_skips_when_every_edge_skipped() {
        let flow = diamond(Gate::Any);
        let mut s = state(&flow);
        s.set_edge("a->c", EdgeStatus::Skipped);
        s.set_edge("b->c", EdgeStatus::Skipped);
        assert!(matches!(s.readiness(&flow, "c"), Readiness::Skip(_)));
    }

    #[test]
    fn test_snapshot_reflects_state() {
        let flow = diamond(Gate::All);
        let mut s = state(&flow);
        s.record_output("a", json!({ "x": 1 }));
        s.set_node("a", NodeStatus::Done);
        s.record_failure(NodeError::new(ErrorCode::ExecutionFailed, "b broke").with_node("b"));
        s.set_node("b", NodeStatus::Failed);
        s.bump_loop_counter("a->c", 2);
        s.finish(RunStatus::Failed, None);

        let snap = s.snapshot(Vec::new());
        assert_eq!(snap.status, RunStatus::Failed);
        assert_eq!(snap.output("a"), Some(&json!({ "x": 1 })));
        assert_eq!(snap.failed_nodes(), vec!["b"]);
        assert_eq!(snap.loop_counters["a->c"], 2);
        assert_eq!(snap.edge("a->c"), EdgeStatus::Pending);
        assert!(snap.completed_at.is_some());
        assert_eq!(s.binding_context().lookup("a.x"), Some(&json!(1)));
    }
}
