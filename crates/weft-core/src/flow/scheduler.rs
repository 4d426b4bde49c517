//! Run scheduler: walks a compiled flow and drives nodes to completion.
//!
//! The scheduler owns the `RunState`. Ready nodes are spawned onto a
//! `tokio::task::JoinSet` (bounded by `max_concurrency`); each task emits its
//! own `node:start` / `node:complete` / `node:failed` events, so per-node
//! ordering holds without a global order across branches.
//!
//! # Run loop
//!
//! 1. Dispatch: skip or start every pending node whose gate is decided.
//! 2. Wait for the next task to finish (or for the run token to cancel).
//! 3. Record the outcome and decide the node's outgoing edges.
//! 4. Repeat until nothing is in flight.
//!
//! A fail-fast failure or an abort stops dispatching; in-flight nodes still
//! finish and record their outcome. Unstarted nodes stay `pending`.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use weft_types::command::{InboundMessage, InboxTarget};
use weft_types::config::EngineConfig;
use weft_types::error::{ErrorCode, NodeError};
use weft_types::event::{EventContext, FlowEvent};
use weft_types::flow::{NodeDefinition, RetryPolicy};
use weft_types::run::{EdgeStatus, IterationRecord, NodeExecutionResult, NodeStatus, RunSnapshot, RunStatus};

use super::binding::BindingContext;
use super::compiler::CompiledFlow;
use super::condition::evaluate_when;
use super::executor::run_node;
use super::state::{Readiness, RunState};
use crate::hub::{Hub, Inbox};
use crate::node::{NodeCapabilities, NodeContext, NodeRegistry};

/// Why the scheduler stopped dispatching.
#[derive(Debug)]
enum Halt {
    Failed(NodeError),
    Aborted(String),
}

/// What a finished task reports back.
struct TaskOutcome {
    node_id: String,
    result: NodeExecutionResult,
    /// Edge whose `forEach` drove the task, with the iterations executed.
    for_each: Option<(usize, u32)>,
    /// Re-run through a loop edge; outgoing edges were already decided.
    rerun: bool,
}

enum Wake {
    Joined(Option<Result<TaskOutcome, tokio::task::JoinError>>),
    Cancelled,
}

pub(crate) struct Scheduler {
    compiled: Arc<CompiledFlow>,
    registry: Arc<NodeRegistry>,
    hub: Hub,
    config: EngineConfig,
    token: CancellationToken,
    state: RunState,
    running: HashSet<String>,
    halted: Option<Halt>,
}

impl Scheduler {
    pub(crate) fn new(
        compiled: Arc<CompiledFlow>,
        registry: Arc<NodeRegistry>,
        hub: &Hub,
        config: EngineConfig,
        token: CancellationToken,
        state: RunState,
    ) -> Self {
        let hub = hub.with_context(EventContext {
            run_id: Some(state.run_id),
            ..Default::default()
        });
        Self {
            compiled,
            registry,
            hub,
            config,
            token,
            state,
            running: HashSet::new(),
            halted: None,
        }
    }

    pub(crate) async fn run(mut self) -> RunSnapshot {
        let started = Instant::now();
        let run_id = self.state.run_id;
        self.state.status = RunStatus::Running;
        tracing::info!(
            run_id = %run_id,
            flow = self.state.flow_name.as_str(),
            "starting flow run"
        );
        self.hub.emit(FlowEvent::FlowStart {
            run_id,
            flow_name: self.state.flow_name.clone(),
        });

        let mut tasks: JoinSet<TaskOutcome> = JoinSet::new();
        let token = self.token.clone();

        loop {
            if self.halted.is_none() && token.is_cancelled() {
                self.halt_aborted();
            }
            if self.halted.is_none() {
                self.dispatch(&mut tasks);
            }
            if tasks.is_empty() {
                break;
            }

            let wake = tokio::select! {
                joined = tasks.join_next() => Wake::Joined(joined),
                _ = token.cancelled(), if self.halted.is_none() => Wake::Cancelled,
            };

            match wake {
                Wake::Joined(Some(Ok(outcome))) => self.complete(outcome, &mut tasks),
                Wake::Joined(Some(Err(join_error))) => {
                    tracing::warn!(run_id = %run_id, error = %join_error, "node task ended abnormally");
                    let error = NodeError::new(
                        ErrorCode::ExecutionFailed,
                        format!("node task ended abnormally: {join_error}"),
                    )
                    .with_run(run_id);
                    self.state.record_failure(error.clone());
                    self.halt_failed(error);
                }
                Wake::Joined(None) => break,
                Wake::Cancelled => self.halt_aborted(),
            }
        }

        if self.halted.is_none() {
            let stalled: Vec<&String> = self
                .compiled
                .order()
                .iter()
                .filter(|id| self.state.node(id) == NodeStatus::Pending)
                .collect();
            if !stalled.is_empty() {
                tracing::warn!(run_id = %run_id, ?stalled, "run ended with undecided nodes");
            }
        }

        self.finish(started)
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    fn dispatch(&mut self, tasks: &mut JoinSet<TaskOutcome>) {
        let compiled = Arc::clone(&self.compiled);
        loop {
            let mut progressed = false;
            for node_id in compiled.order() {
                if self.halted.is_some() {
                    return;
                }
                if self.state.node(node_id) != NodeStatus::Pending || self.running.contains(node_id) {
                    continue;
                }
                match self.state.readiness(&compiled, node_id) {
                    Readiness::Waiting => {}
                    Readiness::Skip(reason) => {
                        self.skip_node(node_id, reason);
                        progressed = true;
                    }
                    Readiness::Ready => {
                        if tasks.len() >= self.config.max_concurrency {
                            continue;
                        }
                        let Some(node) = compiled.node(node_id) else {
                            continue;
                        };
                        let binding = self.state.binding_context();
                        if evaluate_when(node.when.as_ref(), &binding) {
                            self.start_node(node, binding, tasks);
                        } else {
                            self.skip_node(node_id, "condition evaluated to false".to_string());
                        }
                        progressed = true;
                    }
                }
            }
            if !progressed {
                break;
            }
        }
    }

    fn skip_node(&mut self, node_id: &str, reason: String) {
        tracing::debug!(run_id = %self.state.run_id, node_id, reason = reason.as_str(), "node skipped");
        self.state.set_node(node_id, NodeStatus::Skipped);
        self.hub.emit_with(
            FlowEvent::NodeSkipped {
                run_id: self.state.run_id,
                node_id: node_id.to_string(),
                reason,
            },
            &node_scope(node_id),
        );
        self.decide_edges(node_id, false);
    }

    fn start_node(&mut self, node: &NodeDefinition, binding: BindingContext, tasks: &mut JoinSet<TaskOutcome>) {
        let node_id = node.id.clone();
        let job = self.job(node);

        match self.compiled.for_each_edge(&node_id) {
            None => {
                let input = binding.resolve_input(&node.input);
                self.mark_running(&node_id);
                tasks.spawn(async move {
                    let result = job.run_single(input).await;
                    TaskOutcome {
                        node_id,
                        result,
                        for_each: None,
                        rerun: false,
                    }
                });
            }
            Some(edge_index) => self.start_iterations(edge_index, job, binding, false, tasks),
        }
    }

    /// Spawn the iterations of `job` over the items of `edge_index`.
    fn start_iterations(
        &mut self,
        edge_index: usize,
        job: NodeJob,
        binding: BindingContext,
        rerun: bool,
        tasks: &mut JoinSet<TaskOutcome>,
    ) {
        let node_id = job.node.id.clone();
        let edge = self.compiled.edge(edge_index);
        let Some(for_each) = edge.for_each.clone() else {
            return;
        };
        let max_iterations = edge
            .max_iterations
            .unwrap_or(self.config.default_max_iterations) as usize;

        let items = match binding.resolve_template(&for_each.items) {
            Some(Value::Array(items)) => items,
            other => {
                let found = other.as_ref().map_or("nothing", json_kind);
                let error = NodeError::new(
                    ErrorCode::InputValidationError,
                    format!("forEach.in '{}' resolved to {found}, expected an array", for_each.items),
                );
                self.fail_immediately(&node_id, error);
                return;
            }
        };

        if items.len() > max_iterations {
            let error = NodeError::new(
                ErrorCode::ExecutionFailed,
                format!(
                    "forEach over '{}' has {} items, exceeding maxIterations {max_iterations}",
                    self.compiled.edge_id(edge_index),
                    items.len()
                ),
            );
            let error = self.fail_immediately(&node_id, error);
            // Over-limit loops end the run regardless of continueOnError.
            self.halt_failed(error);
            return;
        }

        self.mark_running(&node_id);
        tasks.spawn(async move {
            let (result, executed) = job.run_iterations(items, for_each.binding, binding).await;
            TaskOutcome {
                node_id,
                result,
                for_each: Some((edge_index, executed)),
                rerun,
            }
        });
    }

    fn job(&self, node: &NodeDefinition) -> NodeJob {
        let run_id = self.state.run_id;
        let capabilities = self
            .registry
            .get(&node.node_type)
            .map(|h| h.capabilities())
            .unwrap_or_default();
        let inbox = capabilities
            .supports_inbox
            .then(|| self.hub.inbox(&InboxTarget::Run { run_id }));
        NodeJob {
            registry: Arc::clone(&self.registry),
            node: node.clone(),
            hub: self.hub.with_context(node_scope(&node.id)),
            run_id,
            outputs: self.state.outputs_snapshot(),
            token: self.token.clone(),
            inbox,
            capabilities,
            default_retry: self.config.default_retry.clone(),
        }
    }

    fn mark_running(&mut self, node_id: &str) {
        self.state.set_node(node_id, NodeStatus::Running);
        self.running.insert(node_id.to_string());
    }

    /// Fail a node that never started. Returns the recorded error.
    fn fail_immediately(&mut self, node_id: &str, error: NodeError) -> NodeError {
        let error = error.with_node(node_id).with_run(self.state.run_id);
        self.hub.emit_with(
            FlowEvent::NodeFailed {
                run_id: self.state.run_id,
                node_id: node_id.to_string(),
                error: error.clone(),
            },
            &node_scope(node_id),
        );
        self.on_failure(node_id, error.clone(), false);
        error
    }

    // -----------------------------------------------------------------------
    // Completion
    // -----------------------------------------------------------------------

    fn complete(&mut self, outcome: TaskOutcome, tasks: &mut JoinSet<TaskOutcome>) {
        let TaskOutcome {
            node_id,
            result,
            for_each,
            rerun,
        } = outcome;
        self.running.remove(&node_id);
        if let Some((edge_index, executed)) = for_each {
            let edge_id = self.compiled.edge_id(edge_index).to_string();
            self.state.bump_loop_counter(&edge_id, executed);
        }

        match (result.output, result.error) {
            (_, Some(error)) => self.on_failure(&node_id, error, rerun),
            (output, None) => {
                self.state
                    .record_output(&node_id, output.unwrap_or(Value::Null));
                self.state.set_node(&node_id, NodeStatus::Done);
                tracing::debug!(
                    run_id = %self.state.run_id,
                    node_id = node_id.as_str(),
                    attempts = result.attempts,
                    "node done"
                );
                if !rerun && self.halted.is_none() {
                    self.decide_edges(&node_id, true);
                    self.start_loop_edges(&node_id, tasks);
                }
            }
        }
    }

    fn on_failure(&mut self, node_id: &str, error: NodeError, rerun: bool) {
        self.state.set_node(node_id, NodeStatus::Failed);
        self.state.record_failure(error.clone());
        tracing::debug!(
            run_id = %self.state.run_id,
            node_id,
            code = error.code.as_str(),
            "node failed"
        );

        if self.halted.is_some() || error.code == ErrorCode::Cancelled {
            return;
        }
        let tolerated = self
            .compiled
            .node(node_id)
            .is_some_and(NodeDefinition::continues_on_error);
        if tolerated {
            if !rerun {
                self.decide_edges(node_id, false);
            }
        } else {
            self.halt_failed(error);
        }
    }

    /// Decide every gating edge leaving a terminal node.
    fn decide_edges(&mut self, node_id: &str, succeeded: bool) {
        let compiled = Arc::clone(&self.compiled);
        let binding = succeeded.then(|| self.state.binding_context());
        for &i in compiled.outgoing(node_id) {
            if compiled.is_loop_edge(i) {
                continue;
            }
            let edge = compiled.edge(i);
            let fire = binding
                .as_ref()
                .is_some_and(|ctx| evaluate_when(edge.when.as_ref(), ctx));
            self.set_edge(i, fire);
        }
    }

    /// Loop edges leaving `node_id` re-run their target over fresh items.
    fn start_loop_edges(&mut self, node_id: &str, tasks: &mut JoinSet<TaskOutcome>) {
        let compiled = Arc::clone(&self.compiled);
        for &i in compiled.outgoing(node_id) {
            if !compiled.is_loop_edge(i) {
                continue;
            }
            let edge = compiled.edge(i);
            let binding = self.state.binding_context();
            let fire = evaluate_when(edge.when.as_ref(), &binding);
            self.set_edge(i, fire);
            if !fire || self.halted.is_some() {
                continue;
            }
            let target = edge.to.as_str();
            if self.state.node(target) != NodeStatus::Done || self.running.contains(target) {
                tracing::debug!(edge = compiled.edge_id(i), target, "loop target not re-runnable");
                continue;
            }
            if let Some(node) = compiled.node(target) {
                let job = self.job(node);
                self.start_iterations(i, job, binding, true, tasks);
            }
        }
    }

    fn set_edge(&mut self, index: usize, fire: bool) {
        let edge = self.compiled.edge(index);
        let edge_id = self.compiled.edge_id(index).to_string();
        let run_id = self.state.run_id;
        if fire {
            self.state.set_edge(&edge_id, EdgeStatus::Fired);
            self.hub.emit(FlowEvent::EdgeFire {
                run_id,
                edge_id,
                from: edge.from.clone(),
                to: edge.to.clone(),
            });
        } else {
            self.state.set_edge(&edge_id, EdgeStatus::Skipped);
            self.hub.emit(FlowEvent::EdgeSkip {
                run_id,
                edge_id,
                from: edge.from.clone(),
                to: edge.to.clone(),
            });
        }
    }

    // -----------------------------------------------------------------------
    // Halting and finishing
    // -----------------------------------------------------------------------

    fn halt_failed(&mut self, error: NodeError) {
        if self.halted.is_none() {
            tracing::debug!(run_id = %self.state.run_id, error = %error, "halting run after failure");
            self.halted = Some(Halt::Failed(error));
        }
    }

    fn halt_aborted(&mut self) {
        if self.halted.is_none() {
            let reason = self
                .hub
                .abort_reason(&self.state.run_id)
                .unwrap_or_else(|| "abort requested".to_string());
            tracing::debug!(run_id = %self.state.run_id, reason = reason.as_str(), "halting aborted run");
            self.halted = Some(Halt::Aborted(reason));
        }
    }

    fn finish(mut self, started: Instant) -> RunSnapshot {
        let run_id = self.state.run_id;
        let flow_name = self.state.flow_name.clone();
        let duration_ms = started.elapsed().as_millis() as u64;

        match self.halted.take() {
            Some(Halt::Aborted(reason)) => {
                let error = NodeError::new(ErrorCode::Cancelled, format!("run aborted: {reason}")).with_run(run_id);
                self.state.finish(RunStatus::Aborted, Some(error));
                tracing::info!(run_id = %run_id, flow = flow_name.as_str(), reason = reason.as_str(), "flow run aborted");
                self.hub.emit(FlowEvent::FlowAborted {
                    run_id,
                    flow_name,
                    reason,
                });
            }
            Some(Halt::Failed(error)) => {
                self.state.finish(RunStatus::Failed, Some(error.clone()));
                let snapshot_failed: Vec<String> = self
                    .compiled
                    .order()
                    .iter()
                    .filter(|id| self.state.node(id) == NodeStatus::Failed)
                    .cloned()
                    .collect();
                tracing::info!(
                    run_id = %run_id,
                    flow = flow_name.as_str(),
                    code = error.code.as_str(),
                    duration_ms,
                    "flow run failed"
                );
                self.hub.emit(FlowEvent::FlowFailed {
                    run_id,
                    flow_name,
                    error,
                    failed_nodes: snapshot_failed,
                });
            }
            None => {
                self.state.finish(RunStatus::Complete, None);
                tracing::info!(
                    run_id = %run_id,
                    flow = flow_name.as_str(),
                    duration_ms,
                    tolerated_failures = self.state.has_failures(),
                    "flow run complete"
                );
                self.hub.emit(FlowEvent::FlowComplete {
                    run_id,
                    flow_name,
                    duration_ms,
                });
            }
        }

        let pending: Vec<InboundMessage> = self.hub.pending_messages(&InboxTarget::Run { run_id });
        self.state.snapshot(pending)
    }
}

fn node_scope(node_id: &str) -> EventContext {
    EventContext {
        node_id: Some(node_id.to_string()),
        ..Default::default()
    }
}

fn json_kind(value: &Value) -> &'static str {
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
// NodeJob
// ---------------------------------------------------------------------------

/// Everything a spawned node task needs, owned.
struct NodeJob {
    registry: Arc<NodeRegistry>,
    node: NodeDefinition,
    hub: Hub,
    run_id: Uuid,
    outputs: Arc<BTreeMap<String, Value>>,
    token: CancellationToken,
    inbox: Option<Inbox<InboundMessage>>,
    capabilities: NodeCapabilities,
    default_retry: RetryPolicy,
}

impl NodeJob {
    fn context(&self) -> NodeContext {
        let ctx = NodeContext::new(self.run_id, self.node.id.clone(), self.hub.clone())
            .with_outputs(Arc::clone(&self.outputs))
            .with_cancel(self.token.clone());
        match &self.inbox {
            Some(inbox) => ctx.with_inbox(inbox.clone()),
            None => ctx,
        }
    }

    async fn run_single(self, input: Value) -> NodeExecutionResult {
        self.hub.emit(FlowEvent::NodeStart {
            run_id: self.run_id,
            node_id: self.node.id.clone(),
            node_type: self.node.node_type.clone(),
            iteration: None,
        });
        let result = run_node(&self.registry, &self.node, self.context(), input, &self.default_retry).await;
        report(&self.hub, &result);
        result
    }

    /// Run one invocation per item, sequentially, each in a fresh session.
    /// Stops at the first failed iteration. Returns the aggregate result and
    /// the number of iterations executed.
    async fn run_iterations(
        self,
        items: Vec<Value>,
        binding: String,
        base: BindingContext,
    ) -> (NodeExecutionResult, u32) {
        let started = Instant::now();
        let mut records: Vec<IterationRecord> = Vec::with_capacity(items.len());
        let mut attempts = 0;
        let mut executed = 0;

        let failed = |error: NodeError, attempts: u32| NodeExecutionResult {
            node_id: self.node.id.clone(),
            run_id: self.run_id,
            output: None,
            error: Some(error),
            attempts,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        for (index, item) in items.into_iter().enumerate() {
            if self.token.is_cancelled() {
                let error = NodeError::new(ErrorCode::Cancelled, format!("run cancelled before iteration {index}"))
                    .with_node(self.node.id.clone())
                    .with_run(self.run_id);
                return (failed(error, attempts), executed);
            }

            let session_id = Uuid::now_v7();
            let session_hub = self.hub.with_context(EventContext::session(session_id));
            let input = base
                .clone()
                .with_loop(&binding, item.clone(), index, session_id)
                .resolve_input(&self.node.input);

            if self.capabilities.opens_sessions() {
                session_hub.emit(FlowEvent::SessionStart {
                    session_id,
                    node_id: self.node.id.clone(),
                    index,
                });
            }
            session_hub.emit(FlowEvent::NodeStart {
                run_id: self.run_id,
                node_id: self.node.id.clone(),
                node_type: self.node.node_type.clone(),
                iteration: Some(index),
            });

            let ctx = self.context().with_session(session_id);
            let result = run_node(&self.registry, &self.node, ctx, input, &self.default_retry).await;
            report(&session_hub, &result);
            attempts += result.attempts;
            executed += 1;

            if self.capabilities.opens_sessions() {
                session_hub.emit(FlowEvent::SessionEnd {
                    session_id,
                    node_id: self.node.id.clone(),
                    index,
                    success: result.is_success(),
                });
            }

            match (result.output, result.error) {
                (_, Some(error)) => return (failed(error, attempts), executed),
                (output, None) => records.push(IterationRecord {
                    item,
                    session_id,
                    output: output.unwrap_or(Value::Null),
                }),
            }
        }

        let result = NodeExecutionResult {
            node_id: self.node.id.clone(),
            run_id: self.run_id,
            output: Some(json!({ "iterations": records })),
            error: None,
            attempts,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        (result, executed)
    }
}

fn report(hub: &Hub, result: &NodeExecutionResult) {
    match &result.error {
        None => {
            hub.emit(FlowEvent::NodeComplete {
                run_id: result.run_id,
                node_id: result.node_id.clone(),
                attempts: result.attempts,
                duration_ms: result.duration_ms,
            });
        }
        Some(error) => {
            hub.emit(FlowEvent::NodeFailed {
                run_id: result.run_id,
                node_id: result.node_id.clone(),
                error: error.clone(),
            });
        }
    }
}
