//! Flow runtime: the entry point that compiles a flow and runs it.
//!
//! `FlowRuntime` owns the node registry, the shared `Hub` and the engine
//! config. Every run gets its own id, cancellation token and `RunState`;
//! the returned `RunSnapshot` is the only record of what happened.

use std::future::Future;
use std::sync::Arc;

use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;
use weft_types::config::EngineConfig;
use weft_types::error::{ErrorCode, NodeError};
use weft_types::flow::FlowDefinition;
use weft_types::run::RunSnapshot;

use super::compiler::{compile, CompileError, CompiledFlow};
use super::scheduler::Scheduler;
use super::state::RunState;
use crate::hub::Hub;
use crate::node::schema::{describe, Schema};
use crate::node::NodeRegistry;

// ---------------------------------------------------------------------------
// FlowExecutor trait
// ---------------------------------------------------------------------------

/// Runs flow definitions to completion.
///
/// Uses RPITIT (native async fn in traits, Rust 2024).
pub trait FlowExecutor: Send + Sync {
    /// Compile and run `flow` with `input` as the flow input.
    fn execute(
        &self,
        flow: &FlowDefinition,
        input: Value,
    ) -> impl Future<Output = Result<RunSnapshot, RuntimeError>> + Send;

    /// Cooperatively cancel an in-flight run.
    fn cancel(
        &self,
        run_id: Uuid,
        reason: Option<&str>,
    ) -> impl Future<Output = Result<(), RuntimeError>> + Send;
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that stop a run before its first node.
///
/// Node failures never surface here; they are recorded in the snapshot.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("flow compilation failed: {0}")]
    Compile(#[from] CompileError),

    /// `state.initial` does not match `state.schema`.
    #[error("invalid initial state: {0}")]
    InvalidState(String),

    #[error("run not found: {0}")]
    RunNotFound(Uuid),
}

impl RuntimeError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RuntimeError::Compile(e) => e.code(),
            RuntimeError::InvalidState(_) => ErrorCode::SchemaValidationError,
            RuntimeError::RunNotFound(_) => ErrorCode::ExecutionFailed,
        }
    }

    pub fn to_node_error(&self) -> NodeError {
        match self {
            RuntimeError::Compile(e) => e.to_node_error(),
            other => NodeError::new(other.code(), other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// FlowRuntime
// ---------------------------------------------------------------------------

/// Compiles and runs flows against a fixed node registry.
///
/// Cloning is cheap; clones share the registry and the hub.
#[derive(Debug, Clone)]
pub struct FlowRuntime {
    registry: Arc<NodeRegistry>,
    hub: Hub,
    config: EngineConfig,
}

/// Builder for [`FlowRuntime`].
pub struct FlowRuntimeBuilder {
    registry: Arc<NodeRegistry>,
    hub: Option<Hub>,
    config: EngineConfig,
}

impl FlowRuntimeBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Publish on an existing hub instead of a fresh one.
    pub fn hub(mut self, hub: Hub) -> Self {
        self.hub = Some(hub);
        self
    }

    pub fn build(self) -> FlowRuntime {
        let config = self.config.validated();
        let hub = self.hub.unwrap_or_else(|| Hub::from_config(&config));
        FlowRuntime {
            registry: self.registry,
            hub,
            config,
        }
    }
}

impl FlowRuntime {
    pub fn builder(registry: impl Into<Arc<NodeRegistry>>) -> FlowRuntimeBuilder {
        FlowRuntimeBuilder {
            registry: registry.into(),
            hub: None,
            config: EngineConfig::default(),
        }
    }

    /// A runtime with the default config and a fresh hub.
    pub fn new(registry: impl Into<Arc<NodeRegistry>>) -> Self {
        Self::builder(registry).build()
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Compile `flow` against this runtime's registry without running it.
    pub fn compile(&self, flow: &FlowDefinition) -> Result<CompiledFlow, RuntimeError> {
        Ok(compile(flow, &self.registry)?)
    }

    /// Run `flow` under a fresh run id.
    pub async fn run(&self, flow: &FlowDefinition, input: Value) -> Result<RunSnapshot, RuntimeError> {
        self.run_with_id(Uuid::now_v7(), flow, input).await
    }

    /// Run `flow` under a caller-chosen id, so the caller can address the
    /// run (`send_to_run`, `abort_run`) while it is in flight.
    pub async fn run_with_id(
        &self,
        run_id: Uuid,
        flow: &FlowDefinition,
        input: Value,
    ) -> Result<RunSnapshot, RuntimeError> {
        let compiled = self.compile(flow).inspect_err(|e| {
            tracing::warn!(run_id = %run_id, flow = flow.name(), error = %e, "flow rejected");
        })?;
        let initial_state = initial_state(flow)?;

        let token = self.hub.register_run(run_id);
        let state = RunState::new(run_id, &compiled, input, initial_state);
        let scheduler = Scheduler::new(
            Arc::new(compiled),
            Arc::clone(&self.registry),
            &self.hub,
            self.config.clone(),
            token,
            state,
        );
        let snapshot = scheduler.run().await;
        self.hub.unregister_run(&run_id);
        Ok(snapshot)
    }

    /// Cancel one in-flight run. `false` if no such run is active.
    pub fn abort_run(&self, run_id: Uuid, reason: Option<&str>) -> bool {
        self.hub.abort_run(run_id, reason)
    }
}

impl FlowExecutor for FlowRuntime {
    async fn execute(&self, flow: &FlowDefinition, input: Value) -> Result<RunSnapshot, RuntimeError> {
        self.run(flow, input).await
    }

    async fn cancel(&self, run_id: Uuid, reason: Option<&str>) -> Result<(), RuntimeError> {
        if self.abort_run(run_id, reason) {
            Ok(())
        } else {
            Err(RuntimeError::RunNotFound(run_id))
        }
    }
}

/// `state.initial`, checked against `state.schema` when one is declared.
fn initial_state(flow: &FlowDefinition) -> Result<Value, RuntimeError> {
    let Some(spec) = &flow.state else {
        return Ok(json!({}));
    };
    if let Some(document) = &spec.schema {
        let schema = Schema::compile(document)
            .map_err(|e| RuntimeError::InvalidState(format!("state schema does not compile: {e}")))?;
        schema
            .validate(&spec.initial)
            .map_err(|violations| RuntimeError::InvalidState(describe(&violations)))?;
    }
    Ok(spec.initial.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::EventFilter;
    use crate::node::{FnNode, NodeCapabilities};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::time::Duration;
    use weft_types::event::EnrichedEvent;
    use weft_types::flow::{Condition, EdgeDefinition, Gate, NodeDefinition, NodePolicy, RetryPolicy, StateSpec};
    use weft_types::run::{EdgeStatus, NodeStatus, RunStatus};

    fn echo() -> FnNode {
        FnNode::new("echo", |_ctx, input: Value| async move {
            Ok(json!({ "text": input.get("text").cloned().unwrap_or(Value::Null) }))
        })
    }

    fn list() -> FnNode {
        FnNode::new("list", |_ctx, input: Value| async move {
            Ok(json!({ "value": input.get("value").cloned().unwrap_or(json!([])) }))
        })
    }

    fn fail() -> FnNode {
        FnNode::new("fail", |_ctx, _input: Value| async move { anyhow::bail!("boom") })
    }

    /// Sleeps `input.ms`, returning early with an error when cancelled.
    fn slow() -> FnNode {
        FnNode::new("slow", |ctx: crate::node::NodeContext, input: Value| async move {
            let ms = input.get("ms").and_then(Value::as_u64).unwrap_or(50);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(json!({ "slept": ms })),
                _ = ctx.cancel.cancelled() => anyhow::bail!("interrupted"),
            }
        })
    }

    fn registry() -> NodeRegistry {
        let mut registry = NodeRegistry::new();
        registry.register(echo()).register(list()).register(fail()).register(slow());
        registry
    }

    fn runtime() -> FlowRuntime {
        FlowRuntime::new(registry())
    }

    /// Collect every event named `pattern` published on `hub`.
    fn collect(
        hub: &Hub,
        filter: impl Into<EventFilter>,
    ) -> (Arc<Mutex<Vec<EnrichedEvent>>>, crate::hub::Subscription) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let sub = hub.subscribe(filter, move |e: &EnrichedEvent| {
            sink.lock().unwrap().push(e.clone());
        });
        (seen, sub)
    }

    fn node_ids(events: &[EnrichedEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| e.context.node_id.clone())
            .collect()
    }

    async fn wait_for_run(hub: &Hub) {
        for _ in 0..200 {
            if hub.active_runs() > 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("run never registered");
    }

    // -----------------------------------------------------------------------
    // Ordering and compilation
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_linear_flow_runs_in_dependency_order() {
        let rt = runtime();
        let (starts, _sub) = collect(rt.hub(), "node:start");
        let flow = FlowDefinition::new("linear")
            .with_node(NodeDefinition::new("c", "echo").with_input("text", "{{ b.text }}!"))
            .with_node(NodeDefinition::new("a", "echo").with_input("text", "{{ input.greeting }}"))
            .with_node(NodeDefinition::new("b", "echo").with_input("text", "{{ a.text }}"))
            .with_edge(EdgeDefinition::new("a", "b"))
            .with_edge(EdgeDefinition::new("b", "c"));

        let snap = rt.run(&flow, json!({ "greeting": "hi" })).await.unwrap();

        assert_eq!(snap.status, RunStatus::Complete);
        assert_eq!(node_ids(&starts.lock().unwrap()), ["a", "b", "c"]);
        assert_eq!(snap.output("c"), Some(&json!({ "text": "hi!" })));
        assert_eq!(snap.edge("a->b"), EdgeStatus::Fired);
        assert!(snap.failures.is_empty());
        assert!(snap.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_cycle_fails_before_any_node_runs() {
        let rt = runtime();
        let (events, _sub) = collect(rt.hub(), "*");
        let flow = FlowDefinition::new("loop")
            .with_node(NodeDefinition::new("a", "echo"))
            .with_node(NodeDefinition::new("b", "echo"))
            .with_edge(EdgeDefinition::new("a", "b"))
            .with_edge(EdgeDefinition::new("b", "a"));

        let err = rt.run(&flow, json!({})).await.unwrap_err();
        match &err {
            RuntimeError::Compile(CompileError::Cycle { path }) => {
                assert!(path.contains(&"a".to_string()) && path.contains(&"b".to_string()));
            }
            other => panic!("expected a cycle error, got {other:?}"),
        }
        assert_eq!(err.code(), ErrorCode::SchemaValidationError);
        assert!(events.lock().unwrap().is_empty(), "nothing may be emitted");
    }

    #[tokio::test]
    async fn test_unknown_node_type_rejected() {
        let flow = FlowDefinition::new("f").with_node(NodeDefinition::new("a", "ghost"));
        let err = runtime().run(&flow, json!({})).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::NodeNotFound);
    }

    #[tokio::test]
    async fn test_max_concurrency_bounds_parallel_nodes() {
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (c, p) = (Arc::clone(&current), Arc::clone(&peak));
        let mut registry = NodeRegistry::new();
        registry.register(FnNode::new("tracked", move |_ctx, _input: Value| {
            let (c, p) = (Arc::clone(&c), Arc::clone(&p));
            async move {
                let now = c.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(15)).await;
                c.fetch_sub(1, Ordering::SeqCst);
                Ok(json!({}))
            }
        }));
        let config = EngineConfig {
            max_concurrency: 1,
            ..Default::default()
        };
        let rt = FlowRuntime::builder(registry).config(config).build();
        let flow = FlowDefinition::new("wide")
            .with_node(NodeDefinition::new("a", "tracked"))
            .with_node(NodeDefinition::new("b", "tracked"))
            .with_node(NodeDefinition::new("c", "tracked"));

        let snap = rt.run(&flow, json!({})).await.unwrap();
        assert_eq!(snap.status, RunStatus::Complete);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    // -----------------------------------------------------------------------
    // Retry, timeout and failure tolerance
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let mut registry = registry();
        registry.register(FnNode::new("flaky", move |_ctx, _input: Value| {
            let counter = Arc::clone(&counter);
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    anyhow::bail!("attempt {n} failed");
                }
                Ok(json!({ "ok": true }))
            }
        }));
        let rt = FlowRuntime::new(registry);
        let (retries, _sub) = collect(rt.hub(), "node:retry");
        let flow = FlowDefinition::new("r").with_node(
            NodeDefinition::new("f", "flaky")
                .with_policy(NodePolicy::default().with_retry(RetryPolicy::new(3, 5))),
        );

        let snap = rt.run(&flow, json!({})).await.unwrap();
        assert_eq!(snap.status, RunStatus::Complete);
        assert_eq!(snap.node("f"), NodeStatus::Done);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(retries.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_timeout_with_continue_on_error_keeps_siblings_running() {
        let rt = runtime();
        let flow = FlowDefinition::new("t")
            .with_node(
                NodeDefinition::new("sleepy", "slow")
                    .with_input("ms", 500)
                    .with_policy(NodePolicy::default().with_timeout_ms(20).continue_on_error()),
            )
            .with_node(NodeDefinition::new("sibling", "echo").with_input("text", "fine"))
            .with_node(NodeDefinition::new("after", "echo"))
            .with_edge(EdgeDefinition::new("sleepy", "after"));

        let snap = rt.run(&flow, json!({})).await.unwrap();
        assert_eq!(snap.status, RunStatus::Complete, "tolerated failures complete the run");
        assert_eq!(snap.node("sleepy"), NodeStatus::Failed);
        assert_eq!(snap.node("sibling"), NodeStatus::Done);
        assert_eq!(snap.node("after"), NodeStatus::Skipped);
        assert_eq!(snap.edge("sleepy->after"), EdgeStatus::Skipped);
        assert_eq!(snap.failures.len(), 1);
        assert_eq!(snap.failures[0].code, ErrorCode::ExecutionTimeout);
        assert!(snap.error.is_none());
    }

    #[tokio::test]
    async fn test_fail_fast_leaves_downstream_pending() {
        let rt = runtime();
        let (failed, _sub) = collect(rt.hub(), "flow:failed");
        let flow = FlowDefinition::new("ff")
            .with_node(NodeDefinition::new("bad", "fail"))
            .with_node(NodeDefinition::new("next", "echo"))
            .with_edge(EdgeDefinition::new("bad", "next"));

        let snap = rt.run(&flow, json!({})).await.unwrap();
        assert_eq!(snap.status, RunStatus::Failed);
        assert_eq!(snap.node("bad"), NodeStatus::Failed);
        assert_eq!(snap.node("next"), NodeStatus::Pending);
        assert_eq!(snap.edge("bad->next"), EdgeStatus::Pending);
        let error = snap.error.as_ref().expect("run error");
        assert_eq!(error.code, ErrorCode::ExecutionFailed);
        assert_eq!(error.node_id.as_deref(), Some("bad"));

        let failed = failed.lock().unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].event.get("failedNodes"), Some(&json!(["bad"])));
    }

    #[tokio::test]
    async fn test_any_gate_runs_after_one_branch_succeeds() {
        let rt = runtime();
        let flow = FlowDefinition::new("any")
            .with_node(
                NodeDefinition::new("broken", "fail")
                    .with_policy(NodePolicy::default().continue_on_error()),
            )
            .with_node(NodeDefinition::new("ok", "echo").with_input("text", "from ok"))
            .with_node(NodeDefinition::new("join", "echo").with_input("text", "{{ ok.text }}"))
            .with_edge(EdgeDefinition::new("broken", "join").with_gate(Gate::Any))
            .with_edge(EdgeDefinition::new("ok", "join").with_gate(Gate::Any));

        let snap = rt.run(&flow, json!({})).await.unwrap();
        assert_eq!(snap.node("join"), NodeStatus::Done);
        assert_eq!(snap.output("join"), Some(&json!({ "text": "from ok" })));
        assert_eq!(snap.edge("broken->join"), EdgeStatus::Skipped);
    }

    // -----------------------------------------------------------------------
    // Conditions
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_false_when_skips_node_and_dependents() {
        let rt = runtime();
        let (skipped, _sub) = collect(rt.hub(), "node:skipped");
        let flow = FlowDefinition::new("cond")
            .with_node(
                NodeDefinition::new("gated", "echo")
                    .with_when(Condition::equals("flags.enabled", true)),
            )
            .with_node(NodeDefinition::new("child", "echo"))
            .with_edge(EdgeDefinition::new("gated", "child"));

        let snap = rt
            .run(&flow, json!({ "flags": { "enabled": false } }))
            .await
            .unwrap();
        assert_eq!(snap.status, RunStatus::Complete);
        assert_eq!(snap.node("gated"), NodeStatus::Skipped);
        assert_eq!(snap.node("child"), NodeStatus::Skipped);
        assert_eq!(snap.edge("gated->child"), EdgeStatus::Skipped);
        assert!(snap.output("gated").is_none());
        assert_eq!(node_ids(&skipped.lock().unwrap()), ["gated", "child"]);
    }

    #[tokio::test]
    async fn test_edge_condition_reads_source_output() {
        let rt = runtime();
        let flow = FlowDefinition::new("edges")
            .with_node(NodeDefinition::new("src", "list").with_input("value", json!([1, 2])))
            .with_node(NodeDefinition::new("many", "echo"))
            .with_node(NodeDefinition::new("few", "echo"))
            .with_edge(EdgeDefinition::new("src", "many").with_when(Condition::expr("src.value|length > 5")))
            .with_edge(EdgeDefinition::new("src", "few").with_when(Condition::expr("src.value|length <= 5")));

        let snap = rt.run(&flow, json!({})).await.unwrap();
        assert_eq!(snap.node("many"), NodeStatus::Skipped);
        assert_eq!(snap.node("few"), NodeStatus::Done);
    }

    #[tokio::test]
    async fn test_edge_fire_precedes_target_start() {
        let rt = runtime();
        let (events, _sub) = collect(rt.hub(), ["edge:fire", "node:start"].as_slice());
        let flow = FlowDefinition::new("order")
            .with_node(NodeDefinition::new("a", "echo"))
            .with_node(NodeDefinition::new("b", "echo"))
            .with_edge(EdgeDefinition::new("a", "b"));

        rt.run(&flow, json!({})).await.unwrap();
        let names: Vec<String> = events.lock().unwrap().iter().map(|e| e.name().to_string()).collect();
        assert_eq!(names, ["node:start", "edge:fire", "node:start"]);
    }

    // -----------------------------------------------------------------------
    // forEach
    // -----------------------------------------------------------------------

    fn for_each_flow() -> FlowDefinition {
        FlowDefinition::new("fan")
            .with_node(NodeDefinition::new("list", "list").with_input("value", "{{ input.items }}"))
            .with_node(NodeDefinition::new("echo", "echo").with_input("text", "{{ item }}"))
            .with_edge(EdgeDefinition::new("list", "echo").with_for_each("{{ list.value }}", "item"))
    }

    #[tokio::test]
    async fn test_for_each_aggregates_iterations_in_order() {
        let rt = runtime();
        let (starts, _sub) = collect(rt.hub(), "node:start");

        let snap = rt
            .run(&for_each_flow(), json!({ "items": ["a", "b", "c"] }))
            .await
            .unwrap();
        assert_eq!(snap.status, RunStatus::Complete);

        let iterations = snap.output("echo").unwrap()["iterations"].as_array().unwrap().clone();
        assert_eq!(iterations.len(), 3);
        for (record, expected) in iterations.iter().zip(["a", "b", "c"]) {
            assert_eq!(record["item"], json!(expected));
            assert_eq!(record["output"], json!({ "text": expected }));
        }
        let sessions: std::collections::HashSet<&str> = iterations
            .iter()
            .map(|r| r["sessionId"].as_str().unwrap())
            .collect();
        assert_eq!(sessions.len(), 3, "each iteration gets its own session");

        let starts = starts.lock().unwrap();
        let echo_starts: Vec<&EnrichedEvent> = starts
            .iter()
            .filter(|e| e.context.node_id.as_deref() == Some("echo"))
            .collect();
        assert_eq!(echo_starts.len(), 3);
        assert!(echo_starts.iter().all(|e| e.context.session_id.is_some()));
        assert_eq!(echo_starts[2].event.get("iteration"), Some(&json!(2)));
        assert_eq!(snap.loop_counters["list->echo"], 3);
    }

    #[tokio::test]
    async fn test_for_each_over_non_array_fails_validation() {
        let rt = runtime();
        let flow = for_each_flow();
        let snap = rt.run(&flow, json!({ "items": "not a list" })).await.unwrap();
        assert_eq!(snap.status, RunStatus::Failed);
        assert_eq!(snap.node("echo"), NodeStatus::Failed);
        assert_eq!(snap.error.unwrap().code, ErrorCode::InputValidationError);
    }

    #[tokio::test]
    async fn test_for_each_over_limit_fails_run_even_when_tolerated() {
        let rt = runtime();
        let mut flow = for_each_flow();
        flow.edges[0].max_iterations = Some(2);
        flow.nodes[1].policy = Some(NodePolicy::default().continue_on_error());

        let snap = rt.run(&flow, json!({ "items": [1, 2, 3] })).await.unwrap();
        assert_eq!(snap.status, RunStatus::Failed);
        let error = snap.error.unwrap();
        assert_eq!(error.code, ErrorCode::ExecutionFailed);
        assert!(error.message.contains("maxIterations"), "{}", error.message);
    }

    #[tokio::test]
    async fn test_container_nodes_emit_session_events() {
        let mut registry = registry();
        registry.register(
            FnNode::new("agent", |_ctx, input: Value| async move { Ok(input) })
                .with_capabilities(NodeCapabilities::container()),
        );
        let rt = FlowRuntime::new(registry);
        let (sessions, _sub) = collect(rt.hub(), "session:*");
        let mut flow = for_each_flow();
        flow.nodes[1].node_type = "agent".to_string();

        rt.run(&flow, json!({ "items": [1, 2] })).await.unwrap();
        let names: Vec<String> = sessions.lock().unwrap().iter().map(|e| e.name().to_string()).collect();
        assert_eq!(names, ["session:start", "session:end", "session:start", "session:end"]);
    }

    #[tokio::test]
    async fn test_loop_edge_reruns_target_over_new_items() {
        let rt = runtime();
        let flow = FlowDefinition::new("review")
            .with_node(NodeDefinition::new("plan", "echo").with_input("text", "{{ item }}"))
            .with_node(NodeDefinition::new("check", "list").with_input("value", json!(["x", "y"])))
            .with_edge(EdgeDefinition::new("plan", "check"))
            .with_edge(EdgeDefinition::new("check", "plan").with_for_each("{{ check.value }}", "item"));

        let snap = rt.run(&flow, json!({})).await.unwrap();
        assert_eq!(snap.status, RunStatus::Complete);
        let iterations = snap.output("plan").unwrap()["iterations"].as_array().unwrap().clone();
        assert_eq!(iterations.len(), 2);
        assert_eq!(iterations[1]["output"], json!({ "text": "y" }));
        assert_eq!(snap.loop_counters["check->plan"], 2);
        assert_eq!(snap.edge("check->plan"), EdgeStatus::Fired);
    }

    // -----------------------------------------------------------------------
    // State, abort and commands
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_state_schema_rejects_bad_initial_state() {
        let mut flow = FlowDefinition::new("s").with_node(NodeDefinition::new("a", "echo"));
        flow.state = Some(StateSpec {
            initial: json!({ "counter": "zero" }),
            schema: Some(json!({
                "type": "object",
                "properties": { "counter": { "type": "integer" } }
            })),
        });

        let err = runtime().run(&flow, json!({})).await.unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidState(_)));
        assert_eq!(err.code(), ErrorCode::SchemaValidationError);
    }

    #[tokio::test]
    async fn test_state_is_visible_to_bindings() {
        let flow = FlowDefinition::new("s")
            .with_state(json!({ "counter": 7 }))
            .with_node(NodeDefinition::new("a", "echo").with_input("text", "n={{ state.counter }}"));
        let snap = runtime().run(&flow, json!({})).await.unwrap();
        assert_eq!(snap.output("a"), Some(&json!({ "text": "n=7" })));
        assert_eq!(snap.state, json!({ "counter": 7 }));
    }

    #[tokio::test]
    async fn test_abort_run_stops_scheduling() {
        let rt = runtime();
        let (aborted, _sub) = collect(rt.hub(), "flow:aborted");
        let flow = FlowDefinition::new("long")
            .with_node(NodeDefinition::new("wait", "slow").with_input("ms", 2_000))
            .with_node(NodeDefinition::new("never", "echo"))
            .with_edge(EdgeDefinition::new("wait", "never"));

        let run_id = Uuid::now_v7();
        let handle = {
            let rt = rt.clone();
            tokio::spawn(async move { rt.run_with_id(run_id, &flow, json!({})).await })
        };
        wait_for_run(rt.hub()).await;
        assert!(rt.abort_run(run_id, Some("user stop")));

        let snap = handle.await.unwrap().unwrap();
        assert_eq!(snap.status, RunStatus::Aborted);
        assert_eq!(snap.node("never"), NodeStatus::Pending);
        assert_eq!(snap.error.unwrap().code, ErrorCode::Cancelled);
        let aborted = aborted.lock().unwrap();
        assert_eq!(aborted[0].event.get("reason"), Some(&json!("user stop")));
        assert_eq!(rt.hub().active_runs(), 0);
    }

    #[tokio::test]
    async fn test_cancel_unknown_run_errors() {
        let err = runtime().cancel(Uuid::now_v7(), None).await.unwrap_err();
        assert!(matches!(err, RuntimeError::RunNotFound(_)));
    }

    #[tokio::test]
    async fn test_inbox_node_receives_run_messages() {
        let mut registry = registry();
        registry.register(
            FnNode::new("listener", |ctx: crate::node::NodeContext, _input: Value| async move {
                let inbox = ctx.inbox().ok_or_else(|| anyhow::anyhow!("no inbox"))?;
                let message = inbox.pop().await.ok_or_else(|| anyhow::anyhow!("inbox closed"))?;
                Ok(json!({ "heard": message.content }))
            })
            .with_capabilities(NodeCapabilities::default().with_inbox()),
        );
        let rt = FlowRuntime::new(registry);
        let flow = FlowDefinition::new("chat").with_node(NodeDefinition::new("ear", "listener"));

        let run_id = Uuid::now_v7();
        let handle = {
            let rt = rt.clone();
            tokio::spawn(async move { rt.run_with_id(run_id, &flow, json!({})).await })
        };
        wait_for_run(rt.hub()).await;
        rt.hub().send_to_run(run_id, json!("hello")).unwrap();

        let snap = handle.await.unwrap().unwrap();
        assert_eq!(snap.output("ear"), Some(&json!({ "heard": "hello" })));
        assert!(snap.pending_commands.is_empty());
    }

    #[tokio::test]
    async fn test_unconsumed_messages_appear_in_snapshot() {
        let rt = runtime();
        let flow = FlowDefinition::new("busy").with_node(NodeDefinition::new("w", "slow").with_input("ms", 60));

        let run_id = Uuid::now_v7();
        let handle = {
            let rt = rt.clone();
            tokio::spawn(async move { rt.run_with_id(run_id, &flow, json!({})).await })
        };
        wait_for_run(rt.hub()).await;
        rt.hub().send_to_run(run_id, json!({ "note": "later" })).unwrap();

        let snap = handle.await.unwrap().unwrap();
        assert_eq!(snap.pending_commands.len(), 1);
        assert_eq!(snap.pending_commands[0].content, json!({ "note": "later" }));
    }

    #[tokio::test]
    async fn test_finished_runs_release_their_inboxes() {
        let rt = runtime();
        let flow = FlowDefinition::new("short").with_node(NodeDefinition::new("a", "echo"));
        for _ in 0..3 {
            let snap = rt.run(&flow, json!({})).await.unwrap();
            assert_eq!(snap.status, RunStatus::Complete);
        }
        assert!(rt.hub().inner.inboxes.is_empty());
        assert_eq!(rt.hub().active_runs(), 0);
    }

    #[tokio::test]
    async fn test_run_events_carry_run_id() {
        let rt = runtime();
        let (events, _sub) = collect(rt.hub(), "*");
        let flow = FlowDefinition::new("tagged").with_node(NodeDefinition::new("a", "echo"));
        let snap = rt.run(&flow, json!({})).await.unwrap();

        let events = events.lock().unwrap();
        assert_eq!(events.first().map(|e| e.name()), Some("flow:start"));
        assert_eq!(events.last().map(|e| e.name()), Some("flow:complete"));
        assert!(events.iter().all(|e| e.context.run_id == Some(snap.run_id)));
        assert_eq!(rt.hub().status(), RunStatus::Complete);
    }
}
