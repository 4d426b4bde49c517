//! A node type whose runs go through a [`Recorder`].

use std::sync::Arc;

use anyhow::Context as _;
use serde_json::{json, Value};
use weft_types::event::Event;

use super::recorder::{CallEvents, CallRequest, EventCallback, Recorder};
use super::store::RecordingStore;
use crate::node::context::EventSink;
use crate::node::schema::Schema;
use crate::node::{BoxNodeHandler, NodeCapabilities, NodeContext, NodeHandler};

/// Wraps any node handler so its calls are recorded or replayed.
///
/// Registered under the wrapped handler's type id with the same schemas and
/// capabilities. Events the wrapped node emits through `NodeContext::emit`
/// are captured; on replay they are re-emitted through the same context.
pub struct RecordedNode<S: RecordingStore> {
    inner: BoxNodeHandler,
    recorder: Arc<Recorder<S>>,
    scenario_id: String,
}

impl<S: RecordingStore + 'static> RecordedNode<S> {
    pub fn new(inner: BoxNodeHandler, recorder: Arc<Recorder<S>>, scenario_id: impl Into<String>) -> Self {
        Self {
            inner,
            recorder,
            scenario_id: scenario_id.into(),
        }
    }
}

impl<S: RecordingStore + 'static> NodeHandler for RecordedNode<S> {
    fn node_type(&self) -> &str {
        self.inner.node_type()
    }

    fn input_schema(&self) -> &Schema {
        self.inner.input_schema()
    }

    fn output_schema(&self) -> &Schema {
        self.inner.output_schema()
    }

    fn capabilities(&self) -> NodeCapabilities {
        self.inner.capabilities()
    }

    async fn run(&self, ctx: NodeContext, input: Value) -> anyhow::Result<Value> {
        let request = CallRequest::new(self.scenario_id.clone(), self.inner.node_type(), input.clone());

        let replay_ctx = ctx.clone();
        let callback: EventCallback = Arc::new(move |event: &Value| {
            match serde_json::from_value::<Event>(event.clone()) {
                Ok(event) => {
                    replay_ctx.emit(event.name, Value::Object(event.payload));
                }
                Err(e) => tracing::warn!(error = %e, "skipping unreadable recorded event"),
            }
        });

        let inner = self.inner.clone();
        self.recorder
            .call(request, Some(callback), move |events: CallEvents| {
                let sink: EventSink = Arc::new(move |event: &Event| {
                    events.record(serde_json::to_value(event).unwrap_or_else(|_| json!({ "type": event.name })));
                });
                inner.run(ctx.with_sink(sink), input)
            })
            .await
            .with_context(|| format!("recorded node '{}'", self.scenario_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::FlowRuntime;
    use crate::hub::Hub;
    use crate::node::{FnNode, NodeRegistry};
    use crate::record::store::InMemoryRecordingStore;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use weft_types::event::EnrichedEvent;
    use weft_types::flow::{EdgeDefinition, FlowDefinition, NodeDefinition};
    use weft_types::recording::RecordingMode;
    use weft_types::run::RunStatus;

    /// A "provider" that streams two chunks and counts live invocations.
    fn provider(calls: Arc<AtomicU32>) -> BoxNodeHandler {
        BoxNodeHandler::new(FnNode::new("llm", move |ctx: NodeContext, input: Value| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                let prompt = input["prompt"].as_str().unwrap_or_default().to_string();
                ctx.emit("agent:text", json!({ "delta": "re: " }));
                ctx.emit("agent:text", json!({ "delta": prompt.clone() }));
                ctx.emit("agent:tool", json!({ "type": "function", "name": "lookup" }));
                Ok(json!({ "text": format!("re: {prompt}") }))
            }
        }))
    }

    fn flow() -> FlowDefinition {
        FlowDefinition::new("chat")
            .with_node(NodeDefinition::new("ask", "llm").with_input("prompt", "{{ input.question }}"))
            .with_node(NodeDefinition::new("show", "echo").with_input("text", "{{ ask.text }}"))
            .with_edge(EdgeDefinition::new("ask", "show"))
    }

    async fn run(
        store: &Arc<InMemoryRecordingStore>,
        mode: RecordingMode,
        calls: &Arc<AtomicU32>,
    ) -> (Value, Vec<String>) {
        let recorder = Arc::new(Recorder::new(Arc::clone(store), mode));
        let mut registry = NodeRegistry::new();
        registry.register(RecordedNode::new(provider(Arc::clone(calls)), recorder, "chat/ask"));
        registry.register(FnNode::new("echo", |_ctx, input: Value| async move { Ok(input) }));

        let hub = Hub::new();
        let names = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&names);
        let _sub = hub.subscribe("*", move |e: &EnrichedEvent| {
            sink.lock().unwrap().push(e.name().to_string());
        });
        let runtime = FlowRuntime::builder(registry).hub(hub).build();
        let snap = runtime
            .run(&flow(), json!({ "question": "why" }))
            .await
            .unwrap();
        assert_eq!(snap.status, RunStatus::Complete);

        let names = names.lock().unwrap().clone();
        (snap.output("show").cloned().unwrap_or_default(), names)
    }

    #[tokio::test]
    async fn test_replayed_run_matches_recorded_run() {
        let store = Arc::new(InMemoryRecordingStore::new());
        let calls = Arc::new(AtomicU32::new(0));

        let (recorded_output, recorded_events) = run(&store, RecordingMode::Record, &calls).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.export()[0].events.len(), 3);

        let (replayed_output, replayed_events) = run(&store, RecordingMode::Replay, &calls).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1, "replay makes no live calls");
        assert_eq!(replayed_output, recorded_output);
        assert_eq!(replayed_events, recorded_events);
        assert_eq!(
            replayed_events.iter().filter(|n| *n == "agent:text").count(),
            2
        );
        assert_eq!(
            replayed_events.iter().filter(|n| *n == "agent:tool").count(),
            1
        );
    }

    #[tokio::test]
    async fn test_replay_of_unrecorded_input_fails_node() {
        let store = Arc::new(InMemoryRecordingStore::new());
        let recorder = Arc::new(Recorder::new(Arc::clone(&store), RecordingMode::Replay));
        let calls = Arc::new(AtomicU32::new(0));
        let mut registry = NodeRegistry::new();
        registry.register(RecordedNode::new(provider(Arc::clone(&calls)), recorder, "chat/ask"));

        let runtime = FlowRuntime::new(registry);
        let flow = FlowDefinition::new("one").with_node(NodeDefinition::new("ask", "llm"));
        let snap = runtime.run(&flow, json!({})).await.unwrap();

        assert_eq!(snap.status, RunStatus::Failed);
        let error = snap.error.unwrap();
        assert!(
            error.cause.as_deref().unwrap_or_default().contains("Recording not found"),
            "{error:?}"
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
