//! Per-invocation context handed to `NodeHandler::run`.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use weft_types::command::InboundMessage;
use weft_types::event::{EnrichedEvent, Event, EventContext};

use crate::hub::Hub;
use crate::hub::inbox::Inbox;

/// Receives every event a node emits, in emission order.
pub type EventSink = Arc<dyn Fn(&Event) + Send + Sync>;

/// What a node sees while it runs.
///
/// Passed by value; cloning is cheap.
#[derive(Clone)]
pub struct NodeContext {
    pub run_id: Uuid,
    pub node_id: String,
    /// Set inside `forEach` iterations.
    pub session_id: Option<Uuid>,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Outputs of nodes completed before this one started.
    pub outputs: Arc<BTreeMap<String, Value>>,
    /// Cancelled when the run is aborted or this attempt times out.
    pub cancel: CancellationToken,
    hub: Hub,
    inbox: Option<Inbox<InboundMessage>>,
    sink: Option<EventSink>,
}

impl NodeContext {
    /// A context whose hub handle carries the run and node ids.
    pub fn new(run_id: Uuid, node_id: impl Into<String>, hub: Hub) -> Self {
        let node_id = node_id.into();
        let hub = hub.with_context(EventContext {
            run_id: Some(run_id),
            node_id: Some(node_id.clone()),
            ..Default::default()
        });
        Self {
            run_id,
            node_id,
            session_id: None,
            attempt: 1,
            outputs: Arc::new(BTreeMap::new()),
            cancel: CancellationToken::new(),
            hub,
            inbox: None,
            sink: None,
        }
    }

    pub fn with_session(mut self, session_id: Uuid) -> Self {
        self.session_id = Some(session_id);
        self.hub = self.hub.with_context(EventContext::session(session_id));
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn with_outputs(mut self, outputs: Arc<BTreeMap<String, Value>>) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_inbox(mut self, inbox: Inbox<InboundMessage>) -> Self {
        self.inbox = Some(inbox);
        self
    }

    /// Route emitted events through `sink` as well as the hub.
    pub fn with_sink(mut self, sink: EventSink) -> Self {
        self.sink = Some(sink);
        self
    }

    /// The hub handle scoped to this node.
    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    /// Present only for node types that declare `supports_inbox`.
    pub fn inbox(&self) -> Option<&Inbox<InboundMessage>> {
        self.inbox.as_ref()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Publish a custom event (`agent:text`, `tool:call`, ...) tagged with
    /// this node's context.
    pub fn emit(&self, name: impl Into<String>, payload: Value) -> EnrichedEvent {
        let event = Event::new(name, payload);
        if let Some(sink) = &self.sink {
            sink(&event);
        }
        self.hub.emit(event)
    }
}

impl std::fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeContext")
            .field("run_id", &self.run_id)
            .field("node_id", &self.node_id)
            .field("session_id", &self.session_id)
            .field("attempt", &self.attempt)
            .field("has_inbox", &self.inbox.is_some())
            .finish()
    }
}
