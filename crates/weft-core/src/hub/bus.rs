//! The Hub: context-scoped event publishing plus command routing.
//!
//! Every emitted event is wrapped in an `EnrichedEvent` (fresh id, timestamp,
//! ambient context) and delivered two ways: synchronously to filtered
//! listener callbacks, and to `tokio::sync::broadcast` receivers.
//!
//! Ambient context is carried by the handle, not by the task: `with_context`
//! and `scoped` return child handles sharing the same channel. A child never
//! changes its parent's context, so the parent needs no restoring on any
//! exit path.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use weft_types::command::{InboundMessage, InboxTarget};
use weft_types::config::EngineConfig;
use weft_types::event::{EnrichedEvent, Event, EventContext};
use weft_types::run::RunStatus;

use super::inbox::Inbox;
use super::pattern::EventFilter;

/// Default broadcast capacity.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

type ListenerFn = dyn Fn(&EnrichedEvent) + Send + Sync;

struct Listener {
    filter: EventFilter,
    callback: Box<ListenerFn>,
}

pub(crate) struct HubInner {
    sender: broadcast::Sender<EnrichedEvent>,
    listeners: DashMap<u64, Arc<Listener>>,
    next_listener: AtomicU64,
    pub(crate) status: Mutex<RunStatus>,
    pub(crate) session_active: AtomicBool,
    pub(crate) inboxes: DashMap<InboxTarget, Inbox<InboundMessage>>,
    pub(crate) prompts: DashMap<String, oneshot::Sender<Value>>,
    pub(crate) runs: DashMap<Uuid, CancellationToken>,
    pub(crate) abort_reasons: DashMap<Uuid, String>,
    pub(crate) prompt_timeout: Duration,
}

/// Handle to a shared event/command hub. Cloning shares the channel and the
/// ambient context.
pub struct Hub {
    pub(crate) inner: Arc<HubInner>,
    context: EventContext,
}

impl Hub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    /// Create a hub whose broadcast channel buffers `capacity` events.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::build(capacity, Duration::from_millis(EngineConfig::default().prompt_timeout_ms))
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::build(
            config.event_capacity,
            Duration::from_millis(config.prompt_timeout_ms),
        )
    }

    fn build(capacity: usize, prompt_timeout: Duration) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(HubInner {
                sender,
                listeners: DashMap::new(),
                next_listener: AtomicU64::new(1),
                status: Mutex::new(RunStatus::Idle),
                session_active: AtomicBool::new(false),
                inboxes: DashMap::new(),
                prompts: DashMap::new(),
                runs: DashMap::new(),
                abort_reasons: DashMap::new(),
                prompt_timeout,
            }),
            context: EventContext::default(),
        }
    }

    // -----------------------------------------------------------------------
    // Context
    // -----------------------------------------------------------------------

    /// The ambient context attached to events emitted through this handle.
    pub fn context(&self) -> &EventContext {
        &self.context
    }

    /// A child handle whose context is this one merged with `partial`
    /// (keys in `partial` win).
    pub fn with_context(&self, partial: EventContext) -> Hub {
        Hub {
            inner: Arc::clone(&self.inner),
            context: self.context.merge(&partial),
        }
    }

    /// Run `f` with a child handle scoped to `partial`.
    ///
    /// Emissions through `self` are unaffected before, during and after,
    /// however `f` finishes.
    pub async fn scoped<F, Fut, T>(&self, partial: EventContext, f: F) -> T
    where
        F: FnOnce(Hub) -> Fut,
        Fut: Future<Output = T>,
    {
        f(self.with_context(partial)).await
    }

    // -----------------------------------------------------------------------
    // Publishing
    // -----------------------------------------------------------------------

    /// Publish an event with this handle's ambient context.
    pub fn emit(&self, event: impl Into<Event>) -> EnrichedEvent {
        self.publish(event.into(), self.context.clone())
    }

    /// Publish an event with `context_override` merged over the ambient
    /// context.
    pub fn emit_with(&self, event: impl Into<Event>, context_override: &EventContext) -> EnrichedEvent {
        self.publish(event.into(), self.context.merge(context_override))
    }

    fn publish(&self, event: Event, context: EventContext) -> EnrichedEvent {
        {
            let mut status = self.inner.status.lock().expect("hub status lock poisoned");
            if *status == RunStatus::Idle {
                *status = RunStatus::Running;
            }
        }

        let enriched = EnrichedEvent {
            id: Uuid::now_v7(),
            timestamp: Utc::now(),
            context,
            event,
        };

        // Snapshot first so listeners may subscribe or unsubscribe re-entrantly.
        let mut matching: Vec<(u64, Arc<Listener>)> = self
            .inner
            .listeners
            .iter()
            .filter(|entry| entry.value().filter.matches(enriched.name()))
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();
        matching.sort_unstable_by_key(|(id, _)| *id);
        for (_, listener) in matching {
            (listener.callback)(&enriched);
        }

        // No receivers is fine.
        let _ = self.inner.sender.send(enriched.clone());
        tracing::trace!(event = enriched.name(), id = %enriched.id, "hub event");
        enriched
    }

    // -----------------------------------------------------------------------
    // Subscribing
    // -----------------------------------------------------------------------

    /// Register a listener for events whose name matches `filter`.
    ///
    /// Listeners run synchronously on the emitting task, in subscription
    /// order. Dropping the returned [`Subscription`] unsubscribes.
    pub fn subscribe<F>(&self, filter: impl Into<EventFilter>, listener: F) -> Subscription
    where
        F: Fn(&EnrichedEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.insert(
            id,
            Arc::new(Listener {
                filter: filter.into(),
                callback: Box::new(listener),
            }),
        );
        Subscription {
            id,
            hub: Arc::downgrade(&self.inner),
        }
    }

    /// A broadcast receiver for all future events. Slow receivers lag and
    /// lose the oldest events.
    pub fn receiver(&self) -> broadcast::Receiver<EnrichedEvent> {
        self.inner.sender.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    pub fn status(&self) -> RunStatus {
        *self.inner.status.lock().expect("hub status lock poisoned")
    }

    pub(crate) fn set_status(&self, status: RunStatus) {
        *self.inner.status.lock().expect("hub status lock poisoned") = status;
    }

    /// Whether both handles share one underlying hub.
    pub fn same_hub(&self, other: &Hub) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for Hub {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            context: self.context.clone(),
        }
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("receiver_count", &self.inner.sender.receiver_count())
            .field("listener_count", &self.inner.listeners.len())
            .field("status", &self.status())
            .field("context", &self.context)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// A live listener registration. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes its listener"]
pub struct Subscription {
    id: u64,
    hub: Weak<HubInner>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remove the listener now.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.hub.upgrade() {
            inner.listeners.remove(&self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use weft_types::event::{FlowEvent, PhaseContext};

    fn collector(hub: &Hub, filter: impl Into<EventFilter>) -> (Arc<Mutex<Vec<EnrichedEvent>>>, Subscription) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let sub = hub.subscribe(filter, move |e: &EnrichedEvent| sink.lock().unwrap().push(e.clone()));
        (seen, sub)
    }

    // -------------------------------------------------------------------
    // Publishing and filtering
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_emit_enriches_and_broadcasts() {
        let hub = Hub::new();
        let mut rx = hub.receiver();
        let first = hub.emit(Event::new("agent:start", json!({ "name": "planner" })));
        let second = hub.emit(Event::new("agent:start", Value::Null));

        assert_ne!(first.id, second.id, "ids are unique");
        let received = rx.recv().await.unwrap();
        assert_eq!(received, first);
        assert_eq!(received.event.payload["name"], "planner");
    }

    #[test]
    fn test_listener_filters() {
        let hub = Hub::new();
        let (agent, _a) = collector(&hub, "agent:*");
        let (all, _b) = collector(&hub, "**");
        let (either, _c) = collector(&hub, ["harness:start", "node:start"]);

        hub.emit(Event::new("agent:start", Value::Null));
        hub.emit(Event::new("harness:start", Value::Null));

        assert_eq!(agent.lock().unwrap().len(), 1);
        assert_eq!(all.lock().unwrap().len(), 2);
        assert_eq!(either.lock().unwrap()[0].name(), "harness:start");
    }

    #[test]
    fn test_flow_events_publish_by_name() {
        let hub = Hub::new();
        let (seen, _sub) = collector(&hub, "flow:*");
        hub.emit(FlowEvent::FlowStart {
            run_id: Uuid::nil(),
            flow_name: "f".to_string(),
        });
        assert_eq!(seen.lock().unwrap()[0].name(), "flow:start");
    }

    #[test]
    fn test_unsubscribe_and_drop() {
        let hub = Hub::new();
        let (seen, sub) = collector(&hub, "*");
        hub.emit(Event::new("a", Value::Null));
        sub.unsubscribe();
        hub.emit(Event::new("b", Value::Null));
        assert_eq!(seen.lock().unwrap().len(), 1);

        {
            let _scoped = collector(&hub, "*");
            assert_eq!(hub.listener_count(), 1);
        }
        assert_eq!(hub.listener_count(), 0);
    }

    #[test]
    fn test_reentrant_listener_may_emit() {
        let hub = Hub::new();
        let (seen, _sub) = collector(&hub, "echo:*");
        let inner = hub.clone();
        let _relay = hub.subscribe("ping", move |_e: &EnrichedEvent| {
            inner.emit(Event::new("echo:pong", Value::Null));
        });
        hub.emit(Event::new("ping", Value::Null));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_first_emit_moves_idle_to_running() {
        let hub = Hub::new();
        assert_eq!(hub.status(), RunStatus::Idle);
        hub.emit(Event::new("x", Value::Null));
        assert_eq!(hub.status(), RunStatus::Running);
    }

    // -------------------------------------------------------------------
    // Context scoping
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_nested_scopes_merge() {
        let hub = Hub::new();
        let (seen, _sub) = collector(&hub, "*");

        hub.scoped(EventContext::phase("Planning"), |phase| async move {
            phase
                .scoped(EventContext::task("plan"), |task| async move {
                    task.emit(Event::new("agent:start", Value::Null));
                })
                .await;
        })
        .await;
        hub.emit(Event::new("after", Value::Null));

        let events = seen.lock().unwrap();
        let inside = &events[0].context;
        assert_eq!(inside.phase.as_ref().map(|p| p.name.as_str()), Some("Planning"));
        assert_eq!(inside.task.as_ref().map(|t| t.id.as_str()), Some("plan"));
        let after = &events[1].context;
        assert!(after.phase.is_none() && after.task.is_none());
    }

    #[tokio::test]
    async fn test_scope_exit_on_error_leaves_parent_clean() {
        let hub = Hub::new();
        let (seen, _sub) = collector(&hub, "*");

        let result: Result<(), &str> = hub
            .scoped(EventContext::phase("Planning"), |phase| async move {
                phase.emit(Event::new("inside", Value::Null));
                Err("boom")
            })
            .await;
        assert!(result.is_err());
        hub.emit(Event::new("after", Value::Null));

        let events = seen.lock().unwrap();
        assert!(events[0].context.phase.is_some());
        assert!(events[1].context.phase.is_none());
    }

    #[test]
    fn test_emit_with_override_wins() {
        let hub = Hub::new().with_context(EventContext::phase("Outer"));
        let enriched = hub.emit_with(
            Event::new("x", Value::Null),
            &EventContext {
                phase: Some(PhaseContext {
                    name: "Inner".to_string(),
                    number: Some(2),
                }),
                ..Default::default()
            },
        );
        assert_eq!(enriched.context.phase.unwrap().name, "Inner");
        assert_eq!(hub.context().phase.as_ref().unwrap().name, "Outer");
    }

    #[test]
    fn test_clone_shares_channel() {
        let hub = Hub::new();
        let child = hub.with_context(EventContext::agent("critic"));
        let mut rx = hub.receiver();
        child.emit(Event::new("x", Value::Null));
        assert!(rx.try_recv().is_ok());
        assert!(hub.same_hub(&child));
    }

    #[test]
    fn test_lagged_receiver_handles_gracefully() {
        let hub = Hub::with_capacity(4);
        let mut rx = hub.receiver();
        for i in 0..10 {
            hub.emit(Event::new("tick", json!(i)));
        }
        match rx.try_recv() {
            Ok(_) => {}
            Err(broadcast::error::TryRecvError::Lagged(_)) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_debug_impl() {
        let hub = Hub::new();
        let _rx = hub.receiver();
        let debug = format!("{hub:?}");
        assert!(debug.contains("Hub"));
        assert!(debug.contains("receiver_count"));
    }
}
