//! Mirrors hub events into `tracing`.

use weft_core::hub::{Hub, Subscription};
use weft_types::event::EnrichedEvent;

use crate::flow_attrs::event_span;

/// Target used for mirrored events, for `RUST_LOG` filtering.
pub const EVENT_TARGET: &str = "weft::events";

/// Re-emit every hub event as a `tracing` event inside a `weft.event` span.
///
/// Failures (`*:failed`) log at `warn`, everything else at `debug`. The
/// mirror stays installed until the returned subscription is dropped.
pub fn mirror_events(hub: &Hub) -> Subscription {
    hub.subscribe("**", log_event)
}

fn log_event(event: &EnrichedEvent) {
    let _entered = event_span(event).entered();
    let name = event.name();
    let payload = serde_json::Value::Object(event.event.payload.clone());
    if name.ends_with(":failed") {
        tracing::warn!(target: EVENT_TARGET, event = name, id = %event.id, payload = %payload, "flow event");
    } else {
        tracing::debug!(target: EVENT_TARGET, event = name, id = %event.id, payload = %payload, "flow event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;
    use std::sync::{Arc, Mutex};
    use uuid::Uuid;
    use weft_types::error::{ErrorCode, NodeError};
    use weft_types::event::{Event, FlowEvent};

    #[derive(Clone, Default)]
    struct Buffer(Arc<Mutex<Vec<u8>>>);

    impl Write for Buffer {
        fn write(&mut self, bytes: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(bytes);
            Ok(bytes.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Buffer {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    fn capture(f: impl FnOnce()) -> String {
        let buffer = Buffer::default();
        let writer = buffer.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .finish();
        tracing::subscriber::with_default(subscriber, f);
        buffer.text()
    }

    #[test]
    fn mirrors_custom_and_lifecycle_events() {
        let run_id = Uuid::now_v7();
        let out = capture(|| {
            let hub = Hub::new();
            let _mirror = mirror_events(&hub);
            hub.emit(Event::new("agent:text", json!({ "delta": "hi" })));
            hub.emit(FlowEvent::NodeFailed {
                run_id,
                node_id: "fetch".to_string(),
                error: NodeError::new(ErrorCode::ExecutionFailed, "boom"),
            });
        });

        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2, "{out}");
        assert!(lines[0].contains("DEBUG") && lines[0].contains("agent:text"), "{out}");
        assert!(lines[1].contains("WARN") && lines[1].contains("node:failed"), "{out}");
        assert!(lines[1].contains("boom"), "{out}");
    }

    #[test]
    fn dropping_subscription_stops_mirroring() {
        let out = capture(|| {
            let hub = Hub::new();
            drop(mirror_events(&hub));
            hub.emit(Event::new("agent:text", json!({})));
        });
        assert!(out.is_empty(), "{out}");
    }
}
