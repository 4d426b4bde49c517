//! Span attribute names for flow instrumentation.
//!
//! Dotted names in the `weft.*` namespace, usable with `Span::record` on
//! spans that declare them. `event_span` builds such a span for one hub
//! event.

use tracing::field::{display, Empty};
use tracing::Span;
use weft_types::event::EnrichedEvent;

/// Run id (UUIDv7).
pub const RUN_ID: &str = "weft.run.id";

pub const FLOW_NAME: &str = "weft.flow.name";

pub const NODE_ID: &str = "weft.node.id";

/// Registered node type id, e.g. `echo`.
pub const NODE_TYPE: &str = "weft.node.type";

/// Iteration session id inside a `forEach`.
pub const SESSION_ID: &str = "weft.session.id";

pub const EDGE_ID: &str = "weft.edge.id";

/// 1-based attempt number on `node:retry`.
pub const ATTEMPT: &str = "weft.attempt";

/// A `weft.event` span carrying whichever attributes `event` provides.
pub fn event_span(event: &EnrichedEvent) -> Span {
    let span = tracing::debug_span!(
        "weft.event",
        name = event.name(),
        "weft.run.id" = Empty,
        "weft.flow.name" = Empty,
        "weft.node.id" = Empty,
        "weft.node.type" = Empty,
        "weft.session.id" = Empty,
        "weft.edge.id" = Empty,
        "weft.attempt" = Empty,
    );

    let ctx = &event.context;
    if let Some(run_id) = ctx.run_id {
        span.record(RUN_ID, display(run_id));
    }
    if let Some(node_id) = &ctx.node_id {
        span.record(NODE_ID, node_id.as_str());
    }
    if let Some(session_id) = ctx.session_id {
        span.record(SESSION_ID, display(session_id));
    }

    let payload = &event.event;
    if let Some(flow) = payload.get("flowName").and_then(|v| v.as_str()) {
        span.record(FLOW_NAME, flow);
    }
    if let Some(node_type) = payload.get("nodeType").and_then(|v| v.as_str()) {
        span.record(NODE_TYPE, node_type);
    }
    if let Some(edge_id) = payload.get("edgeId").and_then(|v| v.as_str()) {
        span.record(EDGE_ID, edge_id);
    }
    if let Some(attempt) = payload.get("attempt").and_then(|v| v.as_u64()) {
        span.record(ATTEMPT, attempt);
    }
    span
}
