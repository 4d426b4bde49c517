//! Observability for weft: tracing subscriber setup, flow span attribute
//! names, and mirroring of hub events into `tracing`.

pub mod event_log;
pub mod flow_attrs;
pub mod tracing_setup;
