//! Shared domain types for weft.
//!
//! Flow documents, run snapshots, the event and command envelopes, recordings,
//! error codes and engine configuration.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod command;
pub mod config;
pub mod error;
pub mod event;
pub mod flow;
pub mod recording;
pub mod run;
