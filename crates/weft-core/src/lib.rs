//! The weft flow engine.
//!
//! Compiles declarative flow graphs and runs them: node execution with
//! retries and timeouts, gated and iterated edges, a context-scoped event
//! hub with mid-run command injection, and record/replay for
//! non-deterministic node calls.
//!
//! Depends only on `weft-types` plus async and parsing crates; it never
//! installs a tracing subscriber (see `weft-observe`).

pub mod config;
pub mod flow;
pub mod hub;
pub mod node;
pub mod record;
