//! Record/replay for non-deterministic calls.
//!
//! - `recorder` -- the `Recorder` and its modes
//! - `store` -- `RecordingStore` trait, in-memory store, JSONL encoding
//! - `node` -- `RecordedNode`, a node wrapper that routes runs through a recorder

pub mod node;
pub mod recorder;
pub mod store;

pub use node::RecordedNode;
pub use recorder::{input_hash, CallEvents, CallRequest, EventCallback, Recorder, RecorderError};
pub use store::{recordings_from_jsonl, recordings_to_jsonl, InMemoryRecordingStore, RecordingStore};
