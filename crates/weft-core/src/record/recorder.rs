//! Record/replay of non-deterministic calls.
//!
//! A wrapped call is an async closure `(CallEvents) -> anyhow::Result<Value>`.
//! The closure reports intermediate events through `CallEvents`; the caller
//! observes them through an `EventCallback`.
//!
//! - `Live`: call through, capture nothing.
//! - `Record`: call through, capture every event with a sequence number and
//!   timestamp, persist the bundle under the scenario id.
//! - `Replay`: never call; find the stored session whose input hash matches,
//!   feed its events to the callback in order, return its outcome.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;
use weft_types::error::ErrorCode;
use weft_types::recording::{RecordedEvent, RecordedOutcome, Recording, RecordingMetadata, RecordingMode};

use super::store::RecordingStore;

/// Receives events as the call produces them (or as replay re-feeds them).
pub type EventCallback = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Debug, Error)]
pub enum RecorderError {
    /// No stored session matches the scenario and input.
    #[error("Recording not found: scenario '{scenario_id}'")]
    NotFound { scenario_id: String },

    #[error("Recording not found: no recording {id} in scenario '{scenario_id}'")]
    UnknownRecording { scenario_id: String, id: Uuid },

    /// The live call failed, or the replayed session recorded a failure.
    #[error("call failed: {0}")]
    CallFailed(String),

    #[error("recording store error: {0}")]
    Store(String),

    #[error("corrupt recording at line {line}: {message}")]
    Corrupt { line: usize, message: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RecorderError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RecorderError::Corrupt { .. } | RecorderError::Serialization(_) => {
                ErrorCode::SchemaValidationError
            }
            _ => ErrorCode::ExecutionFailed,
        }
    }
}

// ---------------------------------------------------------------------------
// Call description
// ---------------------------------------------------------------------------

/// What is being called: the scenario key, the provider and the request.
#[derive(Debug, Clone)]
pub struct CallRequest {
    pub scenario_id: String,
    pub provider_type: String,
    pub input: Value,
    pub options: Value,
}

impl CallRequest {
    pub fn new(scenario_id: impl Into<String>, provider_type: impl Into<String>, input: Value) -> Self {
        Self {
            scenario_id: scenario_id.into(),
            provider_type: provider_type.into(),
            input,
            options: json!({}),
        }
    }

    pub fn with_options(mut self, options: Value) -> Self {
        self.options = options;
        self
    }

    /// SHA-256 hex of the canonical `{input, options}` document.
    pub fn input_hash(&self) -> String {
        input_hash(&self.input, &self.options)
    }
}

/// `serde_json` maps are key-sorted, so the compact encoding is canonical.
pub fn input_hash(input: &Value, options: &Value) -> String {
    let canonical = json!({ "input": input, "options": options }).to_string();
    format!("{:x}", Sha256::digest(canonical.as_bytes()))
}

/// Event channel handed to a wrapped call.
#[derive(Clone)]
pub struct CallEvents {
    callback: Option<EventCallback>,
    captured: Option<Arc<Mutex<Vec<RecordedEvent>>>>,
    seq: Arc<AtomicU64>,
}

impl CallEvents {
    fn new(callback: Option<EventCallback>, capture: bool) -> Self {
        Self {
            callback,
            captured: capture.then(|| Arc::new(Mutex::new(Vec::new()))),
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Deliver `event` to the callback and capture it.
    pub fn emit(&self, event: Value) {
        if let Some(callback) = &self.callback {
            callback(&event);
        }
        self.record(event);
    }

    /// Capture `event` without delivering it; for events the caller has
    /// already seen by other means.
    pub fn record(&self, event: Value) {
        if let Some(captured) = &self.captured {
            let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
            captured
                .lock()
                .expect("capture lock poisoned")
                .push(RecordedEvent {
                    seq,
                    timestamp: Utc::now(),
                    event,
                });
        }
    }

    fn take(&self) -> Vec<RecordedEvent> {
        match &self.captured {
            Some(captured) => std::mem::take(&mut *captured.lock().expect("capture lock poisoned")),
            None => Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Recorder
// ---------------------------------------------------------------------------

/// Wraps calls according to a fixed [`RecordingMode`].
pub struct Recorder<S: RecordingStore> {
    store: Arc<S>,
    mode: RecordingMode,
}

impl<S: RecordingStore> Recorder<S> {
    pub fn new(store: Arc<S>, mode: RecordingMode) -> Self {
        Self { store, mode }
    }

    pub fn mode(&self) -> RecordingMode {
        self.mode
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Run (or replay) one call.
    ///
    /// In replay mode `live` is never invoked. A stored session matches when
    /// its input hash equals `request.input_hash()`; the newest match wins.
    pub async fn call<F, Fut>(
        &self,
        request: CallRequest,
        callback: Option<EventCallback>,
        live: F,
    ) -> Result<Value, RecorderError>
    where
        F: FnOnce(CallEvents) -> Fut,
        Fut: Future<Output = anyhow::Result<Value>>,
    {
        match self.mode {
            RecordingMode::Live => {
                let events = CallEvents::new(callback, false);
                live(events)
                    .await
                    .map_err(|e| RecorderError::CallFailed(format!("{e:#}")))
            }
            RecordingMode::Record => self.record(request, callback, live).await,
            RecordingMode::Replay => {
                let hash = request.input_hash();
                let recording = self
                    .store
                    .load(&request.scenario_id)
                    .await?
                    .into_iter()
                    .rev()
                    .find(|r| r.metadata.input_hash == hash)
                    .ok_or_else(|| {
                        tracing::warn!(
                            scenario_id = request.scenario_id.as_str(),
                            input_hash = hash.as_str(),
                            "no recording matches input"
                        );
                        RecorderError::NotFound {
                            scenario_id: request.scenario_id.clone(),
                        }
                    })?;
                replay(&recording, callback.as_ref())
            }
        }
    }

    /// Replay one stored session chosen by id, regardless of its input.
    pub async fn replay_by_id(
        &self,
        scenario_id: &str,
        id: Uuid,
        callback: Option<EventCallback>,
    ) -> Result<Value, RecorderError> {
        let recording = self
            .store
            .load(scenario_id)
            .await?
            .into_iter()
            .find(|r| r.id == id)
            .ok_or_else(|| RecorderError::UnknownRecording {
                scenario_id: scenario_id.to_string(),
                id,
            })?;
        replay(&recording, callback.as_ref())
    }

    async fn record<F, Fut>(
        &self,
        request: CallRequest,
        callback: Option<EventCallback>,
        live: F,
    ) -> Result<Value, RecorderError>
    where
        F: FnOnce(CallEvents) -> Fut,
        Fut: Future<Output = anyhow::Result<Value>>,
    {
        let events = CallEvents::new(callback, true);
        let result = live(events.clone()).await;

        let outcome = match &result {
            Ok(output) => RecordedOutcome::Output {
                output: output.clone(),
            },
            Err(e) => RecordedOutcome::Error {
                message: format!("{e:#}"),
            },
        };
        let recording = Recording {
            id: Uuid::now_v7(),
            metadata: RecordingMetadata {
                provider_type: request.provider_type.clone(),
                created_at: Utc::now(),
                input_hash: request.input_hash(),
            },
            scenario_id: request.scenario_id,
            input: request.input,
            options: request.options,
            events: events.take(),
            outcome,
        };
        tracing::debug!(
            scenario_id = recording.scenario_id.as_str(),
            events = recording.events.len(),
            "call recorded"
        );
        self.store.save(recording).await?;

        result.map_err(|e| RecorderError::CallFailed(format!("{e:#}")))
    }
}

/// Feed a recording's events to `callback` in `seq` order, then return its
/// outcome.
fn replay(recording: &Recording, callback: Option<&EventCallback>) -> Result<Value, RecorderError> {
    tracing::debug!(
        scenario_id = recording.scenario_id.as_str(),
        recording_id = %recording.id,
        events = recording.events.len(),
        "replaying recording"
    );
    if let Some(callback) = callback {
        let mut events: Vec<&RecordedEvent> = recording.events.iter().collect();
        events.sort_by_key(|e| e.seq);
        for recorded in events {
            callback(&recorded.event);
        }
    }
    match &recording.outcome {
        RecordedOutcome::Output { output } => Ok(output.clone()),
        RecordedOutcome::Error { message } => Err(RecorderError::CallFailed(message.clone())),
    }
}
