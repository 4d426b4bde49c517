//! Captured traces of non-deterministic calls, used for deterministic replay.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// How the recorder treats wrapped calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingMode {
    /// Call through, capture nothing.
    #[default]
    Live,
    /// Call through and persist the captured trace.
    Record,
    /// Never call; serve the stored trace.
    Replay,
}

/// A persisted capture of one live call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recording {
    pub id: Uuid,
    /// Caller-chosen key; several sessions may share one scenario id.
    pub scenario_id: String,
    pub metadata: RecordingMetadata,
    pub input: Value,
    /// Resolved options the call was made with.
    #[serde(default)]
    pub options: Value,
    /// Intermediate events, `seq` strictly increasing.
    pub events: Vec<RecordedEvent>,
    pub outcome: RecordedOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingMetadata {
    pub provider_type: String,
    pub created_at: DateTime<Utc>,
    /// SHA-256 hex of the canonical `{input, options}` document.
    pub input_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedEvent {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub event: Value,
}

/// Terminal result of the recorded call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordedOutcome {
    Output { output: Value },
    Error { message: String },
}

impl Recording {
    /// Whether `seq` is strictly increasing across captured events.
    pub fn is_well_ordered(&self) -> bool {
        self.events.windows(2).all(|w| w[0].seq < w[1].seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample(seqs: &[u64]) -> Recording {
        Recording {
            id: Uuid::now_v7(),
            scenario_id: "planner".to_string(),
            metadata: RecordingMetadata {
                provider_type: "echo".to_string(),
                created_at: Utc::now(),
                input_hash: "abc".to_string(),
            },
            input: json!({ "prompt": "hi" }),
            options: json!({}),
            events: seqs
                .iter()
                .map(|seq| RecordedEvent {
                    seq: *seq,
                    timestamp: Utc::now(),
                    event: json!({ "type": "text", "value": seq }),
                })
                .collect(),
            outcome: RecordedOutcome::Output {
                output: json!({ "text": "done" }),
            },
        }
    }

    #[test]
    fn test_sequence_ordering_check() {
        assert!(sample(&[1, 2, 5]).is_well_ordered());
        assert!(!sample(&[1, 1]).is_well_ordered());
        assert!(sample(&[]).is_well_ordered());
    }

    #[test]
    fn test_outcome_wire_shape() {
        let wire = serde_json::to_value(&sample(&[1])).unwrap();
        assert_eq!(wire["outcome"]["kind"], "output");
        assert_eq!(wire["metadata"]["providerType"], "echo");
        let err = RecordedOutcome::Error {
            message: "rate limited".to_string(),
        };
        assert_eq!(serde_json::to_value(&err).unwrap()["kind"], "error");
    }
}
