//! Recording storage.
//!
//! `RecordingStore` is the storage port; `InMemoryRecordingStore` is the
//! in-process implementation. The JSONL helpers give the one-record-per-line
//! encoding used when recordings are written to disk.

use dashmap::DashMap;
use weft_types::recording::Recording;

use super::recorder::RecorderError;

/// Storage interface for recordings, keyed by scenario id.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait RecordingStore: Send + Sync {
    /// Append a recording to its scenario.
    fn save(
        &self,
        recording: Recording,
    ) -> impl std::future::Future<Output = Result<(), RecorderError>> + Send;

    /// Every recording stored for `scenario_id`, oldest first. Empty when the
    /// scenario is unknown.
    fn load(
        &self,
        scenario_id: &str,
    ) -> impl std::future::Future<Output = Result<Vec<Recording>, RecorderError>> + Send;

    /// Known scenario ids, sorted.
    fn list_scenarios(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<String>, RecorderError>> + Send;
}

/// Recordings held in memory for the life of the process.
#[derive(Debug, Default)]
pub struct InMemoryRecordingStore {
    scenarios: DashMap<String, Vec<Recording>>,
}

impl InMemoryRecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a store from previously exported recordings.
    pub fn from_recordings(recordings: impl IntoIterator<Item = Recording>) -> Self {
        let store = Self::new();
        for recording in recordings {
            store
                .scenarios
                .entry(recording.scenario_id.clone())
                .or_default()
                .push(recording);
        }
        store
    }

    /// Every stored recording, grouped by scenario in sorted order.
    pub fn export(&self) -> Vec<Recording> {
        let mut ids: Vec<String> = self.scenarios.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids.iter()
            .filter_map(|id| self.scenarios.get(id).map(|r| r.value().clone()))
            .flatten()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.scenarios.iter().map(|e| e.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RecordingStore for InMemoryRecordingStore {
    async fn save(&self, recording: Recording) -> Result<(), RecorderError> {
        tracing::debug!(
            scenario_id = recording.scenario_id.as_str(),
            recording_id = %recording.id,
            events = recording.events.len(),
            "recording saved"
        );
        self.scenarios
            .entry(recording.scenario_id.clone())
            .or_default()
            .push(recording);
        Ok(())
    }

    async fn load(&self, scenario_id: &str) -> Result<Vec<Recording>, RecorderError> {
        Ok(self
            .scenarios
            .get(scenario_id)
            .map(|r| r.value().clone())
            .unwrap_or_default())
    }

    async fn list_scenarios(&self) -> Result<Vec<String>, RecorderError> {
        let mut ids: Vec<String> = self.scenarios.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        Ok(ids)
    }
}

// ---------------------------------------------------------------------------
// JSONL encoding
// ---------------------------------------------------------------------------

/// One JSON document per line.
pub fn recordings_to_jsonl(recordings: &[Recording]) -> Result<String, RecorderError> {
    let mut out = String::new();
    for recording in recordings {
        out.push_str(&serde_json::to_string(recording)?);
        out.push('\n');
    }
    Ok(out)
}

/// Parse JSONL, ignoring blank lines. Errors name the offending line.
pub fn recordings_from_jsonl(text: &str) -> Result<Vec<Recording>, RecorderError> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line).map_err(|e| RecorderError::Corrupt {
                line: i + 1,
                message: e.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;
    use weft_types::recording::{RecordedOutcome, RecordingMetadata};

    fn recording(scenario: &str, text: &str) -> Recording {
        Recording {
            id: Uuid::now_v7(),
            scenario_id: scenario.to_string(),
            metadata: RecordingMetadata {
                provider_type: "llm".to_string(),
                created_at: Utc::now(),
                input_hash: "h".to_string(),
            },
            input: json!({ "prompt": text }),
            options: json!({}),
            events: Vec::new(),
            outcome: RecordedOutcome::Output {
                output: json!({ "text": text }),
            },
        }
    }

    #[tokio::test]
    async fn test_save_appends_per_scenario() {
        let store = InMemoryRecordingStore::new();
        store.save(recording("b", "one")).await.unwrap();
        store.save(recording("a", "two")).await.unwrap();
        store.save(recording("b", "three")).await.unwrap();

        let b = store.load("b").await.unwrap();
        assert_eq!(b.len(), 2);
        assert_eq!(b[1].input["prompt"], "three");
        assert!(store.load("missing").await.unwrap().is_empty());
        assert_eq!(store.list_scenarios().await.unwrap(), ["a", "b"]);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_jsonl_export_and_reimport() {
        let store = InMemoryRecordingStore::from_recordings([recording("s", "x"), recording("s", "y")]);
        let text = recordings_to_jsonl(&store.export()).unwrap();
        assert_eq!(text.lines().count(), 2);

        let back = recordings_from_jsonl(&format!("\n{text}\n")).unwrap();
        assert_eq!(back, store.export());
    }

    #[test]
    fn test_jsonl_reports_bad_line() {
        let good = recordings_to_jsonl(&[recording("s", "x")]).unwrap();
        let err = recordings_from_jsonl(&format!("{good}{{not json}}\n")).unwrap_err();
        assert!(matches!(err, RecorderError::Corrupt { line: 2, .. }), "{err}");
    }
}
