use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Stable, user-visible error classification.
///
/// Every internal error type in the engine maps onto one of these codes so a
/// final `RunSnapshot` can report failures without exposing Rust types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NodeNotFound,
    InputValidationError,
    OutputValidationError,
    SchemaValidationError,
    ExecutionFailed,
    ExecutionTimeout,
    Cancelled,
}

impl ErrorCode {
    /// The wire representation (`"NODE_NOT_FOUND"`, ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NodeNotFound => "NODE_NOT_FOUND",
            ErrorCode::InputValidationError => "INPUT_VALIDATION_ERROR",
            ErrorCode::OutputValidationError => "OUTPUT_VALIDATION_ERROR",
            ErrorCode::SchemaValidationError => "SCHEMA_VALIDATION_ERROR",
            ErrorCode::ExecutionFailed => "EXECUTION_FAILED",
            ErrorCode::ExecutionTimeout => "EXECUTION_TIMEOUT",
            ErrorCode::Cancelled => "CANCELLED",
        }
    }

    /// Validation failures indicate a configuration defect and are never retried.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ErrorCode::InputValidationError
                | ErrorCode::OutputValidationError
                | ErrorCode::SchemaValidationError
                | ErrorCode::NodeNotFound
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A serializable, diagnostic error attached to node results and snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{code}: {message}")]
#[serde(rename_all = "camelCase")]
pub struct NodeError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    /// Formatted chain of the original failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl NodeError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            node_id: None,
            run_id: None,
            cause: None,
        }
    }

    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_run(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }
}
