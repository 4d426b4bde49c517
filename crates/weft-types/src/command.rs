//! Command envelope for side-channel injection into running flows.
//!
//! Commands travel over the same transport as events and are routed by the
//! Hub: messages land in per-target inboxes, replies resolve outstanding
//! prompts, and `abort` triggers cooperative cancellation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// An inbound command.
///
/// ```json
/// { "type": "sendTo", "agent": "planner", "message": "focus on tests" }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Command {
    /// Message for the active session's inbox.
    Send { message: Value },
    /// Message for a named agent's inbox.
    SendTo { agent: String, message: Value },
    /// Message for a specific run's inbox.
    SendToRun { run_id: Uuid, message: Value },
    /// Answer to an outstanding prompt.
    Reply { prompt_id: String, response: Value },
    /// Cooperatively cancel every active run.
    Abort {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl Command {
    pub fn kind(&self) -> &'static str {
        match self {
            Command::Send { .. } => "send",
            Command::SendTo { .. } => "sendTo",
            Command::SendToRun { .. } => "sendToRun",
            Command::Reply { .. } => "reply",
            Command::Abort { .. } => "abort",
        }
    }
}

/// Which inbox a message is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum InboxTarget {
    Session,
    Agent { name: String },
    Run { run_id: Uuid },
}

/// A message injected into an inbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    pub id: Uuid,
    pub target: InboxTarget,
    pub content: Value,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(target: InboxTarget, content: Value) -> Self {
        Self {
            id: Uuid::now_v7(),
            target,
            content,
            received_at: Utc::now(),
        }
    }
}
