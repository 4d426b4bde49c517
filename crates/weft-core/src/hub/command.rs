//! Side-channel command routing on the Hub.
//!
//! Messages land in per-target inboxes, replies resolve outstanding prompts
//! through `oneshot` channels, and aborts cancel the registered run tokens.
//! Every command is rejected unless the hub is running or a session is
//! active.

use std::sync::atomic::Ordering;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use weft_types::command::{Command, InboundMessage, InboxTarget};
use weft_types::error::ErrorCode;
use weft_types::run::RunStatus;

use super::bus::Hub;
use super::inbox::Inbox;

/// Errors from command handling.
#[derive(Debug, Error)]
pub enum CommandError {
    /// Status is not `running` and no session is active.
    #[error("hub is not accepting commands (status {0:?})")]
    Inactive(RunStatus),

    /// A prompt with this id is already waiting for a reply.
    #[error("prompt {0} is already outstanding")]
    DuplicatePrompt(String),

    /// No reply arrived in time.
    #[error("prompt {id} timed out after {timeout:?}")]
    PromptTimeout { id: String, timeout: Duration },

    /// The prompt was discarded (e.g. by `reset`) before a reply arrived.
    #[error("prompt {0} was dropped without a reply")]
    PromptDropped(String),

    /// The target inbox has been closed.
    #[error("inbox {0:?} is closed")]
    InboxClosed(InboxTarget),
}

impl CommandError {
    pub fn code(&self) -> ErrorCode {
        match self {
            CommandError::PromptTimeout { .. } => ErrorCode::ExecutionTimeout,
            CommandError::PromptDropped(_) => ErrorCode::Cancelled,
            _ => ErrorCode::ExecutionFailed,
        }
    }
}

impl Hub {
    // -----------------------------------------------------------------------
    // Status
    // -----------------------------------------------------------------------

    /// Whether commands are currently accepted.
    pub fn is_accepting(&self) -> bool {
        self.status() == RunStatus::Running || self.is_session_active()
    }

    fn ensure_accepting(&self) -> Result<(), CommandError> {
        if self.is_accepting() {
            Ok(())
        } else {
            Err(CommandError::Inactive(self.status()))
        }
    }

    /// Mark a session active so commands are accepted before the first
    /// event is emitted. Independent of status.
    pub fn start_session(&self) {
        self.inner.session_active.store(true, Ordering::SeqCst);
        debug!("hub session started");
    }

    pub fn end_session(&self) {
        self.inner.session_active.store(false, Ordering::SeqCst);
        debug!("hub session ended");
    }

    pub fn is_session_active(&self) -> bool {
        self.inner.session_active.load(Ordering::SeqCst)
    }

    /// `running` → `complete`. Other statuses are left alone.
    pub fn complete(&self) {
        let mut status = self.inner.status.lock().expect("hub status lock poisoned");
        if *status == RunStatus::Running {
            *status = RunStatus::Complete;
        }
    }

    /// Back to `idle`: clears the session flag and drops outstanding prompts.
    pub fn reset(&self) {
        self.set_status(RunStatus::Idle);
        self.inner.session_active.store(false, Ordering::SeqCst);
        self.inner.prompts.clear();
    }

    // -----------------------------------------------------------------------
    // Routing
    // -----------------------------------------------------------------------

    /// Route a command envelope.
    ///
    /// Returns `true` when the command took effect: the message was queued,
    /// the prompt existed, or at least one run was cancelled.
    pub fn dispatch(&self, command: Command) -> Result<bool, CommandError> {
        debug!(kind = command.kind(), "dispatching command");
        match command {
            Command::Send { message } => self.send(message).map(|_| true),
            Command::SendTo { agent, message } => self.send_to(agent, message).map(|_| true),
            Command::SendToRun { run_id, message } => {
                self.send_to_run(run_id, message).map(|_| true)
            }
            Command::Reply {
                prompt_id,
                response,
            } => self.reply(&prompt_id, response),
            Command::Abort { reason } => self.abort(reason).map(|cancelled| cancelled > 0),
        }
    }

    /// Message for the active session's inbox.
    pub fn send(&self, message: Value) -> Result<InboundMessage, CommandError> {
        self.deliver(InboxTarget::Session, message)
    }

    /// Message for a named agent's inbox.
    pub fn send_to(&self, agent: impl Into<String>, message: Value) -> Result<InboundMessage, CommandError> {
        self.deliver(InboxTarget::Agent { name: agent.into() }, message)
    }

    /// Message for one run's inbox.
    pub fn send_to_run(&self, run_id: Uuid, message: Value) -> Result<InboundMessage, CommandError> {
        self.deliver(InboxTarget::Run { run_id }, message)
    }

    fn deliver(&self, target: InboxTarget, content: Value) -> Result<InboundMessage, CommandError> {
        self.ensure_accepting()?;
        let message = InboundMessage::new(target.clone(), content);
        if !self.inbox(&target).push(message.clone()) {
            return Err(CommandError::InboxClosed(target));
        }
        debug!(target = ?message.target, id = %message.id, "message queued");
        Ok(message)
    }

    /// The inbox for `target`, created on first use.
    pub fn inbox(&self, target: &InboxTarget) -> Inbox<InboundMessage> {
        self.inner
            .inboxes
            .entry(target.clone())
            .or_default()
            .value()
            .clone()
    }

    /// Queued messages for `target` without creating its inbox.
    pub fn pending_messages(&self, target: &InboxTarget) -> Vec<InboundMessage> {
        self.inner
            .inboxes
            .get(target)
            .map(|inbox| inbox.value().pending())
            .unwrap_or_default()
    }

    // -----------------------------------------------------------------------
    // Prompts
    // -----------------------------------------------------------------------

    /// Register an outstanding prompt and wait for its reply.
    ///
    /// `timeout` defaults to the configured prompt timeout.
    pub async fn prompt(&self, prompt_id: impl Into<String>, timeout: Option<Duration>) -> Result<Value, CommandError> {
        let prompt_id = prompt_id.into();
        let timeout = timeout.unwrap_or(self.inner.prompt_timeout);

        let (tx, rx) = oneshot::channel();
        match self.inner.prompts.entry(prompt_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => return Err(CommandError::DuplicatePrompt(prompt_id)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(tx);
            }
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(CommandError::PromptDropped(prompt_id)),
            Err(_) => {
                self.inner.prompts.remove(&prompt_id);
                Err(CommandError::PromptTimeout {
                    id: prompt_id,
                    timeout,
                })
            }
        }
    }

    /// Resolve an outstanding prompt. `Ok(false)` when no such prompt is
    /// waiting (unknown id, or the caller already timed out).
    pub fn reply(&self, prompt_id: &str, response: Value) -> Result<bool, CommandError> {
        self.ensure_accepting()?;
        match self.inner.prompts.remove(prompt_id) {
            Some((_, tx)) => match tx.send(response) {
                Ok(()) => Ok(true),
                Err(_) => {
                    warn!(prompt_id, "prompt waiter already gone");
                    Ok(false)
                }
            },
            None => {
                debug!(prompt_id, "no outstanding prompt");
                Ok(false)
            }
        }
    }

    pub fn pending_prompts(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.prompts.iter().map(|e| e.key().clone()).collect();
        ids.sort_unstable();
        ids
    }

    // -----------------------------------------------------------------------
    // Runs and cancellation
    // -----------------------------------------------------------------------

    /// Register a run and get its cancellation token. The hub becomes
    /// `running`.
    pub fn register_run(&self, run_id: Uuid) -> CancellationToken {
        let token = CancellationToken::new();
        self.inner.runs.insert(run_id, token.clone());
        self.set_status(RunStatus::Running);
        token
    }

    /// Forget a finished run and close its inbox. When it was the last one
    /// and the hub is still running, the hub becomes `complete`.
    pub fn unregister_run(&self, run_id: &Uuid) {
        self.inner.runs.remove(run_id);
        self.inner.abort_reasons.remove(run_id);
        if let Some((_, inbox)) = self.inner.inboxes.remove(&InboxTarget::Run { run_id: *run_id }) {
            inbox.close();
        }
        if self.inner.runs.is_empty() {
            self.complete();
        }
    }

    /// Why `run_id` was aborted, if it was.
    pub fn abort_reason(&self, run_id: &Uuid) -> Option<String> {
        self.inner.abort_reasons.get(run_id).map(|r| r.value().clone())
    }

    pub fn active_runs(&self) -> usize {
        self.inner.runs.len()
    }

    /// Cooperatively cancel every registered run and move to `aborted`.
    /// Returns how many runs were signalled.
    pub fn abort(&self, reason: Option<String>) -> Result<usize, CommandError> {
        self.ensure_accepting()?;
        let reason_text = reason.clone().unwrap_or_else(|| "abort requested".to_string());
        let mut cancelled = 0;
        for entry in self.inner.runs.iter() {
            if !entry.value().is_cancelled() {
                self.inner
                    .abort_reasons
                    .insert(*entry.key(), reason_text.clone());
                entry.value().cancel();
                cancelled += 1;
            }
        }
        self.set_status(RunStatus::Aborted);
        info!(
            reason = reason.as_deref().unwrap_or("abort requested"),
            cancelled, "hub aborted"
        );
        Ok(cancelled)
    }

    /// Cancel one run. `false` if it is not registered.
    pub fn abort_run(&self, run_id: Uuid, reason: Option<&str>) -> bool {
        match self.inner.runs.get(&run_id) {
            Some(token) => {
                self.inner.abort_reasons.insert(
                    run_id,
                    reason.unwrap_or("abort requested").to_string(),
                );
                token.cancel();
                info!(%run_id, reason = reason.unwrap_or("abort requested"), "run aborted");
                true
            }
            None => false,
        }
    }
}
