//! Single-node execution: validation, retries and timeouts.
//!
//! `run_node` never returns an error. Every outcome, including validation
//! failures and panics, is folded into a `NodeExecutionResult`.
//!
//! # Attempt lifecycle
//!
//! 1. Resolve the handler (`NODE_NOT_FOUND`).
//! 2. Validate input against the input schema (`INPUT_VALIDATION_ERROR`, never retried).
//! 3. Run the attempt on its own task, raced against the node timeout.
//! 4. On runtime failure: emit `node:retry`, wait the backoff, try again.
//! 5. Validate the output (`OUTPUT_VALIDATION_ERROR`, never retried).
//!
//! A timed-out attempt is cancelled through its token and detached; the
//! engine does not abort the task.

use std::any::Any;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use weft_types::error::{ErrorCode, NodeError};
use weft_types::event::FlowEvent;
use weft_types::flow::{NodeDefinition, RetryPolicy};
use weft_types::run::NodeExecutionResult;

use crate::node::schema::describe;
use crate::node::{BoxNodeHandler, NodeContext, NodeRegistry};

/// Why one attempt did not produce an output.
#[derive(Debug)]
enum AttemptFailure {
    Failed(anyhow::Error),
    TimedOut(Duration),
    Panicked(String),
    Cancelled,
}

impl AttemptFailure {
    fn summary(&self) -> String {
        match self {
            AttemptFailure::Failed(e) => format!("{e:#}"),
            AttemptFailure::TimedOut(limit) => format!("timed out after {}ms", limit.as_millis()),
            AttemptFailure::Panicked(message) => format!("panicked: {message}"),
            AttemptFailure::Cancelled => "cancelled".to_string(),
        }
    }
}

/// Execute one node to completion under its policy.
///
/// `default_retry` applies when the node declares no retry policy.
pub async fn run_node(
    registry: &NodeRegistry,
    node: &NodeDefinition,
    ctx: NodeContext,
    input: Value,
    default_retry: &RetryPolicy,
) -> NodeExecutionResult {
    let started = Instant::now();
    let run_id = ctx.run_id;

    let finish = |output: Option<Value>, error: Option<NodeError>, attempts: u32| {
        NodeExecutionResult {
            node_id: node.id.clone(),
            run_id,
            output,
            error: error.map(|e| e.with_node(node.id.clone()).with_run(run_id)),
            attempts,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    };

    let Some(handler) = registry.get(&node.node_type) else {
        let error = NodeError::new(
            ErrorCode::NodeNotFound,
            format!("node type '{}' is not registered", node.node_type),
        );
        return finish(None, Some(error), 0);
    };

    if let Err(violations) = handler.input_schema().validate(&input) {
        tracing::debug!(node_id = node.id.as_str(), "input rejected by schema");
        let error = NodeError::new(
            ErrorCode::InputValidationError,
            format!("invalid input for '{}': {}", node.node_type, describe(&violations)),
        );
        return finish(None, Some(error), 0);
    }

    let policy = node.policy.clone().unwrap_or_default();
    let retry = policy.retry.clone().unwrap_or_else(|| default_retry.clone());
    let max_attempts = retry.max_attempts.max(1);
    let timeout = policy.timeout();

    let mut attempt = 0;
    loop {
        attempt += 1;
        if ctx.is_cancelled() {
            let error = NodeError::new(ErrorCode::Cancelled, "run cancelled before attempt");
            return finish(None, Some(error), attempt - 1);
        }

        let failure = match run_attempt(handler, &ctx, attempt, input.clone(), timeout).await {
            Ok(output) => {
                return match handler.output_schema().validate(&output) {
                    Ok(()) => finish(Some(output), None, attempt),
                    Err(violations) => {
                        let error = NodeError::new(
                            ErrorCode::OutputValidationError,
                            format!(
                                "invalid output from '{}': {}",
                                node.node_type,
                                describe(&violations)
                            ),
                        );
                        finish(None, Some(error), attempt)
                    }
                };
            }
            Err(failure) => failure,
        };

        if matches!(failure, AttemptFailure::Cancelled) {
            let error = NodeError::new(ErrorCode::Cancelled, "run cancelled during attempt");
            return finish(None, Some(error), attempt);
        }

        let summary = failure.summary();
        if attempt >= max_attempts {
            let code = match failure {
                AttemptFailure::TimedOut(_) => ErrorCode::ExecutionTimeout,
                _ => ErrorCode::ExecutionFailed,
            };
            tracing::debug!(
                node_id = node.id.as_str(),
                attempt,
                error = summary.as_str(),
                "node attempts exhausted"
            );
            let error = NodeError::new(
                code,
                format!("node '{}' failed after {attempt} attempt(s): {summary}", node.id),
            )
            .with_cause(summary);
            return finish(None, Some(error), attempt);
        }

        let backoff = retry.backoff();
        tracing::debug!(
            node_id = node.id.as_str(),
            attempt,
            backoff_ms = backoff.as_millis() as u64,
            error = summary.as_str(),
            "retrying node"
        );
        ctx.hub().emit(FlowEvent::NodeRetry {
            run_id,
            node_id: node.id.clone(),
            attempt,
            error: summary,
            backoff_ms: backoff.as_millis() as u64,
        });

        if !backoff.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = ctx.cancel.cancelled() => {}
            }
        }
    }
}

/// One invocation on its own task, raced against `timeout`.
async fn run_attempt(
    handler: &BoxNodeHandler,
    ctx: &NodeContext,
    attempt: u32,
    input: Value,
    timeout: Option<Duration>,
) -> Result<Value, AttemptFailure> {
    let token: CancellationToken = ctx.cancel.child_token();
    let attempt_ctx = ctx.clone().with_attempt(attempt).with_cancel(token.clone());
    let mut task = tokio::spawn(handler.run(attempt_ctx, input));

    let joined = match timeout {
        Some(limit) => match tokio::time::timeout(limit, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                // Detach: the task keeps running unless it observes the token.
                token.cancel();
                return Err(AttemptFailure::TimedOut(limit));
            }
        },
        None => task.await,
    };

    match joined {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) if ctx.is_cancelled() => {
            tracing::debug!(error = %e, "attempt failed after cancellation");
            Err(AttemptFailure::Cancelled)
        }
        Ok(Err(e)) => Err(AttemptFailure::Failed(e)),
        Err(join_error) if join_error.is_panic() => {
            Err(AttemptFailure::Panicked(panic_message(join_error.into_panic())))
        }
        Err(_) => Err(AttemptFailure::Cancelled),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
