//! Execution delegate - the capability that actually performs a task
//!
//! The orchestrator never interprets task payloads. It hands each dequeued
//! task to an `ExecutionDelegate` (typically an LLM/tool layer) and acts on
//! the typed outcome.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::scheduler::SleepRequest;
use crate::session::TaskContext;

/// What the delegate reports back for one task
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    /// Task finished; `output` answers a synchronous caller if there is one
    Complete { output: Value },

    /// Work remains; a continuation task carrying `payload` is queued ahead
    /// of same-priority siblings
    NeedsContinuation { reason: String, payload: Value },

    /// Task finished and the agent goes to sleep
    Sleep { output: Value, request: SleepRequest },
}

impl ExecutionOutcome {
    pub fn complete(output: impl Into<Value>) -> Self {
        ExecutionOutcome::Complete {
            output: output.into(),
        }
    }

    pub fn continuation(reason: impl Into<String>, payload: impl Into<Value>) -> Self {
        ExecutionOutcome::NeedsContinuation {
            reason: reason.into(),
            payload: payload.into(),
        }
    }

    pub fn sleep(output: impl Into<Value>, request: SleepRequest) -> Self {
        ExecutionOutcome::Sleep {
            output: output.into(),
            request,
        }
    }
}

/// Trait for whatever executes an agent's tasks
///
/// Called from the owning session's worker; at most one call per session is
/// in flight at a time. Errors and panics count toward the session's error
/// threshold.
#[async_trait]
pub trait ExecutionDelegate: Send + Sync {
    async fn execute(&self, ctx: TaskContext) -> Result<ExecutionOutcome>;
}

/// Delegate that completes every task with its own payload
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoDelegate;

#[async_trait]
impl ExecutionDelegate for EchoDelegate {
    async fn execute(&self, ctx: TaskContext) -> Result<ExecutionOutcome> {
        Ok(ExecutionOutcome::complete(ctx.task.payload))
    }
}
