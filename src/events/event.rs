//! Events published on the bus

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{OrchestratorError, Priority, SessionState, TaskKind};

/// Structured notification about a state change in the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    SessionCreated {
        agent_id: String,
    },

    SessionRestored {
        agent_id: String,
        state: SessionState,
        pending_tasks: usize,
    },

    StateChanged {
        agent_id: String,
        from: SessionState,
        to: SessionState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    TaskEnqueued {
        agent_id: String,
        task_id: String,
        priority: Priority,
        kind: TaskKind,
    },

    TaskCompleted {
        agent_id: String,
        task_id: String,
        /// A continuation was queued behind this task
        continued: bool,
    },

    TaskFailed {
        agent_id: String,
        task_id: String,
        error: String,
        error_count: u32,
    },

    MailSent {
        message_id: String,
        from_agent: String,
        to_agent: String,
        priority: Priority,
        synchronous: bool,
    },

    /// A reply arrived after its sender stopped waiting
    MailReplyDiscarded {
        message_id: String,
        from_agent: String,
    },

    WakeEventBroadcast {
        name: String,
        payload: Value,
    },

    SessionWoke {
        agent_id: String,
        reason: String,
    },

    SessionFatal {
        agent_id: String,
        reason: String,
    },

    SessionStopped {
        agent_id: String,
    },

    CheckpointSaved {
        agent_id: String,
    },

    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_id: Option<String>,
        kind: String,
        message: String,
    },
}

impl OrchestratorEvent {
    /// Build an error event from an orchestrator error
    pub fn error(agent_id: Option<&str>, err: &OrchestratorError) -> Self {
        OrchestratorEvent::Error {
            agent_id: agent_id.map(str::to_string),
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }

    /// Dotted event name handed to notification sinks
    pub fn name(&self) -> &'static str {
        match self {
            OrchestratorEvent::SessionCreated { .. } => "session.created",
            OrchestratorEvent::SessionRestored { .. } => "session.restored",
            OrchestratorEvent::StateChanged { .. } => "session.state_changed",
            OrchestratorEvent::TaskEnqueued { .. } => "task.enqueued",
            OrchestratorEvent::TaskCompleted { .. } => "task.completed",
            OrchestratorEvent::TaskFailed { .. } => "task.failed",
            OrchestratorEvent::MailSent { .. } => "mail.sent",
            OrchestratorEvent::MailReplyDiscarded { .. } => "mail.reply_discarded",
            OrchestratorEvent::WakeEventBroadcast { .. } => "wake.broadcast",
            OrchestratorEvent::SessionWoke { .. } => "session.woke",
            OrchestratorEvent::SessionFatal { .. } => "session.fatal",
            OrchestratorEvent::SessionStopped { .. } => "session.stopped",
            OrchestratorEvent::CheckpointSaved { .. } => "session.checkpoint",
            OrchestratorEvent::Error { .. } => "error",
        }
    }

    /// Agent the event is about, if any
    pub fn agent_id(&self) -> Option<&str> {
        match self {
            OrchestratorEvent::SessionCreated { agent_id }
            | OrchestratorEvent::SessionRestored { agent_id, .. }
            | OrchestratorEvent::StateChanged { agent_id, .. }
            | OrchestratorEvent::TaskEnqueued { agent_id, .. }
            | OrchestratorEvent::TaskCompleted { agent_id, .. }
            | OrchestratorEvent::TaskFailed { agent_id, .. }
            | OrchestratorEvent::SessionWoke { agent_id, .. }
            | OrchestratorEvent::SessionFatal { agent_id, .. }
            | OrchestratorEvent::SessionStopped { agent_id }
            | OrchestratorEvent::CheckpointSaved { agent_id } => Some(agent_id),
            OrchestratorEvent::MailSent { to_agent, .. } => Some(to_agent),
            OrchestratorEvent::MailReplyDiscarded { from_agent, .. } => Some(from_agent),
            OrchestratorEvent::Error { agent_id, .. } => agent_id.as_deref(),
            OrchestratorEvent::WakeEventBroadcast { .. } => None,
        }
    }

    /// JSON payload handed to notification sinks
    pub fn payload(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
