//! Orchestrator error types

use std::time::Duration;

use thiserror::Error;

use super::state::SessionState;

/// Errors that can occur in the orchestration core
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// Bad parameters, rejected synchronously and never retried
    #[error("Validation error: {0}")]
    Validation(String),

    /// Sleep requested without a duration or any wake events
    #[error("Invalid sleep request: {0}")]
    InvalidSleepRequest(String),

    /// A live session with this id already exists
    #[error("Session already exists: {0}")]
    AlreadyExists(String),

    /// No session with this id
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// The session has been stopped
    #[error("Session stopped: {0}")]
    SessionStopped(String),

    /// Enqueue refused at capacity
    #[error("Queue full for {agent_id} (capacity {capacity})")]
    QueueFull { agent_id: String, capacity: usize },

    /// Synchronous mail would revisit an agent already in the call chain
    #[error("Circular mail to {to}: call chain [{}]", chain.join(" -> "))]
    CircularMail { to: String, chain: Vec<String> },

    /// A bounded wait expired
    #[error("Timed out after {after:?}: {operation}")]
    Timeout { operation: String, after: Duration },

    /// A persisted snapshot failed validation on load
    #[error("Corrupt state for {agent_id}: {reason}")]
    CorruptState { agent_id: String, reason: String },

    /// The execution delegate failed; the session returns to idle
    #[error("Transient execution error: {0}")]
    TransientExecution(String),

    /// Error threshold exceeded; the session was forced to stop
    #[error("Fatal session error for {agent_id}: {reason}")]
    FatalSession { agent_id: String, reason: String },

    /// The state machine refused a transition
    #[error("Invalid state transition for {agent_id}: {from} -> {to}")]
    InvalidTransition {
        agent_id: String,
        from: SessionState,
        to: SessionState,
    },

    /// Channel closed unexpectedly
    #[error("Channel closed")]
    ChannelClosed,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}

impl OrchestratorError {
    /// Create a generic error from a string
    pub fn other(msg: impl Into<String>) -> Self {
        OrchestratorError::Other(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        OrchestratorError::Validation(msg.into())
    }

    /// Create a corrupt state error
    pub fn corrupt(agent_id: impl Into<String>, reason: impl Into<String>) -> Self {
        OrchestratorError::CorruptState {
            agent_id: agent_id.into(),
            reason: reason.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        OrchestratorError::Timeout {
            operation: operation.into(),
            after,
        }
    }

    /// Stable name used when the error is published as an event
    pub fn kind(&self) -> &'static str {
        match self {
            OrchestratorError::Validation(_) => "validation",
            OrchestratorError::InvalidSleepRequest(_) => "invalid_sleep_request",
            OrchestratorError::AlreadyExists(_) => "already_exists",
            OrchestratorError::SessionNotFound(_) => "session_not_found",
            OrchestratorError::SessionStopped(_) => "session_stopped",
            OrchestratorError::QueueFull { .. } => "queue_full",
            OrchestratorError::CircularMail { .. } => "circular_mail",
            OrchestratorError::Timeout { .. } => "timeout",
            OrchestratorError::CorruptState { .. } => "corrupt_state",
            OrchestratorError::TransientExecution(_) => "transient_execution",
            OrchestratorError::FatalSession { .. } => "fatal_session",
            OrchestratorError::InvalidTransition { .. } => "invalid_transition",
            OrchestratorError::ChannelClosed => "channel_closed",
            OrchestratorError::Io(_) => "io",
            OrchestratorError::Serialization(_) => "serialization",
            OrchestratorError::Other(_) => "other",
        }
    }

    /// Whether the caller may reasonably retry the same operation later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::QueueFull { .. }
                | OrchestratorError::Timeout { .. }
                | OrchestratorError::TransientExecution(_)
        )
    }
}

/// Result type alias for orchestrator operations
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = OrchestratorError::SessionNotFound("debbie".into());
        assert_eq!(err.to_string(), "Session not found: debbie");

        let err = OrchestratorError::CircularMail {
            to: "alice".into(),
            chain: vec!["alice".into(), "bob".into()],
        };
        assert_eq!(
            err.to_string(),
            "Circular mail to alice: call chain [alice -> bob]"
        );

        let err = OrchestratorError::InvalidTransition {
            agent_id: "x".into(),
            from: SessionState::Sleeping,
            to: SessionState::Active,
        };
        assert_eq!(
            err.to_string(),
            "Invalid state transition for x: SLEEPING -> ACTIVE"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: OrchestratorError = io_err.into();
        assert!(matches!(err, OrchestratorError::Io(_)));
        assert_eq!(err.kind(), "io");
    }

    #[test]
    fn test_retryable() {
        let full = OrchestratorError::QueueFull {
            agent_id: "a".into(),
            capacity: 1,
        };
        assert!(full.is_retryable());
        assert!(!OrchestratorError::validation("bad").is_retryable());
        assert!(!OrchestratorError::corrupt("a", "bad version").is_retryable());
    }
}
