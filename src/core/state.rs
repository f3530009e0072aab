//! Session state machine

use serde::{Deserialize, Serialize};

/// Lifecycle state of an agent session
///
/// ```text
/// IDLE -> ACTIVE      task dequeued
/// ACTIVE -> IDLE      task finished
/// ACTIVE -> WAITING   synchronous mail issued
/// WAITING -> ACTIVE   reply received or timed out
/// IDLE -> SLEEPING    sleep requested
/// SLEEPING -> IDLE    duration elapsed, wake event, or HIGH priority mail
/// * -> STOPPED        explicit stop or fatal error (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    /// Waiting for work
    Idle,

    /// Executing a task
    Active,

    /// Suspended until a timer or wake event fires
    Sleeping,

    /// Blocked on a synchronous mail reply
    Waiting,

    /// Terminal
    Stopped,
}

impl SessionState {
    /// Check if the state is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Stopped)
    }

    /// Check if the session is in the middle of a task
    pub fn is_busy(&self) -> bool {
        matches!(self, SessionState::Active | SessionState::Waiting)
    }

    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Stopped, _) => false,
            (_, Stopped) => true,
            (Idle, Active) | (Active, Idle) => true,
            (Active, Waiting) | (Waiting, Active) => true,
            (Idle, Sleeping) | (Sleeping, Idle) => true,
            _ => false,
        }
    }

    /// Upper-case name as used on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "IDLE",
            SessionState::Active => "ACTIVE",
            SessionState::Sleeping => "SLEEPING",
            SessionState::Waiting => "WAITING",
            SessionState::Stopped => "STOPPED",
        }
    }
}

impl Default for SessionState {
    fn default() -> Self {
        SessionState::Idle
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allowed_transitions() {
        use SessionState::*;
        assert!(Idle.can_transition_to(Active));
        assert!(Active.can_transition_to(Idle));
        assert!(Active.can_transition_to(Waiting));
        assert!(Waiting.can_transition_to(Active));
        assert!(Idle.can_transition_to(Sleeping));
        assert!(Sleeping.can_transition_to(Idle));
        for state in [Idle, Active, Sleeping, Waiting] {
            assert!(state.can_transition_to(Stopped));
        }
    }

    #[test]
    fn test_refused_transitions() {
        use SessionState::*;
        assert!(!Sleeping.can_transition_to(Active));
        assert!(!Active.can_transition_to(Sleeping));
        assert!(!Waiting.can_transition_to(Idle));
        assert!(!Idle.can_transition_to(Waiting));
        assert!(!Stopped.can_transition_to(Idle));
        assert!(!Stopped.can_transition_to(Stopped));
    }

    #[test]
    fn test_state_serde_names() {
        let json = serde_json::to_string(&SessionState::Sleeping).unwrap();
        assert_eq!(json, "\"SLEEPING\"");
        let state: SessionState = serde_json::from_str("\"WAITING\"").unwrap();
        assert_eq!(state, SessionState::Waiting);
        assert_eq!(SessionState::Stopped.to_string(), "STOPPED");
        assert!(SessionState::Stopped.is_terminal());
        assert!(SessionState::Waiting.is_busy());
    }
}
