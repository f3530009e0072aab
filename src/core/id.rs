//! Agent id validation
//!
//! Agent ids key persisted snapshots, so they are restricted to a
//! filesystem-safe alphabet.

use std::sync::LazyLock;

use regex::Regex;

use super::error::{OrchestratorError, OrchestratorResult};

static AGENT_ID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]{0,127}$").expect("agent id pattern is valid")
});

/// Check that an agent id is non-empty, at most 128 chars, and path-safe
pub fn validate_agent_id(agent_id: &str) -> OrchestratorResult<()> {
    if AGENT_ID_PATTERN.is_match(agent_id) {
        Ok(())
    } else {
        Err(OrchestratorError::validation(format!(
            "invalid agent id {agent_id:?}: expected 1-128 chars of [A-Za-z0-9_.-], starting alphanumeric"
        )))
    }
}
