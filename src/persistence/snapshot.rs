//! PersistedSnapshot - durable state of one session
//!
//! Loaded snapshots are validated before use. Anything that fails is
//! reported as `CorruptState` and never resumed from.

use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{OrchestratorError, OrchestratorResult, SessionState, Task, TaskKind};
use crate::session::AgentSession;

/// Current snapshot layout version
pub const SCHEMA_VERSION: u32 = 1;

/// Tolerated clock skew for `last_checkpoint`
const CHECKPOINT_SKEW_MINUTES: i64 = 5;

/// Serialized session state, one record per agent id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedSnapshot {
    pub schema_version: u32,

    pub agent_id: String,

    pub state: SessionState,

    #[serde(default)]
    pub sleep_until: Option<DateTime<Utc>>,

    #[serde(default)]
    pub wake_events: BTreeSet<String>,

    /// Queued tasks in dequeue order
    #[serde(default)]
    pub pending_tasks: Vec<Task>,

    pub last_checkpoint: DateTime<Utc>,

    #[serde(default)]
    pub metadata: HashMap<String, Value>,

    /// Queue capacity of the captured session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_capacity: Option<usize>,
}

impl PersistedSnapshot {
    /// Capture a session without disturbing it
    ///
    /// The running task, if any, is not part of the snapshot.
    pub fn capture(session: &AgentSession) -> Self {
        let (status, pending_tasks) = session.status_with_pending();
        Self {
            schema_version: SCHEMA_VERSION,
            agent_id: session.agent_id().to_string(),
            state: status.state,
            sleep_until: status.sleep_until,
            wake_events: status.wake_events,
            pending_tasks,
            last_checkpoint: Utc::now(),
            metadata: status.metadata,
            queue_capacity: Some(session.queue().capacity()),
        }
    }

    pub fn to_bytes(&self) -> OrchestratorResult<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Parse and validate a stored snapshot
    ///
    /// Every failure, including unparseable bytes, is `CorruptState`.
    pub fn from_bytes(agent_id: &str, bytes: &[u8], max_pending: usize) -> OrchestratorResult<Self> {
        let snapshot: PersistedSnapshot = serde_json::from_slice(bytes)
            .map_err(|e| OrchestratorError::corrupt(agent_id, format!("unreadable snapshot: {e}")))?;
        snapshot.validate(agent_id, max_pending)?;
        Ok(snapshot)
    }

    /// Required-field and range checks
    ///
    /// `max_pending` bounds the queue when the snapshot records no capacity.
    pub fn validate(&self, agent_id: &str, max_pending: usize) -> OrchestratorResult<()> {
        let corrupt = |reason: String| Err(OrchestratorError::corrupt(agent_id, reason));

        if self.schema_version != SCHEMA_VERSION {
            return corrupt(format!(
                "unsupported schema version {} (expected {})",
                self.schema_version, SCHEMA_VERSION
            ));
        }
        if self.agent_id != agent_id {
            return corrupt(format!("snapshot belongs to '{}'", self.agent_id));
        }

        match self.state {
            SessionState::Sleeping => {
                if self.sleep_until.is_none() && self.wake_events.is_empty() {
                    return corrupt("sleeping without deadline or wake events".into());
                }
            }
            _ => {
                if self.sleep_until.is_some() {
                    return corrupt(format!("sleep_until set while {}", self.state));
                }
            }
        }
        if self.wake_events.iter().any(|e| e.trim().is_empty()) {
            return corrupt("empty wake event name".into());
        }

        let capacity = self.queue_capacity.unwrap_or(max_pending);
        if capacity == 0 {
            return corrupt("queue capacity must be positive".into());
        }
        if self.pending_tasks.len() > capacity {
            return corrupt(format!(
                "{} pending tasks exceed queue capacity {}",
                self.pending_tasks.len(),
                capacity
            ));
        }
        let mut seen = HashSet::new();
        for task in &self.pending_tasks {
            if task.id.trim().is_empty() {
                return corrupt("pending task without id".into());
            }
            if !seen.insert(task.id.as_str()) {
                return corrupt(format!("duplicate pending task {}", task.id));
            }
            match task.kind {
                TaskKind::Continuation if task.parent_task_id.is_none() => {
                    return corrupt(format!("continuation {} has no parent", task.id));
                }
                TaskKind::Mail if task.mail.is_none() => {
                    return corrupt(format!("mail task {} has no envelope", task.id));
                }
                _ => {}
            }
        }

        if self.last_checkpoint > Utc::now() + ChronoDuration::minutes(CHECKPOINT_SKEW_MINUTES) {
            return corrupt(format!("checkpoint {} is in the future", self.last_checkpoint));
        }
        Ok(())
    }

    /// Age of the checkpoint relative to now
    pub fn age(&self) -> std::time::Duration {
        (Utc::now() - self.last_checkpoint)
            .to_std()
            .unwrap_or(std::time::Duration::ZERO)
    }
}
