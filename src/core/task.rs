//! Task and priority types

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Priority tier shared by tasks and mail
///
/// Ordered `Low < Normal < High`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Low,
    Normal,
    High,
}

impl Priority {
    /// Queue tier, lower is served first
    pub fn rank(&self) -> u8 {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "LOW"),
            Priority::Normal => write!(f, "NORMAL"),
            Priority::High => write!(f, "HIGH"),
        }
    }
}

/// Where a task came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    /// Enqueued by a caller
    Direct,
    /// Converted from an inbox message
    Mail,
    /// Follow-up of a task that signalled unfinished work
    Continuation,
}

/// Mail routing carried by mail tasks and their continuations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MailEnvelope {
    /// Id of the originating message
    pub message_id: String,

    /// Sending agent
    pub from_agent: String,

    /// Subject line
    pub subject: String,

    /// Agents already visited by this delegation sequence
    #[serde(default)]
    pub call_chain: Vec<String>,

    /// Whether a synchronous sender is waiting on the result
    #[serde(default)]
    pub expects_reply: bool,
}

/// A unit of work for one agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task id
    pub id: String,

    /// Opaque work description handed to the execution delegate
    pub payload: Value,

    /// Free-form context
    #[serde(default)]
    pub context: HashMap<String, Value>,

    pub kind: TaskKind,

    pub priority: Priority,

    /// Served ahead of ordinary tasks of the same priority
    #[serde(default)]
    pub elevated: bool,

    /// Monotonic enqueue sequence, assigned by the queue
    #[serde(default)]
    pub sequence: u64,

    /// Wall-clock enqueue time, informational only
    pub enqueued_at: DateTime<Utc>,

    /// Parent task (continuations only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<String>,

    /// Mail routing (mail tasks and their continuations)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mail: Option<MailEnvelope>,
}

impl Task {
    /// Create a caller-submitted task
    pub fn direct(payload: Value, priority: Priority) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            payload,
            context: HashMap::new(),
            kind: TaskKind::Direct,
            priority,
            elevated: false,
            sequence: 0,
            enqueued_at: Utc::now(),
            parent_task_id: None,
            mail: None,
        }
    }

    /// Create the continuation of `parent`
    ///
    /// Keeps the parent's priority and mail routing and is served ahead of
    /// same-priority siblings.
    pub fn continuation_of(parent: &Task, reason: impl Into<String>, payload: Value) -> Self {
        let mut context = parent.context.clone();
        context.insert("continuation_reason".into(), Value::String(reason.into()));
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            payload,
            context,
            kind: TaskKind::Continuation,
            priority: parent.priority,
            elevated: true,
            sequence: 0,
            enqueued_at: Utc::now(),
            parent_task_id: Some(parent.id.clone()),
            mail: parent.mail.clone(),
        }
    }

    /// Add a context entry
    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// Whether a synchronous sender waits on this task's result
    pub fn expects_reply(&self) -> bool {
        self.mail.as_ref().is_some_and(|m| m.expects_reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert!(Priority::High.rank() < Priority::Low.rank());
        assert_eq!(Priority::default(), Priority::Normal);
        assert_eq!(serde_json::to_string(&Priority::High).unwrap(), "\"HIGH\"");
    }

    #[test]
    fn test_continuation_inherits_parent() {
        let mut parent = Task::direct(json!({"step": 1}), Priority::Low);
        parent.mail = Some(MailEnvelope {
            message_id: "m1".into(),
            from_agent: "alice".into(),
            subject: "report".into(),
            call_chain: vec!["alice".into()],
            expects_reply: true,
        });

        let next = Task::continuation_of(&parent, "more pages", json!({"step": 2}));
        assert_eq!(next.kind, TaskKind::Continuation);
        assert_eq!(next.priority, Priority::Low);
        assert!(next.elevated);
        assert_eq!(next.parent_task_id.as_deref(), Some(parent.id.as_str()));
        assert!(next.expects_reply());
        assert_eq!(next.context["continuation_reason"], json!("more pages"));
        assert_ne!(next.id, parent.id);
    }
}
