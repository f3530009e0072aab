//! Mail message types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::core::{MailEnvelope, OrchestratorError, OrchestratorResult, Priority, Task, TaskKind};

/// A message between agents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MailMessage {
    /// Unique message id (also the reply correlation id)
    pub id: String,

    pub from_agent: String,

    pub to_agent: String,

    pub subject: String,

    pub body: String,

    pub priority: Priority,

    /// Agent ids already visited by this synchronous delegation sequence,
    /// sender last; empty for fire-and-forget mail
    #[serde(default)]
    pub call_chain: Vec<String>,

    pub created_at: DateTime<Utc>,

    /// Correlation id of the message this one answers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,

    /// Sender blocks until this message is answered
    #[serde(default)]
    pub synchronous: bool,
}

impl MailMessage {
    /// Create a fire-and-forget message
    pub fn new(
        from_agent: impl Into<String>,
        to_agent: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
        priority: Priority,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            from_agent: from_agent.into(),
            to_agent: to_agent.into(),
            subject: subject.into(),
            body: body.into(),
            priority,
            call_chain: Vec::new(),
            created_at: Utc::now(),
            reply_to: None,
            synchronous: false,
        }
    }

    /// Create a synchronous message continuing `chain`
    ///
    /// Synchronous mail is always HIGH priority. The sender is appended to
    /// the chain; fails with `CircularMail` if the recipient is already in it.
    pub fn synchronous(
        from_agent: impl Into<String>,
        to_agent: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
        chain: &[String],
    ) -> OrchestratorResult<Self> {
        let from_agent = from_agent.into();
        let to_agent = to_agent.into();

        let mut call_chain = chain.to_vec();
        if call_chain.last() != Some(&from_agent) {
            call_chain.push(from_agent.clone());
        }
        check_call_chain(&call_chain, &to_agent)?;

        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            from_agent,
            to_agent,
            subject: subject.into(),
            body: body.into(),
            priority: Priority::High,
            call_chain,
            created_at: Utc::now(),
            reply_to: None,
            synchronous: true,
        })
    }

    /// Convert into a mail task for the recipient's queue
    ///
    /// Synchronous mail is elevated to the head of its tier. Only synchronous
    /// mail hands its call chain on; an async sender is not blocked, so the
    /// recipient starts a fresh sequence.
    pub fn to_task(&self) -> Task {
        let mut task = Task::direct(
            json!({
                "from": self.from_agent,
                "subject": self.subject,
                "body": self.body,
            }),
            self.priority,
        );
        task.kind = TaskKind::Mail;
        task.elevated = self.synchronous;
        task.mail = Some(MailEnvelope {
            message_id: self.id.clone(),
            from_agent: self.from_agent.clone(),
            subject: self.subject.clone(),
            call_chain: if self.synchronous {
                self.call_chain.clone()
            } else {
                Vec::new()
            },
            expects_reply: self.synchronous,
        });
        task
    }
}

/// Answer to a synchronous message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MailReply {
    /// Id of this reply
    pub message_id: String,

    /// Id of the message being answered
    pub reply_to: String,

    /// Agent that produced the reply
    pub from_agent: String,

    pub body: Value,

    pub created_at: DateTime<Utc>,
}

impl MailReply {
    pub fn new(reply_to: impl Into<String>, from_agent: impl Into<String>, body: Value) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            reply_to: reply_to.into(),
            from_agent: from_agent.into(),
            body,
            created_at: Utc::now(),
        }
    }

    /// Body as text (strings unquoted, anything else as JSON)
    pub fn text(&self) -> String {
        match &self.body {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// Reject delivery to an agent already present in `chain`
pub fn check_call_chain(chain: &[String], to_agent: &str) -> OrchestratorResult<()> {
    if chain.iter().any(|id| id == to_agent) {
        return Err(OrchestratorError::CircularMail {
            to: to_agent.to_string(),
            chain: chain.to_vec(),
        });
    }
    Ok(())
}
