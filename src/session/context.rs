//! TaskContext - what a delegate receives for one task
//!
//! The `Mailer` lets a delegate mail other agents on behalf of the agent it
//! is running for. It carries the current call chain so synchronous
//! delegation cycles are caught, and holds only a weak reference back to
//! the router so sessions never keep their manager alive.

use std::collections::HashMap;
use std::sync::Weak;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::{OrchestratorError, OrchestratorResult, Priority, Task};
use crate::mailbox::{MailMessage, MailReply};

/// Delivery side of the mail system, implemented by the session manager
#[async_trait]
pub trait MailRouter: Send + Sync {
    /// Deliver a message without waiting for an answer
    async fn route_mail(&self, message: MailMessage) -> OrchestratorResult<String>;

    /// Deliver a synchronous message and wait for its reply
    ///
    /// `switch_sender` moves the sending session ACTIVE -> WAITING for the
    /// duration of the wait.
    #[allow(clippy::too_many_arguments)]
    async fn route_sync(
        &self,
        from: &str,
        to: &str,
        subject: &str,
        body: &str,
        chain: &[String],
        timeout: Duration,
        switch_sender: bool,
    ) -> OrchestratorResult<MailReply>;
}

/// Mail handle scoped to one running task
#[derive(Clone)]
pub struct Mailer {
    agent_id: String,
    call_chain: Vec<String>,
    router: Weak<dyn MailRouter>,
}

impl Mailer {
    pub fn new(agent_id: impl Into<String>, call_chain: Vec<String>, router: Weak<dyn MailRouter>) -> Self {
        Self {
            agent_id: agent_id.into(),
            call_chain,
            router,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Agents already involved in the delegation sequence of this task
    pub fn call_chain(&self) -> &[String] {
        &self.call_chain
    }

    /// Fire-and-forget mail from this agent
    pub async fn send_mail(
        &self,
        to: &str,
        subject: &str,
        body: &str,
        priority: Priority,
    ) -> OrchestratorResult<String> {
        let router = self.router.upgrade().ok_or(OrchestratorError::ChannelClosed)?;
        let message = MailMessage::new(&self.agent_id, to, subject, body, priority);
        router.route_mail(message).await
    }

    /// Synchronous mail from this agent; blocks this task until the reply
    pub async fn send_mail_with_switch(
        &self,
        to: &str,
        subject: &str,
        body: &str,
        timeout: Duration,
    ) -> OrchestratorResult<MailReply> {
        let router = self.router.upgrade().ok_or(OrchestratorError::ChannelClosed)?;
        router
            .route_sync(&self.agent_id, to, subject, body, &self.call_chain, timeout, true)
            .await
    }
}

impl std::fmt::Debug for Mailer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailer")
            .field("agent_id", &self.agent_id)
            .field("call_chain", &self.call_chain)
            .finish()
    }
}

/// Everything a delegate gets for one task
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub agent_id: String,

    pub task: Task,

    /// Session metadata at dispatch time
    pub metadata: HashMap<String, Value>,

    pub mailer: Mailer,
}

impl TaskContext {
    /// Subject of the mail behind this task, if any
    pub fn mail_subject(&self) -> Option<&str> {
        self.task.mail.as_ref().map(|m| m.subject.as_str())
    }

    /// Sender of the mail behind this task, if any
    pub fn mail_sender(&self) -> Option<&str> {
        self.task.mail.as_ref().map(|m| m.from_agent.as_str())
    }

    pub fn call_chain(&self) -> &[String] {
        self.mailer.call_chain()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct Recorder {
        sent: parking_lot::Mutex<Vec<MailMessage>>,
        sync_calls: parking_lot::Mutex<Vec<(String, String, Vec<String>, bool)>>,
    }

    #[async_trait]
    impl MailRouter for Recorder {
        async fn route_mail(&self, message: MailMessage) -> OrchestratorResult<String> {
            let id = message.id.clone();
            self.sent.lock().push(message);
            Ok(id)
        }

        async fn route_sync(
            &self,
            from: &str,
            to: &str,
            _subject: &str,
            body: &str,
            chain: &[String],
            _timeout: Duration,
            switch_sender: bool,
        ) -> OrchestratorResult<MailReply> {
            self.sync_calls
                .lock()
                .push((from.to_string(), to.to_string(), chain.to_vec(), switch_sender));
            Ok(MailReply::new("m", to, Value::String(body.to_uppercase())))
        }
    }

    fn recorder() -> Arc<Recorder> {
        Arc::new(Recorder {
            sent: Default::default(),
            sync_calls: Default::default(),
        })
    }

    #[tokio::test]
    async fn test_mailer_chains_only_sync_mail() {
        let router = recorder();
        let weak: Weak<dyn MailRouter> = Arc::downgrade(&router) as Weak<dyn MailRouter>;
        let mailer = Mailer::new("bob", vec!["alice".into()], weak);

        mailer.send_mail("carol", "fyi", "hi", Priority::Low).await.unwrap();
        let sent = router.sent.lock().clone();
        assert!(sent[0].call_chain.is_empty());
        assert_eq!(sent[0].from_agent, "bob");

        let reply = mailer
            .send_mail_with_switch("carol", "q", "ping", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply.text(), "PING");
        let calls = router.sync_calls.lock().clone();
        assert_eq!(calls[0].2, vec!["alice".to_string()]);
        assert!(calls[0].3);
    }

    #[tokio::test]
    async fn test_mailer_without_router_fails() {
        let router = recorder();
        let weak: Weak<dyn MailRouter> = Arc::downgrade(&router) as Weak<dyn MailRouter>;
        drop(router);
        let mailer = Mailer::new("bob", Vec::new(), weak);

        let err = mailer
            .send_mail("carol", "s", "b", Priority::Normal)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::ChannelClosed));
    }
}
