//! Mailbox store - per-agent inboxes and the pending reply table
//!
//! Each inbox has its own lock so delivery to different agents proceeds in
//! parallel. The registry lock is held only to look an inbox up.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{oneshot, Notify};

use crate::core::{OrchestratorError, OrchestratorResult, Priority};
use crate::queue::TaskQueue;

use super::message::{MailMessage, MailReply};

/// Outcome delivered to a waiting synchronous sender
pub type ReplyResult = OrchestratorResult<MailReply>;

/// (tier rank, lane, sequence)
type InboxKey = (u8, u8, u64);

/// One agent's inbox
pub struct Inbox {
    agent_id: String,
    messages: Mutex<BTreeMap<InboxKey, MailMessage>>,
    arrived: Notify,
}

impl Inbox {
    fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            messages: Mutex::new(BTreeMap::new()),
            arrived: Notify::new(),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    fn push(&self, sequence: u64, message: MailMessage) {
        let lane = if message.synchronous { 0 } else { 1 };
        let key = (message.priority.rank(), lane, sequence);
        self.messages.lock().insert(key, message);
        self.arrived.notify_one();
    }

    /// Remove the next message without waiting
    pub fn pop(&self) -> Option<MailMessage> {
        self.messages.lock().pop_first().map(|(_, m)| m)
    }

    /// Move as many messages as fit into `queue`, in inbox order
    ///
    /// Messages that do not fit stay in the inbox. Returns
    /// `(task_id, priority)` for every task created.
    pub fn drain_into(&self, queue: &TaskQueue) -> Vec<(String, Priority)> {
        let mut moved = Vec::new();
        let mut messages = self.messages.lock();
        while queue.remaining() > 0 {
            let Some((key, message)) = messages.pop_first() else {
                break;
            };
            match queue.enqueue(message.to_task()) {
                Ok(task_id) => moved.push((task_id, message.priority)),
                Err(_) => {
                    messages.insert(key, message);
                    break;
                }
            }
        }
        moved
    }

    /// Wait until a message arrives
    pub async fn arrived(&self) {
        self.arrived.notified().await
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct PendingReply {
    from_agent: String,
    to_agent: String,
    tx: oneshot::Sender<ReplyResult>,
}

/// All inboxes plus the synchronous reply correlation table
#[derive(Default)]
pub struct Mailbox {
    inboxes: RwLock<HashMap<String, Arc<Inbox>>>,
    pending: Mutex<HashMap<String, PendingReply>>,
    sequence: AtomicU64,
}

impl Mailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or replace) the inbox for an agent
    pub fn open_inbox(&self, agent_id: &str) -> Arc<Inbox> {
        let inbox = Arc::new(Inbox::new(agent_id));
        self.inboxes
            .write()
            .insert(agent_id.to_string(), inbox.clone());
        inbox
    }

    /// Get an agent's inbox
    pub fn inbox(&self, agent_id: &str) -> Option<Arc<Inbox>> {
        self.inboxes.read().get(agent_id).cloned()
    }

    /// Remove an agent's inbox and fail every pending call involving it
    ///
    /// Callers waiting on replies from this agent see `SessionStopped`.
    /// Returns the number of undelivered messages dropped.
    pub fn close_inbox(&self, agent_id: &str) -> usize {
        let dropped = self
            .inboxes
            .write()
            .remove(agent_id)
            .map(|inbox| inbox.len())
            .unwrap_or(0);
        self.fail_pending(agent_id);
        if dropped > 0 {
            tracing::warn!(agent_id, dropped, "Closed inbox with undelivered mail");
        }
        dropped
    }

    /// Like `close_inbox`, but only while `inbox` is still the registered one
    ///
    /// A session replaced under the same id keeps its new inbox and its
    /// pending calls. Returns None if nothing was closed.
    pub fn close_inbox_if(&self, agent_id: &str, inbox: &Arc<Inbox>) -> Option<usize> {
        let removed = {
            let mut inboxes = self.inboxes.write();
            match inboxes.get(agent_id) {
                Some(current) if Arc::ptr_eq(current, inbox) => inboxes.remove(agent_id),
                _ => None,
            }
        }?;
        let dropped = removed.len();
        self.fail_pending(agent_id);
        if dropped > 0 {
            tracing::warn!(agent_id, dropped, "Closed inbox with undelivered mail");
        }
        Some(dropped)
    }

    fn fail_pending(&self, agent_id: &str) {
        let orphaned: Vec<PendingReply> = {
            let mut pending = self.pending.lock();
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, p)| p.to_agent == agent_id || p.from_agent == agent_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter().filter_map(|id| pending.remove(&id)).collect()
        };
        for entry in orphaned {
            let _ = entry
                .tx
                .send(Err(OrchestratorError::SessionStopped(entry.to_agent.clone())));
        }
    }

    /// Append a message to its recipient's inbox
    pub fn deliver(&self, message: MailMessage) -> OrchestratorResult<String> {
        let inbox = self
            .inbox(&message.to_agent)
            .ok_or_else(|| OrchestratorError::SessionNotFound(message.to_agent.clone()))?;
        let id = message.id.clone();
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        inbox.push(sequence, message);
        Ok(id)
    }

    /// Register interest in the reply to `message`
    pub fn expect_reply(&self, message: &MailMessage) -> oneshot::Receiver<ReplyResult> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(
            message.id.clone(),
            PendingReply {
                from_agent: message.from_agent.clone(),
                to_agent: message.to_agent.clone(),
                tx,
            },
        );
        rx
    }

    /// Hand a result to the sender waiting on `message_id`
    ///
    /// Returns false if nobody is waiting any more (timed out or stopped).
    pub fn resolve_reply(&self, message_id: &str, result: ReplyResult) -> bool {
        let entry = self.pending.lock().remove(message_id);
        match entry {
            Some(entry) => entry.tx.send(result).is_ok(),
            None => false,
        }
    }

    /// Stop waiting for a reply
    pub fn forget_reply(&self, message_id: &str) {
        self.pending.lock().remove(message_id);
    }

    /// Number of synchronous calls awaiting a reply
    pub fn pending_replies(&self) -> usize {
        self.pending.lock().len()
    }
}

impl std::fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailbox")
            .field("inboxes", &self.inboxes.read().len())
            .field("pending_replies", &self.pending_replies())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deliver_requires_inbox() {
        let mailbox = Mailbox::new();
        let msg = MailMessage::new("alice", "nobody", "s", "b", Priority::Normal);
        let err = mailbox.deliver(msg).unwrap_err();
        assert!(matches!(err, OrchestratorError::SessionNotFound(ref id) if id == "nobody"));
    }

    #[test]
    fn test_inbox_orders_by_priority() {
        let mailbox = Mailbox::new();
        let inbox = mailbox.open_inbox("bob");
        mailbox
            .deliver(MailMessage::new("a", "bob", "low", "", Priority::Low))
            .unwrap();
        mailbox
            .deliver(MailMessage::new("a", "bob", "high", "", Priority::High))
            .unwrap();
        let sync = MailMessage::synchronous("a", "bob", "sync", "", &[]).unwrap();
        mailbox.deliver(sync).unwrap();

        let subjects: Vec<_> = std::iter::from_fn(|| inbox.pop()).map(|m| m.subject).collect();
        assert_eq!(subjects, vec!["sync", "high", "low"]);
    }

    #[test]
    fn test_drain_respects_queue_capacity() {
        let mailbox = Mailbox::new();
        let inbox = mailbox.open_inbox("bob");
        for i in 0..3 {
            mailbox
                .deliver(MailMessage::new("a", "bob", format!("m{i}"), "", Priority::Normal))
                .unwrap();
        }

        let queue = TaskQueue::new("bob", 2);
        let moved = inbox.drain_into(&queue);
        assert_eq!(moved.len(), 2);
        assert_eq!(queue.len(), 2);
        assert_eq!(inbox.len(), 1);

        queue.try_dequeue().unwrap();
        assert_eq!(inbox.drain_into(&queue).len(), 1);
        assert!(inbox.is_empty());
    }

    #[tokio::test]
    async fn test_reply_round_trip() {
        let mailbox = Mailbox::new();
        mailbox.open_inbox("debbie");
        let msg = MailMessage::synchronous("alice", "debbie", "q", "?", &[]).unwrap();
        let rx = mailbox.expect_reply(&msg);
        mailbox.deliver(msg.clone()).unwrap();

        assert!(mailbox.resolve_reply(&msg.id, Ok(MailReply::new(&msg.id, "debbie", json!("yes")))));
        let reply = rx.await.unwrap().unwrap();
        assert_eq!(reply.reply_to, msg.id);
        assert_eq!(mailbox.pending_replies(), 0);
    }

    #[test]
    fn test_late_reply_is_discarded() {
        let mailbox = Mailbox::new();
        let msg = MailMessage::synchronous("alice", "debbie", "q", "?", &[]).unwrap();
        let _rx = mailbox.expect_reply(&msg);
        mailbox.forget_reply(&msg.id);

        let delivered =
            mailbox.resolve_reply(&msg.id, Ok(MailReply::new(&msg.id, "debbie", json!("late"))));
        assert!(!delivered);
    }

    #[tokio::test]
    async fn test_close_inbox_fails_waiters() {
        let mailbox = Mailbox::new();
        mailbox.open_inbox("debbie");
        let msg = MailMessage::synchronous("alice", "debbie", "q", "?", &[]).unwrap();
        let rx = mailbox.expect_reply(&msg);
        mailbox.deliver(msg).unwrap();

        assert_eq!(mailbox.close_inbox("debbie"), 1);
        let result = rx.await.unwrap();
        assert!(matches!(result, Err(OrchestratorError::SessionStopped(ref id)) if id == "debbie"));
        assert!(mailbox.inbox("debbie").is_none());
    }

    #[test]
    fn test_close_inbox_if_ignores_replaced_inbox() {
        let mailbox = Mailbox::new();
        let old = mailbox.open_inbox("bob");
        let current = mailbox.open_inbox("bob");
        let msg = MailMessage::synchronous("alice", "bob", "q", "?", &[]).unwrap();
        let _rx = mailbox.expect_reply(&msg);

        assert_eq!(mailbox.close_inbox_if("bob", &old), None);
        assert!(mailbox.inbox("bob").is_some());
        assert_eq!(mailbox.pending_replies(), 1);

        assert_eq!(mailbox.close_inbox_if("bob", &current), Some(0));
        assert!(mailbox.inbox("bob").is_none());
        assert_eq!(mailbox.pending_replies(), 0);
    }
}
