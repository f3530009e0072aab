//! Bounded, priority-ordered task queue
//!
//! Ordering is `HIGH` before `NORMAL` before `LOW`. Within a tier, elevated
//! tasks (continuations, synchronous mail) come before ordinary ones, and
//! each lane is FIFO by the queue-assigned sequence number. Wall-clock time
//! never participates in ordering.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::core::{OrchestratorError, OrchestratorResult, Task};

/// Default queue bound per agent
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// (tier rank, lane, sequence)
type QueueKey = (u8, u8, u64);

fn key_of(task: &Task) -> QueueKey {
    let lane = if task.elevated { 0 } else { 1 };
    (task.priority.rank(), lane, task.sequence)
}

struct QueueInner {
    entries: BTreeMap<QueueKey, Task>,
    next_sequence: u64,
}

/// Per-agent task queue
///
/// Single consumer (the session worker), any number of producers.
pub struct TaskQueue {
    agent_id: String,
    capacity: usize,
    inner: Mutex<QueueInner>,
    available: Notify,
}

impl TaskQueue {
    /// Create an empty queue with the given bound
    pub fn new(agent_id: impl Into<String>, capacity: usize) -> Self {
        Self {
            agent_id: agent_id.into(),
            capacity: capacity.max(1),
            inner: Mutex::new(QueueInner {
                entries: BTreeMap::new(),
                next_sequence: 0,
            }),
            available: Notify::new(),
        }
    }

    /// Add a task, assigning its sequence number
    ///
    /// Fails with `QueueFull` at capacity. Returns the task id.
    pub fn enqueue(&self, mut task: Task) -> OrchestratorResult<String> {
        let id = {
            let mut inner = self.inner.lock();
            if inner.entries.len() >= self.capacity {
                return Err(OrchestratorError::QueueFull {
                    agent_id: self.agent_id.clone(),
                    capacity: self.capacity,
                });
            }
            task.sequence = inner.next_sequence;
            inner.next_sequence += 1;
            task.enqueued_at = Utc::now();
            let id = task.id.clone();
            inner.entries.insert(key_of(&task), task);
            id
        };
        self.available.notify_one();
        Ok(id)
    }

    /// Put back a task that was dequeued but could not run
    ///
    /// Reuses the task's original sequence so it regains its old position.
    /// Capacity is not checked since the slot was just freed.
    pub fn requeue(&self, task: Task) {
        self.inner.lock().entries.insert(key_of(&task), task);
        self.available.notify_one();
    }

    /// Remove the next task without waiting
    pub fn try_dequeue(&self) -> Option<Task> {
        self.inner.lock().entries.pop_first().map(|(_, task)| task)
    }

    /// Remove the next task, waiting up to `timeout` for one to arrive
    ///
    /// Cancel-safe: a task is only removed right before returning it.
    pub async fn dequeue_timeout(&self, timeout: Duration) -> Option<Task> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(task) = self.try_dequeue() {
                return Some(task);
            }
            if tokio::time::timeout_at(deadline, self.available.notified())
                .await
                .is_err()
            {
                return self.try_dequeue();
            }
        }
    }

    /// Non-destructive, ordered copy of the pending tasks
    pub fn peek_all(&self) -> Vec<Task> {
        self.inner.lock().entries.values().cloned().collect()
    }

    /// Drop every pending task, returning how many were removed
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let count = inner.entries.len();
        inner.entries.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Free slots left
    pub fn remaining(&self) -> usize {
        self.capacity.saturating_sub(self.len())
    }
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("agent_id", &self.agent_id)
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Priority;
    use serde_json::json;
    use std::sync::Arc;

    fn task(label: &str, priority: Priority) -> Task {
        Task::direct(json!(label), priority)
    }

    fn drain_labels(queue: &TaskQueue) -> Vec<String> {
        std::iter::from_fn(|| queue.try_dequeue())
            .map(|t| t.payload.as_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_high_before_normal() {
        let queue = TaskQueue::new("q", 10);
        queue.enqueue(task("T1", Priority::Normal)).unwrap();
        queue.enqueue(task("T2", Priority::High)).unwrap();
        assert_eq!(drain_labels(&queue), vec!["T2", "T1"]);
    }

    #[test]
    fn test_tier_then_fifo_order() {
        let queue = TaskQueue::new("q", 10);
        queue.enqueue(task("low-1", Priority::Low)).unwrap();
        queue.enqueue(task("normal-1", Priority::Normal)).unwrap();
        queue.enqueue(task("high-1", Priority::High)).unwrap();
        queue.enqueue(task("low-2", Priority::Low)).unwrap();
        queue.enqueue(task("normal-2", Priority::Normal)).unwrap();
        queue.enqueue(task("high-2", Priority::High)).unwrap();

        assert_eq!(
            drain_labels(&queue),
            vec!["high-1", "high-2", "normal-1", "normal-2", "low-1", "low-2"]
        );
    }

    #[test]
    fn test_elevated_tasks_lead_their_tier() {
        let queue = TaskQueue::new("q", 10);
        queue.enqueue(task("normal-1", Priority::Normal)).unwrap();
        queue.enqueue(task("normal-2", Priority::Normal)).unwrap();

        let parent = task("parent", Priority::Normal);
        let first = Task::continuation_of(&parent, "more", json!("cont-1"));
        let second = Task::continuation_of(&parent, "more", json!("cont-2"));
        queue.enqueue(first).unwrap();
        queue.enqueue(second).unwrap();
        queue.enqueue(task("high", Priority::High)).unwrap();

        assert_eq!(
            drain_labels(&queue),
            vec!["high", "cont-1", "cont-2", "normal-1", "normal-2"]
        );
    }

    #[test]
    fn test_capacity_refuses_excess() {
        let queue = TaskQueue::new("x", 2);
        queue.enqueue(task("a", Priority::Normal)).unwrap();
        queue.enqueue(task("b", Priority::Normal)).unwrap();

        let err = queue.enqueue(task("c", Priority::High)).unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::QueueFull { ref agent_id, capacity: 2 } if agent_id == "x"
        ));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.remaining(), 0);

        queue.try_dequeue().unwrap();
        assert!(queue.enqueue(task("c", Priority::High)).is_ok());
    }

    #[test]
    fn test_peek_is_non_destructive() {
        let queue = TaskQueue::new("q", 10);
        queue.enqueue(task("a", Priority::Low)).unwrap();
        queue.enqueue(task("b", Priority::High)).unwrap();

        let peeked: Vec<_> = queue.peek_all().into_iter().map(|t| t.payload).collect();
        assert_eq!(peeked, vec![json!("b"), json!("a")]);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_requeue_restores_position() {
        let queue = TaskQueue::new("q", 10);
        queue.enqueue(task("first", Priority::Normal)).unwrap();
        queue.enqueue(task("second", Priority::Normal)).unwrap();

        let first = queue.try_dequeue().unwrap();
        queue.requeue(first);
        assert_eq!(drain_labels(&queue), vec!["first", "second"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dequeue_timeout_expires() {
        let queue = TaskQueue::new("q", 10);
        let started = Instant::now();
        assert!(queue.dequeue_timeout(Duration::from_millis(200)).await.is_none());
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_dequeue_wakes_on_enqueue() {
        let queue = Arc::new(TaskQueue::new("q", 10));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue_timeout(Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.enqueue(task("late", Priority::Low)).unwrap();

        let got = consumer.await.unwrap().unwrap();
        assert_eq!(got.payload, json!("late"));
    }

    #[test]
    fn test_sequences_are_monotonic() {
        let queue = TaskQueue::new("q", 10);
        queue.enqueue(task("a", Priority::High)).unwrap();
        queue.enqueue(task("b", Priority::Low)).unwrap();
        let tasks = queue.peek_all();
        assert!(tasks[0].sequence < tasks[1].sequence);
        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
    }
}
