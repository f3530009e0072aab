//! AgentSession - one agent's queue, lifecycle state and bookkeeping
//!
//! All state transitions go through this type so they are validated against
//! the state machine table and published on the event bus.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;

use crate::core::{OrchestratorError, OrchestratorResult, SessionState, Task};
use crate::events::{EventBus, OrchestratorEvent};
use crate::queue::TaskQueue;

/// Mutable part of a session, guarded by one lock
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatus {
    pub state: SessionState,

    /// Task currently executing
    pub current_task: Option<String>,

    /// Message this session is blocked on while WAITING
    pub waiting_on: Option<String>,

    pub wake_events: BTreeSet<String>,

    pub sleep_until: Option<DateTime<Utc>>,

    pub error_count: u32,

    pub last_active: DateTime<Utc>,

    /// Reason given for the most recent transition
    pub last_reason: Option<String>,

    pub metadata: HashMap<String, Value>,
}

/// Read-only view returned by `get_session_state`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub agent_id: String,
    pub state: SessionState,
    pub queue_depth: usize,
    pub sleep_until: Option<DateTime<Utc>>,
    pub error_count: u32,
    pub last_active: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task: Option<String>,
    #[serde(default)]
    pub wake_events: Vec<String>,
}

/// An agent's processing unit state
pub struct AgentSession {
    agent_id: String,
    created_at: DateTime<Utc>,
    queue: TaskQueue,
    status: Mutex<SessionStatus>,
    /// Signalled on externally driven transitions (sleep, wake, stop)
    changed: Notify,
    events: EventBus,
}

impl AgentSession {
    /// Create an idle session with an empty queue
    pub fn new(
        agent_id: impl Into<String>,
        queue_capacity: usize,
        metadata: HashMap<String, Value>,
        events: EventBus,
    ) -> Self {
        let agent_id = agent_id.into();
        let now = Utc::now();
        Self {
            queue: TaskQueue::new(agent_id.clone(), queue_capacity),
            agent_id,
            created_at: now,
            status: Mutex::new(SessionStatus {
                state: SessionState::Idle,
                current_task: None,
                waiting_on: None,
                wake_events: BTreeSet::new(),
                sleep_until: None,
                error_count: 0,
                last_active: now,
                last_reason: None,
                metadata,
            }),
            changed: Notify::new(),
            events,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn state(&self) -> SessionState {
        self.status.lock().state
    }

    /// Copy of the mutable status
    pub fn status(&self) -> SessionStatus {
        self.status.lock().clone()
    }

    /// Status together with the queued tasks, read under the status lock
    ///
    /// No transition can land between the two reads, so a snapshot built
    /// from the pair never mixes states.
    pub fn status_with_pending(&self) -> (SessionStatus, Vec<Task>) {
        let status = self.status.lock();
        let pending = self.queue.peek_all();
        (status.clone(), pending)
    }

    pub fn info(&self) -> SessionInfo {
        let status = self.status.lock();
        SessionInfo {
            agent_id: self.agent_id.clone(),
            state: status.state,
            queue_depth: self.queue.len(),
            sleep_until: status.sleep_until,
            error_count: status.error_count,
            last_active: status.last_active,
            created_at: self.created_at,
            last_reason: status.last_reason.clone(),
            current_task: status.current_task.clone(),
            wake_events: status.wake_events.iter().cloned().collect(),
        }
    }

    pub fn metadata(&self) -> HashMap<String, Value> {
        self.status.lock().metadata.clone()
    }

    pub fn set_metadata(&self, key: impl Into<String>, value: Value) {
        self.status.lock().metadata.insert(key.into(), value);
    }

    /// Wait for an externally driven transition
    pub async fn changed(&self) {
        self.changed.notified().await
    }

    /// Wake the worker so it re-reads the state
    pub fn notify_changed(&self) {
        self.changed.notify_one();
    }

    /// Validate and apply a transition, publishing it
    ///
    /// Returns the previous state.
    fn transition_locked(
        &self,
        status: &mut SessionStatus,
        to: SessionState,
        reason: Option<&str>,
    ) -> OrchestratorResult<SessionState> {
        let from = status.state;
        if !from.can_transition_to(to) {
            return Err(OrchestratorError::InvalidTransition {
                agent_id: self.agent_id.clone(),
                from,
                to,
            });
        }
        status.state = to;
        status.last_active = Utc::now();
        status.last_reason = reason.map(str::to_string);
        tracing::debug!(agent_id = %self.agent_id, %from, %to, reason, "State transition");
        self.events.publish(OrchestratorEvent::StateChanged {
            agent_id: self.agent_id.clone(),
            from,
            to,
            reason: reason.map(str::to_string),
        });
        Ok(from)
    }

    /// IDLE -> ACTIVE for a dequeued task
    pub fn begin_task(&self, task_id: &str) -> OrchestratorResult<()> {
        let mut status = self.status.lock();
        if status.state != SessionState::Idle {
            return Err(OrchestratorError::InvalidTransition {
                agent_id: self.agent_id.clone(),
                from: status.state,
                to: SessionState::Active,
            });
        }
        self.transition_locked(&mut status, SessionState::Active, None)?;
        status.current_task = Some(task_id.to_string());
        Ok(())
    }

    /// ACTIVE -> IDLE after a task
    pub fn finish_task(&self) -> OrchestratorResult<()> {
        let mut status = self.status.lock();
        self.transition_locked(&mut status, SessionState::Idle, None)?;
        status.current_task = None;
        Ok(())
    }

    /// ACTIVE -> WAITING on a synchronous mail reply
    pub fn begin_wait(&self, message_id: &str) -> OrchestratorResult<()> {
        let mut status = self.status.lock();
        if status.state != SessionState::Active {
            return Err(OrchestratorError::InvalidTransition {
                agent_id: self.agent_id.clone(),
                from: status.state,
                to: SessionState::Waiting,
            });
        }
        self.transition_locked(&mut status, SessionState::Waiting, Some("synchronous mail"))?;
        status.waiting_on = Some(message_id.to_string());
        Ok(())
    }

    /// WAITING -> ACTIVE once the reply (or timeout) arrives
    pub fn end_wait(&self, reason: &str) -> OrchestratorResult<()> {
        let mut status = self.status.lock();
        self.transition_locked(&mut status, SessionState::Active, Some(reason))?;
        status.waiting_on = None;
        Ok(())
    }

    /// IDLE -> SLEEPING
    ///
    /// Use `SleepScheduler::put_to_sleep`, which also registers the timer.
    pub fn enter_sleep(
        &self,
        sleep_until: Option<DateTime<Utc>>,
        wake_events: BTreeSet<String>,
    ) -> OrchestratorResult<()> {
        let mut status = self.status.lock();
        if status.state != SessionState::Idle {
            return Err(OrchestratorError::InvalidTransition {
                agent_id: self.agent_id.clone(),
                from: status.state,
                to: SessionState::Sleeping,
            });
        }
        self.transition_locked(&mut status, SessionState::Sleeping, Some("sleep requested"))?;
        status.sleep_until = sleep_until;
        status.wake_events = wake_events;
        drop(status);
        self.notify_changed();
        Ok(())
    }

    /// SLEEPING -> IDLE
    ///
    /// Returns false (and does nothing) if the session is not sleeping.
    pub fn wake(&self, reason: &str) -> bool {
        let mut status = self.status.lock();
        if status.state != SessionState::Sleeping {
            return false;
        }
        if self
            .transition_locked(&mut status, SessionState::Idle, Some(reason))
            .is_err()
        {
            return false;
        }
        status.sleep_until = None;
        status.wake_events.clear();
        drop(status);

        tracing::info!(agent_id = %self.agent_id, reason, "Session woke");
        self.events.publish(OrchestratorEvent::SessionWoke {
            agent_id: self.agent_id.clone(),
            reason: reason.to_string(),
        });
        self.notify_changed();
        true
    }

    /// Any -> STOPPED
    ///
    /// Returns false if the session was already stopped.
    pub fn stop(&self, reason: &str) -> bool {
        let mut status = self.status.lock();
        if status.state.is_terminal() {
            return false;
        }
        let stopped = self
            .transition_locked(&mut status, SessionState::Stopped, Some(reason))
            .is_ok();
        status.sleep_until = None;
        status.wake_events.clear();
        drop(status);
        self.notify_changed();
        stopped
    }

    /// Count one execution failure, returning the new total
    pub fn record_error(&self) -> u32 {
        let mut status = self.status.lock();
        status.error_count += 1;
        status.last_active = Utc::now();
        status.error_count
    }
}

impl std::fmt::Debug for AgentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentSession")
            .field("agent_id", &self.agent_id)
            .field("state", &self.state())
            .field("queue", &self.queue)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use serde_json::json;

    fn session(id: &str) -> (AgentSession, crate::events::EventBusWorker) {
        let (bus, worker) = EventBus::new(64, Vec::new());
        (AgentSession::new(id, 4, HashMap::new(), bus), worker)
    }

    #[test]
    fn test_new_session_is_idle() {
        let (s, _w) = session("alice");
        let info = s.info();
        assert_eq!(info.state, SessionState::Idle);
        assert_eq!(info.queue_depth, 0);
        assert_eq!(info.error_count, 0);
        assert!(info.sleep_until.is_none());
    }

    #[test]
    fn test_task_cycle() {
        let (s, _w) = session("alice");
        s.begin_task("t1").unwrap();
        assert_eq!(s.state(), SessionState::Active);
        assert_eq!(s.status().current_task.as_deref(), Some("t1"));

        assert!(s.begin_task("t2").is_err());

        s.finish_task().unwrap();
        assert_eq!(s.state(), SessionState::Idle);
        assert!(s.status().current_task.is_none());
    }

    #[test]
    fn test_wait_cycle() {
        let (s, _w) = session("alice");
        assert!(s.begin_wait("m1").is_err());

        s.begin_task("t1").unwrap();
        s.begin_wait("m1").unwrap();
        assert_eq!(s.state(), SessionState::Waiting);
        assert_eq!(s.status().waiting_on.as_deref(), Some("m1"));

        s.end_wait("reply received").unwrap();
        assert_eq!(s.state(), SessionState::Active);
        assert!(s.status().waiting_on.is_none());
    }

    #[test]
    fn test_sleep_and_wake() {
        let (s, _w) = session("debbie");
        let events: BTreeSet<String> = ["alert".to_string()].into();
        s.enter_sleep(None, events).unwrap();
        assert_eq!(s.state(), SessionState::Sleeping);
        assert!(s.begin_task("t1").is_err());

        assert!(s.wake("manual"));
        assert_eq!(s.state(), SessionState::Idle);
        assert!(s.status().wake_events.is_empty());
        assert!(!s.wake("manual"));
    }

    #[test]
    fn test_stop_is_terminal() {
        let (s, _w) = session("x");
        assert!(s.stop("stop requested"));
        assert!(!s.stop("again"));
        assert_eq!(s.state(), SessionState::Stopped);
        assert!(s.begin_task("t").is_err());
        assert!(s.enter_sleep(None, BTreeSet::new()).is_err());
        assert!(!s.wake("manual"));
    }

    #[test]
    fn test_errors_and_metadata() {
        let (s, _w) = session("x");
        assert_eq!(s.record_error(), 1);
        assert_eq!(s.record_error(), 2);
        s.set_metadata("role", json!("planner"));
        assert_eq!(s.metadata()["role"], json!("planner"));
        assert_eq!(s.info().error_count, 2);
    }

    #[tokio::test]
    async fn test_transitions_are_published() {
        let (bus, worker) = EventBus::new(64, Vec::new());
        let mut rx = bus.subscribe();
        let cancel = tokio_util::sync::CancellationToken::new();
        tokio::spawn(worker.run(cancel.clone()));

        let s = AgentSession::new("alice", 4, HashMap::new(), bus);
        s.begin_task("t1").unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            OrchestratorEvent::StateChanged {
                agent_id: "alice".into(),
                from: SessionState::Idle,
                to: SessionState::Active,
                reason: None,
            }
        );
        cancel.cancel();
    }

    #[test]
    fn test_status_with_pending() {
        let (s, _w) = session("alice");
        let t1 = s
            .queue()
            .enqueue(Task::direct(json!(1), crate::core::Priority::Normal))
            .unwrap();
        s.enter_sleep(None, ["alert".to_string()].into()).unwrap();

        let (status, pending) = s.status_with_pending();
        assert_eq!(status.state, SessionState::Sleeping);
        assert_eq!(status.wake_events.len(), 1);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, t1);
        assert_eq!(s.queue().len(), 1);
    }
}
