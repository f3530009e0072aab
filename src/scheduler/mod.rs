//! Sleep/Wake scheduler
//!
//! Tracks sleeping agents and evaluates their wake conditions once per tick.
//! When a timer expiry and a matching wake event land in the same tick, the
//! event wins and the wake reason is `event:<name>`.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::Instant;

use crate::core::{OrchestratorError, OrchestratorResult};
use crate::session::AgentSession;

/// Wake reason used when the sleep duration elapses
pub const REASON_SCHEDULED: &str = "scheduled";

/// Wake reason used when HIGH priority mail arrives
pub const REASON_HIGH_PRIORITY_MAIL: &str = "high priority mail";

/// Wake reason for a matching event
pub fn event_reason(name: &str) -> String {
    format!("event:{name}")
}

/// Parameters of a sleep request; at least one must be set
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SleepRequest {
    pub duration: Option<Duration>,
    pub wake_events: BTreeSet<String>,
}

impl SleepRequest {
    /// Sleep for a fixed duration
    pub fn for_duration(duration: Duration) -> Self {
        Self {
            duration: Some(duration),
            wake_events: BTreeSet::new(),
        }
    }

    /// Sleep until one of the named events is broadcast
    pub fn until_events<I, S>(events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            duration: None,
            wake_events: events.into_iter().map(Into::into).collect(),
        }
    }

    /// Add a wake event
    pub fn with_event(mut self, name: impl Into<String>) -> Self {
        self.wake_events.insert(name.into());
        self
    }

    /// Add or replace the duration
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn validate(&self) -> OrchestratorResult<()> {
        if self.duration.is_none() && self.wake_events.is_empty() {
            return Err(OrchestratorError::InvalidSleepRequest(
                "a duration or at least one wake event is required".into(),
            ));
        }
        if self.wake_events.iter().any(|e| e.trim().is_empty()) {
            return Err(OrchestratorError::InvalidSleepRequest(
                "wake event names must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// A named signal broadcast to all sessions; never persisted
#[derive(Debug, Clone, PartialEq)]
pub struct WakeEvent {
    pub name: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl WakeEvent {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// A wake performed by a tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WakeDecision {
    pub agent_id: String,
    pub reason: String,
}

struct Sleeper {
    since: Instant,
    deadline: Option<Instant>,
    wake_events: BTreeSet<String>,
}

/// Registry of sleeping agents
#[derive(Default)]
pub struct SleepScheduler {
    sleepers: Mutex<HashMap<String, Sleeper>>,
    emitted: Mutex<Vec<(Instant, WakeEvent)>>,
}

impl SleepScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move an idle session to SLEEPING and start tracking it
    pub fn put_to_sleep(
        &self,
        session: &AgentSession,
        request: &SleepRequest,
    ) -> OrchestratorResult<()> {
        request.validate()?;
        let sleep_until = match request.duration {
            Some(d) => Some(
                Utc::now()
                    + chrono::Duration::from_std(d).map_err(|_| {
                        OrchestratorError::InvalidSleepRequest(format!("duration {d:?} out of range"))
                    })?,
            ),
            None => None,
        };
        let now = Instant::now();
        session.enter_sleep(sleep_until, request.wake_events.clone())?;
        self.track(session.agent_id(), now, request.duration.map(|d| now + d), request);
        tracing::debug!(
            agent_id = session.agent_id(),
            duration = ?request.duration,
            wake_events = ?request.wake_events,
            "Session sleeping"
        );
        Ok(())
    }

    /// Re-enter a sleep recorded in a snapshot
    ///
    /// A `sleep_until` already in the past wakes on the next tick.
    pub fn resume_sleep(
        &self,
        session: &AgentSession,
        sleep_until: Option<DateTime<Utc>>,
        wake_events: BTreeSet<String>,
    ) -> OrchestratorResult<()> {
        let remaining = sleep_until.map(|until| {
            (until - Utc::now()).to_std().unwrap_or(Duration::ZERO)
        });
        let request = SleepRequest {
            duration: remaining,
            wake_events,
        };
        request.validate()?;
        let now = Instant::now();
        session.enter_sleep(sleep_until, request.wake_events.clone())?;
        self.track(session.agent_id(), now, remaining.map(|d| now + d), &request);
        Ok(())
    }

    fn track(&self, agent_id: &str, since: Instant, deadline: Option<Instant>, request: &SleepRequest) {
        self.sleepers.lock().insert(
            agent_id.to_string(),
            Sleeper {
                since,
                deadline,
                wake_events: request.wake_events.clone(),
            },
        );
    }

    /// Wake a session now (manual override)
    ///
    /// Idempotent: returns false if the session was not sleeping.
    pub fn wake(&self, session: &AgentSession, reason: &str) -> bool {
        self.sleepers.lock().remove(session.agent_id());
        session.wake(reason)
    }

    /// Stop tracking an agent
    pub fn forget(&self, agent_id: &str) {
        self.sleepers.lock().remove(agent_id);
    }

    /// Buffer an event for evaluation at the next tick
    pub fn emit(&self, event: WakeEvent) {
        self.emitted.lock().push((Instant::now(), event));
    }

    /// Evaluate every sleeper and wake those whose condition is met
    ///
    /// Events are consumed by the tick whether or not anything matched. An
    /// event only matches sleepers that were already asleep when it was
    /// emitted. A due sleeper that `lookup` cannot resolve is kept, so a
    /// passed deadline still fires on a later tick.
    pub fn tick<F>(&self, now: Instant, lookup: F) -> Vec<WakeDecision>
    where
        F: Fn(&str) -> Option<Arc<AgentSession>>,
    {
        let events = std::mem::take(&mut *self.emitted.lock());
        let mut sleepers = self.sleepers.lock();

        let mut due: Vec<WakeDecision> = sleepers
            .iter()
            .filter_map(|(agent_id, sleeper)| {
                let matched = events.iter().find(|(emitted_at, event)| {
                    *emitted_at >= sleeper.since && sleeper.wake_events.contains(&event.name)
                });
                let reason = match (matched, sleeper.deadline) {
                    (Some((_, event)), _) => event_reason(&event.name),
                    (None, Some(deadline)) if deadline <= now => REASON_SCHEDULED.to_string(),
                    _ => return None,
                };
                Some(WakeDecision {
                    agent_id: agent_id.clone(),
                    reason,
                })
            })
            .collect();
        due.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));

        let mut woke = Vec::with_capacity(due.len());
        for decision in due {
            // An unregistered sleeper stays tracked until its session shows up
            let Some(session) = lookup(&decision.agent_id) else {
                continue;
            };
            sleepers.remove(&decision.agent_id);
            if session.wake(&decision.reason) {
                woke.push(decision);
            }
        }
        woke
    }

    /// Whether an agent is currently tracked as sleeping
    pub fn is_tracking(&self, agent_id: &str) -> bool {
        self.sleepers.lock().contains_key(agent_id)
    }

    pub fn sleeper_count(&self) -> usize {
        self.sleepers.lock().len()
    }
}

impl std::fmt::Debug for SleepScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SleepScheduler")
            .field("sleepers", &self.sleeper_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SessionState;
    use crate::events::EventBus;
    use serde_json::json;

    fn session(id: &str) -> Arc<AgentSession> {
        let (bus, _worker) = EventBus::new(64, Vec::new());
        Arc::new(AgentSession::new(id, 10, Default::default(), bus))
    }

    fn lookup_one(s: &Arc<AgentSession>) -> impl Fn(&str) -> Option<Arc<AgentSession>> + '_ {
        move |id| (id == s.agent_id()).then(|| s.clone())
    }

    #[test]
    fn test_request_requires_duration_or_events() {
        let err = SleepRequest::default().validate().unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidSleepRequest(_)));
        assert!(SleepRequest::for_duration(Duration::from_secs(1)).validate().is_ok());
        assert!(SleepRequest::until_events(["alert"]).validate().is_ok());
        assert!(SleepRequest::until_events([" "]).validate().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_duration_expiry_wakes_scheduled() {
        let scheduler = SleepScheduler::new();
        let s = session("debbie");
        scheduler
            .put_to_sleep(&s, &SleepRequest::for_duration(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(s.state(), SessionState::Sleeping);
        assert!(s.status().sleep_until.is_some());

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(scheduler.tick(Instant::now(), lookup_one(&s)).is_empty());
        assert_eq!(s.state(), SessionState::Sleeping);

        tokio::time::advance(Duration::from_secs(1)).await;
        let woke = scheduler.tick(Instant::now(), lookup_one(&s));
        assert_eq!(woke.len(), 1);
        assert_eq!(woke[0].reason, "scheduled");
        assert_eq!(s.state(), SessionState::Idle);
        assert_eq!(s.status().last_reason.as_deref(), Some("scheduled"));
        assert!(!scheduler.is_tracking("debbie"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_matching_event_wakes() {
        let scheduler = SleepScheduler::new();
        let s = session("debbie");
        scheduler
            .put_to_sleep(&s, &SleepRequest::until_events(["alert"]))
            .unwrap();

        scheduler.emit(WakeEvent::new("other", json!({})));
        assert!(scheduler.tick(Instant::now(), lookup_one(&s)).is_empty());

        scheduler.emit(WakeEvent::new("alert", json!({})));
        let woke = scheduler.tick(Instant::now(), lookup_one(&s));
        assert_eq!(woke[0].reason, "event:alert");
        assert_eq!(s.state(), SessionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_wins_over_expiry_in_same_tick() {
        let scheduler = SleepScheduler::new();
        let s = session("debbie");
        let request = SleepRequest::for_duration(Duration::from_secs(1)).with_event("alert");
        scheduler.put_to_sleep(&s, &request).unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        scheduler.emit(WakeEvent::new("alert", json!(null)));
        let woke = scheduler.tick(Instant::now(), lookup_one(&s));
        assert_eq!(woke[0].reason, "event:alert");
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_before_sleep_does_not_match() {
        let scheduler = SleepScheduler::new();
        let s = session("debbie");
        scheduler.emit(WakeEvent::new("alert", json!(null)));
        tokio::time::advance(Duration::from_millis(1)).await;
        scheduler
            .put_to_sleep(&s, &SleepRequest::until_events(["alert"]))
            .unwrap();

        assert!(scheduler.tick(Instant::now(), lookup_one(&s)).is_empty());
        assert_eq!(s.state(), SessionState::Sleeping);
    }

    #[test]
    fn test_manual_wake_is_idempotent() {
        let scheduler = SleepScheduler::new();
        let s = session("debbie");
        scheduler
            .put_to_sleep(&s, &SleepRequest::until_events(["never"]))
            .unwrap();

        assert!(scheduler.wake(&s, "manual"));
        assert!(!scheduler.wake(&s, "manual"));
        assert_eq!(s.state(), SessionState::Idle);
        assert_eq!(scheduler.sleeper_count(), 0);
    }

    #[test]
    fn test_sleep_requires_idle() {
        let scheduler = SleepScheduler::new();
        let s = session("busy");
        s.begin_task("t1").unwrap();
        let err = scheduler
            .put_to_sleep(&s, &SleepRequest::for_duration(Duration::from_secs(1)))
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidTransition { .. }));
        assert!(!scheduler.is_tracking("busy"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_past_deadline_wakes_next_tick() {
        let scheduler = SleepScheduler::new();
        let s = session("debbie");
        let past = Utc::now() - chrono::Duration::seconds(30);
        scheduler
            .resume_sleep(&s, Some(past), BTreeSet::new())
            .unwrap();
        assert_eq!(s.state(), SessionState::Sleeping);

        let woke = scheduler.tick(Instant::now(), lookup_one(&s));
        assert_eq!(woke[0].reason, "scheduled");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresolved_due_sleeper_is_kept() {
        let scheduler = SleepScheduler::new();
        let s = session("debbie");
        let past = Utc::now() - chrono::Duration::seconds(30);
        scheduler
            .resume_sleep(&s, Some(past), BTreeSet::new())
            .unwrap();

        // Registered with the scheduler but not yet visible to the lookup
        let woke = scheduler.tick(Instant::now(), |_| None);
        assert!(woke.is_empty());
        assert!(scheduler.is_tracking("debbie"));
        assert_eq!(s.state(), SessionState::Sleeping);

        let woke = scheduler.tick(Instant::now(), lookup_one(&s));
        assert_eq!(woke.len(), 1);
        assert_eq!(woke[0].reason, "scheduled");
        assert!(!scheduler.is_tracking("debbie"));
        assert_eq!(s.state(), SessionState::Idle);
    }
}
