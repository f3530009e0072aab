//! SessionManager - creates, drives and stops agent sessions
//!
//! The `SessionManager` is responsible for:
//! - Spawning one worker task per session
//! - Routing mail between sessions (async and synchronous)
//! - Running the scheduler ticker and the event bus worker
//! - Saving and restoring session snapshots
//!
//! Sessions are addressed by agent id only. Workers reach back into the
//! manager through a weak `MailRouter` reference, so dropping the last
//! `SessionManager` clone tears everything down.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::OrchestratorConfig;
use crate::core::{
    validate_agent_id, OrchestratorError, OrchestratorResult, Priority, SessionState, Task,
};
use crate::delegate::ExecutionDelegate;
use crate::events::{EventBus, EventReceiver, NotificationSink, OrchestratorEvent, TracingSink};
use crate::mailbox::{MailMessage, MailReply, Mailbox};
use crate::persistence::{
    FileBackend, MemoryBackend, PersistedSnapshot, PersistenceBackend, StatePersistenceManager,
};
use crate::scheduler::{SleepRequest, SleepScheduler, WakeEvent, REASON_HIGH_PRIORITY_MAIL};
use crate::session::{AgentSession, MailRouter, SessionInfo};

use super::handle::SessionHandle;
use super::worker::{SessionWorker, WorkerSettings};

/// Per-session overrides for `create_session_with`
#[derive(Clone, Default)]
pub struct SessionOptions {
    /// Delegate for this session instead of the manager default
    pub delegate: Option<Arc<dyn ExecutionDelegate>>,

    pub metadata: HashMap<String, Value>,

    /// Queue bound instead of `OrchestratorConfig::queue_capacity`
    pub queue_capacity: Option<usize>,
}

impl SessionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delegate(mut self, delegate: Arc<dyn ExecutionDelegate>) -> Self {
        self.delegate = Some(delegate);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }
}

impl std::fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionOptions")
            .field("custom_delegate", &self.delegate.is_some())
            .field("metadata", &self.metadata)
            .field("queue_capacity", &self.queue_capacity)
            .finish()
    }
}

/// What to do when a stored snapshot fails validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestorePolicy {
    /// Return the `CorruptState` error
    #[default]
    Abort,
    /// Delete the snapshot and start a fresh session under the same id
    DiscardAndReinitialize,
}

/// Builder for `SessionManager`
pub struct SessionManagerBuilder {
    config: OrchestratorConfig,
    delegate: Arc<dyn ExecutionDelegate>,
    sinks: Vec<Arc<dyn NotificationSink>>,
    backend: Option<Arc<dyn PersistenceBackend>>,
}

impl SessionManagerBuilder {
    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Add a notification sink; without any, events go to `TracingSink`
    pub fn sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Use an explicit snapshot backend instead of the configured one
    pub fn backend(mut self, backend: Arc<dyn PersistenceBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Start the manager's background units
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> OrchestratorResult<SessionManager> {
        let config = self.config;
        config.validate()?;

        let backend: Arc<dyn PersistenceBackend> = match (self.backend, &config.state_dir) {
            (Some(backend), _) => backend,
            (None, Some(dir)) => Arc::new(FileBackend::new(dir)?),
            (None, None) => Arc::new(MemoryBackend::new()),
        };
        let sinks = if self.sinks.is_empty() {
            vec![Arc::new(TracingSink) as Arc<dyn NotificationSink>]
        } else {
            self.sinks
        };

        let (events, bus_worker) = EventBus::new(config.event_buffer, sinks);
        let cancel = CancellationToken::new();
        let tick_interval = config.tick_interval;
        let persistence = Arc::new(StatePersistenceManager::new(backend, config.queue_capacity));

        let shared = Arc::new_cyclic(|self_ref| ManagerShared {
            config,
            delegate: self.delegate,
            sessions: RwLock::new(HashMap::new()),
            mailbox: Arc::new(Mailbox::new()),
            scheduler: Arc::new(SleepScheduler::new()),
            persistence,
            events,
            cancel: cancel.clone(),
            background: Mutex::new(Vec::new()),
            self_ref: self_ref.clone(),
        });

        let bus = tokio::spawn(bus_worker.run(cancel.clone()));
        let ticker = tokio::spawn(run_ticker(Arc::downgrade(&shared), tick_interval, cancel));
        shared.background.lock().extend([bus, ticker]);

        tracing::info!(
            tick_interval = ?shared.config.tick_interval,
            queue_capacity = shared.config.queue_capacity,
            "Session manager started"
        );
        Ok(SessionManager { shared })
    }
}

/// Entry point for all orchestration operations
///
/// Cheap to clone; all clones share the same sessions.
#[derive(Clone)]
pub struct SessionManager {
    shared: Arc<ManagerShared>,
}

struct ManagerShared {
    config: OrchestratorConfig,
    delegate: Arc<dyn ExecutionDelegate>,
    sessions: RwLock<HashMap<String, SessionHandle>>,
    mailbox: Arc<Mailbox>,
    scheduler: Arc<SleepScheduler>,
    persistence: Arc<StatePersistenceManager>,
    events: EventBus,
    cancel: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
    self_ref: Weak<ManagerShared>,
}

impl SessionManager {
    /// Start configuring a manager around a default delegate
    pub fn builder(delegate: Arc<dyn ExecutionDelegate>) -> SessionManagerBuilder {
        SessionManagerBuilder {
            config: OrchestratorConfig::default(),
            delegate,
            sinks: Vec::new(),
            backend: None,
        }
    }

    /// Manager with `config`, logging events through tracing
    pub fn new(config: OrchestratorConfig, delegate: Arc<dyn ExecutionDelegate>) -> OrchestratorResult<Self> {
        Self::builder(delegate).config(config).build()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.shared.config
    }

    // =========================================================================
    // Session lifecycle
    // =========================================================================

    /// Create an idle session with the default delegate
    pub fn create_session(&self, agent_id: &str) -> OrchestratorResult<SessionInfo> {
        self.create_session_with(agent_id, SessionOptions::default())
    }

    /// Create an idle session
    ///
    /// Fails with `AlreadyExists` while a live session holds the id. A
    /// stopped session is replaced.
    pub fn create_session_with(
        &self,
        agent_id: &str,
        options: SessionOptions,
    ) -> OrchestratorResult<SessionInfo> {
        let result = self.shared.create_session(agent_id, options);
        self.shared.report(Some(agent_id), result)
    }

    /// Stop a session and wait for its worker to exit
    ///
    /// Stopping an already stopped session succeeds without doing anything.
    pub async fn stop_session(&self, agent_id: &str) -> OrchestratorResult<()> {
        let result = self.shared.stop_session(agent_id).await;
        self.shared.report(Some(agent_id), result)
    }

    /// Current view of one session
    pub fn get_session_state(&self, agent_id: &str) -> OrchestratorResult<SessionInfo> {
        let result = self.shared.handle(agent_id).map(|h| h.info());
        self.shared.report(Some(agent_id), result)
    }

    /// All registered sessions, ordered by id
    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self
            .shared
            .sessions
            .read()
            .values()
            .map(|h| h.info())
            .collect();
        infos.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        infos
    }

    pub fn set_metadata(&self, agent_id: &str, key: impl Into<String>, value: Value) -> OrchestratorResult<()> {
        let result = self
            .shared
            .handle(agent_id)
            .map(|h| h.session().set_metadata(key, value));
        self.shared.report(Some(agent_id), result)
    }

    /// Stream of every event published from now on
    pub fn subscribe(&self) -> EventReceiver {
        self.shared.events.subscribe()
    }

    // =========================================================================
    // Tasks and mail
    // =========================================================================

    /// Queue a direct task, returning its id
    pub fn enqueue_task(&self, agent_id: &str, payload: Value, priority: Priority) -> OrchestratorResult<String> {
        self.enqueue_task_with(agent_id, Task::direct(payload, priority))
    }

    /// Queue a prepared task
    pub fn enqueue_task_with(&self, agent_id: &str, task: Task) -> OrchestratorResult<String> {
        let result = self.shared.enqueue_task(agent_id, task);
        self.shared.report(Some(agent_id), result)
    }

    /// Fire-and-forget mail; returns the message id
    ///
    /// `from` need not be a registered session. HIGH priority mail wakes a
    /// sleeping recipient.
    pub async fn send_mail(
        &self,
        from: &str,
        to: &str,
        subject: &str,
        body: &str,
        priority: Priority,
    ) -> OrchestratorResult<String> {
        let message = MailMessage::new(from, to, subject, body, priority);
        self.shared.route_mail(message).await
    }

    /// Synchronous mail; waits for the recipient's reply
    ///
    /// `timeout` defaults to `OrchestratorConfig::default_mail_timeout`.
    /// On expiry the call fails with `Timeout` and the recipient's eventual
    /// answer is discarded. Delegates that want their own session to wait in
    /// WAITING use `TaskContext::mailer` instead.
    pub async fn send_mail_with_switch(
        &self,
        from: &str,
        to: &str,
        subject: &str,
        body: &str,
        timeout: Option<Duration>,
    ) -> OrchestratorResult<MailReply> {
        let timeout = timeout.unwrap_or(self.shared.config.default_mail_timeout);
        self.shared
            .route_sync(from, to, subject, body, &[], timeout, false)
            .await
    }

    // =========================================================================
    // Sleep and wake
    // =========================================================================

    /// Put an idle session to sleep
    pub async fn sleep(&self, agent_id: &str, request: SleepRequest) -> OrchestratorResult<()> {
        let result = self.shared.sleep(agent_id, &request).await;
        self.shared.report(Some(agent_id), result)
    }

    /// Wake a sleeping session now
    ///
    /// Returns false if the session was not sleeping.
    pub fn wake(&self, agent_id: &str, reason: &str) -> OrchestratorResult<bool> {
        let result = self
            .shared
            .handle(agent_id)
            .map(|h| self.shared.scheduler.wake(h.session(), reason));
        self.shared.report(Some(agent_id), result)
    }

    /// Signal every session; sleepers waiting on `name` wake on the next tick
    pub fn broadcast_event(&self, name: &str, payload: Value) -> OrchestratorResult<()> {
        if name.trim().is_empty() {
            let err = OrchestratorError::validation("event name must not be empty");
            return self.shared.report(None, Err(err));
        }
        tracing::debug!(event = name, "Broadcasting wake event");
        self.shared.scheduler.emit(WakeEvent::new(name, payload.clone()));
        self.shared.events.publish(OrchestratorEvent::WakeEventBroadcast {
            name: name.to_string(),
            payload,
        });
        Ok(())
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Write a snapshot of one session
    pub async fn save_session_state(&self, agent_id: &str) -> OrchestratorResult<PersistedSnapshot> {
        let result = self.shared.save(agent_id).await;
        self.shared.report(Some(agent_id), result)
    }

    /// Recreate a session from its snapshot
    ///
    /// A session that was ACTIVE or WAITING comes back IDLE (its running
    /// task is not part of the snapshot), a STOPPED one comes back IDLE with
    /// its error count reset, and a SLEEPING one resumes its sleep.
    pub async fn restore_session(&self, agent_id: &str, policy: RestorePolicy) -> OrchestratorResult<SessionInfo> {
        let result = self.shared.restore_session(agent_id, policy).await;
        self.shared.report(Some(agent_id), result)
    }

    /// Restore every stored snapshot without a live session
    pub async fn restore_all(&self, policy: RestorePolicy) -> OrchestratorResult<Vec<String>> {
        let ids = match self.shared.persistence.list_agent_ids().await {
            Ok(ids) => ids,
            Err(err) => return self.shared.report(None, Err(err)),
        };
        let mut restored = Vec::new();
        for agent_id in ids {
            if self.shared.is_live(&agent_id) {
                continue;
            }
            self.restore_session(&agent_id, policy).await?;
            restored.push(agent_id);
        }
        Ok(restored)
    }

    /// Delete snapshots older than `max_age`, except those of live sessions
    pub async fn cleanup_old_states(&self, max_age: Duration) -> OrchestratorResult<Vec<String>> {
        let shared = &self.shared;
        let result = shared
            .persistence
            .cleanup_old_states_except(max_age, |id| shared.is_live(id))
            .await;
        shared.report(None, result)
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Stop every session, then the scheduler and event bus
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.shared.sessions.read().keys().cloned().collect();
        let stops = ids.iter().map(|id| self.shared.stop_session(id));
        for (id, result) in ids.iter().zip(futures::future::join_all(stops).await) {
            if let Err(err) = result {
                tracing::warn!(agent_id = %id, error = %err, "Failed to stop session during shutdown");
            }
        }

        self.shared.cancel.cancel();
        let background: Vec<JoinHandle<()>> = std::mem::take(&mut *self.shared.background.lock());
        for handle in background {
            let _ = handle.await;
        }
        tracing::info!(sessions = ids.len(), "Session manager shut down");
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("sessions", &self.shared.sessions.read().len())
            .field("mailbox", &self.shared.mailbox)
            .field("scheduler", &self.shared.scheduler)
            .finish()
    }
}

impl ManagerShared {
    /// Publish an error event for a failed operation and pass the result on
    fn report<T>(&self, agent_id: Option<&str>, result: OrchestratorResult<T>) -> OrchestratorResult<T> {
        if let Err(err) = &result {
            tracing::debug!(agent_id, kind = err.kind(), error = %err, "Operation failed");
            self.events.publish(OrchestratorEvent::error(agent_id, err));
        }
        result
    }

    fn handle(&self, agent_id: &str) -> OrchestratorResult<SessionHandle> {
        self.sessions
            .read()
            .get(agent_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::SessionNotFound(agent_id.to_string()))
    }

    fn session(&self, agent_id: &str) -> Option<Arc<AgentSession>> {
        self.sessions.read().get(agent_id).map(|h| h.session().clone())
    }

    /// Registered and not stopped
    fn is_live(&self, agent_id: &str) -> bool {
        self.sessions
            .read()
            .get(agent_id)
            .is_some_and(|h| h.state() != SessionState::Stopped)
    }

    /// Session that can still accept work
    fn live_session(&self, agent_id: &str) -> OrchestratorResult<Arc<AgentSession>> {
        let session = self
            .session(agent_id)
            .ok_or_else(|| OrchestratorError::SessionNotFound(agent_id.to_string()))?;
        if session.state() == SessionState::Stopped {
            return Err(OrchestratorError::SessionStopped(agent_id.to_string()));
        }
        Ok(session)
    }

    fn new_session(&self, agent_id: &str, capacity: usize, metadata: HashMap<String, Value>) -> Arc<AgentSession> {
        Arc::new(AgentSession::new(agent_id, capacity, metadata, self.events.clone()))
    }

    /// Open the inbox and spawn the worker for a prepared session
    fn spawn_worker(&self, session: Arc<AgentSession>, delegate: Arc<dyn ExecutionDelegate>) -> SessionHandle {
        let inbox = self.mailbox.open_inbox(session.agent_id());
        let cancel = self.cancel.child_token();
        let router: Weak<dyn MailRouter> = self.self_ref.clone();
        let worker = SessionWorker {
            session: session.clone(),
            inbox: inbox.clone(),
            mailbox: self.mailbox.clone(),
            scheduler: self.scheduler.clone(),
            delegate,
            router,
            persistence: self.persistence.clone(),
            events: self.events.clone(),
            settings: WorkerSettings {
                poll_interval: self.config.poll_interval,
                max_error_count: self.config.max_error_count,
                autosave: self.config.autosave,
            },
            cancel: cancel.clone(),
        };
        let join = tokio::spawn(worker.run());
        SessionHandle::new(session, inbox, cancel, join)
    }

    /// Reject ids held by a live session; clear leftovers of a stopped one
    fn claim_id(&self, sessions: &HashMap<String, SessionHandle>, agent_id: &str) -> OrchestratorResult<()> {
        if let Some(existing) = sessions.get(agent_id) {
            if existing.state() != SessionState::Stopped {
                return Err(OrchestratorError::AlreadyExists(agent_id.to_string()));
            }
            tracing::info!(agent_id, "Replacing stopped session");
            self.scheduler.forget(agent_id);
        }
        Ok(())
    }

    fn create_session(&self, agent_id: &str, options: SessionOptions) -> OrchestratorResult<SessionInfo> {
        validate_agent_id(agent_id)?;
        let capacity = options.queue_capacity.unwrap_or(self.config.queue_capacity);
        if capacity == 0 {
            return Err(OrchestratorError::validation("queue capacity must be positive"));
        }
        let delegate = options.delegate.unwrap_or_else(|| self.delegate.clone());

        let info = {
            let mut sessions = self.sessions.write();
            self.claim_id(&sessions, agent_id)?;
            let session = self.new_session(agent_id, capacity, options.metadata);
            let handle = self.spawn_worker(session, delegate);
            let info = handle.info();
            sessions.insert(agent_id.to_string(), handle);
            info
        };

        tracing::info!(agent_id, capacity, "Session created");
        self.events.publish(OrchestratorEvent::SessionCreated {
            agent_id: agent_id.to_string(),
        });
        Ok(info)
    }

    async fn stop_session(&self, agent_id: &str) -> OrchestratorResult<()> {
        let handle = self.handle(agent_id)?;
        let stopped_now = handle.session().stop("stop requested");
        self.scheduler.forget(agent_id);
        self.mailbox.close_inbox_if(agent_id, handle.inbox());

        if !handle.shutdown(self.config.stop_drain_timeout).await {
            tracing::warn!(agent_id, "Session worker aborted after drain timeout");
        }
        if !stopped_now {
            return Ok(());
        }

        tracing::info!(agent_id, "Session stopped");
        if self.config.autosave {
            self.checkpoint(handle.session()).await;
        }
        self.events.publish(OrchestratorEvent::SessionStopped {
            agent_id: agent_id.to_string(),
        });
        Ok(())
    }

    fn enqueue_task(&self, agent_id: &str, task: Task) -> OrchestratorResult<String> {
        let session = self.live_session(agent_id)?;
        let (priority, kind) = (task.priority, task.kind);
        let task_id = session.queue().enqueue(task)?;
        tracing::debug!(agent_id, task_id = %task_id, %priority, "Task enqueued");
        self.events.publish(OrchestratorEvent::TaskEnqueued {
            agent_id: agent_id.to_string(),
            task_id: task_id.clone(),
            priority,
            kind,
        });
        Ok(task_id)
    }

    /// Force a sleeping recipient awake for HIGH priority mail
    fn wake_for_mail(&self, recipient: &AgentSession, priority: Priority) {
        if priority == Priority::High && recipient.state() == SessionState::Sleeping {
            self.scheduler.wake(recipient, REASON_HIGH_PRIORITY_MAIL);
        }
    }

    fn deliver_mail(&self, message: MailMessage) -> OrchestratorResult<String> {
        validate_agent_id(&message.from_agent)?;
        validate_agent_id(&message.to_agent)?;
        let recipient = self.live_session(&message.to_agent)?;

        let (from, to, priority) = (message.from_agent.clone(), message.to_agent.clone(), message.priority);
        self.wake_for_mail(&recipient, priority);
        let message_id = self.mailbox.deliver(message)?;

        tracing::debug!(message_id = %message_id, %from, %to, %priority, "Mail delivered");
        self.events.publish(OrchestratorEvent::MailSent {
            message_id: message_id.clone(),
            from_agent: from,
            to_agent: to,
            priority,
            synchronous: false,
        });
        Ok(message_id)
    }

    #[allow(clippy::too_many_arguments)]
    async fn deliver_sync(
        &self,
        from: &str,
        to: &str,
        subject: &str,
        body: &str,
        chain: &[String],
        timeout: Duration,
        switch_sender: bool,
    ) -> OrchestratorResult<MailReply> {
        validate_agent_id(from)?;
        validate_agent_id(to)?;
        if timeout.is_zero() {
            return Err(OrchestratorError::validation("mail timeout must be positive"));
        }
        let message = MailMessage::synchronous(from, to, subject, body, chain)?;
        let recipient = self.live_session(to)?;
        let sender = if switch_sender { Some(self.live_session(from)?) } else { None };

        let message_id = message.id.clone();
        let reply_rx = self.mailbox.expect_reply(&message);
        if let Some(sender) = &sender {
            if let Err(err) = sender.begin_wait(&message_id) {
                self.mailbox.forget_reply(&message_id);
                return Err(err);
            }
        }

        self.wake_for_mail(&recipient, Priority::High);
        if let Err(err) = self.mailbox.deliver(message) {
            self.mailbox.forget_reply(&message_id);
            if let Some(sender) = &sender {
                let _ = sender.end_wait("delivery failed");
            }
            return Err(err);
        }
        tracing::debug!(message_id = %message_id, from, to, ?timeout, "Synchronous mail delivered, waiting for reply");
        self.events.publish(OrchestratorEvent::MailSent {
            message_id: message_id.clone(),
            from_agent: from.to_string(),
            to_agent: to.to_string(),
            priority: Priority::High,
            synchronous: true,
        });

        let outcome = match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(OrchestratorError::ChannelClosed),
            Err(_) => {
                self.mailbox.forget_reply(&message_id);
                tracing::warn!(message_id = %message_id, from, to, ?timeout, "Synchronous mail timed out");
                Err(OrchestratorError::timeout(format!("reply from {to}"), timeout))
            }
        };

        if let Some(sender) = &sender {
            let reason = match &outcome {
                Ok(_) => "reply received",
                Err(OrchestratorError::Timeout { .. }) => "reply timed out",
                Err(_) => "reply failed",
            };
            if let Err(err) = sender.end_wait(reason) {
                // Sender was stopped while waiting
                tracing::debug!(agent_id = from, error = %err, "Sender left WAITING before the reply");
            }
        }
        outcome
    }

    async fn sleep(&self, agent_id: &str, request: &SleepRequest) -> OrchestratorResult<()> {
        let session = self.live_session(agent_id)?;
        self.scheduler.put_to_sleep(&session, request)?;
        if self.config.autosave {
            self.checkpoint(&session).await;
        }
        Ok(())
    }

    async fn save(&self, agent_id: &str) -> OrchestratorResult<PersistedSnapshot> {
        let handle = self.handle(agent_id)?;
        let snapshot = self.persistence.save_session_state(handle.session()).await?;
        self.events.publish(OrchestratorEvent::CheckpointSaved {
            agent_id: agent_id.to_string(),
        });
        Ok(snapshot)
    }

    /// Best-effort save used by autosave
    async fn checkpoint(&self, session: &AgentSession) {
        match self.persistence.save_session_state(session).await {
            Ok(_) => self.events.publish(OrchestratorEvent::CheckpointSaved {
                agent_id: session.agent_id().to_string(),
            }),
            Err(err) => {
                tracing::warn!(agent_id = session.agent_id(), error = %err, "Checkpoint failed");
                self.events
                    .publish(OrchestratorEvent::error(Some(session.agent_id()), &err));
            }
        }
    }

    async fn restore_session(&self, agent_id: &str, policy: RestorePolicy) -> OrchestratorResult<SessionInfo> {
        validate_agent_id(agent_id)?;
        if self.is_live(agent_id) {
            return Err(OrchestratorError::AlreadyExists(agent_id.to_string()));
        }

        let snapshot = match self.persistence.restore_session_state(agent_id).await {
            Ok(snapshot) => snapshot,
            Err(err @ OrchestratorError::CorruptState { .. })
                if policy == RestorePolicy::DiscardAndReinitialize =>
            {
                tracing::warn!(agent_id, error = %err, "Discarding corrupt snapshot");
                self.events.publish(OrchestratorEvent::error(Some(agent_id), &err));
                self.persistence.delete(agent_id).await?;
                return self.create_session(agent_id, SessionOptions::default());
            }
            Err(err) => return Err(err),
        };
        self.install_snapshot(snapshot)
    }

    /// Rebuild a session from a validated snapshot and start its worker
    fn install_snapshot(&self, snapshot: PersistedSnapshot) -> OrchestratorResult<SessionInfo> {
        let agent_id = snapshot.agent_id.clone();
        let capacity = snapshot.queue_capacity.unwrap_or(self.config.queue_capacity);
        let pending = snapshot.pending_tasks.len();

        let info = {
            let mut sessions = self.sessions.write();
            self.claim_id(&sessions, &agent_id)?;

            let session = self.new_session(&agent_id, capacity, snapshot.metadata);
            for mut task in snapshot.pending_tasks {
                // Nobody is waiting on replies from before the restart
                if let Some(envelope) = task.mail.as_mut() {
                    envelope.expects_reply = false;
                }
                session.queue().enqueue(task)?;
            }
            match snapshot.state {
                SessionState::Sleeping => {
                    self.scheduler
                        .resume_sleep(&session, snapshot.sleep_until, snapshot.wake_events)?;
                }
                SessionState::Active | SessionState::Waiting => {
                    tracing::info!(agent_id = %agent_id, state = %snapshot.state, "In-flight task not resumed");
                }
                SessionState::Stopped => {
                    tracing::info!(agent_id = %agent_id, "Reinitializing stopped session");
                }
                SessionState::Idle => {}
            }

            let handle = self.spawn_worker(session, self.delegate.clone());
            let info = handle.info();
            sessions.insert(agent_id.clone(), handle);
            info
        };

        tracing::info!(agent_id = %agent_id, state = %info.state, pending, "Session restored");
        self.events.publish(OrchestratorEvent::SessionRestored {
            agent_id,
            state: info.state,
            pending_tasks: pending,
        });
        Ok(info)
    }

    /// One scheduler evaluation
    fn tick(&self) {
        // Registry before scheduler, the same order install_snapshot takes
        let sessions = self.sessions.read();
        let woke = self
            .scheduler
            .tick(Instant::now(), |id| sessions.get(id).map(|h| h.session().clone()));
        drop(sessions);
        for decision in woke {
            tracing::debug!(agent_id = %decision.agent_id, reason = %decision.reason, "Scheduler woke session");
        }
    }
}

#[async_trait]
impl MailRouter for ManagerShared {
    async fn route_mail(&self, message: MailMessage) -> OrchestratorResult<String> {
        let from = message.from_agent.clone();
        let result = self.deliver_mail(message);
        self.report(Some(&from), result)
    }

    async fn route_sync(
        &self,
        from: &str,
        to: &str,
        subject: &str,
        body: &str,
        chain: &[String],
        timeout: Duration,
        switch_sender: bool,
    ) -> OrchestratorResult<MailReply> {
        let result = self
            .deliver_sync(from, to, subject, body, chain, timeout, switch_sender)
            .await;
        self.report(Some(from), result)
    }
}

impl Drop for ManagerShared {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_ticker(shared: Weak<ManagerShared>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.tick();
    }
    tracing::debug!("Scheduler ticker stopped");
}
