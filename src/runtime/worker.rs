//! SessionWorker - the processing loop of one agent session
//!
//! Each session runs exactly one worker task. The worker is the only code
//! that moves its session between IDLE and ACTIVE, so tasks of one agent
//! execute strictly one at a time.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::core::{OrchestratorError, SessionState, Task, TaskKind};
use crate::delegate::{ExecutionDelegate, ExecutionOutcome};
use crate::events::{EventBus, OrchestratorEvent};
use crate::mailbox::{Inbox, MailReply, Mailbox};
use crate::persistence::StatePersistenceManager;
use crate::scheduler::SleepScheduler;
use crate::session::{AgentSession, MailRouter, Mailer, TaskContext};

/// Loop tuning taken from the orchestrator config
#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    /// Bound on one dequeue wait before the inbox is polled again
    pub poll_interval: Duration,
    /// Failures tolerated before the session is forced to STOPPED
    pub max_error_count: u32,
    /// Checkpoint after every task
    pub autosave: bool,
}

/// Processing unit for one session
pub struct SessionWorker {
    pub(crate) session: Arc<AgentSession>,
    pub(crate) inbox: Arc<Inbox>,
    pub(crate) mailbox: Arc<Mailbox>,
    pub(crate) scheduler: Arc<SleepScheduler>,
    pub(crate) delegate: Arc<dyn ExecutionDelegate>,
    pub(crate) router: Weak<dyn MailRouter>,
    pub(crate) persistence: Arc<StatePersistenceManager>,
    pub(crate) events: EventBus,
    pub(crate) settings: WorkerSettings,
    pub(crate) cancel: CancellationToken,
}

impl SessionWorker {
    fn agent_id(&self) -> &str {
        self.session.agent_id()
    }

    /// Run until the session stops or the worker is cancelled
    pub async fn run(self) {
        tracing::debug!(agent_id = self.agent_id(), "Session worker started");

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            match self.session.state() {
                SessionState::Stopped => break,
                SessionState::Sleeping => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = self.session.changed() => {}
                    }
                }
                SessionState::Idle => {
                    self.pull_mail();
                    let next = tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = self.session.changed() => None,
                        _ = self.inbox.arrived() => None,
                        task = self.session.queue().dequeue_timeout(self.settings.poll_interval) => task,
                    };
                    if let Some(task) = next {
                        self.process(task).await;
                    }
                }
                SessionState::Active | SessionState::Waiting => {
                    // Only reachable if a task outlived its own processing
                    tracing::warn!(
                        agent_id = self.agent_id(),
                        state = %self.session.state(),
                        "Worker found session busy between tasks"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = self.session.changed() => {}
                        _ = tokio::time::sleep(self.settings.poll_interval) => {}
                    }
                }
            }
        }

        self.mailbox.close_inbox_if(self.agent_id(), &self.inbox);
        tracing::debug!(agent_id = self.agent_id(), "Session worker stopped");
    }

    /// Move pending mail into the task queue (non-blocking)
    fn pull_mail(&self) {
        for (task_id, priority) in self.inbox.drain_into(self.session.queue()) {
            self.events.publish(OrchestratorEvent::TaskEnqueued {
                agent_id: self.agent_id().to_string(),
                task_id,
                priority,
                kind: TaskKind::Mail,
            });
        }
    }

    async fn process(&self, task: Task) {
        if self.session.begin_task(&task.id).is_err() {
            // Slept or stopped between dequeue and start
            tracing::debug!(
                agent_id = self.agent_id(),
                task_id = %task.id,
                "Session left IDLE, returning task to queue"
            );
            self.session.queue().requeue(task);
            return;
        }

        tracing::debug!(
            agent_id = self.agent_id(),
            task_id = %task.id,
            kind = ?task.kind,
            priority = %task.priority,
            "Executing task"
        );

        let chain = task
            .mail
            .as_ref()
            .map(|m| m.call_chain.clone())
            .unwrap_or_default();
        let ctx = TaskContext {
            agent_id: self.agent_id().to_string(),
            task: task.clone(),
            metadata: self.session.metadata(),
            mailer: Mailer::new(self.agent_id(), chain, self.router.clone()),
        };

        let result = match AssertUnwindSafe(self.delegate.execute(ctx))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => Err(anyhow::anyhow!(
                "execution delegate panicked: {}",
                panic_message(panic.as_ref())
            )),
        };

        match result {
            Ok(outcome) => self.complete(task, outcome),
            Err(err) => self.fail(task, err),
        }

        if self.settings.autosave {
            self.checkpoint().await;
        }
    }

    fn complete(&self, task: Task, outcome: ExecutionOutcome) {
        match outcome {
            ExecutionOutcome::Complete { output } => {
                self.reply(&task, Ok(output));
                self.finish(&task, false);
            }
            ExecutionOutcome::NeedsContinuation { reason, payload } => {
                let next = Task::continuation_of(&task, &reason, payload);
                let next_id = next.id.clone();
                let priority = next.priority;
                self.finish(&task, true);
                match self.session.queue().enqueue(next) {
                    Ok(_) => {
                        tracing::debug!(
                            agent_id = self.agent_id(),
                            parent_task_id = %task.id,
                            task_id = %next_id,
                            reason = %reason,
                            "Queued continuation"
                        );
                        self.events.publish(OrchestratorEvent::TaskEnqueued {
                            agent_id: self.agent_id().to_string(),
                            task_id: next_id,
                            priority,
                            kind: TaskKind::Continuation,
                        });
                    }
                    Err(err) => {
                        tracing::warn!(
                            agent_id = self.agent_id(),
                            task_id = %task.id,
                            error = %err,
                            "Could not queue continuation"
                        );
                        self.events
                            .publish(OrchestratorEvent::error(Some(self.agent_id()), &err));
                        self.reply(&task, Err(err));
                    }
                }
            }
            ExecutionOutcome::Sleep { output, request } => {
                self.reply(&task, Ok(output));
                self.finish(&task, false);
                if let Err(err) = self.scheduler.put_to_sleep(&self.session, &request) {
                    tracing::warn!(agent_id = self.agent_id(), error = %err, "Sleep after task refused");
                    self.events
                        .publish(OrchestratorEvent::error(Some(self.agent_id()), &err));
                }
            }
        }
    }

    /// ACTIVE -> IDLE and publish completion
    fn finish(&self, task: &Task, continued: bool) {
        if let Err(err) = self.session.finish_task() {
            // Stopped while the task ran
            tracing::debug!(agent_id = self.agent_id(), error = %err, "Task finished after stop");
        }
        self.events.publish(OrchestratorEvent::TaskCompleted {
            agent_id: self.agent_id().to_string(),
            task_id: task.id.clone(),
            continued,
        });
    }

    fn fail(&self, task: Task, err: anyhow::Error) {
        let error_count = self.session.record_error();
        let message = format!("{err:#}");
        tracing::warn!(
            agent_id = self.agent_id(),
            task_id = %task.id,
            error_count,
            error = %message,
            "Task execution failed"
        );

        let transient = OrchestratorError::TransientExecution(message.clone());
        self.events.publish(OrchestratorEvent::TaskFailed {
            agent_id: self.agent_id().to_string(),
            task_id: task.id.clone(),
            error: message,
            error_count,
        });
        self.events
            .publish(OrchestratorEvent::error(Some(self.agent_id()), &transient));
        self.reply(&task, Err(transient));

        if error_count > self.settings.max_error_count {
            let reason = format!(
                "error count {} exceeded threshold {}",
                error_count, self.settings.max_error_count
            );
            tracing::error!(agent_id = self.agent_id(), %reason, "Stopping session");
            self.session.stop(&reason);
            let fatal = OrchestratorError::FatalSession {
                agent_id: self.agent_id().to_string(),
                reason: reason.clone(),
            };
            self.events.publish(OrchestratorEvent::SessionFatal {
                agent_id: self.agent_id().to_string(),
                reason,
            });
            self.events
                .publish(OrchestratorEvent::error(Some(self.agent_id()), &fatal));
        } else if let Err(err) = self.session.finish_task() {
            tracing::debug!(agent_id = self.agent_id(), error = %err, "Task failed after stop");
        }
    }

    /// Answer the synchronous sender behind `task`, if one is waiting
    fn reply(&self, task: &Task, result: Result<Value, OrchestratorError>) {
        let Some(envelope) = task.mail.as_ref().filter(|m| m.expects_reply) else {
            return;
        };
        let agent_id = self.agent_id();
        let result = result.map(|body| MailReply::new(&envelope.message_id, agent_id, body));
        if !self.mailbox.resolve_reply(&envelope.message_id, result) {
            tracing::warn!(
                agent_id,
                message_id = %envelope.message_id,
                to = %envelope.from_agent,
                "Discarding late reply"
            );
            self.events.publish(OrchestratorEvent::MailReplyDiscarded {
                message_id: envelope.message_id.clone(),
                from_agent: agent_id.to_string(),
            });
        }
    }

    async fn checkpoint(&self) {
        match self.persistence.save_session_state(&self.session).await {
            Ok(_) => self.events.publish(OrchestratorEvent::CheckpointSaved {
                agent_id: self.agent_id().to_string(),
            }),
            Err(err) => {
                tracing::warn!(agent_id = self.agent_id(), error = %err, "Checkpoint failed");
                self.events
                    .publish(OrchestratorEvent::error(Some(self.agent_id()), &err));
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
