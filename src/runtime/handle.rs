//! SessionHandle - the manager's grip on a running session
//!
//! Cloneable. Holds the session, its inbox, and the worker task so the
//! manager can stop the worker and wait for it to drain.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::SessionState;
use crate::mailbox::Inbox;
use crate::session::{AgentSession, SessionInfo};

/// Handle for one registered session
#[derive(Clone)]
pub struct SessionHandle {
    session: Arc<AgentSession>,
    inbox: Arc<Inbox>,
    cancel: CancellationToken,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SessionHandle {
    pub fn new(
        session: Arc<AgentSession>,
        inbox: Arc<Inbox>,
        cancel: CancellationToken,
        worker: JoinHandle<()>,
    ) -> Self {
        Self {
            session,
            inbox,
            cancel,
            worker: Arc::new(Mutex::new(Some(worker))),
        }
    }

    pub fn agent_id(&self) -> &str {
        self.session.agent_id()
    }

    pub fn session(&self) -> &Arc<AgentSession> {
        &self.session
    }

    pub fn inbox(&self) -> &Arc<Inbox> {
        &self.inbox
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn info(&self) -> SessionInfo {
        self.session.info()
    }

    /// Whether the worker task is still running
    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
            && self
                .worker
                .try_lock()
                .map(|w| w.as_ref().is_some_and(|h| !h.is_finished()))
                .unwrap_or(true)
    }

    /// Cancel the worker and wait up to `drain` for it to exit
    ///
    /// A worker that does not finish in time (a delegate that ignores its
    /// stop) is aborted and awaited, so nothing it owns outlives this call.
    /// Returns true if it exited on its own.
    pub async fn shutdown(&self, drain: Duration) -> bool {
        self.cancel.cancel();
        self.session.notify_changed();

        let Some(mut worker) = self.worker.lock().await.take() else {
            return true;
        };
        match tokio::time::timeout(drain, &mut worker).await {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                tracing::warn!(agent_id = self.agent_id(), error = %err, "Session worker ended abnormally");
                true
            }
            Err(_) => {
                tracing::warn!(
                    agent_id = self.agent_id(),
                    ?drain,
                    "Session worker did not drain in time, aborting"
                );
                worker.abort();
                // The delegate future is only dropped once the abort lands
                let _ = worker.await;
                false
            }
        }
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("agent_id", &self.agent_id())
            .field("state", &self.state())
            .finish()
    }
}
