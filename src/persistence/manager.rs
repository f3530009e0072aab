//! StatePersistenceManager - snapshot save, load and cleanup
//!
//! Writes to one agent id are serialized by a per-key lock; reads of a key
//! run concurrently as long as no write to it is in progress.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::RwLock;

use crate::core::{OrchestratorError, OrchestratorResult};
use crate::session::AgentSession;

use super::backend::PersistenceBackend;
use super::snapshot::PersistedSnapshot;

/// Saves and restores session snapshots through a backend
pub struct StatePersistenceManager {
    backend: Arc<dyn PersistenceBackend>,
    locks: Mutex<HashMap<String, Arc<RwLock<()>>>>,
    /// Pending-task bound for snapshots that record no capacity
    default_capacity: usize,
}

impl StatePersistenceManager {
    pub fn new(backend: Arc<dyn PersistenceBackend>, default_capacity: usize) -> Self {
        Self {
            backend,
            locks: Mutex::new(HashMap::new()),
            default_capacity,
        }
    }

    fn key_lock(&self, agent_id: &str) -> Arc<RwLock<()>> {
        self.locks
            .lock()
            .entry(agent_id.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Drop the caller's clone of a key lock, evicting the entry once no
    /// other save, load or delete holds it
    ///
    /// The map lock is held across the drop and the count check, so a
    /// concurrent `key_lock` either sees the entry gone or bumps the count.
    fn release_lock(&self, agent_id: &str, lock: Arc<RwLock<()>>) {
        let mut locks = self.locks.lock();
        drop(lock);
        if locks.get(agent_id).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(agent_id);
        }
    }

    /// Capture `session` and write it atomically
    pub async fn save_session_state(
        &self,
        session: &AgentSession,
    ) -> OrchestratorResult<PersistedSnapshot> {
        let snapshot = PersistedSnapshot::capture(session);
        self.save_snapshot(&snapshot).await?;
        Ok(snapshot)
    }

    /// Write an already captured snapshot
    pub async fn save_snapshot(&self, snapshot: &PersistedSnapshot) -> OrchestratorResult<()> {
        let bytes = snapshot.to_bytes()?;
        let lock = self.key_lock(&snapshot.agent_id);
        let written = {
            let _guard = lock.write().await;
            self.backend.write(&snapshot.agent_id, bytes).await
        };
        self.release_lock(&snapshot.agent_id, lock);
        written?;
        tracing::debug!(
            agent_id = %snapshot.agent_id,
            state = %snapshot.state,
            pending = snapshot.pending_tasks.len(),
            "Saved session snapshot"
        );
        Ok(())
    }

    /// Load and validate a snapshot; `None` if none is stored
    pub async fn load(&self, agent_id: &str) -> OrchestratorResult<Option<PersistedSnapshot>> {
        let lock = self.key_lock(agent_id);
        let bytes = {
            let _guard = lock.read().await;
            self.backend.read(agent_id).await
        };
        self.release_lock(agent_id, lock);
        bytes?
            .map(|b| PersistedSnapshot::from_bytes(agent_id, &b, self.default_capacity))
            .transpose()
    }

    /// Load a snapshot that must exist
    ///
    /// Fails with `SessionNotFound` if nothing is stored and `CorruptState`
    /// if the record does not validate.
    pub async fn restore_session_state(&self, agent_id: &str) -> OrchestratorResult<PersistedSnapshot> {
        self.load(agent_id)
            .await?
            .ok_or_else(|| OrchestratorError::SessionNotFound(agent_id.to_string()))
    }

    /// Remove a stored snapshot
    pub async fn delete(&self, agent_id: &str) -> OrchestratorResult<bool> {
        let lock = self.key_lock(agent_id);
        let deleted = {
            let _guard = lock.write().await;
            self.backend.delete(agent_id).await
        };
        self.release_lock(agent_id, lock);
        deleted
    }

    /// Agent ids that have a stored snapshot
    pub async fn list_agent_ids(&self) -> OrchestratorResult<Vec<String>> {
        self.backend.list_keys().await
    }

    /// Delete snapshots whose checkpoint is at least `max_age` old
    pub async fn cleanup_old_states(&self, max_age: Duration) -> OrchestratorResult<Vec<String>> {
        self.cleanup_old_states_except(max_age, |_| false).await
    }

    /// `cleanup_old_states`, leaving ids for which `keep` returns true
    ///
    /// Unreadable snapshots are left in place for inspection.
    pub async fn cleanup_old_states_except<F>(
        &self,
        max_age: Duration,
        keep: F,
    ) -> OrchestratorResult<Vec<String>>
    where
        F: Fn(&str) -> bool,
    {
        let mut removed = Vec::new();
        for agent_id in self.list_agent_ids().await? {
            if keep(&agent_id) {
                continue;
            }
            let snapshot = match self.load(&agent_id).await {
                Ok(Some(snapshot)) => snapshot,
                Ok(None) => continue,
                Err(err) => {
                    tracing::warn!(agent_id, error = %err, "Skipping unreadable snapshot during cleanup");
                    continue;
                }
            };
            if snapshot.age() >= max_age && self.delete(&agent_id).await? {
                removed.push(agent_id);
            }
        }
        if !removed.is_empty() {
            tracing::info!(count = removed.len(), ?max_age, "Removed old session snapshots");
        }
        Ok(removed)
    }
}

impl std::fmt::Debug for StatePersistenceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatePersistenceManager")
            .field("default_capacity", &self.default_capacity)
            .finish()
    }
}
