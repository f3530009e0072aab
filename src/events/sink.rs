//! Notification sinks - where events leave the core

use async_trait::async_trait;
use serde_json::Value;

/// External consumer of orchestrator events (e.g. a WebSocket layer)
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Receive one event
    ///
    /// Called from the bus worker; slow sinks delay later events.
    async fn emit(&self, event_name: &str, payload: Value);
}

/// Sink that writes every event to the tracing log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

#[async_trait]
impl NotificationSink for TracingSink {
    async fn emit(&self, event_name: &str, payload: Value) {
        if event_name == "error" || event_name == "session.fatal" {
            tracing::warn!(event = event_name, %payload, "orchestrator event");
        } else {
            tracing::debug!(event = event_name, %payload, "orchestrator event");
        }
    }
}

/// Sink that keeps every event in memory
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: parking_lot::Mutex<Vec<(String, Value)>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far
    pub fn events(&self) -> Vec<(String, Value)> {
        self.events.lock().clone()
    }

    /// Names of recorded events, in order
    pub fn names(&self) -> Vec<String> {
        self.events.lock().iter().map(|(n, _)| n.clone()).collect()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn emit(&self, event_name: &str, payload: Value) {
        self.events.lock().push((event_name.to_string(), payload));
    }
}
