//! EventBus - internal publish/subscribe layer
//!
//! Publishers never block: events go into a bounded mpsc queue that a single
//! worker task drains. The worker re-broadcasts each event to in-process
//! subscribers and forwards it to every registered `NotificationSink`.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use super::event::OrchestratorEvent;
use super::sink::NotificationSink;

/// Buffer size for the subscriber broadcast channel
pub const SUBSCRIBER_CHANNEL_SIZE: usize = 256;

/// Receiver half handed to subscribers
pub type EventReceiver = broadcast::Receiver<OrchestratorEvent>;

/// Cloneable publishing side of the bus
#[derive(Clone)]
pub struct EventBus {
    tx: mpsc::Sender<OrchestratorEvent>,
    subscribers: broadcast::Sender<OrchestratorEvent>,
}

impl EventBus {
    /// Create a bus and the worker that must be spawned to drive it
    pub fn new(buffer: usize, sinks: Vec<Arc<dyn NotificationSink>>) -> (Self, EventBusWorker) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let (subscribers, _) = broadcast::channel(SUBSCRIBER_CHANNEL_SIZE);
        let bus = Self {
            tx,
            subscribers: subscribers.clone(),
        };
        let worker = EventBusWorker {
            rx,
            subscribers,
            sinks,
        };
        (bus, worker)
    }

    /// Publish an event without waiting
    ///
    /// Events are dropped (with a warning) if the queue is full.
    pub fn publish(&self, event: OrchestratorEvent) {
        if let Err(e) = self.tx.try_send(event) {
            match e {
                mpsc::error::TrySendError::Full(event) => {
                    tracing::warn!(event = event.name(), "Event bus full, dropping event");
                }
                mpsc::error::TrySendError::Closed(event) => {
                    tracing::debug!(event = event.name(), "Event bus closed, dropping event");
                }
            }
        }
    }

    /// Subscribe to all events published from this point forward
    pub fn subscribe(&self) -> EventReceiver {
        self.subscribers.subscribe()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscribers.receiver_count())
            .finish()
    }
}

/// The single unit that drains the bus
pub struct EventBusWorker {
    rx: mpsc::Receiver<OrchestratorEvent>,
    subscribers: broadcast::Sender<OrchestratorEvent>,
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl EventBusWorker {
    /// Run until cancelled or every publisher is dropped
    ///
    /// On cancellation, events already queued are still delivered.
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                event = self.rx.recv() => match event {
                    Some(event) => self.dispatch(event).await,
                    None => break,
                },
                _ = cancel.cancelled() => {
                    while let Ok(event) = self.rx.try_recv() {
                        self.dispatch(event).await;
                    }
                    break;
                }
            }
        }
        tracing::debug!("Event bus worker stopped");
    }

    async fn dispatch(&self, event: OrchestratorEvent) {
        // No subscribers is not an error
        let _ = self.subscribers.send(event.clone());

        if self.sinks.is_empty() {
            return;
        }
        let name = event.name();
        let payload = event.payload();
        for sink in &self.sinks {
            sink.emit(name, payload.clone()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::sink::RecordingSink;

    fn created(id: &str) -> OrchestratorEvent {
        OrchestratorEvent::SessionCreated {
            agent_id: id.to_string(),
        }
    }

    #[tokio::test]
    async fn test_subscribers_receive_events_in_order() {
        let (bus, worker) = EventBus::new(16, Vec::new());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(worker.run(cancel.clone()));

        let mut rx = bus.subscribe();
        bus.publish(created("a"));
        bus.publish(created("b"));

        assert_eq!(rx.recv().await.unwrap(), created("a"));
        assert_eq!(rx.recv().await.unwrap(), created("b"));

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_sinks_receive_name_and_payload() {
        let sink = Arc::new(RecordingSink::new());
        let (bus, worker) = EventBus::new(16, vec![sink.clone()]);
        let cancel = CancellationToken::new();

        bus.publish(created("alice"));
        // Cancelling before the worker starts still drains queued events
        cancel.cancel();
        worker.run(cancel).await;

        let recorded = sink.events();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].0, "session.created");
        assert_eq!(recorded[0].1["agent_id"], "alice");
    }

    #[tokio::test]
    async fn test_full_bus_drops_instead_of_blocking() {
        let (bus, worker) = EventBus::new(1, Vec::new());
        bus.publish(created("kept"));
        bus.publish(created("dropped"));

        let sink = Arc::new(RecordingSink::new());
        let worker = EventBusWorker {
            sinks: vec![sink.clone()],
            ..worker
        };
        let cancel = CancellationToken::new();
        cancel.cancel();
        worker.run(cancel).await;

        let names: Vec<_> = sink
            .events()
            .into_iter()
            .map(|(_, payload)| payload["agent_id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["kept".to_string()]);
    }

    #[tokio::test]
    async fn test_worker_exits_when_publishers_dropped() {
        let (bus, worker) = EventBus::new(4, Vec::new());
        let task = tokio::spawn(worker.run(CancellationToken::new()));
        drop(bus);
        task.await.unwrap();
    }
}
