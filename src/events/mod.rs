//! Event bus and notification sinks
//!
//! - `OrchestratorEvent` - structured state-change notifications
//! - `EventBus` - publish/subscribe layer drained by one worker task
//! - `NotificationSink` - capability for surfacing events outside the core

pub mod bus;
pub mod event;
pub mod sink;

pub use bus::{EventBus, EventBusWorker, EventReceiver};
pub use event::OrchestratorEvent;
pub use sink::{NotificationSink, RecordingSink, TracingSink};
