pub mod core;
pub mod queue;
pub mod session;
pub mod runtime;

// Messaging, scheduling and persistence services
pub mod mailbox;
pub mod scheduler;
pub mod persistence;

// Notification layer
pub mod events;

// The capability that actually performs tasks
pub mod delegate;

pub mod config;
pub mod logging;

pub use config::OrchestratorConfig;
pub use core::{OrchestratorError, OrchestratorResult, Priority, SessionState, Task};
pub use delegate::{EchoDelegate, ExecutionDelegate, ExecutionOutcome};
pub use runtime::{RestorePolicy, SessionManager, SessionOptions};
pub use scheduler::SleepRequest;
pub use session::TaskContext;
