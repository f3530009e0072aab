//! Core types for the orchestrator
//!
//! - `SessionState` - agent lifecycle state machine
//! - `Task` / `Priority` - units of work and their ordering tiers
//! - `OrchestratorError` - error taxonomy
//! - `validate_agent_id` - path-safe agent ids

pub mod error;
pub mod id;
pub mod state;
pub mod task;

pub use error::{OrchestratorError, OrchestratorResult};
pub use id::validate_agent_id;
pub use state::SessionState;
pub use task::{MailEnvelope, Priority, Task, TaskKind};
