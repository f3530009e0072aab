//! Agent sessions
//!
//! This module provides `AgentSession`, the per-agent state machine with its
//! task queue, and `TaskContext`, what a delegate sees while it runs a task.

pub mod context;
pub mod session;

pub use context::{MailRouter, Mailer, TaskContext};
pub use session::{AgentSession, SessionInfo, SessionStatus};
