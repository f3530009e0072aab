//! Session runtime
//!
//! This module provides the infrastructure for running sessions:
//! - `SessionManager` - Creates sessions, routes mail, runs the scheduler
//! - `SessionHandle` - The manager's handle on one running session
//! - `SessionWorker` - The per-session processing loop
//!
//! Every session runs as its own tokio task. Cross-session traffic goes
//! through the mailbox and the event bus only.

pub mod handle;
pub mod manager;
pub mod worker;

pub use handle::SessionHandle;
pub use manager::{RestorePolicy, SessionManager, SessionManagerBuilder, SessionOptions};
pub use worker::{SessionWorker, WorkerSettings};
