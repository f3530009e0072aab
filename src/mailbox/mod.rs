//! Inter-agent mail
//!
//! - `MailMessage` / `MailReply` - wire types
//! - `Mailbox` - per-agent inboxes plus the synchronous reply table
//! - `check_call_chain` - cycle guard for synchronous delegation
//!
//! Messages address agents by id only; nothing here holds a session.

pub mod message;
pub mod store;

pub use message::{check_call_chain, MailMessage, MailReply};
pub use store::{Inbox, Mailbox, ReplyResult};
