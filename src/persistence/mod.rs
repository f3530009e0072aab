//! Session state persistence
//!
//! - `PersistedSnapshot` - schema-versioned record of one session
//! - `PersistenceBackend` - byte store with atomic writes (`FileBackend`, `MemoryBackend`)
//! - `StatePersistenceManager` - save/restore/cleanup with per-key locking

pub mod backend;
pub mod manager;
pub mod snapshot;

pub use backend::{FileBackend, MemoryBackend, PersistenceBackend};
pub use manager::StatePersistenceManager;
pub use snapshot::{PersistedSnapshot, SCHEMA_VERSION};
