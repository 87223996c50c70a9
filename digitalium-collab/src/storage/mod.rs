//! Local durable cache for replicated documents.
//!
//! ```text
//! ┌─────────────┐  ReplicaUpdate   ┌──────────────┐  put_cf   ┌──────────────────────┐
//! │ ReplicaDoc  │ ───────────────► │ cache writer │ ────────► │ RocksDB CF "updates" │
//! │ (in-memory) │   (ordered mpsc) │ (tokio task) │           │ key: <ns>-<doc>/seq  │
//! └──────▲──────┘                  └──────────────┘           └──────────┬───────────┘
//!        │              restore on open                                   │
//!        └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Persistence failures are logged and never reach the editing path: the
//! in-memory replica stays authoritative for the running session.

pub mod cache;
pub mod entry;

pub use cache::{CacheConfig, CacheHandle, LocalStore};
pub use entry::{CacheEntry, EntryKind};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(String),
    #[error("codec error: {0}")]
    Codec(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("corrupt cache entry at sequence {sequence}")]
    Corrupt { sequence: u64 },
}

impl From<rocksdb::Error> for PersistenceError {
    fn from(e: rocksdb::Error) -> Self {
        PersistenceError::Database(e.to_string())
    }
}
