//! # digitalium-collab: sync engine for DIGITALIUM documents
//!
//! Keeps an in-memory CRDT replica, a local durable cache and a remote
//! document repository converging while several users edit one document.
//!
//! ## Architecture
//!
//! ```text
//!                ┌──────────────────────────────┐
//!   editor ────► │ SyncSession                  │ ◄──── change feed
//!                │  ReplicaDoc (Yrs)            │
//!                │  driver: debounce, echo drop │ ────► write(full snapshot)
//!                └──────┬───────────────┬───────┘
//!                       │               │
//!                       ▼               ▼
//!                ┌─────────────┐  ┌──────────────────┐
//!                │ LocalStore  │  │ PresenceTracker  │ ──► presence rows
//!                │ (RocksDB)   │  │ (heartbeat, TTL) │
//!                └─────────────┘  └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`session`]: sync coordinator: debounce, single in-flight push, retry
//! - [`storage`]: RocksDB update cache with compaction
//! - [`repository`]: repository traits, change feeds, in-memory backend
//! - [`presence`]: per-session presence heartbeat and peer listing
//! - [`lifecycle`]: creation, status workflow, archival, collaborators
//! - [`config`] / [`retry`]: timing knobs and backoff

pub mod config;
pub mod lifecycle;
pub mod presence;
pub mod repository;
pub mod retry;
pub mod session;
pub mod storage;

pub use config::SyncConfig;
pub use lifecycle::DocumentLifecycle;
pub use presence::PresenceTracker;
pub use repository::{
    DocumentRepository, DocumentWrite, MemoryRepository, PresenceChange, PresenceRepository,
    RepositoryError, SessionBackend,
};
pub use retry::RetryPolicy;
pub use session::{SessionError, SessionEvent, SyncSession, SyncState};
pub use storage::{CacheConfig, CacheHandle, LocalStore, PersistenceError};
