//! fieldsync-core - offline-first sync engine for field service clients
//!
//! This crate contains the entity models, the durable SQLite store, the
//! mutation queue and the sync coordinator with its conflict engine. Every
//! local write is queued durably before it is pushed; server changes are
//! pulled incrementally and reconciled against pending local work.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod remote;
pub mod state;
pub mod store;
pub mod sync;
pub mod util;

pub use config::SyncConfig;
pub use db::SqliteStore;
pub use error::{Error, Result};
pub use models::{
    ConflictId, ConflictKind, ConflictRecord, EntitySnapshot, EntityType, OperationId,
    QueuedOperation, Resolution,
};
pub use remote::{ApplyResponse, ApplyStatus, ChangeBatch, RemoteApply};
pub use state::{SyncPhase, SyncStatus};
pub use store::LocalStore;
pub use sync::{EnqueueRequest, MutationQueue, SyncCoordinator, SyncTrigger};
