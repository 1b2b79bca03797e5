//! Local store adapter interface
//!
//! The durable on-device store holds entity snapshots and the queue, conflict
//! and sync-state tables. Every method is atomic: implementations must commit
//! or roll back each call as a unit, because the queue and conflict tables are
//! only ever mutated through these operations.

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{
    ConflictId, ConflictRecord, EntitySnapshot, EntityType, LocalEntity, OperationId,
    OperationStatus, QueuedOperation,
};

/// Result of appending an operation to the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended(OperationId),
    /// The most recent live operation for the entity has the same idempotency key
    Duplicate(OperationId),
}

impl AppendOutcome {
    pub const fn operation_id(&self) -> OperationId {
        match self {
            Self::Appended(id) | Self::Duplicate(id) => *id,
        }
    }

    pub const fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate(_))
    }
}

/// Everything a conflict resolution writes, committed in one transaction
#[derive(Debug, Clone)]
pub struct ResolutionCommit {
    /// Conflict record in its resolved state
    pub conflict: ConflictRecord,
    /// Server copy the entity is now based on
    pub base: EntitySnapshot,
    /// New local snapshot
    pub local: EntitySnapshot,
    /// Operations replaced by this resolution
    pub superseded: Vec<OperationId>,
    /// Operation carrying the resolved state to the server, if any
    pub follow_up: Option<QueuedOperation>,
}

/// Trait for local durable storage operations (async)
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Read an entity with its dirty flag and sync markers
    async fn read_entity(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Option<LocalEntity>>;

    /// Write a local snapshot, optionally marking it dirty
    async fn write_entity(&self, snapshot: &EntitySnapshot, mark_dirty: bool) -> Result<()>;

    /// Record `server` as the last synced copy of the entity.
    ///
    /// With `overwrite_local` the local snapshot is replaced as well;
    /// otherwise only the version marker and shadow move forward.
    async fn mark_synced(&self, server: &EntitySnapshot, overwrite_local: bool) -> Result<()>;

    /// All queue rows in dispatch order (priority desc, created asc, append order)
    async fn list_pending(&self) -> Result<Vec<QueuedOperation>>;

    async fn get_operation(&self, id: &OperationId) -> Result<Option<QueuedOperation>>;

    /// Append an operation, writing the optimistic snapshot in the same transaction
    async fn append_operation(
        &self,
        operation: &QueuedOperation,
        snapshot: Option<&EntitySnapshot>,
    ) -> Result<AppendOutcome>;

    /// Persist `operation`'s new state if its stored status is one of `expected`
    async fn transition_operation(
        &self,
        operation: &QueuedOperation,
        expected: &[OperationStatus],
    ) -> Result<bool>;

    /// Remove a confirmed in-flight operation and record the server copy
    async fn complete_operation(
        &self,
        id: &OperationId,
        server: Option<&EntitySnapshot>,
    ) -> Result<bool>;

    /// Remove operations regardless of status
    async fn delete_operations(&self, ids: &[OperationId]) -> Result<usize>;

    /// Insert a conflict, removing the originating operation in the same transaction
    async fn record_conflict(
        &self,
        record: &ConflictRecord,
        originating: Option<&OperationId>,
    ) -> Result<()>;

    /// Live operations for the conflict's entity appended before the conflict was recorded
    async fn superseded_operations(&self, id: &ConflictId) -> Result<Vec<QueuedOperation>>;

    async fn update_conflict(&self, record: &ConflictRecord) -> Result<()>;

    async fn get_conflict(&self, id: &ConflictId) -> Result<Option<ConflictRecord>>;

    /// Conflicts newest first
    async fn list_conflicts(&self, unresolved_only: bool) -> Result<Vec<ConflictRecord>>;

    async fn apply_resolution(&self, commit: &ResolutionCommit) -> Result<()>;

    async fn last_sync_timestamp(&self) -> Result<Option<i64>>;

    async fn set_last_sync_timestamp(&self, timestamp: i64) -> Result<()>;
}
