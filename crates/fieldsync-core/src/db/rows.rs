//! Raw table rows and their conversion into models

use rusqlite::Row;

use crate::error::{Error, Result};
use crate::models::{
    ConflictRecord, EntitySnapshot, FieldMap, LocalEntity, QueuedOperation,
};

pub const OPERATION_COLUMNS: &str = "id, entity_type, entity_id, kind, payload, priority, \
     idempotency_key, created_at, updated_at, retry_count, last_error, status, \
     next_attempt_at, base_version, dead_reason";

pub const ENTITY_COLUMNS: &str = "entity_type, entity_id, version, fields, deleted, updated_at, \
     dirty, synced_version, synced_at, shadow";

pub const CONFLICT_COLUMNS: &str = "id, entity_type, entity_id, kind, local_snapshot, \
     server_snapshot, local_changed_fields, server_changed_fields, operation_id, resolved, \
     resolution, merged_snapshot, created_at, resolved_at";

fn parse_field<T>(column: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|error| Error::Store(format!("corrupt {column} column `{value}`: {error}")))
}

#[derive(Debug, Clone)]
pub struct OperationRow {
    pub id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub kind: String,
    pub payload: String,
    pub priority: i32,
    pub idempotency_key: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub status: String,
    pub next_attempt_at: Option<i64>,
    pub base_version: Option<i64>,
    pub dead_reason: Option<String>,
}

impl OperationRow {
    /// Read a row selected with [`OPERATION_COLUMNS`]
    pub fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            entity_type: row.get(1)?,
            entity_id: row.get(2)?,
            kind: row.get(3)?,
            payload: row.get(4)?,
            priority: row.get(5)?,
            idempotency_key: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
            retry_count: row.get(9)?,
            last_error: row.get(10)?,
            status: row.get(11)?,
            next_attempt_at: row.get(12)?,
            base_version: row.get(13)?,
            dead_reason: row.get(14)?,
        })
    }

    pub fn into_operation(self) -> Result<QueuedOperation> {
        Ok(QueuedOperation {
            id: parse_field("operation id", &self.id)?,
            entity_type: parse_field("entity_type", &self.entity_type)?,
            entity_id: self.entity_id,
            kind: parse_field("kind", &self.kind)?,
            payload: serde_json::from_str(&self.payload)?,
            priority: self.priority,
            idempotency_key: self.idempotency_key,
            created_at: self.created_at,
            updated_at: self.updated_at,
            retry_count: self.retry_count,
            last_error: self.last_error,
            status: parse_field("status", &self.status)?,
            next_attempt_at: self.next_attempt_at,
            base_version: self.base_version,
            dead_reason: self
                .dead_reason
                .as_deref()
                .map(|reason| parse_field("dead_reason", reason))
                .transpose()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct EntityRow {
    pub entity_type: String,
    pub entity_id: String,
    pub version: i64,
    pub fields: String,
    pub deleted: bool,
    pub updated_at: i64,
    pub dirty: bool,
    pub synced_version: Option<i64>,
    pub synced_at: Option<i64>,
    pub shadow: Option<String>,
}

impl EntityRow {
    /// Read a row selected with [`ENTITY_COLUMNS`]
    pub fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            entity_type: row.get(0)?,
            entity_id: row.get(1)?,
            version: row.get(2)?,
            fields: row.get(3)?,
            deleted: row.get::<_, i32>(4)? != 0,
            updated_at: row.get(5)?,
            dirty: row.get::<_, i32>(6)? != 0,
            synced_version: row.get(7)?,
            synced_at: row.get(8)?,
            shadow: row.get(9)?,
        })
    }

    pub fn into_entity(self) -> Result<LocalEntity> {
        let shadow = self
            .shadow
            .as_deref()
            .map(serde_json::from_str::<FieldMap>)
            .transpose()?;

        Ok(LocalEntity {
            snapshot: EntitySnapshot {
                entity_type: parse_field("entity_type", &self.entity_type)?,
                entity_id: self.entity_id,
                version: self.version,
                fields: serde_json::from_str(&self.fields)?,
                deleted: self.deleted,
                updated_at: self.updated_at,
            },
            dirty: self.dirty,
            synced_version: self.synced_version,
            synced_at: self.synced_at,
            shadow,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ConflictRow {
    pub id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub kind: String,
    pub local_snapshot: String,
    pub server_snapshot: String,
    pub local_changed_fields: String,
    pub server_changed_fields: String,
    pub operation_id: Option<String>,
    pub resolved: bool,
    pub resolution: Option<String>,
    pub merged_snapshot: Option<String>,
    pub created_at: i64,
    pub resolved_at: Option<i64>,
}

impl ConflictRow {
    /// Read a row selected with [`CONFLICT_COLUMNS`]
    pub fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            entity_type: row.get(1)?,
            entity_id: row.get(2)?,
            kind: row.get(3)?,
            local_snapshot: row.get(4)?,
            server_snapshot: row.get(5)?,
            local_changed_fields: row.get(6)?,
            server_changed_fields: row.get(7)?,
            operation_id: row.get(8)?,
            resolved: row.get::<_, i32>(9)? != 0,
            resolution: row.get(10)?,
            merged_snapshot: row.get(11)?,
            created_at: row.get(12)?,
            resolved_at: row.get(13)?,
        })
    }

    pub fn into_conflict(self) -> Result<ConflictRecord> {
        Ok(ConflictRecord {
            id: parse_field("conflict id", &self.id)?,
            entity_type: parse_field("entity_type", &self.entity_type)?,
            entity_id: self.entity_id,
            local_snapshot: serde_json::from_str(&self.local_snapshot)?,
            server_snapshot: serde_json::from_str(&self.server_snapshot)?,
            kind: parse_field("kind", &self.kind)?,
            local_changed_fields: serde_json::from_str(&self.local_changed_fields)?,
            server_changed_fields: serde_json::from_str(&self.server_changed_fields)?,
            operation_id: self
                .operation_id
                .as_deref()
                .map(|id| parse_field("operation_id", id))
                .transpose()?,
            resolved: self.resolved,
            resolution: self
                .resolution
                .as_deref()
                .map(|resolution| parse_field("resolution", resolution))
                .transpose()?,
            merged_snapshot: self
                .merged_snapshot
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            created_at: self.created_at,
            resolved_at: self.resolved_at,
        })
    }
}
