//! `SQLite`-backed local store

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use tokio::sync::Mutex;
use tracing::debug;

use super::connection::Database;
use super::rows::{
    ConflictRow, EntityRow, OperationRow, CONFLICT_COLUMNS, ENTITY_COLUMNS, OPERATION_COLUMNS,
};
use crate::error::Result;
use crate::models::{
    ConflictId, ConflictRecord, EntityKey, EntitySnapshot, EntityType, LocalEntity, OperationId,
    OperationStatus, QueuedOperation,
};
use crate::store::{AppendOutcome, LocalStore, ResolutionCommit};
use crate::util::now_ms;

const LAST_SYNC_KEY: &str = "last_sync_timestamp";
/// Last queue sequence number handed out; survives deletion of queue rows
const OPERATION_SEQ_KEY: &str = "operation_seq";

/// Thread-safe local store over a single `SQLite` connection.
///
/// Every call takes the connection lock for its whole duration, so each
/// append or transition is a scoped, exclusive write.
#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<Mutex<Database>>,
}

impl SqliteStore {
    /// Open a store at the given filesystem path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::open(path)?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    /// Open an in-memory store (primarily for tests).
    pub fn open_in_memory() -> Result<Self> {
        let db = Database::open_in_memory()?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    /// Run raw SQL against the connection.
    #[cfg(test)]
    pub(crate) async fn execute_batch(&self, sql: &str) -> Result<()> {
        self.with_conn(|conn| Ok(conn.execute_batch(sql)?)).await
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send,
        T: Send,
    {
        let mut db = self.db.lock().await;
        f(db.connection_mut())
    }
}

fn load_entity(conn: &Connection, key: &EntityKey) -> Result<Option<LocalEntity>> {
    let row = conn
        .query_row(
            &format!(
                "SELECT {ENTITY_COLUMNS} FROM entities WHERE entity_type = ?1 AND entity_id = ?2"
            ),
            params![key.entity_type.as_str(), key.entity_id],
            EntityRow::read,
        )
        .optional()?;
    row.map(EntityRow::into_entity).transpose()
}

fn load_operation(conn: &Connection, id: &OperationId) -> Result<Option<QueuedOperation>> {
    let row = conn
        .query_row(
            &format!("SELECT {OPERATION_COLUMNS} FROM queued_operations WHERE id = ?1"),
            params![id.as_str()],
            OperationRow::read,
        )
        .optional()?;
    row.map(OperationRow::into_operation).transpose()
}

fn has_queued_operations(tx: &Transaction<'_>, key: &EntityKey) -> Result<bool> {
    Ok(tx.query_row(
        "SELECT EXISTS(SELECT 1 FROM queued_operations WHERE entity_type = ?1 AND entity_id = ?2)",
        params![key.entity_type.as_str(), key.entity_id],
        |row| row.get(0),
    )?)
}

fn read_state(conn: &Connection, key: &str) -> Result<Option<i64>> {
    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM sync_state WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;
    value
        .map(|value| {
            value
                .parse::<i64>()
                .map_err(|error| crate::Error::Store(format!("corrupt {key}: {error}")))
        })
        .transpose()
}

fn write_state(conn: &Connection, key: &str, value: i64) -> Result<()> {
    conn.execute(
        "INSERT INTO sync_state (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value.to_string()],
    )?;
    Ok(())
}

fn next_operation_seq(tx: &Transaction<'_>) -> Result<i64> {
    let next = read_state(tx, OPERATION_SEQ_KEY)?.unwrap_or(0) + 1;
    write_state(tx, OPERATION_SEQ_KEY, next)?;
    Ok(next)
}

fn synced_version(tx: &Transaction<'_>, key: &EntityKey) -> Result<Option<i64>> {
    Ok(tx
        .query_row(
            "SELECT synced_version FROM entities WHERE entity_type = ?1 AND entity_id = ?2",
            params![key.entity_type.as_str(), key.entity_id],
            |row| row.get::<_, Option<i64>>(0),
        )
        .optional()?
        .flatten())
}

fn upsert_snapshot(tx: &Transaction<'_>, snapshot: &EntitySnapshot, dirty: bool) -> Result<()> {
    tx.execute(
        "INSERT INTO entities (entity_type, entity_id, version, fields, deleted, updated_at, dirty)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(entity_type, entity_id) DO UPDATE SET
             version = excluded.version,
             fields = excluded.fields,
             deleted = excluded.deleted,
             updated_at = excluded.updated_at,
             dirty = MAX(entities.dirty, excluded.dirty)",
        params![
            snapshot.entity_type.as_str(),
            snapshot.entity_id,
            snapshot.version,
            serde_json::to_string(&snapshot.fields)?,
            i32::from(snapshot.deleted),
            snapshot.updated_at,
            i32::from(dirty),
        ],
    )?;
    Ok(())
}

/// Move the sync markers to `server`, replacing the local copy when asked.
///
/// A server copy older than the stored synced version is ignored.
fn record_synced(
    tx: &Transaction<'_>,
    server: &EntitySnapshot,
    local: Option<&EntitySnapshot>,
    now: i64,
) -> Result<()> {
    let key = server.key();
    if let Some(synced) = synced_version(tx, &key)?.filter(|synced| server.version < *synced) {
        debug!(
            entity_id = %key.entity_id,
            server_version = server.version,
            synced_version = synced,
            "Ignoring server copy older than the synced version"
        );
        return Ok(());
    }

    let pending = has_queued_operations(tx, &key)?;
    let shadow = serde_json::to_string(&server.fields)?;

    match local {
        Some(local) => {
            tx.execute(
                "INSERT INTO entities (entity_type, entity_id, version, fields, deleted, updated_at,
                                       dirty, synced_version, synced_at, shadow)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(entity_type, entity_id) DO UPDATE SET
                     version = excluded.version,
                     fields = excluded.fields,
                     deleted = excluded.deleted,
                     updated_at = excluded.updated_at,
                     dirty = excluded.dirty,
                     synced_version = excluded.synced_version,
                     synced_at = excluded.synced_at,
                     shadow = excluded.shadow",
                params![
                    key.entity_type.as_str(),
                    key.entity_id,
                    server.version,
                    serde_json::to_string(&local.fields)?,
                    i32::from(local.deleted),
                    local.updated_at,
                    i32::from(pending),
                    server.version,
                    now,
                    shadow,
                ],
            )?;
        }
        None => {
            let updated = tx.execute(
                "UPDATE entities
                 SET version = ?3, synced_version = ?3, synced_at = ?4, shadow = ?5,
                     dirty = MAX(dirty, ?6)
                 WHERE entity_type = ?1 AND entity_id = ?2",
                params![
                    key.entity_type.as_str(),
                    key.entity_id,
                    server.version,
                    now,
                    shadow,
                    i32::from(pending),
                ],
            )?;
            if updated == 0 {
                return record_synced(tx, server, Some(server), now);
            }
        }
    }
    Ok(())
}

fn insert_operation(tx: &Transaction<'_>, op: &QueuedOperation) -> Result<()> {
    tx.execute(
        &format!(
            "INSERT INTO queued_operations ({OPERATION_COLUMNS}, seq)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
        ),
        params![
            op.id.as_str(),
            op.entity_type.as_str(),
            op.entity_id,
            op.kind.as_str(),
            serde_json::to_string(&op.payload)?,
            op.priority,
            op.idempotency_key,
            op.created_at,
            op.updated_at,
            op.retry_count,
            op.last_error,
            op.status.as_str(),
            op.next_attempt_at,
            op.base_version,
            op.dead_reason.map(|reason| reason.as_str()),
            next_operation_seq(tx)?,
        ],
    )?;
    tx.execute(
        "UPDATE entities SET dirty = 1 WHERE entity_type = ?1 AND entity_id = ?2",
        params![op.entity_type.as_str(), op.entity_id],
    )?;
    Ok(())
}

fn write_conflict(tx: &Transaction<'_>, record: &ConflictRecord) -> Result<()> {
    tx.execute(
        &format!(
            "INSERT INTO sync_conflicts ({CONFLICT_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
             ON CONFLICT(id) DO UPDATE SET
                 kind = excluded.kind,
                 local_snapshot = excluded.local_snapshot,
                 server_snapshot = excluded.server_snapshot,
                 local_changed_fields = excluded.local_changed_fields,
                 server_changed_fields = excluded.server_changed_fields,
                 operation_id = excluded.operation_id,
                 resolved = excluded.resolved,
                 resolution = excluded.resolution,
                 merged_snapshot = excluded.merged_snapshot,
                 resolved_at = excluded.resolved_at"
        ),
        params![
            record.id.as_str(),
            record.entity_type.as_str(),
            record.entity_id,
            record.kind.as_str(),
            serde_json::to_string(&record.local_snapshot)?,
            serde_json::to_string(&record.server_snapshot)?,
            serde_json::to_string(&record.local_changed_fields)?,
            serde_json::to_string(&record.server_changed_fields)?,
            record.operation_id.map(|id| id.as_str()),
            i32::from(record.resolved),
            record.resolution.map(|resolution| resolution.as_str()),
            record
                .merged_snapshot
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            record.created_at,
            record.resolved_at,
        ],
    )?;
    Ok(())
}

fn delete_operation_rows(tx: &Transaction<'_>, ids: &[OperationId]) -> Result<usize> {
    let mut removed = 0;
    for id in ids {
        removed += tx.execute(
            "DELETE FROM queued_operations WHERE id = ?1",
            params![id.as_str()],
        )?;
    }
    Ok(removed)
}

#[async_trait]
impl LocalStore for SqliteStore {
    async fn read_entity(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Option<LocalEntity>> {
        let key = EntityKey::new(entity_type, entity_id);
        self.with_conn(|conn| load_entity(conn, &key)).await
    }

    async fn write_entity(&self, snapshot: &EntitySnapshot, mark_dirty: bool) -> Result<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            upsert_snapshot(&tx, snapshot, mark_dirty)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn mark_synced(&self, server: &EntitySnapshot, overwrite_local: bool) -> Result<()> {
        let now = now_ms();
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            record_synced(&tx, server, overwrite_local.then_some(server), now)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn list_pending(&self) -> Result<Vec<QueuedOperation>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {OPERATION_COLUMNS}
                 FROM queued_operations
                 ORDER BY priority DESC, created_at ASC, seq ASC"
            ))?;
            let rows = stmt
                .query_map([], OperationRow::read)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(OperationRow::into_operation).collect()
        })
        .await
    }

    async fn get_operation(&self, id: &OperationId) -> Result<Option<QueuedOperation>> {
        self.with_conn(|conn| load_operation(conn, id)).await
    }

    async fn append_operation(
        &self,
        operation: &QueuedOperation,
        snapshot: Option<&EntitySnapshot>,
    ) -> Result<AppendOutcome> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            if let Some(snapshot) = snapshot {
                upsert_snapshot(&tx, snapshot, true)?;
            }

            let latest: Option<(String, String)> = tx
                .query_row(
                    "SELECT id, idempotency_key FROM queued_operations
                     WHERE entity_type = ?1 AND entity_id = ?2 AND status != 'dead'
                     ORDER BY seq DESC
                     LIMIT 1",
                    params![operation.entity_type.as_str(), operation.entity_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let outcome = match latest {
                Some((existing_id, key)) if key == operation.idempotency_key => {
                    let existing_id = existing_id.parse::<OperationId>().map_err(|error| {
                        crate::Error::Store(format!("corrupt operation id {existing_id}: {error}"))
                    })?;
                    AppendOutcome::Duplicate(existing_id)
                }
                _ => {
                    insert_operation(&tx, operation)?;
                    AppendOutcome::Appended(operation.id)
                }
            };

            tx.commit()?;
            Ok(outcome)
        })
        .await
    }

    async fn transition_operation(
        &self,
        operation: &QueuedOperation,
        expected: &[OperationStatus],
    ) -> Result<bool> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let current: Option<String> = tx
                .query_row(
                    "SELECT status FROM queued_operations WHERE id = ?1",
                    params![operation.id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;

            let Some(current) = current else {
                return Ok(false);
            };
            if !expected.iter().any(|status| status.as_str() == current) {
                return Ok(false);
            }

            tx.execute(
                "UPDATE queued_operations
                 SET status = ?2, retry_count = ?3, last_error = ?4, next_attempt_at = ?5,
                     base_version = ?6, dead_reason = ?7, updated_at = ?8
                 WHERE id = ?1",
                params![
                    operation.id.as_str(),
                    operation.status.as_str(),
                    operation.retry_count,
                    operation.last_error,
                    operation.next_attempt_at,
                    operation.base_version,
                    operation.dead_reason.map(|reason| reason.as_str()),
                    operation.updated_at,
                ],
            )?;
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    async fn complete_operation(
        &self,
        id: &OperationId,
        server: Option<&EntitySnapshot>,
    ) -> Result<bool> {
        let now = now_ms();
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let Some(operation) = load_operation(&tx, id)? else {
                return Ok(false);
            };
            if operation.status != OperationStatus::InFlight {
                return Ok(false);
            }

            tx.execute(
                "DELETE FROM queued_operations WHERE id = ?1",
                params![id.as_str()],
            )?;

            let key = operation.key();
            if let Some(server) = server {
                let overwrite = !has_queued_operations(&tx, &key)?;
                record_synced(&tx, server, overwrite.then_some(server), now)?;
            } else if !has_queued_operations(&tx, &key)? {
                tx.execute(
                    "UPDATE entities SET dirty = 0, synced_at = ?3
                     WHERE entity_type = ?1 AND entity_id = ?2",
                    params![key.entity_type.as_str(), key.entity_id, now],
                )?;
            }

            tx.commit()?;
            Ok(true)
        })
        .await
    }

    async fn delete_operations(&self, ids: &[OperationId]) -> Result<usize> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let removed = delete_operation_rows(&tx, ids)?;
            tx.commit()?;
            Ok(removed)
        })
        .await
    }

    async fn record_conflict(
        &self,
        record: &ConflictRecord,
        originating: Option<&OperationId>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            write_conflict(&tx, record)?;
            // Operations appended up to here are superseded when the conflict resolves.
            tx.execute(
                "UPDATE sync_conflicts SET queue_seq = ?2 WHERE id = ?1",
                params![
                    record.id.as_str(),
                    read_state(&tx, OPERATION_SEQ_KEY)?.unwrap_or(0)
                ],
            )?;
            if let Some(id) = originating {
                delete_operation_rows(&tx, std::slice::from_ref(id))?;
            }
            tx.execute(
                "UPDATE entities SET dirty = 1 WHERE entity_type = ?1 AND entity_id = ?2",
                params![record.entity_type.as_str(), record.entity_id],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn superseded_operations(&self, id: &ConflictId) -> Result<Vec<QueuedOperation>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {OPERATION_COLUMNS}
                 FROM queued_operations
                 WHERE status != 'dead'
                   AND EXISTS (
                       SELECT 1 FROM sync_conflicts c
                       WHERE c.id = ?1
                         AND c.entity_type = queued_operations.entity_type
                         AND c.entity_id = queued_operations.entity_id
                         AND queued_operations.seq <= c.queue_seq
                   )
                 ORDER BY seq ASC"
            ))?;
            let rows = stmt
                .query_map(params![id.as_str()], OperationRow::read)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(OperationRow::into_operation).collect()
        })
        .await
    }

    async fn update_conflict(&self, record: &ConflictRecord) -> Result<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            write_conflict(&tx, record)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_conflict(&self, id: &ConflictId) -> Result<Option<ConflictRecord>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    &format!("SELECT {CONFLICT_COLUMNS} FROM sync_conflicts WHERE id = ?1"),
                    params![id.as_str()],
                    ConflictRow::read,
                )
                .optional()?;
            row.map(ConflictRow::into_conflict).transpose()
        })
        .await
    }

    async fn list_conflicts(&self, unresolved_only: bool) -> Result<Vec<ConflictRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {CONFLICT_COLUMNS}
                 FROM sync_conflicts
                 WHERE resolved = 0 OR ?1 = 0
                 ORDER BY created_at DESC, rowid DESC"
            ))?;
            let rows = stmt
                .query_map(params![i32::from(unresolved_only)], ConflictRow::read)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(ConflictRow::into_conflict).collect()
        })
        .await
    }

    async fn apply_resolution(&self, commit: &ResolutionCommit) -> Result<()> {
        let now = now_ms();
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            write_conflict(&tx, &commit.conflict)?;
            delete_operation_rows(&tx, &commit.superseded)?;
            if let Some(follow_up) = &commit.follow_up {
                insert_operation(&tx, follow_up)?;
            }
            record_synced(&tx, &commit.base, Some(&commit.local), now)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn last_sync_timestamp(&self) -> Result<Option<i64>> {
        self.with_conn(|conn| read_state(conn, LAST_SYNC_KEY)).await
    }

    async fn set_last_sync_timestamp(&self, timestamp: i64) -> Result<()> {
        self.with_conn(|conn| write_state(conn, LAST_SYNC_KEY, timestamp))
            .await
    }
}
