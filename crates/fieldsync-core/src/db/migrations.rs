//! Database migrations

use rusqlite::{Connection, OptionalExtension};

use crate::error::Result;

/// Current schema version
const CURRENT_VERSION: i32 = 3;

/// Run all pending migrations
pub fn run(conn: &mut Connection) -> Result<()> {
    let version = get_version(conn)?;

    if version < 1 {
        migrate_v1(conn)?;
    }
    if version < 2 {
        migrate_v2(conn)?;
    }
    if version < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

/// Get the current schema version
fn get_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get(0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version = conn
        .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
            row.get::<_, Option<i32>>(0)
        })
        .optional()?
        .flatten()
        .unwrap_or(0);

    Ok(version)
}

fn apply(conn: &mut Connection, version: i32, statements: &[&str]) -> Result<()> {
    let tx = conn.transaction()?;
    for stmt in statements {
        tx.execute(stmt, [])?;
    }
    tx.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        [version],
    )?;
    tx.commit()?;

    tracing::info!("Migrated local store to version {version}");
    Ok(())
}

/// Migration to version 1: entities, mutation queue and sync state
fn migrate_v1(conn: &mut Connection) -> Result<()> {
    apply(
        conn,
        1,
        &[
            // Schema version tracking
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            )",
            // Local entity snapshots with sync markers
            "CREATE TABLE IF NOT EXISTS entities (
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 0,
                fields TEXT NOT NULL,
                deleted INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL,
                dirty INTEGER NOT NULL DEFAULT 0,
                synced_version INTEGER,
                synced_at INTEGER,
                shadow TEXT,
                PRIMARY KEY (entity_type, entity_id)
            )",
            "CREATE INDEX IF NOT EXISTS idx_entities_dirty ON entities(dirty)",
            // Mutation queue, one row per pending operation
            "CREATE TABLE IF NOT EXISTS queued_operations (
                id TEXT PRIMARY KEY,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                priority INTEGER NOT NULL,
                idempotency_key TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                status TEXT NOT NULL,
                next_attempt_at INTEGER,
                base_version INTEGER,
                dead_reason TEXT
            )",
            "CREATE INDEX IF NOT EXISTS idx_queue_order ON queued_operations(priority DESC, created_at ASC)",
            "CREATE INDEX IF NOT EXISTS idx_queue_entity ON queued_operations(entity_type, entity_id)",
            "CREATE INDEX IF NOT EXISTS idx_queue_status ON queued_operations(status)",
            // Key/value sync state (last pull watermark)
            "CREATE TABLE IF NOT EXISTS sync_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
        ],
    )
}

/// Migration to version 2: conflict records
fn migrate_v2(conn: &mut Connection) -> Result<()> {
    apply(
        conn,
        2,
        &[
            "CREATE TABLE IF NOT EXISTS sync_conflicts (
                id TEXT PRIMARY KEY,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                local_snapshot TEXT NOT NULL,
                server_snapshot TEXT NOT NULL,
                local_changed_fields TEXT NOT NULL,
                server_changed_fields TEXT NOT NULL,
                operation_id TEXT,
                resolved INTEGER NOT NULL DEFAULT 0,
                resolution TEXT,
                merged_snapshot TEXT,
                created_at INTEGER NOT NULL,
                resolved_at INTEGER
            )",
            "CREATE INDEX IF NOT EXISTS idx_sync_conflicts_entity ON sync_conflicts(entity_type, entity_id, resolved)",
            "CREATE INDEX IF NOT EXISTS idx_sync_conflicts_created_at ON sync_conflicts(created_at DESC)",
        ],
    )
}

/// Migration to version 3: queue append order independent of wall-clock time
fn migrate_v3(conn: &mut Connection) -> Result<()> {
    apply(
        conn,
        CURRENT_VERSION,
        &[
            "ALTER TABLE queued_operations ADD COLUMN seq INTEGER NOT NULL DEFAULT 0",
            "UPDATE queued_operations SET seq = rowid",
            "CREATE INDEX IF NOT EXISTS idx_queue_entity_seq ON queued_operations(entity_type, entity_id, seq)",
            // Highest queue sequence number appended before the conflict was recorded
            "ALTER TABLE sync_conflicts ADD COLUMN queue_seq INTEGER NOT NULL DEFAULT 0",
            "UPDATE sync_conflicts SET queue_seq = (
                SELECT COALESCE(MAX(q.seq), 0) FROM queued_operations q
                WHERE q.entity_type = sync_conflicts.entity_type
                  AND q.entity_id = sync_conflicts.entity_id
                  AND q.created_at <= sync_conflicts.created_at
            )",
            "INSERT OR REPLACE INTO sync_state (key, value)
             SELECT 'operation_seq', CAST(COALESCE(MAX(seq), 0) AS TEXT) FROM queued_operations",
        ],
    )
}
