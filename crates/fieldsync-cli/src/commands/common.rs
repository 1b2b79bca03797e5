use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use fieldsync_core::models::{
    ConflictId, ConflictRecord, FieldMap, OperationId, QueuedOperation,
};
use fieldsync_core::{SqliteStore, SyncConfig, SyncCoordinator};
use serde::Serialize;

use crate::config_profiles::{CliProfile, CliProfilesConfig};
use crate::error::CliError;
use crate::remote::HttpRemote;

const DB_PATH_ENV: &str = "FIELDSYNC_DB_PATH";

/// Profile selected for this invocation, with its name
pub struct ResolvedProfile {
    pub name: String,
    pub profile: CliProfile,
}

#[derive(Debug, Serialize)]
pub struct OperationListItem {
    pub id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub kind: String,
    pub status: String,
    pub priority: i32,
    pub retry_count: u32,
    pub created_at: i64,
    pub relative_time: String,
    pub next_attempt_at: Option<i64>,
    pub last_error: Option<String>,
    pub dead_reason: Option<String>,
    pub dead_error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ConflictListItem {
    pub id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub kind: String,
    pub local_changed_fields: Vec<String>,
    pub server_changed_fields: Vec<String>,
    pub server_version: i64,
    pub created_at: i64,
    pub created_at_iso: String,
    pub resolution: Option<String>,
}

pub fn load_profile(explicit: Option<&str>) -> Result<ResolvedProfile, CliError> {
    let config = CliProfilesConfig::load().map_err(CliError::Config)?;
    let name = config.resolve_profile_name(explicit);
    let profile = config.profile(&name).cloned().unwrap_or_default();
    Ok(ResolvedProfile { name, profile })
}

pub fn resolve_db_path(cli_db_path: Option<PathBuf>, profile: &CliProfile) -> Result<PathBuf, CliError> {
    if let Some(path) = cli_db_path
        .or_else(|| env::var_os(DB_PATH_ENV).map(PathBuf::from))
        .or_else(|| profile.database.clone())
    {
        return Ok(path);
    }
    default_db_path()
}

pub fn default_db_path() -> Result<PathBuf, CliError> {
    dirs::data_dir()
        .map(|dir| dir.join("fieldsync").join("fieldsync.db"))
        .ok_or_else(|| CliError::Config("Failed to resolve CLI data directory".to_string()))
}

pub fn open_store(path: &Path) -> Result<Arc<SqliteStore>, CliError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(Arc::new(SqliteStore::open(path)?))
}

/// Coordinator wired to the profile's remote authority, initialized and online.
pub async fn open_coordinator(
    path: &Path,
    profile: &CliProfile,
) -> Result<SyncCoordinator, CliError> {
    let remote_url = profile.remote_url().ok_or(CliError::SyncNotConfigured)?;
    let remote = Arc::new(HttpRemote::new(remote_url, profile.auth_token())?);
    let store = open_store(path)?;
    let config: SyncConfig = profile.sync.clone();

    let coordinator = SyncCoordinator::new(store, remote, config)?;
    // Mark online before init so the first cycle is the caller's manual one.
    coordinator.set_online(true).await?;
    coordinator.init().await?;
    Ok(coordinator)
}

pub fn parse_operation_id(raw: &str) -> Result<OperationId, CliError> {
    raw.trim()
        .parse::<OperationId>()
        .map_err(|_| CliError::InvalidId(raw.to_string()))
}

pub fn parse_conflict_id(raw: &str) -> Result<ConflictId, CliError> {
    raw.trim()
        .parse::<ConflictId>()
        .map_err(|_| CliError::InvalidId(raw.to_string()))
}

/// Parse a `--fields` argument; absent means an empty map.
pub fn parse_fields(raw: Option<&str>) -> Result<FieldMap, CliError> {
    let Some(raw) = raw.map(str::trim).filter(|raw| !raw.is_empty()) else {
        return Ok(FieldMap::new());
    };
    match serde_json::from_str::<serde_json::Value>(raw)? {
        serde_json::Value::Object(map) => Ok(map.into_iter().collect()),
        _ => Err(CliError::InvalidFields),
    }
}

pub fn operation_to_item(operation: &QueuedOperation) -> OperationListItem {
    let now_ms = Utc::now().timestamp_millis();
    OperationListItem {
        id: operation.id.to_string(),
        entity_type: operation.entity_type.to_string(),
        entity_id: operation.entity_id.clone(),
        kind: operation.kind.to_string(),
        status: operation.status.to_string(),
        priority: operation.priority,
        retry_count: operation.retry_count,
        created_at: operation.created_at,
        relative_time: format_relative_time(operation.created_at, now_ms),
        next_attempt_at: operation.next_attempt_at,
        last_error: operation.last_error.clone(),
        dead_reason: operation
            .dead_reason
            .map(|reason| reason.as_str().to_string()),
        dead_error: operation.dead_error().map(|error| error.to_string()),
    }
}

pub fn format_operation_lines(operations: &[QueuedOperation]) -> Vec<String> {
    let now_ms = Utc::now().timestamp_millis();
    operations
        .iter()
        .map(|operation| {
            let id = operation.id.to_string();
            let short_id = id.chars().take(13).collect::<String>();
            let target = format!("{}:{}", operation.entity_type, operation.entity_id);
            let relative_time = format_relative_time(operation.created_at, now_ms);
            let line = format!(
                "{short_id:<13}  {:<6}  {target:<28}  p{:<3}  {:<9}  {relative_time}",
                operation.kind.as_str(),
                operation.priority,
                operation.status.as_str(),
            );

            match (operation.dead_error(), &operation.last_error) {
                (Some(dead), _) => format!("{line}  {dead}"),
                (None, Some(error)) if operation.retry_count > 0 => {
                    format!("{line}  [{}x] {error}", operation.retry_count)
                }
                _ => line,
            }
        })
        .collect()
}

pub fn conflict_to_item(record: &ConflictRecord) -> ConflictListItem {
    ConflictListItem {
        id: record.id.to_string(),
        entity_type: record.entity_type.to_string(),
        entity_id: record.entity_id.clone(),
        kind: record.kind.to_string(),
        local_changed_fields: record.local_changed_fields.clone(),
        server_changed_fields: record.server_changed_fields.clone(),
        server_version: record.server_snapshot.version,
        created_at: record.created_at,
        created_at_iso: format_sync_timestamp(record.created_at),
        resolution: record
            .resolution
            .map(|resolution| resolution.as_str().to_string()),
    }
}

pub fn format_conflict_lines(conflicts: &[ConflictRecord]) -> Vec<String> {
    conflicts
        .iter()
        .map(|record| {
            let state = record
                .resolution
                .map_or("open", |resolution| resolution.as_str());
            format!(
                "{}  {}  {:<27}  {}:{}  local=[{}] server=[{}]  {state}",
                format_sync_timestamp(record.created_at),
                record.id,
                record.kind.as_str(),
                record.entity_type,
                record.entity_id,
                record.local_changed_fields.join(","),
                record.server_changed_fields.join(","),
            )
        })
        .collect()
}

pub fn format_sync_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;
    let week = 7 * day;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else if diff < week {
        format!("{}d ago", diff / day)
    } else {
        format!("{}w ago", diff / week)
    }
}
