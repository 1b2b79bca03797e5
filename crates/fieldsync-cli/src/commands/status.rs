use std::path::Path;
use std::sync::Arc;

use fieldsync_core::sync::{MutationQueue, RetryManager};
use fieldsync_core::{LocalStore, SqliteStore};
use serde::Serialize;

use crate::commands::common::{format_sync_timestamp, open_store, ResolvedProfile};
use crate::error::CliError;

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct StatusItem {
    pub profile: String,
    pub remote_url: Option<String>,
    pub pending_operations: usize,
    pub dead_operations: usize,
    pub conflicts: usize,
    pub last_sync: Option<i64>,
    pub last_sync_iso: Option<String>,
}

pub async fn collect_status(
    store: Arc<SqliteStore>,
    profile: &ResolvedProfile,
) -> Result<StatusItem, CliError> {
    let queue = MutationQueue::new(
        store.clone(),
        RetryManager::new(profile.profile.sync.retry.clone()),
    );
    let counts = queue.counts().await?;
    let conflicts = store.list_conflicts(true).await?.len();
    let last_sync = store.last_sync_timestamp().await?;

    Ok(StatusItem {
        profile: profile.name.clone(),
        remote_url: profile.profile.remote_url(),
        pending_operations: counts.live,
        dead_operations: counts.dead,
        conflicts,
        last_sync,
        last_sync_iso: last_sync.map(format_sync_timestamp),
    })
}

pub async fn run_status(
    as_json: bool,
    db_path: &Path,
    profile: &ResolvedProfile,
) -> Result<(), CliError> {
    let status = collect_status(open_store(db_path)?, profile).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    for line in format_status_lines(&status) {
        println!("{line}");
    }
    Ok(())
}

pub fn format_status_lines(status: &StatusItem) -> Vec<String> {
    let mut lines = vec![
        format!("Profile:    {}", status.profile),
        format!(
            "Remote:     {}",
            status.remote_url.as_deref().unwrap_or("(not configured)")
        ),
        format!("Pending:    {}", status.pending_operations),
    ];
    if status.dead_operations > 0 {
        lines.push(format!(
            "Dead:       {} (run `fieldsync queue list --dead`)",
            status.dead_operations
        ));
    }
    if status.conflicts > 0 {
        lines.push(format!(
            "Conflicts:  {} (run `fieldsync conflicts list`)",
            status.conflicts
        ));
    }
    lines.push(format!(
        "Last sync:  {}",
        status.last_sync_iso.as_deref().unwrap_or("never")
    ));
    lines
}
