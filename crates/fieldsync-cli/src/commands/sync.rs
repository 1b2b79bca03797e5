use std::path::Path;

use fieldsync_core::sync::CycleReport;
use fieldsync_core::SyncStatus;
use serde::Serialize;

use crate::commands::common::{open_coordinator, ResolvedProfile};
use crate::error::CliError;

#[derive(Debug, Serialize)]
struct SyncOutput<'a> {
    report: &'a CycleReport,
    status: &'a SyncStatus,
}

pub async fn run_sync(
    as_json: bool,
    db_path: &Path,
    profile: &ResolvedProfile,
) -> Result<(), CliError> {
    let coordinator = open_coordinator(db_path, &profile.profile).await?;
    let outcome = coordinator.trigger_manual_sync().await;
    coordinator.teardown().await;
    let report = outcome?.unwrap_or_default();
    let status = coordinator.get_sync_status();

    if as_json {
        let output = SyncOutput {
            report: &report,
            status: &status,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    for line in format_report_lines(&report, &status) {
        println!("{line}");
    }
    Ok(())
}

pub fn format_report_lines(report: &CycleReport, status: &SyncStatus) -> Vec<String> {
    let mut lines = vec![format!(
        "Pushed {}, pulled {}, {} new conflict(s), {} auto-merged",
        report.pushed,
        report.pulled,
        report.conflicts + report.deferred,
        report.auto_merged
    )];
    if report.retried > 0 {
        lines.push(format!("{} operation(s) will be retried", report.retried));
    }
    if report.dead + report.rejected > 0 {
        lines.push(format!(
            "{} operation(s) need attention (run `fieldsync queue list --dead`)",
            report.dead + report.rejected
        ));
    }
    if let Some(error) = &status.last_error {
        lines.push(format!("Pull did not complete: {error}"));
    }
    lines.push(format!(
        "{} pending, {} unresolved conflict(s)",
        status.pending_operations, status.conflicts
    ));
    lines
}
