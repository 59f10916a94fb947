use std::path::{Path, PathBuf};

use anyhow::Context;
use rowsmith_storage::write_atomically;

use crate::orchestrator::{BuildReport, SyncOutcome};

/// Writes `build_report.json` and `build_summary.md` under
/// `<reports_dir>/<build_id>/` and returns that directory.
pub async fn write_report(report: &BuildReport, reports_dir: &Path) -> anyhow::Result<PathBuf> {
    let dir = reports_dir.join(&report.build_id);
    tokio::fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let json = serde_json::to_vec_pretty(report).context("serializing build report")?;
    write_atomically(&dir.join("build_report.json"), &json)
        .await
        .context("writing build_report.json")?;
    write_atomically(&dir.join("build_summary.md"), render_summary(report).as_bytes())
        .await
        .context("writing build_summary.md")?;
    Ok(dir)
}

pub fn render_summary(report: &BuildReport) -> String {
    let outcome = if report.cancelled {
        "cancelled"
    } else if report.success {
        "succeeded"
    } else {
        "failed"
    };
    let mut lines = vec![
        format!("# Build `{}`", report.build_id),
        String::new(),
        format!("- Database: `{}`", report.database),
        format!("- Started: {}", report.started_at),
        format!("- Finished: {}", report.finished_at),
        format!("- Sync: {}", describe_sync(&report.sync)),
        format!("- Result: {outcome}"),
        String::new(),
        "## Resources".to_string(),
    ];

    for resource in &report.outcomes {
        lines.push(format!(
            "- {}: {} ({} ms)",
            resource.resource,
            resource.status.as_str(),
            resource.duration_ms
        ));
        for table in &resource.tables {
            let version = table
                .version
                .map(|v| format!("v{v}"))
                .unwrap_or_else(|| "-".to_string());
            lines.push(format!(
                "  - `{}` {} {version}, {} written, {} rows",
                table.table,
                table.status.as_str(),
                table.records_written,
                table.row_count
            ));
        }
        if let Some(reason) = &resource.skip_reason {
            lines.push(format!("  - skipped: {reason}"));
        }
        if let Some(err) = &resource.error {
            lines.push(format!("  - error: {err}"));
        }
        if let Some(hint) = &resource.suggestion {
            lines.push(format!("  - suggestion: {hint}"));
        }
    }
    lines.push(String::new());
    lines.join("\n")
}

fn describe_sync(sync: &SyncOutcome) -> String {
    match sync {
        SyncOutcome::NotRequested => "not requested".to_string(),
        SyncOutcome::NoRemoteConfigured => "no remote configured".to_string(),
        SyncOutcome::Downloaded { bytes } => format!("downloaded {bytes} bytes"),
        SyncOutcome::RemoteAbsent => "no remote copy".to_string(),
        SyncOutcome::TimedOut => "timed out".to_string(),
        SyncOutcome::Failed { message } => format!("failed ({message})"),
    }
}
