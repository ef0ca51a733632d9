use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use jtt_storage::write_json_atomic;
use tokio::fs;

use crate::delivery::DeliveryStats;
use crate::pipeline::{RunReport, TargetStatus};

pub fn render_summary(report: &RunReport, delivery: Option<&DeliveryStats>) -> String {
    let mut lines = vec![
        "# JTT Run Summary".to_string(),
        String::new(),
        format!("- Run ID: `{}`", report.run_id),
        format!("- Started: {}", report.started_at),
        format!("- Finished: {}", report.finished_at),
        format!("- Targets: {}", report.targets.len()),
        format!("- Records: {}", report.output.record_count()),
    ];
    if let Some(stats) = delivery {
        lines.push(format!(
            "- Delivery: {} delivered ({} inserted, {} updated rows), {} failed",
            stats.delivered, stats.inserted, stats.updated, stats.failed
        ));
    }

    for target in &report.targets {
        lines.push(String::new());
        lines.push(format!("## {}", target.target));
        let status = match &target.status {
            TargetStatus::Completed => "completed".to_string(),
            TargetStatus::Cached => "cached".to_string(),
            TargetStatus::Aborted { reason } => format!("aborted ({reason})"),
        };
        lines.push(format!("- status: {status}"));
        lines.push(format!("- listed: {}", target.listed));
        lines.push(format!("- succeeded: {}", target.succeeded));
        lines.push(format!("- skipped: {}", target.skipped.len()));
        if let Some(path) = &target.output_path {
            lines.push(format!("- run file: `{}`", path.display()));
        }
        for skipped in &target.skipped {
            lines.push(format!("  - `{}`: {}", skipped.identifier, skipped.reason));
        }
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Writes `results.json`, `targets.json` and `summary.md` under `{reports_root}/{run_id}`.
pub async fn write_run_reports(
    reports_root: &Path,
    report: &RunReport,
    delivery: Option<&DeliveryStats>,
) -> Result<PathBuf> {
    let reports_dir = reports_root.join(report.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    write_json_atomic(&reports_dir.join("results.json"), &report.output).await?;
    write_json_atomic(&reports_dir.join("targets.json"), &report.targets).await?;
    fs::write(reports_dir.join("summary.md"), render_summary(report, delivery))
        .await
        .context("writing summary.md")?;
    Ok(reports_dir)
}
