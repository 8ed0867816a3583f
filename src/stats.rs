//! Task statistics.
//!
//! Counts tasks by outcome and lists the most recently started ones. Served
//! at `/api/crawl/stats` and printed by `crawl stats`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;

use crate::error::Result;
use crate::ledger::Ledger;
use crate::models::CrawlTask;

const RECENT_TASKS: u32 = 5;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStats {
    pub completed_tasks: i64,
    /// Pending and running tasks together.
    pub pending_tasks: i64,
    pub failed_tasks: i64,
    pub total_tasks: i64,
    pub recent_tasks: Vec<CrawlTask>,
}

pub async fn collect_stats(ledger: &Ledger) -> Result<TaskStats> {
    let counts = ledger.status_counts().await?;
    let (recent_tasks, _) = ledger.list_tasks(None, 1, RECENT_TASKS).await?;
    Ok(TaskStats {
        completed_tasks: counts.completed,
        pending_tasks: counts.in_flight(),
        failed_tasks: counts.failed,
        total_tasks: counts.total(),
        recent_tasks,
    })
}

/// Print the stats table for `crawl stats`.
pub fn print_stats(stats: &TaskStats, db_path: &Path) {
    let db_size = std::fs::metadata(db_path).map(|m| m.len()).unwrap_or(0);

    println!("Crawl Harness — Task Stats");
    println!("==========================");
    println!();
    println!("  Database:    {}", db_path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Completed:   {}", stats.completed_tasks);
    println!("  In flight:   {}", stats.pending_tasks);
    println!("  Failed:      {}", stats.failed_tasks);
    println!("  Total:       {}", stats.total_tasks);

    if !stats.recent_tasks.is_empty() {
        println!();
        println!("  Recent tasks:");
        println!(
            "  {:>6}  {:<28} {:<10} {:>4}   {}",
            "ID", "KEYWORD", "STATUS", "PCT", "STARTED"
        );
        println!("  {}", "-".repeat(70));
        for t in &stats.recent_tasks {
            println!(
                "  {:>6}  {:<28} {:<10} {:>3}%   {}",
                t.id,
                t.keyword,
                t.status,
                t.progress,
                format_ts_relative(t.started_at)
            );
        }
    }

    println!();
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a timestamp relative to now (e.g. "3 hours ago").
pub fn format_ts_relative(ts: DateTime<Utc>) -> String {
    let delta = (Utc::now() - ts).num_seconds();

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M").to_string()
}
