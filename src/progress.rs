//! Caller-side progress reporting for `crawl status --watch` and `--wait`.
//!
//! Each poll that observes a changed task snapshot is reported once.
//! Progress is emitted on **stderr** so stdout remains parseable for scripts.

use std::io::Write;

use crate::models::CrawlTask;

/// Reports task snapshots observed while polling.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, task: &CrawlTask);
}

/// Human-friendly progress on stderr: `task 12  rust async  running  [#####.....]  42%  analyzing`.
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, task: &CrawlTask) {
        let line = format!(
            "task {}  {}  {:<9}  {}  {:>3}%  {}\n",
            task.id,
            task.keyword,
            task.status,
            progress_bar(task.progress, 20),
            task.progress,
            task.message.as_deref().unwrap_or("")
        );
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, task: &CrawlTask) {
        let obj = serde_json::json!({
            "event": "progress",
            "task": task,
        });
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _task: &CrawlTask) {}
}

fn progress_bar(progress: i64, width: usize) -> String {
    let filled = (progress.clamp(0, 100) as usize * width) / 100;
    format!("[{}{}]", "#".repeat(filled), ".".repeat(width - filled))
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
