//! Status polling: the latest task for a keyword.
//!
//! [`get_status`] is a single read and never mutates the ledger. The
//! [`StatusPoller`] is the caller side: it repeats that read at a bounded
//! interval until the task reaches a terminal state.

use std::time::Duration;

use tracing::debug;

use crate::admission::normalize_keyword;
use crate::error::{CrawlError, Result};
use crate::ledger::Ledger;
use crate::models::CrawlTask;
use crate::progress::ProgressReporter;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Most recently started task for `keyword`.
pub async fn get_status(ledger: &Ledger, keyword: &str) -> Result<CrawlTask> {
    let keyword = normalize_keyword(keyword)?;
    ledger
        .latest_task_for_keyword(&keyword)
        .await?
        .ok_or_else(|| CrawlError::not_found(format!("no crawl task for keyword '{}'", keyword)))
}

pub struct StatusPoller {
    ledger: Ledger,
    interval: Duration,
}

impl StatusPoller {
    pub fn new(ledger: Ledger, interval: Duration) -> Self {
        Self {
            ledger,
            interval: interval.max(MIN_POLL_INTERVAL),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Poll until the latest task for `keyword` is terminal.
    ///
    /// Each changed snapshot is passed to `reporter`; the terminal snapshot
    /// is returned.
    pub async fn watch(&self, keyword: &str, reporter: &dyn ProgressReporter) -> Result<CrawlTask> {
        let mut last: Option<CrawlTask> = None;
        loop {
            let task = get_status(&self.ledger, keyword).await?;
            if last.as_ref() != Some(&task) {
                reporter.report(&task);
            }
            if task.status.is_terminal() {
                return Ok(task);
            }
            debug!(task_id = task.id, status = %task.status, progress = task.progress, "polled");
            last = Some(task);
            tokio::time::sleep(self.interval).await;
        }
    }
}
