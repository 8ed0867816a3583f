//! Pipeline orchestrator: drives one task through collect then analyze.
//!
//! ```text
//! pending ──handoff──▶ running(5) ──collect ok──▶ running(80) ──analyze ok──▶ completed(100)
//!    │                      │                           │
//!    └──────────────────────┴──── any failure ──────────┴──▶ failed (progress retained)
//! ```
//!
//! Runs are fire-and-forget: [`Orchestrator::spawn`] returns immediately and
//! the caller observes the outcome through status polling. Whatever happens
//! inside a run, including a panic, the task ends `completed` or `failed`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::{CrawlError, Result};
use crate::ledger::{Ledger, TaskUpdate};
use crate::models::{CrawlParams, Stage, TaskStatus};
use crate::runner::{StageInvocation, StageProgress, StageRunner};

pub const HANDOFF_PROGRESS: i64 = 5;
pub const ANALYZE_PROGRESS: i64 = 80;
pub const COMPLETE_PROGRESS: i64 = 100;

const FAIL_WRITE_ATTEMPTS: u32 = 8;
const FAIL_WRITE_BASE_DELAY: Duration = Duration::from_millis(200);
const FAIL_WRITE_MAX_DELAY: Duration = Duration::from_secs(5);

/// Delay before the next attempt to record a failure, doubling up to a cap.
fn failure_backoff(attempt: u32) -> Duration {
    let factor = 1u32 << attempt.saturating_sub(1).min(16);
    FAIL_WRITE_BASE_DELAY
        .saturating_mul(factor)
        .min(FAIL_WRITE_MAX_DELAY)
}

/// Overall progress window owned by a stage.
fn progress_band(stage: Stage) -> (i64, i64) {
    match stage {
        Stage::Collect => (HANDOFF_PROGRESS, ANALYZE_PROGRESS),
        Stage::Analyze => (ANALYZE_PROGRESS, COMPLETE_PROGRESS - 1),
    }
}

/// Map a stage-local percentage into the stage's band.
pub fn scale_progress(stage: Stage, percent: u8) -> i64 {
    let (lo, hi) = progress_band(stage);
    lo + (hi - lo) * i64::from(percent.min(100)) / 100
}

/// Everything needed to run one task's pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineRun {
    pub task_id: i64,
    pub keyword: String,
    pub params: CrawlParams,
}

#[derive(Clone)]
pub struct Orchestrator {
    ledger: Ledger,
    runner: Arc<dyn StageRunner>,
}

impl Orchestrator {
    pub fn new(ledger: Ledger, runner: Arc<dyn StageRunner>) -> Self {
        Self { ledger, runner }
    }

    /// Start a run in the background.
    pub fn spawn(&self, run: PipelineRun) -> JoinHandle<TaskStatus> {
        let this = self.clone();
        tokio::spawn(async move { this.run(run).await })
    }

    /// Run a pipeline to a terminal state and return that state.
    ///
    /// The stages execute in their own task so a panic is observed here as
    /// a join error and recorded like any other failure.
    pub async fn run(&self, run: PipelineRun) -> TaskStatus {
        let task_id = run.task_id;
        let keyword = run.keyword.clone();

        let inner = self.clone();
        let outcome = tokio::spawn(async move { inner.execute(&run).await }).await;

        let message = match outcome {
            Ok(Ok(())) => return TaskStatus::Completed,
            Ok(Err(e @ CrawlError::ExternalProcess { .. })) => e.to_string(),
            Ok(Err(e)) => format!("pipeline error: {}", e),
            Err(join_err) if join_err.is_panic() => "pipeline error: worker panicked".to_string(),
            Err(join_err) => format!("pipeline error: {}", join_err),
        };

        error!(task_id, keyword = %keyword, error = %message, "pipeline failed");
        self.record_failure(task_id, &keyword, &message).await;
        TaskStatus::Failed
    }

    async fn execute(&self, run: &PipelineRun) -> Result<()> {
        self.transition(
            run.task_id,
            TaskUpdate::new(TaskStatus::Running, HANDOFF_PROGRESS, "collecting repositories"),
        )
        .await?;

        self.run_stage(Stage::Collect, run).await?;

        self.transition(
            run.task_id,
            TaskUpdate::new(TaskStatus::Running, ANALYZE_PROGRESS, "analyzing results"),
        )
        .await?;

        self.run_stage(Stage::Analyze, run).await?;

        self.transition(
            run.task_id,
            TaskUpdate::new(
                TaskStatus::Completed,
                COMPLETE_PROGRESS,
                "crawl and analysis completed",
            ),
        )
        .await
    }

    async fn transition(&self, task_id: i64, update: TaskUpdate) -> Result<()> {
        if !self.ledger.update_task(task_id, &update).await? {
            return Err(CrawlError::Internal(format!(
                "task {} is no longer in flight",
                task_id
            )));
        }
        info!(
            task_id,
            status = %update.status,
            progress = update.progress,
            "task transition"
        );
        Ok(())
    }

    async fn run_stage(&self, stage: Stage, run: &PipelineRun) -> Result<()> {
        let invocation = StageInvocation {
            stage,
            task_id: run.task_id,
            keyword: run.keyword.clone(),
            params: run.params.clone(),
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<StageProgress>();
        let stage_run = self.runner.run(&invocation, tx);
        let forward = async {
            while let Some(p) = rx.recv().await {
                let message = p
                    .message
                    .unwrap_or_else(|| format!("{} {}%", stage, p.percent));
                let update =
                    TaskUpdate::new(TaskStatus::Running, scale_progress(stage, p.percent), message);
                if let Err(e) = self.ledger.update_task(run.task_id, &update).await {
                    warn!(task_id = run.task_id, error = %e, "progress update failed");
                }
            }
        };

        let (result, ()) = tokio::join!(stage_run, forward);
        result
    }

    /// Drive the task to `failed`. Progress already reached is kept.
    async fn record_failure(&self, task_id: i64, keyword: &str, message: &str) {
        let update = TaskUpdate::new(TaskStatus::Failed, 0, message);
        for attempt in 1..=FAIL_WRITE_ATTEMPTS {
            match self.ledger.update_task(task_id, &update).await {
                Ok(true) => {
                    info!(task_id, status = %TaskStatus::Failed, "task transition");
                    return;
                }
                Ok(false) => {
                    warn!(task_id, "task already terminal or removed; failure not recorded");
                    return;
                }
                Err(e) => {
                    warn!(task_id, attempt, error = %e, "could not record failure");
                    if attempt < FAIL_WRITE_ATTEMPTS {
                        tokio::time::sleep(failure_backoff(attempt)).await;
                    }
                }
            }
        }
        // The row stays in flight, so admission keeps re-attaching to it.
        error!(
            task_id,
            keyword = %keyword,
            "giving up recording failure; run `crawl cleanup --apply --keyword \"{}\"` to clear the stuck task",
            keyword
        );
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::mpsc::UnboundedSender;

    /// Scripted stage runner that records every invocation.
    #[derive(Default)]
    pub struct FakeRunner {
        pub fail: Option<Stage>,
        pub panic_on: Option<Stage>,
        pub progress: Vec<u8>,
        pub collect_calls: AtomicUsize,
        pub analyze_calls: AtomicUsize,
        pub invocations: Mutex<Vec<StageInvocation>>,
    }

    impl FakeRunner {
        pub fn calls(&self, stage: Stage) -> usize {
            match stage {
                Stage::Collect => self.collect_calls.load(Ordering::SeqCst),
                Stage::Analyze => self.analyze_calls.load(Ordering::SeqCst),
            }
        }
    }

    #[async_trait]
    impl StageRunner for FakeRunner {
        async fn run(
            &self,
            invocation: &StageInvocation,
            progress: UnboundedSender<StageProgress>,
        ) -> Result<()> {
            match invocation.stage {
                Stage::Collect => self.collect_calls.fetch_add(1, Ordering::SeqCst),
                Stage::Analyze => self.analyze_calls.fetch_add(1, Ordering::SeqCst),
            };
            self.invocations.lock().unwrap().push(invocation.clone());

            if self.panic_on == Some(invocation.stage) {
                panic!("scripted panic in {} stage", invocation.stage);
            }
            for pct in &self.progress {
                let _ = progress.send(StageProgress {
                    percent: *pct,
                    message: None,
                });
            }
            if self.fail == Some(invocation.stage) {
                return Err(CrawlError::ExternalProcess {
                    stage: invocation.stage,
                    message: "exit code 1".to_string(),
                });
            }
            Ok(())
        }
    }
}
