//! Crawl operations shared by the HTTP server and the CLI.
//!
//! [`CrawlService`] owns the ledger, result store, admission guard,
//! orchestrator, and reconciler, and exposes one method per external
//! operation. Submissions return as soon as the task is admitted; the
//! pipeline keeps running in the background.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;
use tracing::info;

use crate::admission::{normalize_keyword, AdmissionGuard};
use crate::config::Config;
use crate::error::{CrawlError, Result};
use crate::ledger::Ledger;
use crate::models::{Admission, CrawlParams, CrawlTask, TaskStatus};
use crate::pipeline::{Orchestrator, PipelineRun};
use crate::reconcile::{CleanupReport, Reconciler};
use crate::results::ResultStore;
use crate::runner::{ProcessRunner, StageRunner};
use crate::stats::{collect_stats, TaskStats};
use crate::status::get_status;

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    #[serde(default)]
    pub keyword: String,
    #[serde(default)]
    pub languages: Option<Vec<String>>,
    #[serde(default)]
    pub limits: Option<BTreeMap<String, u32>>,
}

impl SubmitRequest {
    pub fn new(keyword: impl Into<String>) -> Self {
        Self {
            keyword: keyword.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub success: bool,
    pub task_id: i64,
    pub keyword: String,
    pub created: bool,
    pub message: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListQuery {
    pub page: Option<u32>,
    pub limit: Option<u32>,
    pub status: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPage {
    pub tasks: Vec<CrawlTask>,
    pub total: i64,
    pub page: u32,
    pub limit: u32,
    pub total_pages: i64,
}

/// Counts pipelines still running so the CLI can wait for them.
#[derive(Default)]
struct PipelineTracker {
    running: AtomicUsize,
    idle: Notify,
}

struct TrackerGuard(Arc<PipelineTracker>);

impl Drop for TrackerGuard {
    fn drop(&mut self) {
        if self.0.running.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

#[derive(Clone)]
pub struct CrawlService {
    ledger: Ledger,
    store: ResultStore,
    admission: AdmissionGuard,
    orchestrator: Orchestrator,
    reconciler: Reconciler,
    defaults: CrawlParams,
    tracker: Arc<PipelineTracker>,
}

impl CrawlService {
    pub fn new(
        ledger: Ledger,
        store: ResultStore,
        runner: Arc<dyn StageRunner>,
        defaults: CrawlParams,
    ) -> Self {
        Self {
            admission: AdmissionGuard::new(ledger.clone()),
            orchestrator: Orchestrator::new(ledger.clone(), runner),
            reconciler: Reconciler::new(ledger.clone(), store.clone()),
            ledger,
            store,
            defaults,
            tracker: Arc::new(PipelineTracker::default()),
        }
    }

    /// Connect to the configured ledger (migrating it if needed) and wire
    /// the process runner from the pipeline config.
    pub async fn open(config: &Config) -> anyhow::Result<Self> {
        let pool = crate::db::connect(config).await?;
        crate::migrate::migrate_pool(&pool).await?;

        let defaults = CrawlParams {
            languages: config.pipeline.default_languages.clone(),
            limits: config.pipeline.default_limits.clone(),
        };
        Ok(Self::new(
            Ledger::new(pool),
            ResultStore::from_config(&config.results),
            Arc::new(ProcessRunner::from_config(&config.pipeline)),
            defaults,
        ))
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Admit a crawl for a keyword, creating the keyword if needed.
    pub async fn submit(&self, req: SubmitRequest) -> Result<SubmitResponse> {
        let params = self.resolve_params(&req)?;
        let admission = self.admission.admit(&req.keyword).await?;
        Ok(self.launch(admission, params, "crawl task created"))
    }

    /// Like [`submit`](Self::submit) but the keyword must already exist.
    pub async fn recrawl(&self, req: SubmitRequest) -> Result<SubmitResponse> {
        let params = self.resolve_params(&req)?;
        let admission = self.admission.admit_existing(&req.keyword).await?;
        Ok(self.launch(admission, params, "recrawl task created"))
    }

    /// Start a fresh task for the keyword of a failed task.
    pub async fn retry(&self, original_task_id: i64) -> Result<SubmitResponse> {
        let admission = self.admission.retry(original_task_id).await?;
        let message = format!("retry of task {} created", original_task_id);
        Ok(self.launch(admission, self.defaults.clone(), &message))
    }

    pub async fn status(&self, keyword: &str) -> Result<CrawlTask> {
        get_status(&self.ledger, keyword).await
    }

    /// Scan for drift; repair it and purge `keyword` only when `apply` is set.
    pub async fn cleanup(&self, apply: bool, keyword: Option<&str>) -> Result<CleanupReport> {
        let target = match keyword.map(str::trim).filter(|k| !k.is_empty()) {
            Some(k) => Some(normalize_keyword(k)?),
            None => None,
        };
        info!(apply, target = ?target, "cleanup requested");
        self.reconciler.cleanup(apply, target.as_deref()).await
    }

    pub async fn list_tasks(&self, query: &ListQuery) -> Result<TaskPage> {
        let page = query.page.unwrap_or(1).max(1);
        let limit = query
            .limit
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE);
        let status = match query.status.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(s) => Some(s.parse::<TaskStatus>().map_err(CrawlError::Validation)?),
        };

        let (tasks, total) = self.ledger.list_tasks(status, page, limit).await?;
        let total_pages = (total + i64::from(limit) - 1) / i64::from(limit);
        Ok(TaskPage {
            tasks,
            total,
            page,
            limit,
            total_pages,
        })
    }

    pub async fn stats(&self) -> Result<TaskStats> {
        collect_stats(&self.ledger).await
    }

    pub async fn delete_task(&self, task_id: i64) -> Result<()> {
        self.ledger.delete_task(task_id).await?;
        info!(task_id, "task deleted");
        Ok(())
    }

    /// The analysis artifact for a keyword.
    pub async fn get_analysis(&self, keyword: &str) -> Result<Value> {
        let keyword = normalize_keyword(keyword)?;
        self.store
            .load_artifact(&keyword)?
            .ok_or_else(|| CrawlError::not_found(format!("no analysis for keyword '{}'", keyword)))
    }

    /// Wait until every pipeline spawned by this service has finished.
    pub async fn wait_idle(&self) {
        loop {
            let idle = self.tracker.idle.notified();
            if self.tracker.running.load(Ordering::SeqCst) == 0 {
                return;
            }
            idle.await;
        }
    }

    fn launch(&self, admission: Admission, params: CrawlParams, created_message: &str) -> SubmitResponse {
        let message = if admission.created {
            self.spawn_pipeline(PipelineRun {
                task_id: admission.task_id,
                keyword: admission.keyword.clone(),
                params,
            });
            created_message.to_string()
        } else {
            "keyword is already being processed; poll its status for progress".to_string()
        };

        SubmitResponse {
            success: true,
            task_id: admission.task_id,
            keyword: admission.keyword,
            created: admission.created,
            message,
        }
    }

    fn spawn_pipeline(&self, run: PipelineRun) {
        self.tracker.running.fetch_add(1, Ordering::SeqCst);
        let guard = TrackerGuard(self.tracker.clone());
        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move {
            let _guard = guard;
            orchestrator.run(run).await
        });
    }

    fn resolve_params(&self, req: &SubmitRequest) -> Result<CrawlParams> {
        let languages = match &req.languages {
            Some(langs) if !langs.is_empty() => langs
                .iter()
                .map(|l| l.trim().to_string())
                .collect::<Vec<_>>(),
            _ => self.defaults.languages.clone(),
        };
        for lang in &languages {
            if lang.is_empty() || lang.contains([',', '=']) || lang.chars().any(char::is_whitespace) {
                return Err(CrawlError::validation(format!("invalid language '{}'", lang)));
            }
        }

        let limits = match &req.limits {
            Some(limits) if !limits.is_empty() => limits.clone(),
            _ => self.defaults.limits.clone(),
        };
        for (lang, limit) in &limits {
            if *limit == 0 {
                return Err(CrawlError::validation(format!(
                    "limit for '{}' must be greater than zero",
                    lang
                )));
            }
            if lang.trim().is_empty() || lang.contains([',', '=']) {
                return Err(CrawlError::validation(format!("invalid language '{}'", lang)));
            }
        }

        Ok(CrawlParams { languages, limits })
    }
}
