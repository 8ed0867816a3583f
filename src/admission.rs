//! Admission guard: at most one in-flight task per keyword.
//!
//! The check-then-create sequence is serialized by the ledger's partial
//! unique index. A losing insert re-reads the in-flight row and re-attaches
//! the caller to it instead of failing.

use tracing::{debug, info};

use crate::error::{CrawlError, Result};
use crate::ledger::Ledger;
use crate::models::{Admission, Keyword, TaskStatus};

const MAX_KEYWORD_CHARS: usize = 200;
const ADMIT_ATTEMPTS: usize = 3;

/// Trim and validate a keyword submitted by a caller.
pub fn normalize_keyword(raw: &str) -> Result<String> {
    let keyword = raw.trim();
    if keyword.is_empty() {
        return Err(CrawlError::validation("keyword must not be empty"));
    }
    if keyword.chars().count() > MAX_KEYWORD_CHARS {
        return Err(CrawlError::validation(format!(
            "keyword must be at most {} characters",
            MAX_KEYWORD_CHARS
        )));
    }
    if keyword.contains(['/', '\\']) || keyword.chars().any(char::is_control) {
        return Err(CrawlError::validation(
            "keyword must not contain path separators or control characters",
        ));
    }
    Ok(keyword.to_string())
}

#[derive(Clone)]
pub struct AdmissionGuard {
    ledger: Ledger,
}

impl AdmissionGuard {
    pub fn new(ledger: Ledger) -> Self {
        Self { ledger }
    }

    /// Admit a crawl for `keyword`, creating the keyword if needed.
    ///
    /// A cleanup may delete the fresh, still unreferenced keyword before its
    /// task row lands. The keyword is then created again and admission
    /// retried.
    pub async fn admit(&self, keyword: &str) -> Result<Admission> {
        let keyword = normalize_keyword(keyword)?;
        for _ in 0..ADMIT_ATTEMPTS {
            let attempt = match self.ledger.get_or_create_keyword(&keyword).await {
                Ok(kw) => self.try_admit(&kw, "queued").await,
                Err(e) => Err(e),
            };
            match attempt {
                Ok(Some(admission)) => return Ok(admission),
                Ok(None) => {}
                Err(CrawlError::NotFound(reason)) => {
                    debug!(keyword = %keyword, reason = %reason, "keyword removed during admission");
                }
                Err(e) => return Err(e),
            }
        }
        Err(admission_exhausted(&keyword))
    }

    /// Admit a crawl for a keyword that must already exist.
    pub async fn admit_existing(&self, keyword: &str) -> Result<Admission> {
        let keyword = normalize_keyword(keyword)?;
        let kw = self
            .ledger
            .find_keyword(&keyword)
            .await?
            .ok_or_else(|| CrawlError::not_found(format!("keyword '{}' not found", keyword)))?;
        for _ in 0..ADMIT_ATTEMPTS {
            if let Some(admission) = self.try_admit(&kw, "recrawl queued").await? {
                return Ok(admission);
            }
        }
        Err(admission_exhausted(&keyword))
    }

    /// Start a fresh task for the keyword of a failed task.
    ///
    /// The original row is never touched. Refused unless the original is
    /// `failed` and nothing else is in flight for its keyword.
    pub async fn retry(&self, original_task_id: i64) -> Result<Admission> {
        let original = self
            .ledger
            .get_task(original_task_id)
            .await?
            .ok_or_else(|| CrawlError::not_found(format!("task {} not found", original_task_id)))?;

        if original.status != TaskStatus::Failed {
            return Err(CrawlError::conflict(format!(
                "task {} is {}; only failed tasks can be retried",
                original.id, original.status
            )));
        }

        if let Some(active) = self.ledger.find_in_flight(original.keyword_id).await? {
            return Err(CrawlError::conflict(format!(
                "keyword '{}' already has task {} in flight",
                original.keyword, active.id
            )));
        }

        let message = format!("retry of task {} queued", original.id);
        match self
            .ledger
            .insert_pending_task(original.keyword_id, &message)
            .await?
        {
            Some(task_id) => {
                info!(task_id, original_task_id, keyword = %original.keyword, "retry admitted");
                Ok(Admission {
                    task_id,
                    keyword: original.keyword,
                    created: true,
                })
            }
            None => Err(CrawlError::conflict(format!(
                "keyword '{}' already has a task in flight",
                original.keyword
            ))),
        }
    }

    /// Re-attach to the in-flight task or insert a new one. `Ok(None)`
    /// means the insert lost a race and the caller should read again.
    async fn try_admit(&self, kw: &Keyword, message: &str) -> Result<Option<Admission>> {
        if let Some(task) = self.ledger.find_in_flight(kw.id).await? {
            debug!(task_id = task.id, keyword = %kw.text, "re-attached to in-flight task");
            return Ok(Some(Admission {
                task_id: task.id,
                keyword: kw.text.clone(),
                created: false,
            }));
        }

        Ok(self
            .ledger
            .insert_pending_task(kw.id, message)
            .await?
            .map(|task_id| {
                info!(task_id, keyword = %kw.text, "task admitted");
                Admission {
                    task_id,
                    keyword: kw.text.clone(),
                    created: true,
                }
            }))
    }
}

fn admission_exhausted(keyword: &str) -> CrawlError {
    CrawlError::Internal(format!("could not admit a task for keyword '{}'", keyword))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::test_support::temp_ledger;
    use crate::ledger::TaskUpdate;

    #[test]
    fn keyword_validation() {
        assert_eq!(normalize_keyword("  rust async ").unwrap(), "rust async");
        assert!(matches!(normalize_keyword("   "), Err(CrawlError::Validation(_))));
        assert!(normalize_keyword("a/b").is_err());
        assert!(normalize_keyword(&"x".repeat(201)).is_err());
    }

    #[tokio::test]
    async fn repeated_admission_reattaches() {
        let (_dir, ledger) = temp_ledger().await;
        let guard = AdmissionGuard::new(ledger.clone());

        let first = guard.admit("rust-async").await.unwrap();
        let second = guard.admit("rust-async").await.unwrap();
        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.task_id, second.task_id);

        let counts = ledger.status_counts().await.unwrap();
        assert_eq!(counts.in_flight(), 1);
    }

    #[tokio::test]
    async fn concurrent_admissions_create_one_task() {
        let (_dir, ledger) = temp_ledger().await;
        let guard = AdmissionGuard::new(ledger.clone());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let g = guard.clone();
            handles.push(tokio::spawn(async move { g.admit("tokio").await }));
        }
        let mut ids = Vec::new();
        for h in handles {
            ids.push(h.await.unwrap().unwrap().task_id);
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(ledger.status_counts().await.unwrap().total(), 1);
    }

    #[tokio::test]
    async fn retry_requires_failed_original() {
        let (_dir, ledger) = temp_ledger().await;
        let guard = AdmissionGuard::new(ledger.clone());
        let first = guard.admit("serde").await.unwrap();

        // pending
        assert!(matches!(guard.retry(first.task_id).await, Err(CrawlError::Conflict(_))));

        ledger
            .update_task(first.task_id, &TaskUpdate::new(TaskStatus::Running, 5, "running"))
            .await
            .unwrap();
        assert!(matches!(guard.retry(first.task_id).await, Err(CrawlError::Conflict(_))));

        ledger
            .update_task(first.task_id, &TaskUpdate::new(TaskStatus::Completed, 100, "done"))
            .await
            .unwrap();
        assert!(matches!(guard.retry(first.task_id).await, Err(CrawlError::Conflict(_))));
        assert_eq!(ledger.status_counts().await.unwrap().total(), 1);

        assert!(matches!(guard.retry(9999).await, Err(CrawlError::NotFound(_))));
    }

    #[tokio::test]
    async fn retry_creates_fresh_task() {
        let (_dir, ledger) = temp_ledger().await;
        let guard = AdmissionGuard::new(ledger.clone());
        let first = guard.admit("axum").await.unwrap();
        ledger
            .update_task(first.task_id, &TaskUpdate::new(TaskStatus::Failed, 0, "boom"))
            .await
            .unwrap();

        let retried = guard.retry(first.task_id).await.unwrap();
        assert!(retried.created);
        assert_ne!(retried.task_id, first.task_id);
        assert_eq!(retried.keyword, "axum");

        let old = ledger.get_task(first.task_id).await.unwrap().unwrap();
        assert_eq!(old.status, TaskStatus::Failed);
        let new = ledger.get_task(retried.task_id).await.unwrap().unwrap();
        assert_eq!(new.keyword_id, old.keyword_id);
        assert_eq!(new.status, TaskStatus::Pending);

        // a second retry of the same failed task collides with the new one
        assert!(matches!(guard.retry(first.task_id).await, Err(CrawlError::Conflict(_))));
    }

    #[tokio::test]
    async fn keyword_deleted_before_insert_is_recreated() {
        let (_dir, ledger) = temp_ledger().await;
        let guard = AdmissionGuard::new(ledger.clone());

        // cleanup removes the keyword between its creation and the task insert
        let stale = ledger.get_or_create_keyword("race").await.unwrap();
        assert!(ledger.delete_unreferenced_keyword(stale.id).await.unwrap());
        assert!(matches!(
            guard.try_admit(&stale, "queued").await,
            Err(CrawlError::NotFound(_))
        ));

        let admission = guard.admit("race").await.unwrap();
        assert!(admission.created);
        let task = ledger.get_task(admission.task_id).await.unwrap().unwrap();
        let kw = ledger.find_keyword("race").await.unwrap().unwrap();
        assert_eq!(task.keyword_id, kw.id);
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn recrawl_requires_existing_keyword() {
        let (_dir, ledger) = temp_ledger().await;
        let guard = AdmissionGuard::new(ledger);
        assert!(matches!(
            guard.admit_existing("never seen").await,
            Err(CrawlError::NotFound(_))
        ));
        guard.admit("seen").await.unwrap();
        assert!(!guard.admit_existing("seen").await.unwrap().created);
    }
}
