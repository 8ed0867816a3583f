//! SQLite-backed task ledger.
//!
//! The ledger is the single mutable source of truth for keywords and crawl
//! tasks. Every operation here is one SQL statement or one transaction;
//! status transitions are guarded in the `WHERE` clause so a terminal row is
//! never moved again, even by a late writer.

use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::error::{CrawlError, Result};
use crate::models::{millis_to_datetime, CrawlTask, Keyword, TaskStatus};

/// SELECT list shared by every query returning a [`CrawlTask`].
const TASK_COLUMNS: &str = r#"
    t.id, t.keyword_id, k.text AS keyword, t.status, t.progress, t.message,
    t.started_at, t.completed_at
"#;

/// A status transition with its progress and message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskUpdate {
    pub status: TaskStatus,
    pub progress: i64,
    pub message: String,
}

impl TaskUpdate {
    pub fn new(status: TaskStatus, progress: i64, message: impl Into<String>) -> Self {
        Self {
            status,
            progress: progress.clamp(0, 100),
            message: message.into(),
        }
    }
}

/// Rows in other tables that still reference a keyword.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeywordReferences {
    pub analytics: i64,
    pub repositories: i64,
    pub tasks: i64,
}

impl KeywordReferences {
    pub fn is_empty(&self) -> bool {
        self.analytics == 0 && self.repositories == 0 && self.tasks == 0
    }
}

/// Row counts removed by [`Ledger::purge_keyword`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgedRows {
    pub analytics: u64,
    pub repository_links: u64,
    pub crawl_tasks: u64,
    pub keyword: u64,
}

/// Task counts grouped by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
}

impl StatusCounts {
    pub fn in_flight(&self) -> i64 {
        self.pending + self.running
    }

    pub fn total(&self) -> i64 {
        self.pending + self.running + self.completed + self.failed
    }
}

#[derive(Clone)]
pub struct Ledger {
    pool: SqlitePool,
}

impl Ledger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ── Keywords ────────────────────────────────────────────────────

    pub async fn find_keyword(&self, text: &str) -> Result<Option<Keyword>> {
        let row = sqlx::query("SELECT id, text, created_at FROM keywords WHERE text = ?")
            .bind(text)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(keyword_from_row).transpose()?)
    }

    /// Look up a keyword by text, creating it when absent.
    ///
    /// Concurrent callers for the same text converge on the same row.
    pub async fn get_or_create_keyword(&self, text: &str) -> Result<Keyword> {
        sqlx::query("INSERT INTO keywords (text, created_at) VALUES (?, ?) ON CONFLICT(text) DO NOTHING")
            .bind(text)
            .bind(Utc::now().timestamp_millis())
            .execute(&self.pool)
            .await?;

        self.find_keyword(text)
            .await?
            .ok_or_else(|| {
                CrawlError::not_found(format!("keyword '{}' was removed while being created", text))
            })
    }

    pub async fn list_keywords(&self) -> Result<Vec<Keyword>> {
        let rows = sqlx::query("SELECT id, text, created_at FROM keywords ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(keyword_from_row).collect()
    }

    pub async fn keyword_references(&self, keyword_id: i64) -> Result<KeywordReferences> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM analytics WHERE keyword_id = ?1) AS analytics,
                (SELECT COUNT(*) FROM repository_keywords WHERE keyword_id = ?1) AS repositories,
                (SELECT COUNT(*) FROM crawl_tasks WHERE keyword_id = ?1) AS tasks
            "#,
        )
        .bind(keyword_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(KeywordReferences {
            analytics: row.try_get("analytics")?,
            repositories: row.try_get("repositories")?,
            tasks: row.try_get("tasks")?,
        })
    }

    /// Delete a keyword only if nothing references it any more.
    ///
    /// Returns `false` when the row is gone or gained a reference since it
    /// was scanned (for example a submission that raced the cleanup).
    pub async fn delete_unreferenced_keyword(&self, keyword_id: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM keywords
            WHERE id = ?1
              AND NOT EXISTS (SELECT 1 FROM crawl_tasks WHERE keyword_id = ?1)
              AND NOT EXISTS (SELECT 1 FROM analytics WHERE keyword_id = ?1)
              AND NOT EXISTS (SELECT 1 FROM repository_keywords WHERE keyword_id = ?1)
            "#,
        )
        .bind(keyword_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Unconditionally remove a keyword and everything that references it.
    ///
    /// Returns `None` when no keyword with that text exists.
    pub async fn purge_keyword(&self, text: &str) -> Result<Option<PurgedRows>> {
        let mut tx = self.pool.begin().await?;

        let keyword_id: Option<i64> = sqlx::query_scalar("SELECT id FROM keywords WHERE text = ?")
            .bind(text)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(keyword_id) = keyword_id else {
            return Ok(None);
        };

        let analytics = sqlx::query("DELETE FROM analytics WHERE keyword_id = ?")
            .bind(keyword_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let repository_links = sqlx::query("DELETE FROM repository_keywords WHERE keyword_id = ?")
            .bind(keyword_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let crawl_tasks = sqlx::query("DELETE FROM crawl_tasks WHERE keyword_id = ?")
            .bind(keyword_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let keyword = sqlx::query("DELETE FROM keywords WHERE id = ?")
            .bind(keyword_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;

        Ok(Some(PurgedRows {
            analytics,
            repository_links,
            crawl_tasks,
            keyword,
        }))
    }

    // ── Tasks ───────────────────────────────────────────────────────

    pub async fn get_task(&self, task_id: i64) -> Result<Option<CrawlTask>> {
        let sql = format!(
            "SELECT {} FROM crawl_tasks t JOIN keywords k ON k.id = t.keyword_id WHERE t.id = ?",
            TASK_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(task_from_row).transpose()?)
    }

    /// The pending or running task for a keyword, if any.
    pub async fn find_in_flight(&self, keyword_id: i64) -> Result<Option<CrawlTask>> {
        let sql = format!(
            r#"
            SELECT {} FROM crawl_tasks t JOIN keywords k ON k.id = t.keyword_id
            WHERE t.keyword_id = ? AND t.status IN ('pending', 'running')
            ORDER BY t.started_at DESC, t.id DESC
            LIMIT 1
            "#,
            TASK_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(keyword_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(task_from_row).transpose()?)
    }

    /// The most recently started task for a keyword text.
    pub async fn latest_task_for_keyword(&self, text: &str) -> Result<Option<CrawlTask>> {
        let sql = format!(
            r#"
            SELECT {} FROM crawl_tasks t JOIN keywords k ON k.id = t.keyword_id
            WHERE k.text = ?
            ORDER BY t.started_at DESC, t.id DESC
            LIMIT 1
            "#,
            TASK_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(text)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(task_from_row).transpose()?)
    }

    /// Insert a `pending` task at progress 0.
    ///
    /// Returns `Ok(None)` when the in-flight unique index rejects the row,
    /// meaning another task for this keyword is already pending or running.
    /// A keyword deleted since it was read is reported as `NotFound`.
    pub async fn insert_pending_task(&self, keyword_id: i64, message: &str) -> Result<Option<i64>> {
        let result = sqlx::query(
            r#"
            INSERT INTO crawl_tasks (keyword_id, status, progress, message, started_at)
            VALUES (?, 'pending', 0, ?, ?)
            "#,
        )
        .bind(keyword_id)
        .bind(message)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => Ok(Some(done.last_insert_rowid())),
            Err(e) if is_unique_violation(&e) => Ok(None),
            Err(e) if is_foreign_key_violation(&e) => Err(CrawlError::not_found(format!(
                "keyword {} no longer exists",
                keyword_id
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Apply a status transition.
    ///
    /// The update only matches rows whose current status may legally move
    /// to `update.status`, and progress never decreases. Returns `false`
    /// when the row is missing or already terminal.
    pub async fn update_task(&self, task_id: i64, update: &TaskUpdate) -> Result<bool> {
        let predecessors: Vec<&str> = TaskStatus::ALL
            .iter()
            .filter(|from| from.can_transition_to(update.status))
            .map(|from| from.as_str())
            .collect();
        if predecessors.is_empty() {
            return Ok(false);
        }

        let placeholders = vec!["?"; predecessors.len()].join(", ");
        let sql = format!(
            r#"
            UPDATE crawl_tasks
            SET status = ?,
                progress = MAX(progress, ?),
                message = ?,
                completed_at = ?
            WHERE id = ? AND status IN ({})
            "#,
            placeholders
        );

        let completed_at = update
            .status
            .is_terminal()
            .then(|| Utc::now().timestamp_millis());

        let mut query = sqlx::query(&sql)
            .bind(update.status.as_str())
            .bind(update.progress)
            .bind(update.message.as_str())
            .bind(completed_at)
            .bind(task_id);
        for status in predecessors {
            query = query.bind(status);
        }

        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    /// Page through tasks, newest first, optionally filtered by status.
    pub async fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        page: u32,
        limit: u32,
    ) -> Result<(Vec<CrawlTask>, i64)> {
        let offset = i64::from(page.saturating_sub(1)) * i64::from(limit);
        let filter = if status.is_some() { "WHERE t.status = ?" } else { "" };

        let sql = format!(
            r#"
            SELECT {} FROM crawl_tasks t JOIN keywords k ON k.id = t.keyword_id
            {}
            ORDER BY t.started_at DESC, t.id DESC
            LIMIT ? OFFSET ?
            "#,
            TASK_COLUMNS, filter
        );
        let mut query = sqlx::query(&sql);
        if let Some(s) = status {
            query = query.bind(s.as_str());
        }
        let rows = query
            .bind(i64::from(limit))
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;
        let tasks = rows.iter().map(task_from_row).collect::<Result<Vec<_>>>()?;

        let total: i64 = match status {
            Some(s) => {
                sqlx::query_scalar("SELECT COUNT(*) FROM crawl_tasks WHERE status = ?")
                    .bind(s.as_str())
                    .fetch_one(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_scalar("SELECT COUNT(*) FROM crawl_tasks")
                    .fetch_one(&self.pool)
                    .await?
            }
        };

        Ok((tasks, total))
    }

    pub async fn status_counts(&self) -> Result<StatusCounts> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM crawl_tasks GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut counts = StatusCounts::default();
        for row in &rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            match status.parse::<TaskStatus>() {
                Ok(TaskStatus::Pending) => counts.pending = n,
                Ok(TaskStatus::Running) => counts.running = n,
                Ok(TaskStatus::Completed) => counts.completed = n,
                Ok(TaskStatus::Failed) => counts.failed = n,
                Err(e) => return Err(CrawlError::Internal(e)),
            }
        }
        Ok(counts)
    }

    /// Remove one terminal task row.
    pub async fn delete_task(&self, task_id: i64) -> Result<()> {
        let task = self
            .get_task(task_id)
            .await?
            .ok_or_else(|| CrawlError::not_found(format!("task {} not found", task_id)))?;

        if task.status.is_in_flight() {
            return Err(CrawlError::conflict(format!(
                "task {} is {}; only completed or failed tasks can be deleted",
                task_id, task.status
            )));
        }

        let result =
            sqlx::query("DELETE FROM crawl_tasks WHERE id = ? AND status IN ('completed', 'failed')")
                .bind(task_id)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(CrawlError::not_found(format!("task {} not found", task_id)));
        }
        Ok(())
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_foreign_key_violation())
}

fn keyword_from_row(row: &SqliteRow) -> Result<Keyword> {
    Ok(Keyword {
        id: row.try_get("id")?,
        text: row.try_get("text")?,
        created_at: millis_to_datetime(row.try_get("created_at")?),
    })
}

fn task_from_row(row: &SqliteRow) -> Result<CrawlTask> {
    let status: String = row.try_get("status")?;
    let completed_at: Option<i64> = row.try_get("completed_at")?;
    Ok(CrawlTask {
        id: row.try_get("id")?,
        keyword_id: row.try_get("keyword_id")?,
        keyword: row.try_get("keyword")?,
        status: status.parse().map_err(CrawlError::Internal)?,
        progress: row.try_get("progress")?,
        message: row.try_get("message")?,
        started_at: millis_to_datetime(row.try_get("started_at")?),
        completed_at: completed_at.map(millis_to_datetime),
    })
}
