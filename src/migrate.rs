//! Database schema migrations (idempotent).
//!
//! The `crawl_tasks` table carries a partial unique index over
//! `(keyword_id) WHERE status IN ('pending', 'running')`: SQLite itself
//! rejects a second in-flight task for the same keyword.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create all ledger tables and indexes on an existing pool.
pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS keywords (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            text TEXT NOT NULL UNIQUE,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS crawl_tasks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            keyword_id INTEGER NOT NULL,
            status TEXT NOT NULL
                CHECK (status IN ('pending', 'running', 'completed', 'failed')),
            progress INTEGER NOT NULL DEFAULT 0
                CHECK (progress BETWEEN 0 AND 100),
            message TEXT,
            started_at INTEGER NOT NULL,
            completed_at INTEGER,
            FOREIGN KEY (keyword_id) REFERENCES keywords(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Written by the collector; the core only counts and purges these.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS repositories (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            full_name TEXT NOT NULL UNIQUE,
            language TEXT,
            stars INTEGER NOT NULL DEFAULT 0,
            url TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS repository_keywords (
            repository_id INTEGER NOT NULL,
            keyword_id INTEGER NOT NULL,
            PRIMARY KEY (repository_id, keyword_id),
            FOREIGN KEY (repository_id) REFERENCES repositories(id),
            FOREIGN KEY (keyword_id) REFERENCES keywords(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Written by the analyzer.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS analytics (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            keyword_id INTEGER NOT NULL,
            data_json TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL,
            FOREIGN KEY (keyword_id) REFERENCES keywords(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_crawl_tasks_in_flight
            ON crawl_tasks(keyword_id)
            WHERE status IN ('pending', 'running')
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_crawl_tasks_keyword_started ON crawl_tasks(keyword_id, started_at DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_crawl_tasks_status ON crawl_tasks(status)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_repository_keywords_keyword ON repository_keywords(keyword_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_analytics_keyword ON analytics(keyword_id)")
        .execute(pool)
        .await?;

    Ok(())
}
