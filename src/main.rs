//! # Crawl Harness CLI (`crawl`)
//!
//! The `crawl` binary drives keyword crawl tasks: it admits them, runs the
//! collector and analyzer stages, reports status, and reconciles the result
//! files with the task ledger.
//!
//! ## Usage
//!
//! ```bash
//! crawl --config ./config/crawl.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `crawl init` | Create the SQLite ledger and run schema migrations |
//! | `crawl serve` | Start the HTTP server |
//! | `crawl submit <keyword>` | Admit a crawl and run its pipeline |
//! | `crawl recrawl <keyword>` | Re-run a crawl for an existing keyword |
//! | `crawl retry <task-id>` | Retry a failed task |
//! | `crawl status <keyword>` | Show the latest task for a keyword |
//! | `crawl tasks` | List tasks, newest first |
//! | `crawl stats` | Task counts and recent tasks |
//! | `crawl cleanup` | Report (and with `--apply`, repair) drift |
//! | `crawl delete-task <id>` | Delete a finished task |
//!
//! ## Examples
//!
//! ```bash
//! crawl init
//! crawl submit "rust async" --language python --limit python=20 --wait
//! crawl status "rust async" --watch --interval 1
//! crawl cleanup --apply --keyword "old keyword"
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::bail;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crawl_harness::config::{self, Config};
use crawl_harness::migrate;
use crawl_harness::models::{CrawlTask, TaskStatus};
use crawl_harness::progress::ProgressMode;
use crawl_harness::reconcile::{CleanupReport, Finding};
use crawl_harness::server;
use crawl_harness::service::{CrawlService, ListQuery, SubmitRequest, SubmitResponse, TaskPage};
use crawl_harness::stats::{format_ts_relative, print_stats};
use crawl_harness::status::StatusPoller;

/// Crawl Harness CLI — keyword crawl orchestration and reconciliation.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/crawl.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "crawl",
    about = "Crawl Harness — keyword crawl orchestration and reconciliation",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/crawl.toml")]
    config: PathBuf,

    /// Print results as JSON on stdout and progress as JSON lines on stderr.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the ledger schema.
    ///
    /// Creates the SQLite database file and all tables. Idempotent.
    Init,

    /// Start the HTTP server on `[server].bind`.
    Serve,

    /// Submit a keyword crawl.
    ///
    /// Re-attaches to the in-flight task when the keyword is already being
    /// processed.
    Submit {
        keyword: String,
        #[command(flatten)]
        params: ParamArgs,
        #[command(flatten)]
        wait: WaitArgs,
    },

    /// Re-run a crawl for a keyword that already exists.
    Recrawl {
        keyword: String,
        #[command(flatten)]
        params: ParamArgs,
        #[command(flatten)]
        wait: WaitArgs,
    },

    /// Retry a failed task with a fresh task for the same keyword.
    Retry {
        task_id: i64,
        #[command(flatten)]
        wait: WaitArgs,
    },

    /// Show the latest task for a keyword.
    Status {
        keyword: String,
        /// Keep polling until the task completes or fails.
        #[arg(long)]
        watch: bool,
        /// Seconds between polls.
        #[arg(long, default_value = "2", value_parser = parse_interval)]
        interval: Duration,
    },

    /// List tasks, newest first.
    Tasks {
        /// Only tasks with this status (pending, running, completed, failed).
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },

    /// Show task counts and the most recent tasks.
    Stats,

    /// Report drift between the ledger and result files.
    ///
    /// Read-only unless `--apply` is given.
    Cleanup {
        /// Delete orphaned files, keywords, and index entries.
        #[arg(long)]
        apply: bool,
        /// With `--apply`, also purge this keyword and all of its data.
        #[arg(long)]
        keyword: Option<String>,
    },

    /// Delete a completed or failed task.
    DeleteTask { id: i64 },
}

#[derive(clap::Args)]
struct ParamArgs {
    /// Language to crawl (repeatable). Defaults to `[pipeline].default_languages`.
    #[arg(long = "language")]
    languages: Vec<String>,
    /// Per-language result limit as `LANG=N` (repeatable).
    #[arg(long = "limit", value_parser = parse_limit)]
    limits: Vec<(String, u32)>,
}

impl ParamArgs {
    fn into_request(self, keyword: String) -> SubmitRequest {
        SubmitRequest {
            keyword,
            languages: (!self.languages.is_empty()).then_some(self.languages),
            limits: (!self.limits.is_empty())
                .then(|| self.limits.into_iter().collect::<BTreeMap<_, _>>()),
        }
    }
}

#[derive(clap::Args)]
struct WaitArgs {
    /// Poll until the task completes or fails.
    #[arg(long)]
    wait: bool,
    /// Seconds between polls.
    #[arg(long, default_value = "2", value_parser = parse_interval)]
    interval: Duration,
}

/// Parse a `LANG=N` pair for `--limit`.
fn parse_limit(s: &str) -> Result<(String, u32), String> {
    let (lang, n) = s
        .split_once('=')
        .ok_or_else(|| format!("invalid LANG=N: no '=' found in '{}'", s))?;
    let n: u32 = n
        .parse()
        .map_err(|_| format!("invalid limit '{}' for '{}'", n, lang))?;
    Ok((lang.to_string(), n))
}

fn parse_interval(s: &str) -> Result<Duration, String> {
    let secs: f64 = s
        .parse()
        .map_err(|_| format!("invalid interval '{}'", s))?;
    if !secs.is_finite() || secs <= 0.0 {
        return Err("interval must be a positive number of seconds".to_string());
    }
    Ok(Duration::from_secs_f64(secs))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    let json = cli.json;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Submit {
            keyword,
            params,
            wait,
        } => {
            let service = CrawlService::open(&cfg).await?;
            let resp = service.submit(params.into_request(keyword)).await?;
            finish_submission(&service, resp, &wait, json).await?;
        }
        Commands::Recrawl {
            keyword,
            params,
            wait,
        } => {
            let service = CrawlService::open(&cfg).await?;
            let resp = service.recrawl(params.into_request(keyword)).await?;
            finish_submission(&service, resp, &wait, json).await?;
        }
        Commands::Retry { task_id, wait } => {
            let service = CrawlService::open(&cfg).await?;
            let resp = service.retry(task_id).await?;
            finish_submission(&service, resp, &wait, json).await?;
        }
        Commands::Status {
            keyword,
            watch,
            interval,
        } => {
            let service = CrawlService::open(&cfg).await?;
            let task = if watch {
                watch_task(&service, &keyword, interval, json).await?
            } else {
                service.status(&keyword).await?
            };
            print_task(&task, json)?;
        }
        Commands::Tasks {
            status,
            page,
            limit,
        } => {
            let service = CrawlService::open(&cfg).await?;
            let tasks = service
                .list_tasks(&ListQuery {
                    page: Some(page),
                    limit: Some(limit),
                    status,
                })
                .await?;
            print_tasks(&tasks, json)?;
        }
        Commands::Stats => {
            let service = CrawlService::open(&cfg).await?;
            let stats = service.stats().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                print_stats(&stats, &cfg.db.path);
            }
        }
        Commands::Cleanup { apply, keyword } => {
            if keyword.is_some() && !apply {
                eprintln!("note: --keyword only takes effect with --apply");
            }
            let service = CrawlService::open(&cfg).await?;
            let report = service.cleanup(apply, keyword.as_deref()).await?;
            print_cleanup(&report, json)?;
            if !report.success {
                bail!("cleanup reported {} error(s)", report.errors.len());
            }
        }
        Commands::DeleteTask { id } => {
            let service = CrawlService::open(&cfg).await?;
            service.delete_task(id).await?;
            println!("Deleted task {}.", id);
        }
    }

    Ok(())
}

/// Print the admission, optionally follow the task, and let spawned
/// pipelines finish before the process exits.
async fn finish_submission(
    service: &CrawlService,
    resp: SubmitResponse,
    wait: &WaitArgs,
    json: bool,
) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string(&resp)?);
    } else {
        println!("Task {} for '{}': {}", resp.task_id, resp.keyword, resp.message);
    }

    let outcome = if wait.wait {
        let task = watch_task(service, &resp.keyword, wait.interval, json).await?;
        print_task(&task, json)?;
        Some(task)
    } else {
        None
    };

    service.wait_idle().await;

    if let Some(task) = outcome {
        if task.status == TaskStatus::Failed {
            bail!(
                "task {} failed: {}",
                task.id,
                task.message.unwrap_or_default()
            );
        }
    }
    Ok(())
}

async fn watch_task(
    service: &CrawlService,
    keyword: &str,
    interval: Duration,
    json: bool,
) -> anyhow::Result<CrawlTask> {
    let mode = if json {
        ProgressMode::Json
    } else {
        ProgressMode::default_for_tty()
    };
    let reporter = mode.reporter();
    let poller = StatusPoller::new(service.ledger().clone(), interval);
    Ok(poller.watch(keyword, reporter.as_ref()).await?)
}

fn print_task(task: &CrawlTask, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(task)?);
        return Ok(());
    }

    println!("Task {}  {}", task.id, task.keyword);
    println!("  Status:     {}", task.status);
    println!("  Progress:   {}%", task.progress);
    if let Some(message) = &task.message {
        println!("  Message:    {}", message);
    }
    println!(
        "  Started:    {} ({})",
        task.started_at.format("%Y-%m-%d %H:%M:%S"),
        format_ts_relative(task.started_at)
    );
    if let Some(done) = task.completed_at {
        println!("  Finished:   {}", done.format("%Y-%m-%d %H:%M:%S"));
    }
    Ok(())
}

fn print_tasks(page: &TaskPage, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(page)?);
        return Ok(());
    }

    if page.tasks.is_empty() {
        println!("No tasks.");
        return Ok(());
    }

    println!(
        "{:>6}  {:<28} {:<10} {:>4}   {}",
        "ID", "KEYWORD", "STATUS", "PCT", "STARTED"
    );
    println!("{}", "-".repeat(70));
    for t in &page.tasks {
        println!(
            "{:>6}  {:<28} {:<10} {:>3}%   {}",
            t.id,
            t.keyword,
            t.status,
            t.progress,
            format_ts_relative(t.started_at)
        );
    }
    println!();
    println!(
        "Page {} of {} ({} tasks)",
        page.page,
        page.total_pages.max(1),
        page.total
    );
    Ok(())
}

fn print_cleanup(report: &CleanupReport, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    let s = &report.summary;
    println!("Keywords:         {}", s.total_keywords);
    println!("Artifact files:   {}", s.total_files);
    println!("Inconsistencies:  {}", s.inconsistencies_found);

    for finding in &report.inconsistencies {
        match finding {
            Finding::OrphanFile { file, .. } => println!("  orphan file      {}", file),
            Finding::OrphanKeyword {
                keyword,
                keyword_id,
                ..
            } => println!("  orphan keyword   {} (id {})", keyword, keyword_id),
            Finding::OrphanAllKeywordsData { keyword, .. } => {
                println!("  orphan index     {}", keyword)
            }
        }
    }

    if report.cleaned {
        println!();
        println!("Files cleaned:    {}", s.files_cleaned);
        println!("Keywords cleaned: {}", s.keywords_cleaned);
        if let Some(purged) = &report.purged {
            println!("Purged keyword:   {}", purged.keyword);
        }
    } else if s.inconsistencies_found > 0 {
        println!();
        println!("Run with --apply to repair.");
    }
    for e in &report.errors {
        println!("  error: {}", e);
    }
    Ok(())
}
