//! External stage execution.
//!
//! Each pipeline stage is an external executable. [`StageRunner`] is the
//! seam the orchestrator calls through; [`ProcessRunner`] is the production
//! implementation that spawns the configured collector or analyzer.
//!
//! # Process contract
//!
//! ```text
//! <program> <args...> --keywords <keyword> --task-id <id>
//!                     [--languages a,b,c] [--limits a=1,b=2]    (collector only)
//! ```
//!
//! - exit code 0 is success; anything else fails the stage
//! - stdout lines `PROGRESS <pct> [message]` are forwarded as progress
//! - the last non-empty stderr line becomes the failure message

use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info};

use crate::config::{PipelineConfig, StageCommand};
use crate::error::{CrawlError, Result};
use crate::models::{CrawlParams, Stage};

const MAX_FAILURE_MESSAGE_CHARS: usize = 200;

/// One stage invocation for one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageInvocation {
    pub stage: Stage,
    pub task_id: i64,
    pub keyword: String,
    pub params: CrawlParams,
}

impl StageInvocation {
    /// Arguments appended after the configured program arguments.
    pub fn cli_args(&self) -> Vec<String> {
        let mut args = vec![
            "--keywords".to_string(),
            self.keyword.clone(),
            "--task-id".to_string(),
            self.task_id.to_string(),
        ];

        if self.stage == Stage::Collect {
            if !self.params.languages.is_empty() {
                args.push("--languages".to_string());
                args.push(self.params.languages.join(","));
            }
            if !self.params.limits.is_empty() {
                // BTreeMap iteration is already sorted by language
                let limits: Vec<String> = self
                    .params
                    .limits
                    .iter()
                    .map(|(lang, n)| format!("{}={}", lang, n))
                    .collect();
                args.push("--limits".to_string());
                args.push(limits.join(","));
            }
        }

        args
    }
}

/// Progress reported from inside a stage, in the stage's own 0–100 scale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageProgress {
    pub percent: u8,
    pub message: Option<String>,
}

/// Parse a `PROGRESS <pct> [message]` line.
pub fn parse_progress_line(line: &str) -> Option<StageProgress> {
    let rest = line.trim().strip_prefix("PROGRESS")?;
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }
    let rest = rest.trim_start();
    let (pct, message) = match rest.split_once(char::is_whitespace) {
        Some((pct, message)) => (pct, Some(message.trim())),
        None => (rest, None),
    };
    let percent: u8 = pct.trim_end_matches('%').parse().ok()?;
    if percent > 100 {
        return None;
    }
    Some(StageProgress {
        percent,
        message: message.filter(|m| !m.is_empty()).map(str::to_string),
    })
}

/// Runs one external stage to completion.
///
/// Implementations return `Ok(())` only when the stage succeeded, and an
/// [`CrawlError::ExternalProcess`] naming the stage otherwise. Progress may
/// be sent on `progress` at any time before returning.
#[async_trait]
pub trait StageRunner: Send + Sync {
    async fn run(
        &self,
        invocation: &StageInvocation,
        progress: UnboundedSender<StageProgress>,
    ) -> Result<()>;
}

/// Spawns the configured collector and analyzer executables.
pub struct ProcessRunner {
    collector: StageCommand,
    analyzer: StageCommand,
}

impl ProcessRunner {
    pub fn new(collector: StageCommand, analyzer: StageCommand) -> Self {
        Self {
            collector,
            analyzer,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.collector.clone(), config.analyzer.clone())
    }

    fn command_for(&self, stage: Stage) -> &StageCommand {
        match stage {
            Stage::Collect => &self.collector,
            Stage::Analyze => &self.analyzer,
        }
    }

    fn build_command(&self, invocation: &StageInvocation) -> Command {
        let command = self.command_for(invocation.stage);
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .args(invocation.cli_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &command.working_dir {
            cmd.current_dir(dir);
        }
        for name in &command.pass_env {
            if let Ok(value) = std::env::var(name) {
                cmd.env(name, value);
            }
        }
        cmd.envs(&command.env);
        cmd
    }
}

#[async_trait]
impl StageRunner for ProcessRunner {
    async fn run(
        &self,
        invocation: &StageInvocation,
        progress: UnboundedSender<StageProgress>,
    ) -> Result<()> {
        let stage = invocation.stage;
        let program = &self.command_for(stage).program;
        let failed = |message: String| CrawlError::ExternalProcess { stage, message };

        let mut child = self
            .build_command(invocation)
            .spawn()
            .map_err(|e| failed(format!("could not start '{}': {}", program, e)))?;

        info!(
            task_id = invocation.task_id,
            stage = stage.as_str(),
            pid = child.id().unwrap_or_default(),
            "stage started"
        );

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| failed("stdout was not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| failed("stderr was not captured".to_string()))?;

        let task_id = invocation.task_id;
        let read_stdout = async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                match parse_progress_line(&line) {
                    Some(p) => {
                        let _ = progress.send(p);
                    }
                    None => debug!(task_id, stage = stage.as_str(), "{}", line),
                }
            }
            Ok::<_, std::io::Error>(())
        };
        let read_stderr = async move {
            let mut last = None;
            let mut lines = BufReader::new(stderr).lines();
            while let Some(line) = lines.next_line().await? {
                debug!(task_id, stage = stage.as_str(), stderr = true, "{}", line);
                if !line.trim().is_empty() {
                    last = Some(line);
                }
            }
            Ok::<_, std::io::Error>(last)
        };

        let (stdout_res, stderr_res, status) = tokio::join!(read_stdout, read_stderr, child.wait());
        let status = status.map_err(|e| failed(format!("could not wait for '{}': {}", program, e)))?;
        stdout_res.map_err(|e| failed(format!("reading stdout: {}", e)))?;
        let last_stderr = stderr_res.map_err(|e| failed(format!("reading stderr: {}", e)))?;

        info!(
            task_id = invocation.task_id,
            stage = stage.as_str(),
            exit_code = status.code(),
            "stage exited"
        );

        if status.success() {
            return Ok(());
        }

        let message = match (last_stderr, status.code()) {
            (Some(line), _) => truncate_chars(line.trim(), MAX_FAILURE_MESSAGE_CHARS),
            (None, Some(code)) => format!("exit code {}", code),
            (None, None) => "terminated by signal".to_string(),
        };
        Err(failed(message))
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
