//! Core data models used throughout crawl-harness.
//!
//! Keywords and crawl tasks live in the SQLite task ledger; the status
//! enum and stage names are shared with the pipeline and the HTTP layer.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A unique search term driving one lineage of crawl tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Keyword {
    pub id: i64,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

/// Lifecycle state of a crawl task.
///
/// Transitions are strictly `pending → running → {completed | failed}`
/// (a task may also fail straight from `pending`). Terminal states have no
/// outgoing transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 4] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    pub fn is_in_flight(&self) -> bool {
        !self.is_terminal()
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        match (self, next) {
            (TaskStatus::Pending, TaskStatus::Running) => true,
            (TaskStatus::Pending, TaskStatus::Failed) => true,
            (TaskStatus::Running, TaskStatus::Running) => true,
            (TaskStatus::Running, TaskStatus::Completed) => true,
            (TaskStatus::Running, TaskStatus::Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(format!(
                "invalid status '{}': must be one of pending, running, completed, failed",
                other
            )),
        }
    }
}

/// One crawl task row, joined with its keyword text.
///
/// This is also the snapshot shape returned by status polling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlTask {
    pub id: i64,
    pub keyword_id: i64,
    pub keyword: String,
    pub status: TaskStatus,
    pub progress: i64,
    pub message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// The two sequential external-process stages of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Collect,
    Analyze,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Collect => "collect",
            Stage::Analyze => "analyze",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Collect => f.write_str("collection"),
            Stage::Analyze => f.write_str("analysis"),
        }
    }
}

/// Per-submission crawl parameters forwarded to the collector.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlParams {
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default)]
    pub limits: BTreeMap<String, u32>,
}

/// Outcome of an admission request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Admission {
    pub task_id: i64,
    pub keyword: String,
    /// `false` when the caller was re-attached to an in-flight task.
    pub created: bool,
}

pub(crate) fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for status in TaskStatus::ALL {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("done".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn terminal_states_have_no_successor() {
        for next in TaskStatus::ALL {
            assert!(!TaskStatus::Completed.can_transition_to(next));
            assert!(!TaskStatus::Failed.can_transition_to(next));
        }
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Running));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Completed));
    }

    #[test]
    fn stage_display_names_the_stage() {
        assert_eq!(Stage::Collect.to_string(), "collection");
        assert_eq!(Stage::Analyze.as_str(), "analyze");
    }
}
