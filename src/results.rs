//! Result store: per-keyword analysis artifacts and the aggregate index.
//!
//! Both live on the filesystem and are written by the analyzer stage. The
//! core reads them for the dashboard, and the reconciler deletes or rewrites
//! them when they drift from the ledger. They are caches: the ledger is
//! always authoritative.
//!
//! Layout:
//!
//! ```text
//! <analytics_dir>/analysis_rust_async.json    one artifact per keyword
//! <aggregate_file>                            [{"keyword": "rust async", ...}, ...]
//! ```

use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::ResultsConfig;
use crate::error::{CrawlError, Result};

const ARTIFACT_PREFIX: &str = "analysis_";
const ARTIFACT_SUFFIX: &str = ".json";

/// Artifact file name for a keyword: spaces become underscores.
pub fn artifact_file_name(keyword: &str) -> String {
    format!("{}{}{}", ARTIFACT_PREFIX, keyword.replace(' ', "_"), ARTIFACT_SUFFIX)
}

/// Keyword text derived from an artifact file name.
///
/// Underscores become spaces, so a keyword that itself contains an
/// underscore cannot be told apart from one with a space. Returns `None`
/// for files that are not artifacts.
pub fn keyword_from_file_name(file_name: &str) -> Option<String> {
    let stem = file_name
        .strip_prefix(ARTIFACT_PREFIX)?
        .strip_suffix(ARTIFACT_SUFFIX)?;
    if stem.is_empty() {
        return None;
    }
    Some(stem.replace('_', " "))
}

/// The `keyword` field of an aggregate index entry.
pub fn entry_keyword(entry: &Value) -> Option<&str> {
    entry.get("keyword").and_then(Value::as_str)
}

#[derive(Debug, Clone)]
pub struct ResultStore {
    analytics_dir: PathBuf,
    aggregate_file: PathBuf,
}

impl ResultStore {
    pub fn new(analytics_dir: impl Into<PathBuf>, aggregate_file: impl Into<PathBuf>) -> Self {
        Self {
            analytics_dir: analytics_dir.into(),
            aggregate_file: aggregate_file.into(),
        }
    }

    pub fn from_config(config: &ResultsConfig) -> Self {
        Self::new(&config.analytics_dir, &config.aggregate_file)
    }

    pub fn analytics_dir(&self) -> &Path {
        &self.analytics_dir
    }

    pub fn aggregate_file(&self) -> &Path {
        &self.aggregate_file
    }

    pub fn artifact_path(&self, keyword: &str) -> PathBuf {
        self.analytics_dir.join(artifact_file_name(keyword))
    }

    pub fn artifact_exists(&self, keyword: &str) -> bool {
        self.artifact_path(keyword).is_file()
    }

    /// File names of every artifact in the analytics directory, sorted.
    ///
    /// A missing directory is an empty store.
    pub fn list_artifacts(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.analytics_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if keyword_from_file_name(&name).is_some() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Parsed artifact for a keyword, or `None` when the file is absent.
    pub fn load_artifact(&self, keyword: &str) -> Result<Option<Value>> {
        let path = self.artifact_path(keyword);
        match fs::read_to_string(&path) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete one artifact by file name.
    ///
    /// Returns `false` when the file was already gone.
    pub fn remove_artifact_file(&self, file_name: &str) -> Result<bool> {
        if file_name.contains(['/', '\\']) {
            return Err(CrawlError::validation(format!(
                "artifact name '{}' must not contain a path separator",
                file_name
            )));
        }
        match fs::remove_file(self.analytics_dir.join(file_name)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// All aggregate index entries; a missing file is an empty index.
    pub fn read_aggregate(&self) -> Result<Vec<Value>> {
        let content = match fs::read_to_string(&self.aggregate_file) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }

        match serde_json::from_str::<Value>(&content)? {
            Value::Array(entries) => Ok(entries),
            _ => Err(CrawlError::Internal(format!(
                "{} is not a JSON array",
                self.aggregate_file.display()
            ))),
        }
    }

    /// Replace the aggregate index with exactly `entries`.
    ///
    /// Writes a sibling temp file and renames it over the target, so readers
    /// see either the old index or the new one.
    pub fn write_aggregate(&self, entries: &[Value]) -> Result<()> {
        let parent = match self.aggregate_file.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)?;

        let file_name = self
            .aggregate_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "aggregate.json".to_string());
        let tmp_path = parent.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

        let json = serde_json::to_string_pretty(entries)?;
        fs::write(&tmp_path, json)?;
        if let Err(e) = fs::rename(&tmp_path, &self.aggregate_file) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }

        info!(
            path = %self.aggregate_file.display(),
            entries = entries.len(),
            "rewrote aggregate index"
        );
        Ok(())
    }
}
