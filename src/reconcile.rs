//! Reconciler: detects and repairs drift between the ledger and result store.
//!
//! Three independent checks produce tagged findings:
//!
//! | Finding | Condition | Repair |
//! |---------|-----------|--------|
//! | `orphan_file` | artifact file matches no keyword | delete the file |
//! | `orphan_keyword` | keyword has no artifact, no analytics, no repository links, no tasks | delete the keyword |
//! | `orphan_all_keywords_data` | aggregate entry names no keyword | drop the entry |
//!
//! A keyword with crawl history and a missing artifact is stale, not
//! orphaned, and is never reported. [`Reconciler::scan`] only reads. An
//! unreadable aggregate index skips the third check and is reported in
//! `errors`; the other two checks still run.
//! [`Reconciler::apply`] repairs each finding independently: one failed
//! deletion is logged and the rest proceed.

use std::collections::{BTreeSet, HashSet};

use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::error::{CrawlError, Result};
use crate::ledger::{Ledger, PurgedRows};
use crate::results::{artifact_file_name, entry_keyword, keyword_from_file_name, ResultStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupAction {
    DeleteFile,
    DeleteKeyword,
    RemoveFromAllKeywords,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Finding {
    OrphanFile {
        file: String,
        keyword: String,
        action: CleanupAction,
    },
    OrphanKeyword {
        keyword: String,
        #[serde(rename = "keywordId")]
        keyword_id: i64,
        action: CleanupAction,
    },
    OrphanAllKeywordsData {
        keyword: String,
        action: CleanupAction,
    },
}

/// Output of a scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationReport {
    pub total_keywords: usize,
    pub total_files: usize,
    pub findings: Vec<Finding>,
    /// Checks that could not run.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

/// Output of an apply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationResult {
    pub files_cleaned: usize,
    pub keywords_cleaned: usize,
    pub index_entries_removed: usize,
    /// One message per finding that could not be repaired.
    pub errors: Vec<String>,
}

/// What a targeted purge removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgeResult {
    pub keyword: String,
    pub rows: Option<PurgedRows>,
    pub artifact_removed: bool,
    pub index_entries_removed: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CleanupSummary {
    pub total_keywords: usize,
    pub total_files: usize,
    pub inconsistencies_found: usize,
    pub files_cleaned: usize,
    pub keywords_cleaned: usize,
}

/// Response of a full cleanup request.
#[derive(Debug, Clone, Serialize)]
pub struct CleanupReport {
    pub success: bool,
    pub summary: CleanupSummary,
    pub inconsistencies: Vec<Finding>,
    pub cleaned: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purged: Option<PurgeResult>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

#[derive(Clone)]
pub struct Reconciler {
    ledger: Ledger,
    store: ResultStore,
}

impl Reconciler {
    pub fn new(ledger: Ledger, store: ResultStore) -> Self {
        Self { ledger, store }
    }

    /// Compare ledger, artifacts, and aggregate index. Read-only.
    pub async fn scan(&self) -> Result<ReconciliationReport> {
        let keywords = self.ledger.list_keywords().await?;
        let files = self.store.list_artifacts()?;
        let mut errors = Vec::new();
        let aggregate = match self.store.read_aggregate() {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "aggregate index unreadable; skipping index check");
                errors.push(format!("aggregate index unreadable: {}", e));
                Vec::new()
            }
        };

        let known_texts: HashSet<&str> = keywords.iter().map(|k| k.text.as_str()).collect();
        let expected_files: HashSet<String> =
            keywords.iter().map(|k| artifact_file_name(&k.text)).collect();
        let present_files: HashSet<&str> = files.iter().map(String::as_str).collect();

        let mut findings = Vec::new();

        for file in &files {
            if expected_files.contains(file) {
                continue;
            }
            if let Some(keyword) = keyword_from_file_name(file) {
                findings.push(Finding::OrphanFile {
                    file: file.clone(),
                    keyword,
                    action: CleanupAction::DeleteFile,
                });
            }
        }

        for kw in &keywords {
            if present_files.contains(artifact_file_name(&kw.text).as_str()) {
                continue;
            }
            let refs = self.ledger.keyword_references(kw.id).await?;
            if refs.is_empty() {
                findings.push(Finding::OrphanKeyword {
                    keyword: kw.text.clone(),
                    keyword_id: kw.id,
                    action: CleanupAction::DeleteKeyword,
                });
            }
        }

        for entry in &aggregate {
            if let Some(keyword) = entry_keyword(entry) {
                if !known_texts.contains(keyword) {
                    findings.push(Finding::OrphanAllKeywordsData {
                        keyword: keyword.to_string(),
                        action: CleanupAction::RemoveFromAllKeywords,
                    });
                }
            }
        }

        info!(
            keywords = keywords.len(),
            files = files.len(),
            findings = findings.len(),
            "reconciliation scan"
        );

        Ok(ReconciliationReport {
            total_keywords: keywords.len(),
            total_files: files.len(),
            findings,
            errors,
        })
    }

    /// Repair every finding in `report`, continuing past individual failures.
    pub async fn apply(&self, report: &ReconciliationReport) -> ReconciliationResult {
        let mut result = ReconciliationResult::default();
        let mut orphan_entries = BTreeSet::new();

        for finding in &report.findings {
            match finding {
                Finding::OrphanFile { file, .. } => match self.store.remove_artifact_file(file) {
                    Ok(removed) => {
                        info!(file = %file, removed, "deleted orphan artifact");
                        result.files_cleaned += 1;
                    }
                    Err(e) => result.errors.push(cleanup_failure(file, e)),
                },
                Finding::OrphanKeyword {
                    keyword,
                    keyword_id,
                    ..
                } => match self.ledger.delete_unreferenced_keyword(*keyword_id).await {
                    Ok(true) => {
                        info!(keyword = %keyword, keyword_id, "deleted orphan keyword");
                        result.keywords_cleaned += 1;
                    }
                    Ok(false) => {
                        let e = CrawlError::PartialCleanup {
                            target: format!("keyword '{}'", keyword),
                            reason: "keyword is gone or is referenced again".to_string(),
                        };
                        warn!(keyword = %keyword, keyword_id, error = %e, "skipped keyword");
                        result.errors.push(e.to_string());
                    }
                    Err(e) => result
                        .errors
                        .push(cleanup_failure(&format!("keyword '{}'", keyword), e)),
                },
                Finding::OrphanAllKeywordsData { keyword, .. } => {
                    orphan_entries.insert(keyword.as_str());
                }
            }
        }

        if !orphan_entries.is_empty() {
            match self.rewrite_aggregate(|kw| !orphan_entries.contains(kw)) {
                Ok(removed) => result.index_entries_removed = removed,
                Err(e) => result.errors.push(cleanup_failure("aggregate index", e)),
            }
        }

        info!(
            files = result.files_cleaned,
            keywords = result.keywords_cleaned,
            index_entries = result.index_entries_removed,
            errors = result.errors.len(),
            "reconciliation applied"
        );
        result
    }

    /// Remove one keyword's rows, artifact, and aggregate entry outright.
    ///
    /// In-flight tasks are removed too; their pipelines stop at the next
    /// ledger write. The artifact and the aggregate entry are removed
    /// independently, and a failure of either lands in `errors`.
    pub async fn purge(&self, keyword: &str) -> Result<PurgeResult> {
        let rows = self.ledger.purge_keyword(keyword).await?;
        if let Some(rows) = &rows {
            info!(
                keyword = %keyword,
                analytics = rows.analytics,
                repository_links = rows.repository_links,
                crawl_tasks = rows.crawl_tasks,
                "purged keyword rows"
            );
        }

        let file = artifact_file_name(keyword);
        let mut errors = Vec::new();
        let artifact_removed = match self.store.remove_artifact_file(&file) {
            Ok(removed) => removed,
            Err(e) => {
                errors.push(cleanup_failure(&file, e));
                false
            }
        };
        let index_entries_removed = match self.rewrite_aggregate(|kw| kw != keyword) {
            Ok(removed) => removed,
            Err(e) => {
                errors.push(cleanup_failure("aggregate index", e));
                0
            }
        };

        Ok(PurgeResult {
            keyword: keyword.to_string(),
            rows,
            artifact_removed,
            index_entries_removed,
            errors,
        })
    }

    /// Scan, and when `apply` is set, repair and optionally purge `target`.
    pub async fn cleanup(&self, apply: bool, target: Option<&str>) -> Result<CleanupReport> {
        let report = self.scan().await?;

        let mut outcome = ReconciliationResult::default();
        let mut purged = None;
        if apply {
            outcome = self.apply(&report).await;
            if let Some(keyword) = target {
                match self.purge(keyword).await {
                    Ok(p) => {
                        outcome.errors.extend(p.errors.iter().cloned());
                        purged = Some(p);
                    }
                    Err(e) => outcome
                        .errors
                        .push(cleanup_failure(&format!("keyword '{}'", keyword), e)),
                }
            }
        }

        let mut errors = report.errors;
        errors.append(&mut outcome.errors);

        Ok(CleanupReport {
            success: errors.is_empty(),
            summary: CleanupSummary {
                total_keywords: report.total_keywords,
                total_files: report.total_files,
                inconsistencies_found: report.findings.len(),
                files_cleaned: outcome.files_cleaned,
                keywords_cleaned: outcome.keywords_cleaned,
            },
            inconsistencies: report.findings,
            cleaned: apply,
            purged,
            errors,
        })
    }

    /// Rewrite the aggregate index keeping entries whose keyword passes
    /// `keep`. Entries without a keyword are kept. The index is re-read so
    /// entries added since the scan survive, and an index that does not
    /// parse is left untouched. Returns the number removed.
    fn rewrite_aggregate(&self, keep: impl Fn(&str) -> bool) -> Result<usize> {
        let entries = self.store.read_aggregate()?;
        let before = entries.len();
        let surviving: Vec<Value> = entries
            .into_iter()
            .filter(|e| entry_keyword(e).map_or(true, |kw| keep(kw)))
            .collect();

        let removed = before - surviving.len();
        if removed > 0 {
            self.store.write_aggregate(&surviving)?;
        }
        Ok(removed)
    }
}

fn cleanup_failure(target: &str, err: CrawlError) -> String {
    let e = CrawlError::PartialCleanup {
        target: target.to_string(),
        reason: err.to_string(),
    };
    warn!(error = %e, "cleanup item failed");
    e.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::test_support::{insert_analytics, link_repository, temp_ledger};
    use crate::ledger::TaskUpdate;
    use crate::models::TaskStatus;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, Ledger, ResultStore, Reconciler) {
        let (dir, ledger) = temp_ledger().await;
        let store = ResultStore::new(
            dir.path().join("analytics"),
            dir.path().join("result").join("all_keywords_analysis.json"),
        );
        fs::create_dir_all(store.analytics_dir()).unwrap();
        let reconciler = Reconciler::new(ledger.clone(), store.clone());
        (dir, ledger, store, reconciler)
    }

    fn write_artifact(store: &ResultStore, keyword: &str) {
        fs::write(
            store.artifact_path(keyword),
            json!({"keyword": keyword, "charts": {}}).to_string(),
        )
        .unwrap();
    }

    #[tokio::test]
    async fn consistent_store_has_no_findings() {
        let (_dir, ledger, store, reconciler) = setup().await;
        ledger.get_or_create_keyword("rust async").await.unwrap();
        write_artifact(&store, "rust async");
        store.write_aggregate(&[json!({"keyword": "rust async"})]).unwrap();

        let report = reconciler.scan().await.unwrap();
        assert_eq!(report.total_keywords, 1);
        assert_eq!(report.total_files, 1);
        assert!(report.findings.is_empty());
    }

    #[tokio::test]
    async fn orphan_keyword_precision() {
        let (_dir, ledger, _store, reconciler) = setup().await;
        let with_task = ledger.get_or_create_keyword("has task").await.unwrap();
        ledger.insert_pending_task(with_task.id, "queued").await.unwrap();
        let with_analytics = ledger.get_or_create_keyword("has analytics").await.unwrap();
        insert_analytics(&ledger, with_analytics.id).await;
        let with_repo = ledger.get_or_create_keyword("has repo").await.unwrap();
        link_repository(&ledger, with_repo.id, "tokio-rs/tokio").await;
        let bare = ledger.get_or_create_keyword("bare").await.unwrap();

        let report = reconciler.scan().await.unwrap();
        assert_eq!(
            report.findings,
            vec![Finding::OrphanKeyword {
                keyword: "bare".into(),
                keyword_id: bare.id,
                action: CleanupAction::DeleteKeyword,
            }]
        );
    }

    #[tokio::test]
    async fn orphan_file_is_detected_and_removed() {
        let (_dir, _ledger, store, reconciler) = setup().await;
        write_artifact(&store, "ghost keyword");

        let report = reconciler.scan().await.unwrap();
        assert_eq!(
            report.findings,
            vec![Finding::OrphanFile {
                file: "analysis_ghost_keyword.json".into(),
                keyword: "ghost keyword".into(),
                action: CleanupAction::DeleteFile,
            }]
        );

        let result = reconciler.apply(&report).await;
        assert_eq!(result.files_cleaned, 1);
        assert!(!store.artifact_exists("ghost keyword"));
        assert!(reconciler.scan().await.unwrap().findings.is_empty());
    }

    #[tokio::test]
    async fn underscore_keyword_owns_its_artifact() {
        let (_dir, ledger, store, reconciler) = setup().await;
        ledger.get_or_create_keyword("snake_case").await.unwrap();
        write_artifact(&store, "snake_case");

        assert!(reconciler.scan().await.unwrap().findings.is_empty());
    }

    #[tokio::test]
    async fn aggregate_index_is_repaired() {
        let (_dir, ledger, store, reconciler) = setup().await;
        let a = ledger.get_or_create_keyword("A").await.unwrap();
        ledger.insert_pending_task(a.id, "queued").await.unwrap();
        store
            .write_aggregate(&[json!({"keyword": "A"}), json!({"keyword": "B"})])
            .unwrap();

        let report = reconciler.scan().await.unwrap();
        assert_eq!(
            report.findings,
            vec![Finding::OrphanAllKeywordsData {
                keyword: "B".into(),
                action: CleanupAction::RemoveFromAllKeywords,
            }]
        );

        let result = reconciler.apply(&report).await;
        assert_eq!(result.index_entries_removed, 1);
        assert_eq!(store.read_aggregate().unwrap(), vec![json!({"keyword": "A"})]);
    }

    #[tokio::test]
    async fn apply_is_idempotent() {
        let (_dir, ledger, store, reconciler) = setup().await;
        ledger.get_or_create_keyword("bare").await.unwrap();
        write_artifact(&store, "ghost");
        store.write_aggregate(&[json!({"keyword": "ghost"})]).unwrap();

        let report = reconciler.scan().await.unwrap();
        assert_eq!(report.findings.len(), 3);

        let first = reconciler.apply(&report).await;
        assert!(first.errors.is_empty());
        assert!(reconciler.scan().await.unwrap().findings.is_empty());

        // replaying the stale report changes nothing further
        let second = reconciler.apply(&report).await;
        assert_eq!(second.keywords_cleaned, 0);
        assert_eq!(second.index_entries_removed, 0);
        assert!(reconciler.scan().await.unwrap().findings.is_empty());
    }

    #[tokio::test]
    async fn one_failure_does_not_stop_the_batch() {
        let (_dir, ledger, store, reconciler) = setup().await;
        let raced = ledger.get_or_create_keyword("raced").await.unwrap();
        write_artifact(&store, "ghost");

        let report = reconciler.scan().await.unwrap();
        // a submission lands between scan and apply
        ledger.insert_pending_task(raced.id, "queued").await.unwrap();

        let result = reconciler.apply(&report).await;
        assert_eq!(result.files_cleaned, 1);
        assert_eq!(result.keywords_cleaned, 0);
        assert_eq!(result.errors.len(), 1);
        assert!(ledger.find_keyword("raced").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn cleanup_with_target_purges_keyword() {
        let (_dir, ledger, store, reconciler) = setup().await;
        let kw = ledger.get_or_create_keyword("doomed").await.unwrap();
        let task = ledger.insert_pending_task(kw.id, "queued").await.unwrap().unwrap();
        ledger
            .update_task(task, &TaskUpdate::new(TaskStatus::Running, 5, "running"))
            .await
            .unwrap();
        write_artifact(&store, "doomed");
        store
            .write_aggregate(&[json!({"keyword": "doomed"}), json!({"keyword": "kept", "x": 1})])
            .unwrap();

        let dry = reconciler.cleanup(false, Some("doomed")).await.unwrap();
        assert!(!dry.cleaned);
        assert!(dry.purged.is_none());
        assert!(ledger.find_keyword("doomed").await.unwrap().is_some());

        let report = reconciler.cleanup(true, Some("doomed")).await.unwrap();
        let purged = report.purged.unwrap();
        assert_eq!(purged.rows.unwrap().crawl_tasks, 1);
        assert!(purged.artifact_removed);
        assert!(ledger.find_keyword("doomed").await.unwrap().is_none());
        assert!(!store.artifact_exists("doomed"));

        // "kept" has no keyword row, so the generic pass already dropped it
        assert!(store.read_aggregate().unwrap().is_empty());
    }

    #[tokio::test]
    async fn corrupt_index_does_not_block_other_checks() {
        let (_dir, ledger, store, reconciler) = setup().await;
        ledger.get_or_create_keyword("bare").await.unwrap();
        write_artifact(&store, "ghost");
        fs::create_dir_all(store.aggregate_file().parent().unwrap()).unwrap();
        let truncated = r#"[{"keyword": "A"},"#;
        fs::write(store.aggregate_file(), truncated).unwrap();

        let report = reconciler.scan().await.unwrap();
        assert_eq!(report.findings.len(), 2);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("aggregate index"));

        let cleaned = reconciler.cleanup(true, None).await.unwrap();
        assert!(!cleaned.success);
        assert_eq!(cleaned.summary.files_cleaned, 1);
        assert_eq!(cleaned.summary.keywords_cleaned, 1);
        assert_eq!(cleaned.errors.len(), 1);
        assert!(!store.artifact_exists("ghost"));
        assert!(ledger.find_keyword("bare").await.unwrap().is_none());

        // a purge must not overwrite an index it could not parse
        let purged = reconciler.purge("A").await.unwrap();
        assert_eq!(purged.errors.len(), 1);
        assert_eq!(fs::read_to_string(store.aggregate_file()).unwrap(), truncated);
    }

    #[tokio::test]
    async fn purge_removes_index_entry_when_artifact_delete_fails() {
        let (_dir, ledger, store, reconciler) = setup().await;
        ledger.get_or_create_keyword("stuck").await.unwrap();
        // a directory in place of the artifact makes the file delete fail
        fs::create_dir_all(store.artifact_path("stuck")).unwrap();
        store
            .write_aggregate(&[json!({"keyword": "stuck"}), json!({"keyword": "other"})])
            .unwrap();

        let purged = reconciler.purge("stuck").await.unwrap();
        assert!(purged.rows.is_some());
        assert!(!purged.artifact_removed);
        assert_eq!(purged.index_entries_removed, 1);
        assert_eq!(purged.errors.len(), 1);
        assert!(purged.errors[0].contains("analysis_stuck.json"));
        assert_eq!(store.read_aggregate().unwrap(), vec![json!({"keyword": "other"})]);
        assert!(ledger.find_keyword("stuck").await.unwrap().is_none());
    }

    #[test]
    fn findings_serialize_with_type_tags() {
        let finding = Finding::OrphanKeyword {
            keyword: "x".into(),
            keyword_id: 3,
            action: CleanupAction::DeleteKeyword,
        };
        assert_eq!(
            serde_json::to_value(&finding).unwrap(),
            json!({"type": "orphan_keyword", "keyword": "x", "keywordId": 3, "action": "delete_keyword"})
        );
    }
}
