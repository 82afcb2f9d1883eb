// src/model.rs

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::error::FailureKind;

/// One unit of batch input: a repository URL or a repository directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkItem(String);

impl WorkItem {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last path or URL segment, without a trailing `.git`.
    pub fn name(&self) -> &str {
        let trimmed = self.0.trim_end_matches('/');
        let last = trimmed
            .rsplit(|c| c == '/' || c == ':')
            .next()
            .unwrap_or(trimmed);
        last.strip_suffix(".git").unwrap_or(last)
    }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkItem {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for WorkItem {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    Failure,
    Timeout,
}

/// Result of running one work item through a runner. Never mutated after creation.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub item: WorkItem,
    pub status: Status,
    pub exit_code: Option<i32>,
    pub http_status: Option<u16>,
    /// Captured stdout, or the response body for HTTP requests.
    pub stdout: String,
    pub stderr: String,
    pub error_detail: Option<String>,
    pub failure: Option<FailureKind>,
    pub elapsed: Duration,
}

impl Outcome {
    pub fn success(item: WorkItem, stdout: String, stderr: String, elapsed: Duration) -> Self {
        Self {
            item,
            status: Status::Success,
            exit_code: Some(0),
            http_status: None,
            stdout,
            stderr,
            error_detail: None,
            failure: None,
            elapsed,
        }
    }

    pub fn failure(item: WorkItem, kind: FailureKind, detail: impl Into<String>, elapsed: Duration) -> Self {
        let status = if kind == FailureKind::Timeout {
            Status::Timeout
        } else {
            Status::Failure
        };
        Self {
            item,
            status,
            exit_code: None,
            http_status: None,
            stdout: String::new(),
            stderr: String::new(),
            error_detail: Some(detail.into()),
            failure: Some(kind),
            elapsed,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }

    /// Short operator-facing reason for a non-successful outcome.
    pub fn reason(&self) -> String {
        match (&self.failure, &self.error_detail) {
            (Some(kind), Some(detail)) => format!("{kind}: {detail}"),
            (Some(kind), None) => kind.to_string(),
            (None, _) => "ok".to_string(),
        }
    }
}

// --- Mining tool output ---

#[derive(Debug, Deserialize)]
pub struct MinerDocument {
    pub commits: Vec<MinedCommit>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MinedCommit {
    #[serde(default)]
    pub sha1: Option<String>,
    #[serde(default)]
    pub repository: Option<String>,
    #[serde(default)]
    pub refactorings: Vec<MinedRefactoring>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MinedRefactoring {
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

// --- Aggregation ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TypeCount {
    #[serde(rename = "type")]
    pub kind: String,
    pub count: u64,
}

/// One mined repository's structured result.
#[derive(Debug, Clone, PartialEq)]
pub struct RefactoringRecord {
    pub repository: String,
    /// Repository origin as reported by the mining tool, if any.
    pub origin: Option<String>,
    pub type_counts: BTreeMap<String, u64>,
    /// Commits carrying at least one refactoring, in mining order, no duplicates.
    pub commit_shas: Vec<String>,
    pub avg_inter_refactoring_time: Option<Duration>,
}

impl RefactoringRecord {
    /// Type counts by descending count, then alphabetically.
    pub fn sorted_types(&self) -> Vec<TypeCount> {
        let mut types: Vec<TypeCount> = self
            .type_counts
            .iter()
            .map(|(kind, &count)| TypeCount { kind: kind.clone(), count })
            .collect();
        types.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.kind.cmp(&b.kind)));
        types
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommitTimingInfo {
    pub sha: String,
    pub timestamp: DateTime<FixedOffset>,
    pub committer_name: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunCounters {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl RunCounters {
    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.skipped
    }
}

/// A repository excluded from the aggregate, with the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemNote {
    pub repository: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct AggregateReport {
    pub records: Vec<RefactoringRecord>,
    pub counters: RunCounters,
    pub failures: Vec<ItemNote>,
    pub skips: Vec<ItemNote>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportEntry {
    pub repository: String,
    pub refactoring_types: Vec<TypeCount>,
    pub refactoring_commits: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_inter_refactoring_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_commit_time_diff: Option<String>,
}

impl From<&RefactoringRecord> for ReportEntry {
    fn from(record: &RefactoringRecord) -> Self {
        Self {
            repository: record.repository.clone(),
            refactoring_types: record.sorted_types(),
            refactoring_commits: record.commit_shas.len(),
            avg_inter_refactoring_seconds: record.avg_inter_refactoring_time.map(|d| d.as_secs_f64()),
            avg_commit_time_diff: record.avg_inter_refactoring_time.map(humanize_interval),
        }
    }
}

/// `"{hours} hours, which is ~{days} days"`.
pub fn humanize_interval(interval: Duration) -> String {
    let secs = interval.as_secs();
    format!("{} hours, which is ~{} days", secs / 3600, secs / 86_400)
}

// --- Line-delta results ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TouchedLines {
    pub commit: String,
    pub committer: String,
    pub tlocs: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TlocReport {
    pub repository: String,
    pub refactorings: Vec<TouchedLines>,
}

// --- Commit statistics ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileChange {
    /// File name without its directory.
    pub modified: String,
    pub added_lines: usize,
    pub deleted_lines: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitChanges {
    pub commit_hash: String,
    pub previous_commit_hash: Option<String>,
    pub added_lines: usize,
    pub deleted_lines: usize,
    pub modified_files: Vec<FileChange>,
}
