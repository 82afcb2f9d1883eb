// src/aggregator.rs

use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::classifier::Classified;
use crate::error::{PipelineError, Result};
use crate::model::{AggregateReport, ItemNote, Outcome, RefactoringRecord, ReportEntry, TypeCount};

pub const REPORT_FILE: &str = "refactoring_type_results.json";
pub const TABLE_FILE: &str = "refactoring_types.tsv";
pub const REPOSITORIES_DIR: &str = "repositories";

#[derive(Debug, Default)]
pub struct Aggregator {
    report: AggregateReport,
    seen: HashSet<String>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one classification result for `repository`.
    pub fn add(&mut self, repository: &str, classified: Classified) {
        match classified {
            Classified::Parsed(record) => self.push(record),
            Classified::Skipped(reason) => self.skip(repository, reason),
            Classified::Malformed(reason) => self.fail(repository, format!("malformed output: {reason}")),
        }
    }

    pub fn push(&mut self, record: RefactoringRecord) {
        if !self.seen.insert(record.repository.clone()) {
            warn!("{} appears more than once, keeping the first record", record.repository);
            self.report.counters.skipped += 1;
            self.report.skips.push(ItemNote {
                repository: record.repository,
                reason: "duplicate repository".into(),
            });
            return;
        }
        self.report.counters.succeeded += 1;
        self.report.records.push(record);
    }

    pub fn skip(&mut self, repository: &str, reason: impl Into<String>) {
        self.report.counters.skipped += 1;
        self.report.skips.push(ItemNote {
            repository: repository.to_string(),
            reason: reason.into(),
        });
    }

    pub fn fail(&mut self, repository: &str, reason: impl Into<String>) {
        self.report.counters.failed += 1;
        self.report.failures.push(ItemNote {
            repository: repository.to_string(),
            reason: reason.into(),
        });
    }

    /// Tally one runner outcome that produces no record.
    pub fn observe(&mut self, repository: &str, outcome: &Outcome) {
        if outcome.is_success() {
            self.report.counters.succeeded += 1;
        } else {
            self.fail(repository, outcome.reason());
        }
    }

    pub fn records_mut(&mut self) -> &mut [RefactoringRecord] {
        &mut self.report.records
    }

    /// Finish the fold, sorting everything by repository name.
    pub fn finish(mut self) -> AggregateReport {
        self.report.records.sort_by(|a, b| a.repository.cmp(&b.repository));
        self.report.failures.sort_by(|a, b| a.repository.cmp(&b.repository));
        self.report.skips.sort_by(|a, b| a.repository.cmp(&b.repository));
        self.report
    }
}

pub fn fold(records: impl IntoIterator<Item = RefactoringRecord>) -> AggregateReport {
    let mut aggregator = Aggregator::new();
    for record in records {
        aggregator.push(record);
    }
    aggregator.finish()
}

/// Count a multiset of type names, by descending count then alphabetically.
pub fn count_types<I, S>(kinds: I) -> Vec<TypeCount>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut counts: BTreeMap<String, u64> = BTreeMap::new();
    for kind in kinds {
        let kind = kind.as_ref();
        if !kind.is_empty() {
            *counts.entry(kind.to_string()).or_insert(0) += 1;
        }
    }
    let record = RefactoringRecord {
        repository: String::new(),
        origin: None,
        type_counts: counts,
        commit_shas: Vec::new(),
        avg_inter_refactoring_time: None,
    };
    record.sorted_types()
}

// --- Emission ---

pub fn entries(report: &AggregateReport) -> Vec<ReportEntry> {
    report.records.iter().map(ReportEntry::from).collect()
}

pub fn to_json(report: &AggregateReport) -> Result<String> {
    Ok(serde_json::to_string_pretty(&entries(report))?)
}

/// Flattened `repository\ttype\tcount` table with a header row.
pub fn to_tsv(report: &AggregateReport) -> String {
    let mut out = String::from("repository\ttype\tcount\n");
    for record in &report.records {
        for TypeCount { kind, count } in record.sorted_types() {
            let _ = writeln!(out, "{}\t{}\t{}", record.repository, kind, count);
        }
    }
    out
}

/// Operator-facing summary of everything that was excluded, and why.
pub fn summary(report: &AggregateReport) -> String {
    let c = &report.counters;
    let mut out = format!(
        "{} succeeded, {} failed, {} skipped (of {})\n",
        c.succeeded,
        c.failed,
        c.skipped,
        c.total()
    );
    if !report.failures.is_empty() {
        out.push_str("Failed repositories:\n");
        for note in &report.failures {
            let _ = writeln!(out, "- {}: {}", note.repository, note.reason);
        }
    }
    if !report.skips.is_empty() {
        out.push_str("Skipped repositories:\n");
        for note in &report.skips {
            let _ = writeln!(out, "- {}: {}", note.repository, note.reason);
        }
    }
    out
}

pub fn ensure_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).map_err(|source| PipelineError::CreateDir {
        path: dir.to_path_buf(),
        source,
    })
}

pub fn write_file(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).map_err(|source| PipelineError::Write {
        path: path.to_path_buf(),
        source,
    })
}

/// Write `<dir>/repositories/<repository>.json` for one record.
pub fn write_repository_file(dir: &Path, record: &RefactoringRecord) -> Result<PathBuf> {
    let repos = dir.join(REPOSITORIES_DIR);
    ensure_dir(&repos)?;
    let path = repos.join(format!("{}.json", record.repository));
    write_file(&path, &serde_json::to_string_pretty(&ReportEntry::from(record))?)?;
    Ok(path)
}

/// Write the JSON report, the TSV table and every per-repository file.
pub fn write_artifacts(report: &AggregateReport, dir: &Path) -> Result<()> {
    ensure_dir(dir)?;
    write_file(&dir.join(REPORT_FILE), &to_json(report)?)?;
    write_file(&dir.join(TABLE_FILE), &to_tsv(report))?;
    for record in &report.records {
        write_repository_file(dir, record)?;
    }
    info!("wrote {} repositories to {}", report.records.len(), dir.join(REPORT_FILE).display());
    Ok(())
}
