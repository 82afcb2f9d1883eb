// src/classifier.rs

use indicatif::{ParallelProgressIterator, ProgressBar};
use rayon::prelude::*;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::model::{MinerDocument, Outcome, RefactoringRecord};

#[derive(Debug, Clone, PartialEq)]
pub enum Classified {
    Parsed(RefactoringRecord),
    Skipped(String),
    Malformed(String),
}

pub const NO_EVENTS: &str = "no refactoring events detected";

/// Classify a mining outcome whose result is expected at `output_file`.
pub fn classify(outcome: &Outcome, output_file: &Path) -> Classified {
    if !outcome.is_success() {
        return Classified::Skipped(format!("non-zero exit / timeout ({})", outcome.reason()));
    }
    classify_file(output_file)
}

/// Classify one result file; the repository is named after the file stem.
pub fn classify_file(path: &Path) -> Classified {
    let repository = repository_name(path);
    match load_document(path) {
        Ok(document) => classify_document(&repository, &document),
        Err(reason) => {
            warn!("{} is malformed, skipping: {reason}", path.display());
            Classified::Malformed(reason)
        }
    }
}

/// Read and validate a mining tool document.
pub fn load_document(path: &Path) -> Result<MinerDocument, String> {
    let contents = fs::read_to_string(path).map_err(|e| format!("cannot read: {e}"))?;
    parse_document(&contents)
}

pub fn parse_document(contents: &str) -> Result<MinerDocument, String> {
    if contents.trim().is_empty() {
        return Err("empty file".into());
    }
    serde_json::from_str(contents).map_err(|e| format!("invalid structure: {e}"))
}

/// Fold one document into a record. Refactorings without a type are ignored.
pub fn classify_document(repository: &str, document: &MinerDocument) -> Classified {
    let mut type_counts: BTreeMap<String, u64> = BTreeMap::new();
    let mut commit_shas = Vec::new();
    let mut seen = HashSet::new();

    for commit in &document.commits {
        let mut counted = 0;
        for refactoring in &commit.refactorings {
            match refactoring.kind.as_deref().map(str::trim) {
                Some(kind) if !kind.is_empty() => {
                    *type_counts.entry(kind.to_string()).or_insert(0) += 1;
                    counted += 1;
                }
                _ => {}
            }
        }
        if counted > 0 {
            if let Some(sha) = commit.sha1.as_deref().filter(|s| !s.is_empty()) {
                if seen.insert(sha.to_string()) {
                    commit_shas.push(sha.to_string());
                }
            }
        }
    }

    if type_counts.is_empty() {
        debug!("{repository}: {NO_EVENTS}");
        return Classified::Skipped(NO_EVENTS.into());
    }

    let origin = document
        .commits
        .iter()
        .find_map(|c| c.repository.clone())
        .filter(|r| !r.is_empty());

    Classified::Parsed(RefactoringRecord {
        repository: repository.to_string(),
        origin,
        type_counts,
        commit_shas,
        avg_inter_refactoring_time: None,
    })
}

pub fn repository_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// All `*.json` files directly under `dir`, sorted by name.
pub fn result_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();
    Ok(files)
}

/// Classify every file in parallel. The result pairs each repository with
/// its classification, in file-name order.
pub fn classify_all(files: &[PathBuf]) -> Vec<(String, Classified)> {
    let bar = ProgressBar::new(files.len() as u64);
    bar.set_message("Classifying results");
    let classified = files
        .par_iter()
        .progress_with(bar.clone())
        .map(|path| (repository_name(path), classify_file(path)))
        .collect();
    bar.finish_and_clear();
    classified
}
