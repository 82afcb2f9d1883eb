// src/tloc.rs

use git2::build::CheckoutBuilder;
use git2::{Oid, Repository};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::TlocError;
use crate::model::{MinerDocument, TlocReport, TouchedLines, WorkItem};
use crate::runner::{execute, CommandLine};

#[derive(Default)]
pub struct RepoLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl RepoLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_for(&self, repository: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(repository.to_string()).or_default().clone()
    }
}

pub trait LineCounter: Sync {
    /// Total lines of code in the working tree at `dir`.
    fn count(&self, dir: &Path) -> Result<i64, TlocError>;
}

impl<F> LineCounter for F
where
    F: Fn(&Path) -> Result<i64, TlocError> + Sync,
{
    fn count(&self, dir: &Path) -> Result<i64, TlocError> {
        self(dir)
    }
}

/// Runs an external counter in the working tree and reads its `Total` row.
pub struct ExternalLineCounter {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl ExternalLineCounter {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }
}

impl LineCounter for ExternalLineCounter {
    fn count(&self, dir: &Path) -> Result<i64, TlocError> {
        let mut command = CommandLine::new(&self.program).current_dir(dir);
        for arg in &self.args {
            command = command.arg(arg);
        }
        let exec = execute(WorkItem::new(dir.display().to_string()), &command, self.timeout);
        if !exec.outcome.is_success() {
            return Err(TlocError::LineCounter(exec.outcome.reason()));
        }
        parse_total(&exec.outcome.stdout).ok_or(TlocError::NoTotal)
    }
}

/// Third field of the first row starting with `Total`.
pub fn parse_total(output: &str) -> Option<i64> {
    output.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        if fields.next()? != "Total" {
            return None;
        }
        fields.nth(1)?.replace(',', "").parse().ok()
    })
}

pub struct LineDeltaCorrelator<'a, C> {
    repositories_dir: PathBuf,
    counter: C,
    locks: &'a RepoLocks,
}

impl<'a, C: LineCounter> LineDeltaCorrelator<'a, C> {
    pub fn new(repositories_dir: impl Into<PathBuf>, counter: C, locks: &'a RepoLocks) -> Self {
        Self {
            repositories_dir: repositories_dir.into(),
            counter,
            locks,
        }
    }

    /// Measure one (refactoring commit, reference commit) pair.
    ///
    /// The working tree is returned to its original HEAD afterwards.
    pub fn touched_lines(
        &self,
        repository: &str,
        refactoring_sha: &str,
        reference_sha: &str,
    ) -> Result<TouchedLines, TlocError> {
        if refactoring_sha == reference_sha {
            return Err(TlocError::IdenticalCommits(refactoring_sha.to_string()));
        }

        let lock = self.locks.lock_for(repository);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let dir = self.repositories_dir.join(repository);
        let repo = Repository::open(&dir).map_err(|source| TlocError::Open {
            path: dir.clone(),
            source,
        })?;
        let original = OriginalHead::capture(&repo);

        let measured = self
            .measure(&repo, &dir, refactoring_sha)
            .and_then(|(committer, rc_loc)| {
                let (_, ref_loc) = self.measure(&repo, &dir, reference_sha)?;
                Ok(TouchedLines {
                    commit: refactoring_sha.to_string(),
                    committer,
                    tlocs: rc_loc - ref_loc,
                })
            });

        if let Some(original) = original {
            if let Err(e) = original.restore(&repo, &dir) {
                warn!("failed to restore {repository} to its original HEAD: {e}");
            }
        }
        measured
    }

    fn measure(&self, repo: &Repository, dir: &Path, sha: &str) -> Result<(String, i64), TlocError> {
        clear_stale_lock(dir)?;
        let checkout_err = |source| TlocError::Checkout {
            sha: sha.to_string(),
            source,
        };
        let commit = repo
            .revparse_single(sha)
            .and_then(|object| object.peel_to_commit())
            .map_err(checkout_err)?;
        force_checkout(repo, commit.id()).map_err(checkout_err)?;
        repo.set_head_detached(commit.id()).map_err(checkout_err)?;

        let committer = commit.committer().name().unwrap_or("Unknown").to_string();
        let loc = self.counter.count(dir)?;
        debug!("{} at {sha}: {loc} lines", dir.display());
        Ok((committer, loc))
    }

    /// Every refactoring commit that has a following entry, paired with it.
    /// Failed pairs are left out of the report and returned alongside it.
    pub fn repository_report(&self, repository: &str, document: &MinerDocument) -> (TlocReport, Vec<TlocError>) {
        let commits = &document.commits;
        let mut refactorings = Vec::new();
        let mut errors = Vec::new();
        for (index, commit) in commits.iter().enumerate() {
            let has_events = commit
                .refactorings
                .iter()
                .any(|r| r.kind.as_deref().is_some_and(|k| !k.trim().is_empty()));
            if !has_events {
                continue;
            }
            let (Some(rc), Some(reference)) = (
                commit.sha1.as_deref(),
                commits.get(index + 1).and_then(|c| c.sha1.as_deref()),
            ) else {
                continue;
            };
            match self.touched_lines(repository, rc, reference) {
                Ok(touched) => refactorings.push(touched),
                Err(e) => {
                    warn!("TLOC for {rc} in {repository} failed ({}): {e}", e.kind());
                    errors.push(e);
                }
            }
        }
        let report = TlocReport {
            repository: repository.to_string(),
            refactorings,
        };
        (report, errors)
    }
}

/// Remove `.git/index.lock` left behind by an interrupted checkout.
pub fn clear_stale_lock(dir: &Path) -> Result<(), TlocError> {
    let lock = dir.join(".git").join("index.lock");
    if lock.exists() {
        warn!("removing stale {}", lock.display());
        fs::remove_file(&lock).map_err(|source| TlocError::StaleLock { path: lock, source })?;
    }
    Ok(())
}

fn force_checkout(repo: &Repository, oid: Oid) -> Result<(), git2::Error> {
    let commit = repo.find_commit(oid)?;
    let mut opts = CheckoutBuilder::new();
    opts.force();
    repo.checkout_tree(commit.as_object(), Some(&mut opts))
}

enum OriginalHead {
    Branch { name: String, oid: Oid },
    Detached(Oid),
}

impl OriginalHead {
    fn capture(repo: &Repository) -> Option<Self> {
        let head = repo.head().ok()?;
        let oid = head.target()?;
        match head.name() {
            Some(name) if head.is_branch() => Some(Self::Branch {
                name: name.to_string(),
                oid,
            }),
            _ => Some(Self::Detached(oid)),
        }
    }

    fn restore(&self, repo: &Repository, dir: &Path) -> Result<(), TlocError> {
        clear_stale_lock(dir)?;
        let (oid, sha) = match self {
            Self::Branch { oid, .. } | Self::Detached(oid) => (*oid, oid.to_string()),
        };
        let checkout_err = |source| TlocError::Checkout { sha: sha.clone(), source };
        force_checkout(repo, oid).map_err(checkout_err)?;
        let moved = match self {
            Self::Branch { name, .. } => repo.set_head(name),
            Self::Detached(oid) => repo.set_head_detached(*oid),
        };
        moved.map_err(checkout_err)
    }
}
