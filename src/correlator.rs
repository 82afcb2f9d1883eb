// src/correlator.rs

use chrono::{DateTime, FixedOffset, TimeZone};
use git2::{Repository, Sort};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::http::HostClient;
use crate::model::{CommitTimingInfo, RefactoringRecord};

/// Minimum length of an abbreviated sha accepted as a prefix match.
const MIN_PREFIX: usize = 7;

pub trait LookupSource {
    fn lookup(&self, sha: &str) -> Option<CommitTimingInfo>;
}

/// The full committed history of a local clone, read once.
///
/// Read-only: walks from HEAD and every local branch without touching the
/// working tree.
pub struct GitHistory {
    commits: HashMap<String, CommitTimingInfo>,
}

impl GitHistory {
    pub fn open(repo_path: &Path) -> Result<Self, git2::Error> {
        let repo = Repository::open(repo_path)?;
        let mut revwalk = repo.revwalk()?;
        revwalk.set_sorting(Sort::TIME)?;
        if repo.head().is_ok() {
            revwalk.push_head()?;
        }
        revwalk.push_glob("heads")?;

        let mut commits = HashMap::new();
        for oid in revwalk {
            let commit = repo.find_commit(oid?)?;
            let committer = commit.committer();
            let Some(timestamp) = to_datetime(committer.when()) else {
                continue;
            };
            let sha = commit.id().to_string();
            commits.insert(
                sha.clone(),
                CommitTimingInfo {
                    sha,
                    timestamp,
                    committer_name: committer.name().map(str::to_string),
                },
            );
        }
        debug!("read {} commits from {}", commits.len(), repo_path.display());
        Ok(Self { commits })
    }

    pub fn len(&self) -> usize {
        self.commits.len()
    }
}

impl LookupSource for GitHistory {
    fn lookup(&self, sha: &str) -> Option<CommitTimingInfo> {
        if let Some(info) = self.commits.get(sha) {
            return Some(info.clone());
        }
        if sha.len() < MIN_PREFIX {
            return None;
        }
        let mut matches = self.commits.iter().filter(|(full, _)| full.starts_with(sha));
        match (matches.next(), matches.next()) {
            (Some((_, info)), None) => Some(info.clone()),
            _ => None,
        }
    }
}

/// Commit metadata from the hosting API, one request per sha.
pub struct ApiHistory<'a> {
    client: &'a HostClient,
    owner: String,
    repo: String,
}

impl<'a> ApiHistory<'a> {
    pub fn new(client: &'a HostClient, owner: impl Into<String>, repo: impl Into<String>) -> Self {
        Self {
            client,
            owner: owner.into(),
            repo: repo.into(),
        }
    }
}

impl LookupSource for ApiHistory<'_> {
    fn lookup(&self, sha: &str) -> Option<CommitTimingInfo> {
        self.client.commit_timing(&self.owner, &self.repo, sha)
    }
}

impl<F> LookupSource for F
where
    F: Fn(&str) -> Option<CommitTimingInfo>,
{
    fn lookup(&self, sha: &str) -> Option<CommitTimingInfo> {
        self(sha)
    }
}

fn to_datetime(time: git2::Time) -> Option<DateTime<FixedOffset>> {
    let offset = FixedOffset::east_opt(time.offset_minutes() * 60)?;
    offset.timestamp_opt(time.seconds(), 0).single()
}

/// Resolve every sha of the record and attach the average interval.
pub fn enrich(mut record: RefactoringRecord, source: &dyn LookupSource) -> RefactoringRecord {
    let timestamps: Vec<DateTime<FixedOffset>> = record
        .commit_shas
        .iter()
        .filter_map(|sha| source.lookup(sha))
        .map(|info| info.timestamp)
        .collect();
    debug!(
        "{}: resolved {}/{} refactoring commits",
        record.repository,
        timestamps.len(),
        record.commit_shas.len()
    );
    record.avg_inter_refactoring_time = avg_inter_refactoring_time(&timestamps);
    record
}

/// Mean absolute gap between consecutive timestamps, in the given order.
/// `None` with fewer than two timestamps.
pub fn avg_inter_refactoring_time(timestamps: &[DateTime<FixedOffset>]) -> Option<Duration> {
    if timestamps.len() < 2 {
        return None;
    }
    let gaps: Vec<f64> = timestamps
        .windows(2)
        .map(|pair| (pair[1] - pair[0]).num_milliseconds().unsigned_abs() as f64 / 1000.0)
        .collect();
    let mean = gaps.iter().sum::<f64>() / gaps.len() as f64;
    Some(Duration::from_secs_f64(mean))
}
