// src/error.rs

use std::io;
use std::path::PathBuf;

/// Why a single work item did not succeed. Never aborts a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FailureKind {
    #[error("transport error")]
    Transport,

    #[error("timed out")]
    Timeout,

    #[error("non-zero exit")]
    NonZeroExit,

    #[error("malformed output")]
    MalformedOutput,

    #[error("caller contract violation")]
    CallerContractViolation,
}

/// Errors loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("invalid config at {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Fatal setup errors. These abort the run before any item is processed.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("failed to create directory {path}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to write {path}: {source}")]
    Write { path: PathBuf, source: io::Error },

    #[error("failed to read csv {path}: {source}")]
    Csv { path: PathBuf, source: csv::Error },

    #[error("{path} does not contain the expected headers 'project' and 'organization'")]
    MissingColumns { path: PathBuf },

    #[error("failed to build worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error("failed to build http client: {0}")]
    HttpClient(#[source] reqwest::Error),

    #[error("request to {url} failed: {reason}")]
    Remote { url: String, reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = core::result::Result<T, PipelineError>;

/// Errors from the line-delta correlator, reported per commit pair.
#[derive(Debug, thiserror::Error)]
pub enum TlocError {
    #[error("refactoring and reference commit are the same: {0}")]
    IdenticalCommits(String),

    #[error("failed to open repository {path}: {source}")]
    Open { path: PathBuf, source: git2::Error },

    #[error("failed to check out {sha}: {source}")]
    Checkout { sha: String, source: git2::Error },

    #[error("failed to clear stale lock {path}: {source}")]
    StaleLock { path: PathBuf, source: io::Error },

    #[error("line counter failed: {0}")]
    LineCounter(String),

    #[error("line counter output has no Total row")]
    NoTotal,
}

impl TlocError {
    pub fn kind(&self) -> FailureKind {
        match self {
            TlocError::IdenticalCommits(_) => FailureKind::CallerContractViolation,
            TlocError::NoTotal => FailureKind::MalformedOutput,
            TlocError::LineCounter(_) => FailureKind::NonZeroExit,
            TlocError::Open { .. } | TlocError::Checkout { .. } | TlocError::StaleLock { .. } => {
                FailureKind::Transport
            }
        }
    }
}
