// src/config.rs

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

pub const DEFAULT_CONFIG_FILE: &str = "refmine.toml";
pub const TOKEN_ENV: &str = "GITHUB_TOKEN";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Config {
    pub source_csv: PathBuf,
    pub repositories_dir: PathBuf,
    pub results_dir: PathBuf,
    pub miner_results_dir: PathBuf,
    pub miner_executable: String,
    pub line_counter: String,
    pub line_counter_args: Vec<String>,
    pub api_base: String,
    pub web_base: String,
    pub api_token: Option<String>,
    pub jira_base: String,
    pub jira_page_size: u32,
    /// Worker pool size. `0` derives it from the host.
    pub concurrency: usize,
    pub timeouts: Timeouts,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Timeouts {
    pub clone_secs: u64,
    pub mining_secs: u64,
    pub http_secs: u64,
    pub line_count_secs: u64,
    pub rate_limit_backoff_secs: u64,
    pub jira_page_pause_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source_csv: PathBuf::from("sonar_measures.csv"),
            repositories_dir: PathBuf::from("repositories"),
            results_dir: PathBuf::from("results"),
            miner_results_dir: PathBuf::from("results/miner_results"),
            miner_executable: "RefactoringMiner".into(),
            line_counter: "scc".into(),
            line_counter_args: vec!["--no-cocomo".into(), "--no-complexity".into(), "--no-size".into()],
            api_base: "https://api.github.com".into(),
            web_base: "https://github.com".into(),
            api_token: None,
            jira_base: "https://issues.apache.org/jira/rest/api/2".into(),
            jira_page_size: 1000,
            concurrency: 0,
            timeouts: Timeouts::default(),
        }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            clone_secs: 1800,
            mining_secs: 900,
            http_secs: 60,
            line_count_secs: 300,
            rate_limit_backoff_secs: 5,
            jira_page_pause_ms: 1000,
        }
    }
}

impl Timeouts {
    pub fn clone_timeout(&self) -> Duration {
        Duration::from_secs(self.clone_secs)
    }

    pub fn mining_timeout(&self) -> Duration {
        Duration::from_secs(self.mining_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_secs)
    }

    pub fn line_count_timeout(&self) -> Duration {
        Duration::from_secs(self.line_count_secs)
    }

    pub fn rate_limit_backoff(&self) -> Duration {
        Duration::from_secs(self.rate_limit_backoff_secs)
    }

    pub fn jira_page_pause(&self) -> Duration {
        Duration::from_millis(self.jira_page_pause_ms)
    }
}

impl Config {
    /// Load from an explicit path (which must exist), or the default file
    /// if present, or defaults. `token_from_env` is consulted only when the
    /// file has no `api-token`.
    pub fn load(explicit: Option<&Path>, token_from_env: Option<String>) -> Result<Self, ConfigError> {
        let mut config = match explicit {
            Some(path) if !path.exists() => return Err(ConfigError::NotFound(path.to_path_buf())),
            Some(path) => Self::from_file(path)?,
            None => {
                let default = Path::new(DEFAULT_CONFIG_FILE);
                if default.exists() {
                    Self::from_file(default)?
                } else {
                    Self::default()
                }
            }
        };

        if config.api_token.as_deref().map_or(true, str::is_empty) {
            config.api_token = token_from_env.filter(|t| !t.is_empty());
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.miner_executable.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "miner-executable",
                reason: "must not be empty".into(),
            });
        }
        for (key, value) in [
            ("api-base", &self.api_base),
            ("web-base", &self.web_base),
            ("jira-base", &self.jira_base),
        ] {
            if !value.starts_with("http://") && !value.starts_with("https://") {
                return Err(ConfigError::Invalid {
                    key,
                    reason: format!("expected an http(s) URL, got {value:?}"),
                });
            }
        }
        if self.timeouts.mining_secs == 0 || self.timeouts.http_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "timeouts",
                reason: "timeouts must be at least one second".into(),
            });
        }
        if self.jira_page_size == 0 {
            return Err(ConfigError::Invalid {
                key: "jira-page-size",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }

    /// Effective worker pool size: the configured value, or half the CPUs (min 1).
    pub fn concurrency(&self) -> usize {
        if self.concurrency > 0 {
            self.concurrency
        } else {
            (num_cpus::get() / 2).max(1)
        }
    }

    pub fn repo_lists_dir(&self) -> PathBuf {
        self.results_dir.join("repo_lists")
    }

    pub fn activity_dir(&self) -> PathBuf {
        self.results_dir.join("refactoring_activity")
    }

    pub fn tloc_dir(&self) -> PathBuf {
        self.results_dir.join("tloc_results")
    }

    pub fn issues_dir(&self) -> PathBuf {
        self.results_dir.join("issues")
    }

    pub fn commit_stats_dir(&self) -> PathBuf {
        self.results_dir.join("pydriller_results")
    }
}
