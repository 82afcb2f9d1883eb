// src/jira.rs

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{PipelineError, Result};
use crate::http::HostClient;
use crate::model::WorkItem;

/// The tracker's own website project, never a repository's match.
const EXCLUDED_PROJECT: &str = "ASFSITE";
const FIRST_WORD_BONUS: f64 = 0.2;
const MATCHED_WORDS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JiraProject {
    pub key: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JiraMatch {
    pub closest_project_name: String,
    pub closest_project_key: Option<String>,
    pub similarity_score: f64,
}

impl JiraMatch {
    pub fn from_best(best: Option<(&JiraProject, f64)>) -> Self {
        match best {
            Some((project, score)) => Self {
                closest_project_name: project.name.clone(),
                closest_project_key: Some(project.key.clone()),
                similarity_score: score,
            },
            None => Self {
                closest_project_name: "No match found".into(),
                closest_project_key: None,
                similarity_score: 0.0,
            },
        }
    }
}

#[derive(Deserialize)]
struct SearchPage {
    #[serde(default)]
    issues: Vec<Value>,
    #[serde(default)]
    total: usize,
}

/// Lowercase alphanumeric words of a repository URL's last segment.
pub fn keywords(repository: &str) -> Vec<String> {
    words(WorkItem::new(repository.trim()).name())
}

fn words(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !(c.is_ascii_lowercase() || c.is_ascii_digit()))
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

/// Best project for a repository's keywords: Jaccard similarity on the
/// first three words, plus a bonus when the first word is in the project
/// name. Ties keep the earlier project; a zero score is no match.
pub fn closest_match<'p>(keywords: &[String], projects: &'p [JiraProject]) -> Option<(&'p JiraProject, f64)> {
    let parsed: BTreeSet<String> = keywords.iter().take(MATCHED_WORDS).cloned().collect();
    let first = keywords.first();
    let mut best: Option<(&JiraProject, f64)> = None;
    for project in projects {
        let name: BTreeSet<String> = words(&project.name).into_iter().collect();
        let mut score = jaccard(&parsed, &name);
        if first.is_some_and(|w| name.contains(w)) {
            score += FIRST_WORD_BONUS;
        }
        if score > best.map_or(0.0, |(_, s)| s) {
            best = Some((project, score));
        }
    }
    best
}

pub struct JiraClient {
    http: HostClient,
    page_size: u32,
    pause: Duration,
}

impl JiraClient {
    pub fn new(config: &Config) -> Result<Self> {
        let http = HostClient::with_settings(
            &config.jira_base,
            None,
            config.timeouts.http_timeout(),
            config.timeouts.rate_limit_backoff(),
        )?;
        Ok(Self::with_client(http, config.jira_page_size, config.timeouts.jira_page_pause()))
    }

    pub fn with_client(http: HostClient, page_size: u32, pause: Duration) -> Self {
        Self { http, page_size, pause }
    }

    pub fn projects(&self) -> Result<Vec<JiraProject>> {
        let url = self.http.api_url("project");
        let outcome = self.http.get(WorkItem::new("projects"), &url, &[]);
        if !outcome.is_success() {
            return Err(PipelineError::Remote {
                url,
                reason: outcome.reason(),
            });
        }
        let projects: Vec<JiraProject> = serde_json::from_str(&outcome.stdout)?;
        Ok(projects.into_iter().filter(|p| p.key != EXCLUDED_PROJECT).collect())
    }

    /// Every issue of project `key`, page by page. A failing page ends the
    /// walk and keeps what was fetched; `Err` only when nothing was.
    pub fn fetch_issues(&self, key: &str) -> std::result::Result<Vec<Value>, String> {
        let url = self.http.api_url("search");
        let mut issues = Vec::new();
        loop {
            let query = [
                ("jql", format!("project={key}")),
                ("startAt", issues.len().to_string()),
                ("maxResults", self.page_size.to_string()),
            ];
            let outcome = self.http.get(WorkItem::new(format!("{key}@{}", issues.len())), &url, &query);
            let page = if outcome.is_success() {
                serde_json::from_str::<SearchPage>(&outcome.stdout).map_err(|e| format!("malformed search page: {e}"))
            } else {
                Err(outcome.reason())
            };

            match page {
                Ok(page) => {
                    let exhausted = page.issues.is_empty();
                    issues.extend(page.issues);
                    info!("fetched {} of {} issues for {key}", issues.len(), page.total);
                    if exhausted || issues.len() >= page.total {
                        break;
                    }
                }
                Err(reason) if issues.is_empty() => return Err(reason),
                Err(reason) => {
                    warn!("issues for {key} stopped after {}: {reason}", issues.len());
                    break;
                }
            }
            thread::sleep(self.pause);
        }
        Ok(issues)
    }
}
