// src/http.rs

use chrono::{DateTime, FixedOffset};
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{FailureKind, PipelineError, Result};
use crate::model::{CommitTimingInfo, Outcome, WorkItem};
use crate::runner::Runner;

const USER_AGENT: &str = concat!("refmine/", env!("CARGO_PKG_VERSION"));
pub const ISSUES_PER_PAGE: u32 = 100;

#[derive(Clone)]
pub struct HostClient {
    http: Client,
    api_base: String,
    token: Option<String>,
    backoff: Duration,
}

#[derive(Deserialize)]
struct RepositoryMeta {
    #[serde(default)]
    has_issues: bool,
}

#[derive(Deserialize)]
struct CommitEnvelope {
    commit: CommitBody,
}

#[derive(Deserialize)]
struct CommitBody {
    committer: CommitSignature,
}

#[derive(Deserialize)]
struct CommitSignature {
    #[serde(default)]
    name: Option<String>,
    date: String,
}

impl HostClient {
    pub fn new(config: &Config) -> Result<Self> {
        Self::with_settings(
            &config.api_base,
            config.api_token.clone(),
            config.timeouts.http_timeout(),
            config.timeouts.rate_limit_backoff(),
        )
    }

    pub fn with_settings(
        api_base: &str,
        token: Option<String>,
        timeout: Duration,
        backoff: Duration,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(PipelineError::HttpClient)?;
        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            token,
            backoff,
        })
    }

    /// `GET url`, retrying once after backoff on `403`.
    ///
    /// The credential is attached only to requests against the API base.
    pub fn get(&self, item: WorkItem, url: &str, query: &[(&str, String)]) -> Outcome {
        let started = Instant::now();
        let mut outcome = self.get_once(&item, url, query, started);
        if outcome.http_status == Some(StatusCode::FORBIDDEN.as_u16()) {
            warn!("rate limited on {url}, retrying once in {:?}", self.backoff);
            thread::sleep(self.backoff);
            outcome = self.get_once(&item, url, query, started);
        }
        outcome
    }

    fn get_once(&self, item: &WorkItem, url: &str, query: &[(&str, String)], started: Instant) -> Outcome {
        let mut request = self.http.get(url).query(query);
        if let Some(token) = &self.token {
            if url.starts_with(&self.api_base) {
                request = request.bearer_auth(token);
            }
        }

        let response = match request.send() {
            Ok(response) => response,
            Err(e) => {
                let kind = if e.is_timeout() {
                    FailureKind::Timeout
                } else {
                    FailureKind::Transport
                };
                return Outcome::failure(item.clone(), kind, e.to_string(), started.elapsed());
            }
        };

        let status = response.status();
        let body = match response.text() {
            Ok(body) => body,
            Err(e) => {
                let kind = if e.is_timeout() {
                    FailureKind::Timeout
                } else {
                    FailureKind::Transport
                };
                let mut outcome = Outcome::failure(item.clone(), kind, e.to_string(), started.elapsed());
                outcome.http_status = Some(status.as_u16());
                return outcome;
            }
        };
        debug!("GET {url} -> {status}");

        let mut outcome = if status.is_success() {
            Outcome::success(item.clone(), body, String::new(), started.elapsed())
        } else {
            let mut outcome = Outcome::failure(
                item.clone(),
                FailureKind::NonZeroExit,
                format!("HTTP {status}"),
                started.elapsed(),
            );
            outcome.stdout = body;
            outcome
        };
        outcome.exit_code = None;
        outcome.http_status = Some(status.as_u16());
        outcome
    }

    pub fn api_url(&self, path: &str) -> String {
        format!("{}/{}", self.api_base, path.trim_start_matches('/'))
    }

    /// `Some(has_issues)` on success, `None` when undetermined.
    pub fn has_issues(&self, owner: &str, repo: &str) -> Option<bool> {
        let item = WorkItem::new(format!("{owner}/{repo}"));
        let outcome = self.get(item, &self.api_url(&format!("repos/{owner}/{repo}")), &[]);
        if !outcome.is_success() {
            warn!("failed to fetch repository data for {owner}/{repo}: {}", outcome.reason());
            return None;
        }
        match serde_json::from_str::<RepositoryMeta>(&outcome.stdout) {
            Ok(meta) => Some(meta.has_issues),
            Err(e) => {
                warn!("unexpected repository payload for {owner}/{repo}: {e}");
                None
            }
        }
    }

    /// Every issue of the repository, page by page until an empty page.
    ///
    /// A failing page ends the walk; pages already fetched are kept.
    pub fn fetch_all_issues(&self, owner: &str, repo: &str) -> Vec<Value> {
        let url = self.api_url(&format!("repos/{owner}/{repo}/issues"));
        let mut issues = Vec::new();
        let mut page = 1u32;
        loop {
            let query = [
                ("state", "all".to_string()),
                ("page", page.to_string()),
                ("per_page", ISSUES_PER_PAGE.to_string()),
            ];
            let outcome = self.get(WorkItem::new(format!("{owner}/{repo}#{page}")), &url, &query);
            if !outcome.is_success() {
                warn!("failed to fetch issues page {page} for {owner}/{repo}: {}", outcome.reason());
                break;
            }
            match serde_json::from_str::<Vec<Value>>(&outcome.stdout) {
                Ok(batch) if batch.is_empty() => break,
                Ok(batch) => issues.extend(batch),
                Err(e) => {
                    warn!("malformed issues page {page} for {owner}/{repo}: {e}");
                    break;
                }
            }
            page += 1;
        }
        info!("fetched {} issues for {owner}/{repo}", issues.len());
        issues
    }

    /// Committer date and name of one commit; `None` when it cannot be resolved.
    pub fn commit_timing(&self, owner: &str, repo: &str, sha: &str) -> Option<CommitTimingInfo> {
        let item = WorkItem::new(sha);
        let outcome = self.get(item, &self.api_url(&format!("repos/{owner}/{repo}/commits/{sha}")), &[]);
        if !outcome.is_success() {
            debug!("commit {sha} not resolved for {owner}/{repo}: {}", outcome.reason());
            return None;
        }
        let envelope: CommitEnvelope = serde_json::from_str(&outcome.stdout).ok()?;
        let timestamp: DateTime<FixedOffset> =
            DateTime::parse_from_rfc3339(&envelope.commit.committer.date).ok()?;
        Some(CommitTimingInfo {
            sha: sha.to_string(),
            timestamp,
            committer_name: envelope.commit.committer.name,
        })
    }
}

pub struct ProbeRunner<'a> {
    client: &'a HostClient,
}

impl<'a> ProbeRunner<'a> {
    pub fn new(client: &'a HostClient) -> Self {
        Self { client }
    }
}

impl Runner for ProbeRunner<'_> {
    fn run(&self, item: &WorkItem) -> Outcome {
        self.client.get(item.clone(), item.as_str(), &[])
    }
}

#[cfg(test)]
pub(crate) mod test_server {
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread;

    /// Serves canned `(status, body)` responses in order, then 404s.
    /// Returns the base URL, the request counter and the seen request lines.
    pub fn serve(responses: Vec<(u16, &'static str)>) -> (String, Arc<AtomicUsize>, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (count_srv, seen_srv) = (count.clone(), seen.clone());

        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { break };
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                let mut request_line = String::new();
                reader.read_line(&mut request_line).unwrap();
                loop {
                    let mut header = String::new();
                    if reader.read_line(&mut header).unwrap() == 0 || header == "\r\n" {
                        break;
                    }
                    if header.to_ascii_lowercase().starts_with("authorization:") {
                        seen_srv.lock().unwrap().push(header.trim().to_string());
                    }
                }
                seen_srv.lock().unwrap().push(request_line.trim().to_string());

                let index = count_srv.fetch_add(1, Ordering::SeqCst);
                let (status, body) = responses.get(index).copied().unwrap_or((404, ""));
                let response = format!(
                    "HTTP/1.1 {status} X\r\nContent-Length: {}\r\nContent-Type: application/json\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes());
            }
        });

        (base, count, seen)
    }
}

#[cfg(test)]
mod tests {
    use super::test_server::serve;
    use super::*;
    use crate::model::Status;
    use std::sync::atomic::Ordering;

    fn client(base: &str) -> HostClient {
        HostClient::with_settings(base, Some("t0ken".into()), Duration::from_secs(5), Duration::from_millis(10)).unwrap()
    }

    #[test]
    fn rate_limited_request_is_retried_once_then_succeeds() {
        let (base, count, _) = serve(vec![(403, ""), (200, "{\"has_issues\": true}")]);
        assert_eq!(client(&base).has_issues("apache", "kafka"), Some(true));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn rate_limited_request_is_never_retried_twice() {
        let (base, count, _) = serve(vec![(403, ""), (403, ""), (200, "{}")]);
        let outcome = client(&base).get(WorkItem::from("x"), &format!("{base}/repos/a/b"), &[]);
        assert_eq!(outcome.status, Status::Failure);
        assert_eq!(outcome.http_status, Some(403));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn other_errors_are_not_retried() {
        let (base, count, _) = serve(vec![(500, "oops"), (200, "{}")]);
        let outcome = client(&base).get(WorkItem::from("x"), &format!("{base}/repos/a/b"), &[]);
        assert_eq!(outcome.status, Status::Failure);
        assert_eq!(outcome.http_status, Some(500));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn bearer_token_is_sent_to_the_api() {
        let (base, _, seen) = serve(vec![(200, "{\"has_issues\": false}")]);
        assert_eq!(client(&base).has_issues("o", "r"), Some(false));
        let seen = seen.lock().unwrap();
        assert!(seen.iter().any(|h| h.eq_ignore_ascii_case("authorization: Bearer t0ken")));
    }

    #[test]
    fn connection_refused_is_transport_failure() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);
        let outcome = client(&base).get(WorkItem::from("x"), &base, &[]);
        assert_eq!(outcome.failure, Some(FailureKind::Transport));
    }

    #[test]
    fn issues_are_paginated_until_an_empty_page() {
        let (base, count, seen) = serve(vec![(200, "[{\"number\": 1}, {\"number\": 2}]"), (200, "[{\"number\": 3}]"), (200, "[]")]);
        let issues = client(&base).fetch_all_issues("apache", "kafka");
        assert_eq!(issues.len(), 3);
        assert_eq!(count.load(Ordering::SeqCst), 3);
        let seen = seen.lock().unwrap();
        assert!(seen.iter().any(|l| l.contains("page=2") && l.contains("state=all")));
    }

    #[test]
    fn commit_timing_reads_committer_date() {
        let body = r#"{"sha": "abc", "commit": {"committer": {"name": "Ada", "date": "2021-03-04T05:06:07Z"}}}"#;
        let (base, _, _) = serve(vec![(200, body), (404, "")]);
        let c = client(&base);
        let info = c.commit_timing("o", "r", "abc").unwrap();
        assert_eq!(info.committer_name.as_deref(), Some("Ada"));
        assert_eq!(info.timestamp.timestamp(), 1_614_834_367);
        assert!(c.commit_timing("o", "r", "missing").is_none());
    }
}
