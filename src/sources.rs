// src/sources.rs

use serde::Deserialize;
use std::fs;
use std::path::Path;
use tracing::info;

use crate::error::{PipelineError, Result};
use crate::model::{Outcome, Status};

#[derive(Debug, Deserialize)]
struct ProjectRow {
    #[serde(default)]
    project: Option<String>,
    #[serde(default)]
    organization: Option<String>,
}

/// Repository name from a measures row: drop the organization prefix and
/// the common build-module suffixes.
pub fn derive_repository_name(project: &str, organization: &str) -> String {
    let name = project
        .strip_prefix(&format!("{organization}_"))
        .unwrap_or(project)
        .replace("-master", "")
        .replace("-builder", "")
        .replace("-parent", "");
    name.strip_prefix(&format!("{organization}-"))
        .map(str::to_string)
        .unwrap_or(name)
}

/// Unique repository web URLs from the measures CSV, in first-seen order.
pub fn repository_urls(csv_path: &Path, web_base: &str) -> Result<Vec<String>> {
    let csv_err = |source| PipelineError::Csv {
        path: csv_path.to_path_buf(),
        source,
    };
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(csv_path)
        .map_err(csv_err)?;

    let headers = reader.headers().map_err(csv_err)?;
    if !headers.iter().any(|h| h == "project") || !headers.iter().any(|h| h == "organization") {
        return Err(PipelineError::MissingColumns {
            path: csv_path.to_path_buf(),
        });
    }

    let base = web_base.trim_end_matches('/');
    let mut urls: Vec<String> = Vec::new();
    for row in reader.deserialize::<ProjectRow>() {
        let row = row.map_err(csv_err)?;
        let (Some(project), Some(organization)) = (row.project, row.organization) else {
            continue;
        };
        if project.is_empty() || organization.is_empty() {
            continue;
        }
        let url = format!("{base}/{organization}/{}", derive_repository_name(&project, &organization));
        if !urls.contains(&url) {
            info!("found URL: {url}");
            urls.push(url);
        }
    }
    Ok(urls)
}

/// `https://host/owner/repo` → `git@host:owner/repo`. Other forms pass through.
pub fn https_to_ssh(url: &str) -> String {
    match url.strip_prefix("https://").and_then(|rest| rest.split_once('/')) {
        Some((host, path)) => format!("git@{host}:{path}"),
        None => url.to_string(),
    }
}

/// `git@host:owner/repo` → `https://host/owner/repo`. Other forms pass through.
pub fn ssh_to_https(url: &str) -> String {
    match url.strip_prefix("git@").and_then(|rest| rest.split_once(':')) {
        Some((host, path)) => format!("https://{host}/{path}"),
        None => url.to_string(),
    }
}

/// `(owner, repo)` from either URL form, without a trailing `.git`.
pub fn owner_and_repo(url: &str) -> Option<(String, String)> {
    let https = ssh_to_https(url.trim());
    let path = https.strip_prefix("https://").or_else(|| https.strip_prefix("http://"))?;
    let mut segments = path.trim_end_matches('/').split('/').skip(1);
    let owner = segments.next()?.to_string();
    let repo = segments.next()?;
    let repo = repo.strip_suffix(".git").unwrap_or(repo).to_string();
    if owner.is_empty() || repo.is_empty() {
        return None;
    }
    Some((owner, repo))
}

pub fn read_list(path: &Path) -> Result<Vec<String>> {
    let contents = fs::read_to_string(path).map_err(|source| PipelineError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

pub fn write_list<S: AsRef<str>>(path: &Path, items: &[S]) -> Result<()> {
    let mut contents = String::new();
    for item in items {
        contents.push_str(item.as_ref());
        contents.push('\n');
    }
    fs::write(path, contents).map_err(|source| PipelineError::Write {
        path: path.to_path_buf(),
        source,
    })
}

/// Case-insensitive sort, as used for every emitted repository list.
pub fn sort_casefold(items: &mut [String]) {
    items.sort_by_key(|s| s.to_lowercase());
}

/// Existence-probe line for an outcome: `"{url} {status}"`, `408` on
/// timeout, `"{url} request failed"` on transport errors.
pub fn probe_line(outcome: &Outcome) -> String {
    match (outcome.status, outcome.http_status) {
        (Status::Timeout, _) => format!("{} 408", outcome.item),
        (_, Some(code)) => format!("{} {code}", outcome.item),
        (_, None) => format!("{} request failed", outcome.item),
    }
}

pub fn probe_ok(outcome: &Outcome) -> bool {
    outcome.http_status == Some(200)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::model::WorkItem;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn derives_names_like_the_measures_sheet() {
        assert_eq!(derive_repository_name("apache_commons-io", "apache"), "commons-io");
        assert_eq!(derive_repository_name("apache_kafka-master", "apache"), "kafka");
        assert_eq!(derive_repository_name("apache-maven-parent", "apache"), "maven");
        assert_eq!(derive_repository_name("apache_apache-felix-builder", "apache"), "felix");
    }

    #[test]
    fn reads_unique_urls_from_csv() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("measures.csv");
        fs::write(
            &path,
            "id,project,organization,metric\n\
             1,apache_kafka,apache,10\n\
             2,apache_kafka-master,apache,11\n\
             3,apache_zookeeper,apache,\"1,2\"\n\
             4,,apache,3\n",
        )
        .unwrap();
        let urls = repository_urls(&path, "https://github.com/").unwrap();
        assert_eq!(urls, ["https://github.com/apache/kafka", "https://github.com/apache/zookeeper"]);
    }

    #[test]
    fn missing_headers_are_fatal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.csv");
        fs::write(&path, "name,owner\nkafka,apache\n").unwrap();
        assert!(matches!(
            repository_urls(&path, "https://github.com"),
            Err(PipelineError::MissingColumns { .. })
        ));
    }

    #[test]
    fn converts_between_url_forms() {
        assert_eq!(https_to_ssh("https://github.com/apache/kafka"), "git@github.com:apache/kafka");
        assert_eq!(ssh_to_https("git@github.com:apache/kafka.git"), "https://github.com/apache/kafka.git");
        assert_eq!(https_to_ssh("/local/path"), "/local/path");
    }

    #[test]
    fn owner_and_repo_from_either_form() {
        let expected = Some(("apache".to_string(), "kafka".to_string()));
        assert_eq!(owner_and_repo("git@github.com:apache/kafka.git"), expected);
        assert_eq!(owner_and_repo("https://github.com/apache/kafka/"), expected);
        assert_eq!(owner_and_repo("https://github.com/apache"), None);
    }

    #[test]
    fn list_round_trip_skips_blank_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("list.txt");
        fs::write(&path, "stale\n").unwrap();
        write_list(&path, &["b", "", "a"]).unwrap();
        assert_eq!(read_list(&path).unwrap(), ["b", "a"]);
    }

    #[test]
    fn probe_lines() {
        let item = WorkItem::from("https://github.com/a/b");
        let mut ok = Outcome::success(item.clone(), String::new(), String::new(), Duration::ZERO);
        ok.http_status = Some(200);
        assert_eq!(probe_line(&ok), "https://github.com/a/b 200");
        assert!(probe_ok(&ok));

        let timeout = Outcome::failure(item.clone(), FailureKind::Timeout, "60s", Duration::ZERO);
        assert_eq!(probe_line(&timeout), "https://github.com/a/b 408");
        let refused = Outcome::failure(item, FailureKind::Transport, "refused", Duration::ZERO);
        assert_eq!(probe_line(&refused), "https://github.com/a/b request failed");
        assert!(!probe_ok(&refused));
    }

    #[test]
    fn casefold_sort() {
        let mut items = vec!["b".to_string(), "A".to_string(), "a2".to_string()];
        sort_casefold(&mut items);
        assert_eq!(items, ["A", "a2", "b"]);
    }
}
