// src/pipeline.rs

use rayon::prelude::*;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::aggregator::{self, ensure_dir, write_file, Aggregator};
use crate::classifier::{self, Classified};
use crate::cli::Lookup;
use crate::commits;
use crate::config::Config;
use crate::correlator::{self, ApiHistory, GitHistory};
use crate::error::{FailureKind, PipelineError, Result};
use crate::http::{HostClient, ProbeRunner};
use crate::jira::{self, JiraClient, JiraMatch};
use crate::model::{AggregateReport, Outcome, WorkItem};
use crate::runner::{execute, CommandLine, CommandRunner, Runner};
use crate::scheduler::{run_with_progress, Scheduler};
use crate::sources;
use crate::tloc::{ExternalLineCounter, LineDeltaCorrelator, RepoLocks};

pub struct Pipeline<'a> {
    config: &'a Config,
    scheduler: Scheduler,
}

impl<'a> Pipeline<'a> {
    pub fn new(config: &'a Config) -> Result<Self> {
        let scheduler = Scheduler::new(config.concurrency())?;
        info!("running with up to {} concurrent jobs", scheduler.limit());
        Ok(Self { config, scheduler })
    }

    // --- fetch ---

    pub fn fetch(&self) -> Result<Vec<String>> {
        let dest = self.config.repo_lists_dir();
        ensure_dir(&dest)?;

        let https_urls = sources::repository_urls(&self.config.source_csv, &self.config.web_base)?;
        let ssh_urls: Vec<String> = https_urls.iter().map(|u| sources::https_to_ssh(u)).collect();
        sources::write_list(&dest.join("ssh_urls.txt"), &ssh_urls)?;

        let client = HostClient::new(self.config)?;
        let items: Vec<WorkItem> = https_urls.iter().map(|u| WorkItem::new(u.as_str())).collect();
        let (outcomes, _) = run_with_progress(&self.scheduler, "probe", items, &ProbeRunner::new(&client));

        let by_url: HashMap<&str, &Outcome> = outcomes.iter().map(|o| (o.item.as_str(), o)).collect();
        let mut statuses = Vec::with_capacity(https_urls.len());
        let mut ok = Vec::new();
        let mut unavailable = Vec::new();
        for url in &https_urls {
            let Some(outcome) = by_url.get(url.as_str()) else {
                continue;
            };
            statuses.push(sources::probe_line(outcome));
            if sources::probe_ok(outcome) {
                ok.push(sources::https_to_ssh(url));
            } else {
                unavailable.push(url.clone());
            }
        }
        sources::sort_casefold(&mut ok);
        sources::sort_casefold(&mut unavailable);

        sources::write_list(&dest.join("https_statuses.txt"), &statuses)?;
        sources::write_list(&dest.join("ok_repos.txt"), &ok)?;
        sources::write_list(&dest.join("unavailable_repos.txt"), &unavailable)?;

        for url in &unavailable {
            warn!("unavailable: {url}");
        }
        info!(
            "found {} OK repositories and {} unavailable repositories, lists are in {}",
            ok.len(),
            unavailable.len(),
            dest.display()
        );
        Ok(ok)
    }

    // --- clone ---

    /// Clone every URL not already present under the repositories directory.
    /// URLs sharing a directory name with an earlier entry are skipped.
    pub fn clone_repositories(&self, urls: &[String]) -> Result<AggregateReport> {
        let root = &self.config.repositories_dir;
        ensure_dir(root)?;

        let mut aggregator = Aggregator::new();
        let mut claimed = HashSet::new();
        let mut items = Vec::new();
        for url in urls {
            let item = WorkItem::new(url.as_str());
            let name = item.name();
            if !claimed.insert(name.to_string()) {
                aggregator.skip(url, format!("directory name {name} is taken by an earlier entry"));
            } else if root.join(name).exists() {
                info!("{name} already cloned, skipping");
                aggregator.skip(name, "already cloned");
            } else {
                items.push(item);
            }
        }

        let timeout = self.config.timeouts.clone_timeout();
        let runner = |item: &WorkItem| {
            let target = root.join(item.name());
            if target.exists() {
                return Outcome::failure(
                    item.clone(),
                    FailureKind::CallerContractViolation,
                    format!("{} already exists", target.display()),
                    Duration::ZERO,
                );
            }
            let command = CommandLine::new("git").arg("clone").arg(item.as_str()).arg(&target);
            let outcome = execute(item.clone(), &command, timeout).outcome;
            if !outcome.is_success() {
                remove_partial(&target);
            }
            outcome
        };
        let (outcomes, _) = run_with_progress(&self.scheduler, "clone", items, &runner);
        for outcome in &outcomes {
            aggregator.observe(outcome.item.as_str(), outcome);
        }

        let report = aggregator.finish();
        println!("{}", aggregator::summary(&report));
        Ok(report)
    }

    // --- mine ---

    pub fn mine(&self, force: bool) -> Result<AggregateReport> {
        let out_dir = &self.config.miner_results_dir;
        ensure_dir(out_dir)?;
        let mut aggregator = Aggregator::new();

        let mut items = Vec::new();
        for dir in repository_dirs(&self.config.repositories_dir)? {
            let item = WorkItem::new(dir.to_string_lossy());
            let output = output_file(out_dir, &item);
            let done = fs::metadata(&output).map(|m| m.len() > 0).unwrap_or(false);
            if done && !force {
                aggregator.add(item.name(), classifier::classify_file(&output));
            } else {
                items.push(item);
            }
        }

        let miner = &self.config.miner_executable;
        let runner = CommandRunner::new(self.config.timeouts.mining_timeout(), |item: &WorkItem| {
            CommandLine::new(miner)
                .arg("-a")
                .arg(item.as_str())
                .arg("-json")
                .arg(output_file(out_dir, item))
        });
        let cleanup = |item: &WorkItem| {
            let outcome = runner.run(item);
            if !outcome.is_success() {
                remove_partial(&output_file(out_dir, item));
            }
            outcome
        };
        let (outcomes, _) = run_with_progress(&self.scheduler, "mine", items, &cleanup);

        for outcome in &outcomes {
            let output = output_file(out_dir, &outcome.item);
            let name = outcome.item.name().to_string();
            match classifier::classify(outcome, &output) {
                Classified::Skipped(reason) if !outcome.is_success() => aggregator.fail(&name, reason),
                classified => aggregator.add(&name, classified),
            }
        }

        let report = aggregator.finish();
        println!("{}", aggregator::summary(&report));
        Ok(report)
    }

    // --- analyze ---

    pub fn analyze(&self, lookup: Lookup) -> Result<AggregateReport> {
        let started = Instant::now();
        let files = self.result_files()?;
        if files.is_empty() {
            warn!("no mining results found in {}", self.config.miner_results_dir.display());
        }

        let mut aggregator = Aggregator::new();
        for (repository, classified) in classifier::classify_all(&files) {
            aggregator.add(&repository, classified);
        }

        let client = match lookup {
            Lookup::Api => Some(HostClient::new(self.config)?),
            Lookup::Git => None,
        };
        info!("calculating average inter-refactoring times");
        let repositories_dir = &self.config.repositories_dir;
        let records = aggregator.records_mut();
        self.scheduler.install(|| {
            records.par_iter_mut().for_each(|record| {
                let enriched = match &client {
                    Some(client) => {
                        let Some((owner, repo)) = record.origin.as_deref().and_then(sources::owner_and_repo) else {
                            warn!("{}: no repository origin, cannot query the API", record.repository);
                            return;
                        };
                        correlator::enrich(record.clone(), &ApiHistory::new(client, owner, repo))
                    }
                    None => match GitHistory::open(&repositories_dir.join(&record.repository)) {
                        Ok(history) => correlator::enrich(record.clone(), &history),
                        Err(e) => {
                            warn!("{}: cannot read git history: {e}", record.repository);
                            return;
                        }
                    },
                };
                *record = enriched;
            });
        });

        let report = aggregator.finish();
        aggregator::write_artifacts(&report, &self.config.activity_dir())?;
        println!("{}", aggregator::summary(&report));
        info!("analysis finished in {:.2?}", started.elapsed());
        Ok(report)
    }

    // --- tloc ---

    pub fn tloc(&self) -> Result<AggregateReport> {
        let dest = self.config.tloc_dir();
        ensure_dir(&dest)?;

        let mut aggregator = Aggregator::new();
        let mut items = Vec::new();
        for path in self.result_files()? {
            match classifier::classify_file(&path) {
                Classified::Parsed(_) => items.push(WorkItem::new(path.to_string_lossy())),
                Classified::Skipped(reason) | Classified::Malformed(reason) => {
                    let repository = classifier::repository_name(&path);
                    info!("{repository}: {reason}, skipping");
                    aggregator.skip(&repository, reason);
                }
            }
        }

        let locks = RepoLocks::new();
        let counter = ExternalLineCounter::new(
            &self.config.line_counter,
            self.config.line_counter_args.clone(),
            self.config.timeouts.line_count_timeout(),
        );
        let correlator = LineDeltaCorrelator::new(&self.config.repositories_dir, counter, &locks);

        let runner = |item: &WorkItem| {
            let started = Instant::now();
            let path = Path::new(item.as_str());
            let repository = classifier::repository_name(path);
            let document = match classifier::load_document(path) {
                Ok(document) => document,
                Err(reason) => return Outcome::failure(item.clone(), FailureKind::MalformedOutput, reason, started.elapsed()),
            };
            let (report, errors) = correlator.repository_report(&repository, &document);
            if report.refactorings.is_empty() {
                return match errors.first() {
                    Some(first) => Outcome::failure(
                        item.clone(),
                        first.kind(),
                        format!("all {} commit pairs failed, first: {first}", errors.len()),
                        started.elapsed(),
                    ),
                    None => Outcome::success(item.clone(), String::new(), String::new(), started.elapsed()),
                };
            }
            let target = dest.join(format!("{repository}.json"));
            let written = serde_json::to_string(&report)
                .map_err(PipelineError::from)
                .and_then(|json| write_file(&target, &json));
            match written {
                Ok(()) => Outcome::success(item.clone(), target.display().to_string(), String::new(), started.elapsed()),
                Err(e) => Outcome::failure(item.clone(), FailureKind::Transport, e.to_string(), started.elapsed()),
            }
        };

        let (outcomes, _) = run_with_progress(&self.scheduler, "tloc", items, &runner);
        for outcome in &outcomes {
            let repository = classifier::repository_name(Path::new(outcome.item.as_str()));
            if outcome.is_success() && outcome.stdout.is_empty() {
                aggregator.skip(&repository, "no refactoring commit with a following entry");
            } else {
                aggregator.observe(&repository, outcome);
            }
        }

        let report = aggregator.finish();
        println!("{}", aggregator::summary(&report));
        info!("touched-lines results are in {}", dest.display());
        Ok(report)
    }

    // --- commit statistics ---

    pub fn commit_stats(&self) -> Result<AggregateReport> {
        let dest = self.config.commit_stats_dir();
        ensure_dir(&dest)?;

        let mut aggregator = Aggregator::new();
        let mut items = Vec::new();
        for dir in repository_dirs(&self.config.repositories_dir)? {
            let item = WorkItem::new(dir.to_string_lossy());
            match classifier::classify_file(&output_file(&self.config.miner_results_dir, &item)) {
                Classified::Parsed(_) => items.push(item),
                Classified::Skipped(reason) | Classified::Malformed(reason) => {
                    aggregator.skip(item.name(), format!("no refactoring detected ({reason})"));
                }
            }
        }

        let runner = |item: &WorkItem| {
            let started = Instant::now();
            let changes = match commits::commit_changes(Path::new(item.as_str())) {
                Ok(changes) => changes,
                Err(e) => {
                    let detail = format!("cannot walk history: {e}");
                    return Outcome::failure(item.clone(), FailureKind::Transport, detail, started.elapsed());
                }
            };
            let target = output_file(&dest, item);
            let written = serde_json::to_string_pretty(&changes)
                .map_err(PipelineError::from)
                .and_then(|json| write_file(&target, &json));
            match written {
                Ok(()) => Outcome::success(item.clone(), target.display().to_string(), String::new(), started.elapsed()),
                Err(e) => Outcome::failure(item.clone(), FailureKind::Transport, e.to_string(), started.elapsed()),
            }
        };

        let (outcomes, _) = run_with_progress(&self.scheduler, "commits", items, &runner);
        for outcome in &outcomes {
            aggregator.observe(outcome.item.name(), outcome);
        }

        let report = aggregator.finish();
        println!("{}", aggregator::summary(&report));
        info!("commit statistics are in {}", dest.display());
        Ok(report)
    }

    // --- issues ---

    /// Split the repositories of `list` by issue-tracker status and, when
    /// `fetch` is set, download every issue of the enabled ones.
    pub fn issues(&self, list: &Path, fetch: bool) -> Result<AggregateReport> {
        let dest = self.config.issues_dir();
        let issues_dir = dest.join("github_issues");
        ensure_dir(&issues_dir)?;

        let urls = sources::read_list(list)?;
        let client = HostClient::new(self.config)?;
        let runner = |item: &WorkItem| {
            let started = Instant::now();
            let Some((owner, repo)) = sources::owner_and_repo(item.as_str()) else {
                return Outcome::failure(
                    item.clone(),
                    FailureKind::CallerContractViolation,
                    "not a repository URL",
                    started.elapsed(),
                );
            };
            match client.has_issues(&owner, &repo) {
                Some(true) => {
                    if fetch {
                        let issues = client.fetch_all_issues(&owner, &repo);
                        if issues.is_empty() {
                            info!("no issues found for {owner}/{repo}");
                        } else {
                            let path = issues_dir.join(format!("{owner}_{repo}_issues.json"));
                            let written = serde_json::to_string_pretty(&issues)
                                .map_err(PipelineError::from)
                                .and_then(|json| write_file(&path, &json));
                            if let Err(e) = written {
                                return Outcome::failure(item.clone(), FailureKind::Transport, e.to_string(), started.elapsed());
                            }
                        }
                    }
                    Outcome::success(item.clone(), "enabled".into(), String::new(), started.elapsed())
                }
                Some(false) => Outcome::success(item.clone(), "disabled".into(), String::new(), started.elapsed()),
                None => Outcome::failure(
                    item.clone(),
                    FailureKind::Transport,
                    "could not determine issue tracking status",
                    started.elapsed(),
                ),
            }
        };

        let items = urls.iter().map(|u| WorkItem::new(u.as_str())).collect();
        let (outcomes, _) = run_with_progress(&self.scheduler, "issues", items, &runner);

        let mut aggregator = Aggregator::new();
        let mut enabled = Vec::new();
        let mut disabled = Vec::new();
        for outcome in &outcomes {
            aggregator.observe(outcome.item.as_str(), outcome);
            if !outcome.is_success() {
                continue;
            }
            match outcome.stdout.as_str() {
                "enabled" => enabled.push(outcome.item.to_string()),
                _ => disabled.push(outcome.item.to_string()),
            }
        }
        sources::sort_casefold(&mut enabled);
        sources::sort_casefold(&mut disabled);
        sources::write_list(&dest.join("github_issues_enabled.txt"), &enabled)?;
        sources::write_list(&dest.join("github_issues_disabled.txt"), &disabled)?;
        let report = aggregator.finish();
        println!("{}", aggregator::summary(&report));
        info!(
            "{} repositories with issues enabled, {} disabled, {} undetermined",
            enabled.len(),
            disabled.len(),
            report.counters.failed
        );
        Ok(report)
    }

    /// Match each repository of `list` to a JIRA project by name and
    /// download every issue of each matched project once.
    pub fn jira_issues(&self, list: &Path) -> Result<AggregateReport> {
        let dest = self.config.issues_dir();
        let issues_dir = dest.join("jira_issues");
        ensure_dir(&issues_dir)?;

        let parsed: Vec<Vec<String>> = sources::read_list(list)?.iter().map(|url| jira::keywords(url)).collect();
        write_file(&dest.join("parsed_names_collection.json"), &serde_json::to_string_pretty(&parsed)?)?;

        let client = JiraClient::new(self.config)?;
        let projects = client.projects()?;
        write_file(&dest.join("projects_collection.json"), &serde_json::to_string_pretty(&projects)?)?;

        let mut aggregator = Aggregator::new();
        let mut matches = BTreeMap::new();
        // project key -> project name
        let mut wanted: BTreeMap<String, String> = BTreeMap::new();
        for words in &parsed {
            let label = words.join(" ");
            let best = jira::closest_match(words, &projects);
            match best {
                Some((project, _)) if wanted.contains_key(&project.key) => {
                    aggregator.skip(&label, format!("issues of {} are already fetched", project.key));
                }
                Some((project, _)) => {
                    wanted.insert(project.key.clone(), project.name.clone());
                }
                None => aggregator.skip(&label, "no matching JIRA project"),
            }
            matches.insert(label, JiraMatch::from_best(best));
        }
        write_file(&dest.join("closest_matches.json"), &serde_json::to_string_pretty(&matches)?)?;

        let runner = |item: &WorkItem| {
            let started = Instant::now();
            let key = item.as_str();
            let issues = match client.fetch_issues(key) {
                Ok(issues) => issues,
                Err(reason) => return Outcome::failure(item.clone(), FailureKind::Transport, reason, started.elapsed()),
            };
            let name = wanted.get(key).map_or(key, String::as_str);
            let target = issues_dir.join(format!("{}_issues.json", name.replace([' ', '/'], "_")));
            let written = serde_json::to_string_pretty(&issues)
                .map_err(PipelineError::from)
                .and_then(|json| write_file(&target, &json));
            match written {
                Ok(()) => Outcome::success(item.clone(), target.display().to_string(), String::new(), started.elapsed()),
                Err(e) => Outcome::failure(item.clone(), FailureKind::Transport, e.to_string(), started.elapsed()),
            }
        };

        let items = wanted.keys().map(|key| WorkItem::new(key.as_str())).collect();
        let (outcomes, _) = run_with_progress(&self.scheduler, "jira", items, &runner);
        for outcome in &outcomes {
            aggregator.observe(outcome.item.as_str(), outcome);
        }

        let report = aggregator.finish();
        println!("{}", aggregator::summary(&report));
        Ok(report)
    }

    // --- run ---

    pub fn run(&self, force: bool) -> Result<AggregateReport> {
        let ok = self.fetch()?;
        self.clone_repositories(&ok)?;
        self.mine(force)?;
        self.analyze(Lookup::Git)
    }

    fn result_files(&self) -> Result<Vec<PathBuf>> {
        let dir = &self.config.miner_results_dir;
        if !dir.exists() {
            return Ok(Vec::new());
        }
        classifier::result_files(dir).map_err(|source| PipelineError::Read {
            path: dir.clone(),
            source,
        })
    }
}

/// `<dir>/<repository>.json` for a repository work item.
pub fn output_file(dir: &Path, item: &WorkItem) -> PathBuf {
    dir.join(format!("{}.json", item.name()))
}

pub fn repository_dirs(root: &Path) -> Result<Vec<PathBuf>> {
    let read_err = |source| PipelineError::Read {
        path: root.to_path_buf(),
        source,
    };
    let mut dirs = Vec::new();
    for entry in fs::read_dir(root).map_err(read_err)? {
        let path = entry.map_err(read_err)?.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn remove_partial(path: &Path) {
    let removed = if path.is_dir() {
        fs::remove_dir_all(path)
    } else if path.exists() {
        fs::remove_file(path)
    } else {
        return;
    };
    if let Err(e) = removed {
        warn!("failed to remove partial output {}: {e}", path.display());
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::testing::{commit_file, init_repo};
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    /// A stand-in mining tool: writes a document for `good*` repositories,
    /// garbage for `corrupt*`, and fails for anything else.
    const FAKE_MINER: &str = r#"#!/bin/sh
repo="$2"; out="$4"; name=$(basename "$repo")
echo "mining $name" >&2
case "$name" in
  good*) printf '{"commits": [{"sha1": "%s", "refactorings": [{"type": "Move Method"}]}]}' "$(cat "$repo/HEAD_SHA")" > "$out" ;;
  corrupt*) printf '{"commits": [' > "$out" ;;
  *) printf 'partial' > "$out"; exit 2 ;;
esac
"#;

    fn config(root: &Path) -> Config {
        let miner = root.join("fake-miner.sh");
        fs::write(&miner, FAKE_MINER).unwrap();
        fs::set_permissions(&miner, fs::Permissions::from_mode(0o755)).unwrap();
        Config {
            repositories_dir: root.join("repos"),
            results_dir: root.join("results"),
            miner_results_dir: root.join("results/miner_results"),
            miner_executable: miner.to_string_lossy().into_owned(),
            concurrency: 2,
            ..Config::default()
        }
    }

    fn repo(root: &Path, name: &str) {
        let repo = init_repo(&root.join("repos").join(name));
        commit_file(&repo, "a.txt", "1", 1_000, "Ada");
        let sha = commit_file(&repo, "b.txt", "2", 2_000, "Ada");
        fs::write(root.join("repos").join(name).join("HEAD_SHA"), sha.to_string()).unwrap();
    }

    #[test]
    fn mine_classifies_every_repository_independently() {
        let root = TempDir::new().unwrap();
        let config = config(root.path());
        for name in ["good-a", "corrupt-b", "broken-c", "good-d"] {
            repo(root.path(), name);
        }
        let pipeline = Pipeline::new(&config).unwrap();
        let report = pipeline.mine(false).unwrap();

        let names: Vec<_> = report.records.iter().map(|r| r.repository.as_str()).collect();
        assert_eq!(names, ["good-a", "good-d"]);
        assert_eq!(report.counters.succeeded, 2);
        assert_eq!(report.counters.failed, 2);
        // The failed run's partial output is removed so a rerun retries it.
        assert!(!config.miner_results_dir.join("broken-c.json").exists());
        assert!(config.miner_results_dir.join("corrupt-b.json").exists());
    }

    #[test]
    fn mine_reuses_existing_results_unless_forced() {
        let root = TempDir::new().unwrap();
        let mut config = config(root.path());
        repo(root.path(), "good-a");
        let pipeline = Pipeline::new(&config).unwrap();
        pipeline.mine(false).unwrap();

        // A miner that would fail proves the cached result was used.
        config.miner_executable = "false".into();
        let pipeline = Pipeline::new(&config).unwrap();
        assert_eq!(pipeline.mine(false).unwrap().counters.succeeded, 1);
        assert_eq!(pipeline.mine(true).unwrap().counters.failed, 1);
    }

    #[test]
    fn analyze_writes_reports_with_git_timings() {
        let root = TempDir::new().unwrap();
        let config = config(root.path());
        let repo_dir = root.path().join("repos/proj");
        let repo = init_repo(&repo_dir);
        let c1 = commit_file(&repo, "a.txt", "1", 1_000, "Ada");
        let c2 = commit_file(&repo, "a.txt", "2", 1_100, "Ada");
        let c3 = commit_file(&repo, "a.txt", "3", 1_400, "Ada");

        fs::create_dir_all(&config.miner_results_dir).unwrap();
        fs::write(
            config.miner_results_dir.join("proj.json"),
            format!(
                r#"{{"commits": [
                    {{"sha1": "{c3}", "refactorings": [{{"type": "Extract Method"}}]}},
                    {{"sha1": "{c2}", "refactorings": [{{"type": "Extract Method"}}, {{"type": "Rename Class"}}]}},
                    {{"sha1": "ffffffffffffffffffffffffffffffffffffffff", "refactorings": [{{"type": "Rename Class"}}]}},
                    {{"sha1": "{c1}", "refactorings": [{{"type": "Move Method"}}]}}
                ]}}"#
            ),
        )
        .unwrap();
        fs::write(config.miner_results_dir.join("empty.json"), "").unwrap();

        let pipeline = Pipeline::new(&config).unwrap();
        let report = pipeline.analyze(Lookup::Git).unwrap();
        assert_eq!(report.records.len(), 1);
        assert_eq!(report.counters.failed, 1);
        // Gaps of 300s and 100s; the unknown sha is dropped.
        assert_eq!(report.records[0].avg_inter_refactoring_time, Some(std::time::Duration::from_secs(200)));

        let dir = config.activity_dir();
        let json = fs::read_to_string(dir.join(aggregator::REPORT_FILE)).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed[0]["refactoring_types"][0]["type"], "Extract Method");
        assert_eq!(parsed[0]["refactoring_types"][1]["type"], "Rename Class");
        assert!(dir.join("repositories/proj.json").is_file());
        let tsv = fs::read_to_string(dir.join(aggregator::TABLE_FILE)).unwrap();
        assert!(tsv.contains("proj\tExtract Method\t2"));
    }

    #[test]
    fn clone_skips_present_repositories_and_cleans_failures() {
        let root = TempDir::new().unwrap();
        let config = config(root.path());
        let source = root.path().join("upstream/lib");
        let repo = init_repo(&source);
        commit_file(&repo, "a.txt", "1", 1_000, "Ada");
        fs::create_dir_all(config.repositories_dir.join("present")).unwrap();

        let urls = vec![
            source.to_string_lossy().into_owned(),
            root.path().join("upstream/missing").to_string_lossy().into_owned(),
            "file:///nowhere/present".to_string(),
        ];
        let pipeline = Pipeline::new(&config).unwrap();
        let report = pipeline.clone_repositories(&urls).unwrap();
        assert_eq!(report.counters.succeeded, 1);
        assert_eq!(report.counters.failed, 1);
        assert_eq!(report.counters.skipped, 1);
        assert_eq!(report.failures[0].repository, urls[1]);
        assert!(config.repositories_dir.join("lib/.git").exists());
        assert!(!config.repositories_dir.join("missing").exists());
    }

    #[test]
    fn same_named_sources_keep_the_first_clone() {
        let root = TempDir::new().unwrap();
        let mut config = config(root.path());
        config.concurrency = 1;
        let mut urls = Vec::new();
        for owner in ["a", "b"] {
            let source = root.path().join("upstream").join(owner).join("lib");
            let repo = init_repo(&source);
            commit_file(&repo, "owner.txt", owner, 1_000, "Ada");
            urls.push(source.to_string_lossy().into_owned());
        }
        urls.push(urls[0].clone());

        let pipeline = Pipeline::new(&config).unwrap();
        let report = pipeline.clone_repositories(&urls).unwrap();
        assert_eq!(report.counters.succeeded, 1);
        assert_eq!(report.counters.failed, 0);
        assert_eq!(report.counters.skipped, 2);
        assert!(report.skips.iter().all(|note| note.reason.contains("taken by an earlier entry")));
        let cloned = fs::read_to_string(config.repositories_dir.join("lib/owner.txt")).unwrap();
        assert_eq!(cloned, "a");
    }

    #[test]
    fn tloc_counts_a_missing_clone_as_failed() {
        let root = TempDir::new().unwrap();
        let config = config(root.path());
        fs::create_dir_all(&config.miner_results_dir).unwrap();
        fs::write(
            config.miner_results_dir.join("ghost.json"),
            r#"{"commits": [
                {"sha1": "b2", "refactorings": [{"type": "Move Class"}]},
                {"sha1": "a1", "refactorings": []}
            ]}"#,
        )
        .unwrap();
        fs::write(config.miner_results_dir.join("quiet.json"), r#"{"commits": [{"sha1": "a1", "refactorings": []}]}"#).unwrap();

        let pipeline = Pipeline::new(&config).unwrap();
        let report = pipeline.tloc().unwrap();
        assert_eq!(report.counters.failed, 1);
        assert_eq!(report.counters.skipped, 1);
        assert_eq!(report.failures[0].repository, "ghost");
        assert!(report.failures[0].reason.contains("failed to open repository"));
        assert!(!config.tloc_dir().join("ghost.json").exists());
    }

    #[test]
    fn commit_stats_cover_repositories_with_refactorings() {
        let root = TempDir::new().unwrap();
        let config = config(root.path());
        repo(root.path(), "good-a");
        repo(root.path(), "plain");
        let head = fs::read_to_string(root.path().join("repos/good-a/HEAD_SHA")).unwrap();
        fs::create_dir_all(&config.miner_results_dir).unwrap();
        fs::write(
            config.miner_results_dir.join("good-a.json"),
            format!(r#"{{"commits": [{{"sha1": "{head}", "refactorings": [{{"type": "Move Method"}}]}}]}}"#),
        )
        .unwrap();

        let pipeline = Pipeline::new(&config).unwrap();
        let report = pipeline.commit_stats().unwrap();
        assert_eq!(report.counters.succeeded, 1);
        assert_eq!(report.counters.skipped, 1);
        assert_eq!(report.skips[0].repository, "plain");

        let json = fs::read_to_string(config.commit_stats_dir().join("good-a.json")).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.as_array().map(Vec::len), Some(2));
        assert_eq!(parsed[1]["commit_hash"], head.as_str());
        assert_eq!(parsed[1]["modified_files"][0]["modified"], "b.txt");
    }

    #[test]
    fn jira_issues_are_fetched_once_per_matched_project() {
        let projects = r#"[{"key": "KAFKA", "name": "Kafka"}, {"key": "ASFSITE", "name": "Kafka Site"}]"#;
        let (base, count, _) = crate::http::test_server::serve(vec![
            (200, projects),
            (200, r#"{"issues": [{"id": "1"}], "total": 1}"#),
        ]);
        let root = TempDir::new().unwrap();
        let mut config = config(root.path());
        config.jira_base = base;
        config.timeouts.jira_page_pause_ms = 0;
        let list = root.path().join("ok_repos.txt");
        fs::write(
            &list,
            "git@github.com:apache/kafka.git\ngit@github.com:apache/kafka-site.git\ngit@github.com:apache/zookeeper.git\n",
        )
        .unwrap();

        let pipeline = Pipeline::new(&config).unwrap();
        let report = pipeline.jira_issues(&list).unwrap();
        assert_eq!(report.counters.succeeded, 1);
        assert_eq!(report.counters.skipped, 2);
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 2);

        let dest = config.issues_dir();
        assert!(dest.join("jira_issues/Kafka_issues.json").is_file());
        let matches: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dest.join("closest_matches.json")).unwrap()).unwrap();
        assert_eq!(matches["kafka site"]["closest_project_key"], "KAFKA");
        assert_eq!(matches["zookeeper"]["closest_project_key"], serde_json::Value::Null);
    }

    #[test]
    fn missing_csv_is_fatal_before_any_probe() {
        let root = TempDir::new().unwrap();
        let mut config = config(root.path());
        config.source_csv = root.path().join("absent.csv");
        let pipeline = Pipeline::new(&config).unwrap();
        assert!(matches!(pipeline.fetch(), Err(PipelineError::Csv { .. })));
    }
}
