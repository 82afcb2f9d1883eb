// src/main.rs

mod aggregator;
mod classifier;
mod cli;
mod commits;
mod config;
mod correlator;
mod error;
mod http;
mod jira;
mod model;
mod pipeline;
mod runner;
mod scheduler;
mod sources;
#[cfg(test)]
mod testing;
mod tloc;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Args, Command};
use config::Config;
use pipeline::Pipeline;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(args.log_filter())),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let start_time = Instant::now();
    let mut config = Config::load(args.config.as_deref(), std::env::var(config::TOKEN_ENV).ok())
        .context("failed to load configuration")?;
    args.apply(&mut config);

    let pipeline = Pipeline::new(&config).context("failed to set up pipeline")?;
    let default_list = || config.repo_lists_dir().join("ok_repos.txt");

    match args.command {
        Command::Fetch => {
            let ok = pipeline.fetch().context("fetch failed")?;
            println!("{} repositories available.", ok.len());
        }
        Command::Clone { list } => {
            let list = list.unwrap_or_else(default_list);
            let urls = sources::read_list(&list).context("failed to read repository list")?;
            pipeline.clone_repositories(&urls).context("clone failed")?;
        }
        Command::Mine { force } => {
            pipeline.mine(force).context("mining failed")?;
        }
        Command::Analyze { lookup } => {
            pipeline.analyze(lookup).context("analysis failed")?;
            println!("Results are in {}", config.activity_dir().display());
        }
        Command::Tloc => {
            pipeline.tloc().context("touched-lines calculation failed")?;
        }
        Command::Commits => {
            pipeline.commit_stats().context("commit statistics failed")?;
            println!("Results are in {}", config.commit_stats_dir().display());
        }
        Command::Issues { list, fetch, jira } => {
            let list = list.unwrap_or_else(default_list);
            if jira {
                pipeline.jira_issues(&list).context("JIRA issue collection failed")?;
            } else {
                pipeline.issues(&list, fetch).context("issue collection failed")?;
            }
            println!("Results are in {}", config.issues_dir().display());
        }
        Command::Run { force } => {
            pipeline.run(force).context("pipeline failed")?;
        }
    }

    println!("Total time: {:.2?}", start_time.elapsed());
    Ok(())
}
