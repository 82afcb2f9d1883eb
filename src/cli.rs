// src/cli.rs

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::Config;

#[derive(Parser, Debug)]
#[command(author, version, about = "Clone, mine and summarize refactoring activity across many repositories", long_about = None)]
pub struct Args {
    /// Path to a TOML config file (default: ./refmine.toml if present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Maximum number of concurrent jobs (default: half the CPUs)
    #[arg(short = 'j', long, global = true)]
    pub concurrency: Option<usize>,

    /// Directory holding the cloned repositories
    #[arg(long, global = true)]
    pub repositories_dir: Option<PathBuf>,

    /// Directory receiving every report
    #[arg(long, global = true)]
    pub results_dir: Option<PathBuf>,

    /// Directory holding the mining tool's per-repository JSON files
    #[arg(long, global = true)]
    pub miner_results_dir: Option<PathBuf>,

    /// Path to the mining executable
    #[arg(long, global = true)]
    pub miner: Option<String>,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Derive repository URLs from the measures CSV and probe which exist
    Fetch,

    /// Clone every repository of a URL list
    Clone {
        /// URL list (default: <results>/repo_lists/ok_repos.txt)
        #[arg(long)]
        list: Option<PathBuf>,
    },

    /// Run the mining tool over every cloned repository
    Mine {
        /// Re-mine repositories that already have a result file
        #[arg(long)]
        force: bool,
    },

    /// Aggregate refactoring types and inter-refactoring times
    Analyze {
        /// Where commit timestamps come from
        #[arg(long, value_enum, default_value_t = Lookup::Git)]
        lookup: Lookup,
    },

    /// Touched lines of code per refactoring commit
    Tloc,

    /// Check issue tracking status and optionally download issues
    Issues {
        /// URL list (default: <results>/repo_lists/ok_repos.txt)
        #[arg(long)]
        list: Option<PathBuf>,

        /// Download every issue of repositories with issues enabled
        #[arg(long)]
        fetch: bool,

        /// Match repositories to JIRA projects by name and download their issues instead
        #[arg(long, conflicts_with = "fetch")]
        jira: bool,
    },

    /// Per-commit added and deleted lines for repositories with refactorings
    Commits,

    /// fetch, clone, mine and analyze in one go
    Run {
        /// Re-mine repositories that already have a result file
        #[arg(long)]
        force: bool,
    },
}

#[derive(clap::ValueEnum, Clone, Debug, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// Read the local clone's history
    Git,
    /// Ask the hosting API, one request per commit
    Api,
}

impl Args {
    /// Apply command-line overrides on top of the loaded configuration.
    pub fn apply(&self, config: &mut Config) {
        if let Some(n) = self.concurrency {
            config.concurrency = n;
        }
        if let Some(dir) = &self.repositories_dir {
            config.repositories_dir = dir.clone();
        }
        if let Some(dir) = &self.results_dir {
            config.results_dir = dir.clone();
        }
        if let Some(dir) = &self.miner_results_dir {
            config.miner_results_dir = dir.clone();
        }
        if let Some(miner) = &self.miner {
            config.miner_executable = miner.clone();
        }
    }

    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_win_over_config() {
        let args = Args::parse_from(["refmine", "-j", "3", "--miner", "/opt/rm/bin/RefactoringMiner", "mine", "--force"]);
        let mut config = Config::default();
        args.apply(&mut config);
        assert_eq!(config.concurrency(), 3);
        assert_eq!(config.miner_executable, "/opt/rm/bin/RefactoringMiner");
        assert!(matches!(args.command, Command::Mine { force: true }));
    }

    #[test]
    fn analyze_defaults_to_git_lookup() {
        let args = Args::parse_from(["refmine", "analyze"]);
        assert!(matches!(args.command, Command::Analyze { lookup: Lookup::Git }));
        let args = Args::parse_from(["refmine", "-vv", "analyze", "--lookup", "api"]);
        assert!(matches!(args.command, Command::Analyze { lookup: Lookup::Api }));
        assert_eq!(args.log_filter(), "trace");
    }

    #[test]
    fn jira_and_fetch_are_exclusive() {
        let args = Args::parse_from(["refmine", "issues", "--jira"]);
        assert!(matches!(args.command, Command::Issues { jira: true, fetch: false, .. }));
        assert!(Args::try_parse_from(["refmine", "issues", "--jira", "--fetch"]).is_err());
    }
}
