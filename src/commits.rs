// src/commits.rs

use git2::{DiffOptions, Oid, Patch, Repository, Sort};
use std::path::Path;

use crate::model::{CommitChanges, FileChange};

/// Line statistics for every commit reachable from HEAD, oldest first.
/// Each commit is diffed against its first parent; root commits against the empty tree.
pub fn commit_changes(repo_dir: &Path) -> Result<Vec<CommitChanges>, git2::Error> {
    let repo = Repository::open(repo_dir)?;
    let mut revwalk = repo.revwalk()?;
    revwalk.push_head()?;
    revwalk.set_sorting(Sort::TOPOLOGICAL | Sort::TIME | Sort::REVERSE)?;

    let mut changes = Vec::new();
    for oid in revwalk {
        changes.push(changes_for(&repo, oid?)?);
    }
    Ok(changes)
}

fn changes_for(repo: &Repository, oid: Oid) -> Result<CommitChanges, git2::Error> {
    let commit = repo.find_commit(oid)?;
    let parent = commit.parents().next();
    let parent_tree = parent.as_ref().map(|p| p.tree()).transpose()?;
    let tree = commit.tree()?;

    let mut opts = DiffOptions::new();
    opts.ignore_filemode(true);
    let diff = repo.diff_tree_to_tree(parent_tree.as_ref(), Some(&tree), Some(&mut opts))?;
    let stats = diff.stats()?;

    let mut files = Vec::new();
    for (index, delta) in diff.deltas().enumerate() {
        let modified = delta
            .new_file()
            .path()
            .or_else(|| delta.old_file().path())
            .and_then(Path::file_name)
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        // Binary files have no patch.
        let (added_lines, deleted_lines) = match Patch::from_diff(&diff, index)? {
            Some(patch) => {
                let (_, added, deleted) = patch.line_stats()?;
                (added, deleted)
            }
            None => (0, 0),
        };
        files.push(FileChange {
            modified,
            added_lines,
            deleted_lines,
        });
    }

    Ok(CommitChanges {
        commit_hash: oid.to_string(),
        previous_commit_hash: parent.map(|p| p.id().to_string()),
        added_lines: stats.insertions(),
        deleted_lines: stats.deletions(),
        modified_files: files,
    })
}
