// src/testing.rs

use git2::{Oid, Repository, Signature, Time};
use std::fs;
use std::path::Path;

/// Write `path` with `contents`, stage everything and commit at `seconds`
/// (UTC) as `name`. Returns the new commit id.
pub fn commit_file(repo: &Repository, path: &str, contents: &str, seconds: i64, name: &str) -> Oid {
    let workdir = repo.workdir().expect("non-bare repository");
    let full = workdir.join(path);
    if let Some(parent) = full.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(&full, contents).unwrap();

    let mut index = repo.index().unwrap();
    index.add_all(["*"], git2::IndexAddOption::DEFAULT, None).unwrap();
    index.write().unwrap();
    let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();

    let signature = Signature::new(name, &format!("{name}@example.com"), &Time::new(seconds, 0)).unwrap();
    let parents = match repo.head() {
        Ok(head) => vec![head.peel_to_commit().unwrap()],
        Err(_) => Vec::new(),
    };
    let parents: Vec<_> = parents.iter().collect();
    repo.commit(Some("HEAD"), &signature, &signature, path, &tree, &parents)
        .unwrap()
}

pub fn init_repo(dir: &Path) -> Repository {
    Repository::init(dir).unwrap()
}
