use std::path::{Component, Path};

use serde::Serialize;

use super::{delete_branch, git, GitError, WORKTREES_DIR};
use crate::cmd::Executor;
use crate::errors::collect_errors;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorktreeInfo {
    pub path: String,
    pub branch: String,
    pub head: String,
    pub is_bare: bool,
}

/// Parse `git worktree list --porcelain`.
pub fn parse_worktree_list(output: &str) -> Result<Vec<WorktreeInfo>, GitError> {
    let mut worktrees = Vec::new();
    let mut current: Option<WorktreeInfo> = None;

    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            worktrees.extend(current.take());
            continue;
        }

        if let Some(path) = line.strip_prefix("worktree ") {
            worktrees.extend(current.take());
            current = Some(WorktreeInfo {
                path: path.to_string(),
                ..Default::default()
            });
            continue;
        }

        let entry = current
            .as_mut()
            .ok_or_else(|| GitError::Parse(line.to_string()))?;

        if let Some(head) = line.strip_prefix("HEAD ") {
            entry.head = head.to_string();
        } else if let Some(branch) = line.strip_prefix("branch ") {
            entry.branch = branch
                .strip_prefix("refs/heads/")
                .unwrap_or(branch)
                .to_string();
        } else if line == "bare" {
            entry.is_bare = true;
        }
    }
    worktrees.extend(current.take());

    if worktrees.iter().any(|w| w.path.is_empty()) {
        return Err(GitError::Parse("missing worktree path".to_string()));
    }
    Ok(worktrees)
}

fn is_managed_path(path: &Path) -> bool {
    path.components()
        .any(|c| matches!(c, Component::Normal(name) if name == WORKTREES_DIR))
}

/// Remove every worktree under `<repo>/.worktrees/` together with its
/// branch, then prune. Keeps going past individual failures.
pub fn cleanup_worktrees(exec: &dyn Executor, repo_path: &Path) -> Result<Vec<String>, GitError> {
    let out = git(exec, repo_path, &["worktree", "list", "--porcelain"])?;
    let mut removed = Vec::new();
    let mut errors = Vec::new();

    for wt in parse_worktree_list(&out)? {
        let path = Path::new(&wt.path);
        if !is_managed_path(path) {
            continue;
        }

        tracing::info!("Removing worktree {}", wt.path);
        if git(exec, repo_path, &["worktree", "remove", "-f", &wt.path]).is_err() && path.exists() {
            if let Err(e) = std::fs::remove_dir_all(path) {
                errors.push(GitError::Io(e));
            }
        }
        if !wt.branch.is_empty() {
            if let Err(e) = delete_branch(exec, repo_path, &wt.branch) {
                errors.push(e);
            }
        }
        removed.push(wt.path);
    }

    // Directories git no longer tracks
    let dir = repo_path.join(WORKTREES_DIR);
    if let Ok(entries) = std::fs::read_dir(&dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                match std::fs::remove_dir_all(&path) {
                    Ok(()) => removed.push(path.to_string_lossy().to_string()),
                    Err(e) => errors.push(GitError::Io(e)),
                }
            }
        }
    }

    if let Err(e) = git(exec, repo_path, &["worktree", "prune"]) {
        errors.push(e);
    }

    collect_errors(errors)?;
    Ok(removed)
}
