use serde::Serialize;

use super::{GitError, GitWorktree};

/// Line counts of the worktree against its base commit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiffStats {
    pub added: usize,
    pub removed: usize,
    pub content: String,
}

impl DiffStats {
    pub fn is_empty(&self) -> bool {
        self.added == 0 && self.removed == 0
    }

    fn from_patch(content: String) -> Self {
        let mut added = 0;
        let mut removed = 0;
        for line in content.lines() {
            if line.starts_with('+') && !line.starts_with("+++") {
                added += 1;
            } else if line.starts_with('-') && !line.starts_with("---") {
                removed += 1;
            }
        }
        Self {
            added,
            removed,
            content,
        }
    }
}

impl GitWorktree {
    /// Diff the worktree (untracked files included) against the base
    /// commit. [`GitError::BaseCommitUnset`] and [`GitError::WorktreeGone`]
    /// are expected while an instance is loading or paused.
    pub fn diff(&self) -> Result<DiffStats, GitError> {
        let base = self.base_commit_sha().ok_or(GitError::BaseCommitUnset)?.to_string();
        if !self.worktree_path().exists() {
            return Err(GitError::WorktreeGone(self.worktree_path().to_path_buf()));
        }

        // Intent-to-add so new files show up in the diff
        self.in_worktree(&["add", "-N", "."])?;
        let patch = self.in_worktree(&["--no-pager", "diff", &base])?;
        Ok(DiffStats::from_patch(patch))
    }
}
