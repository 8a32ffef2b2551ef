//! Isolated git worktrees, one branch each, under `<repo>/.worktrees/`.

mod cleanup;
mod diff;
pub mod plan;

pub use cleanup::{cleanup_worktrees, parse_worktree_list, WorktreeInfo};
pub use diff::DiffStats;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cmd::{CmdError, CommandSpec, Executor};
use crate::errors::{collect_errors, format_joined, Joinable};

/// Directory under the repository root that holds every worktree.
pub const WORKTREES_DIR: &str = ".worktrees";

#[derive(Debug, Error)]
pub enum GitError {
    #[error(transparent)]
    Command(#[from] CmdError),
    #[error("base commit SHA not set")]
    BaseCommitUnset,
    #[error("worktree path gone: {}", .0.display())]
    WorktreeGone(PathBuf),
    #[error("branch {0} is already checked out in another worktree")]
    BranchCheckedOut(String),
    #[error("cannot derive a branch name from {0:?}")]
    InvalidBranch(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unexpected git worktree output: {0}")]
    Parse(String),
    #[error("{}", format_joined(.0))]
    Multiple(Vec<GitError>),
}

impl GitError {
    /// Conditions a metadata tick skips silently.
    pub fn is_transient(&self) -> bool {
        matches!(self, GitError::BaseCommitUnset | GitError::WorktreeGone(_))
    }
}

impl Joinable for GitError {
    fn joined(errors: Vec<Self>) -> Self {
        GitError::Multiple(errors)
    }
}

/// Lowercase, dash-separated branch name. Keeps `/` so callers can
/// namespace branches.
pub fn sanitize_branch_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.trim().to_lowercase().chars() {
        let c = if c.is_whitespace() { '-' } else { c };
        if !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '/' | '.')) {
            continue;
        }
        if c == '-' && out.ends_with('-') {
            continue;
        }
        out.push(c);
    }
    out.trim_matches(|c| c == '-' || c == '/' || c == '.').to_string()
}

/// `<repo>/.worktrees/<branch with '/' replaced by '-'>`.
pub fn worktree_path_for(repo_path: &Path, branch: &str) -> PathBuf {
    repo_path.join(WORKTREES_DIR).join(branch.replace('/', "-"))
}

pub(crate) fn git(exec: &dyn Executor, dir: &Path, args: &[&str]) -> Result<String, GitError> {
    let out = exec.output(&CommandSpec::git(dir).args(args.iter().copied()))?;
    Ok(String::from_utf8_lossy(&out).to_string())
}

/// `rev-parse --verify`; a failed lookup means "no such branch".
pub(crate) fn branch_exists(
    exec: &dyn Executor,
    repo: &Path,
    branch: &str,
) -> Result<bool, GitError> {
    match git(exec, repo, &["rev-parse", "--verify", "--quiet", branch]) {
        Ok(_) => Ok(true),
        Err(GitError::Command(CmdError::Failed { .. })) => Ok(false),
        Err(e) => Err(e),
    }
}

pub(crate) fn delete_branch(exec: &dyn Executor, repo: &Path, branch: &str) -> Result<(), GitError> {
    git(exec, repo, &["branch", "-D", branch]).map(|_| ())
}

/// Branch checked out in `repo`'s main working tree.
pub fn current_branch(exec: &dyn Executor, repo: &Path) -> Result<String, GitError> {
    Ok(git(exec, repo, &["rev-parse", "--abbrev-ref", "HEAD"])?.trim().to_string())
}

/// Persisted form of a worktree binding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorktreeData {
    pub repo_path: PathBuf,
    pub worktree_path: PathBuf,
    pub session_name: String,
    pub branch_name: String,
    pub base_commit_sha: String,
}

#[derive(Clone)]
pub struct GitWorktree {
    executor: Arc<dyn Executor>,
    repo_path: PathBuf,
    worktree_path: PathBuf,
    session_name: String,
    branch_name: String,
    base_commit_sha: Option<String>,
}

impl std::fmt::Debug for GitWorktree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitWorktree")
            .field("repo_path", &self.repo_path)
            .field("worktree_path", &self.worktree_path)
            .field("branch_name", &self.branch_name)
            .field("base_commit_sha", &self.base_commit_sha)
            .finish()
    }
}

impl GitWorktree {
    /// A worktree on a branch derived from `title`. Nothing touches disk
    /// until [`GitWorktree::setup`].
    pub fn new(
        executor: Arc<dyn Executor>,
        repo_path: &Path,
        title: &str,
    ) -> Result<(Self, String), GitError> {
        let branch = sanitize_branch_name(title);
        if branch.is_empty() {
            return Err(GitError::InvalidBranch(title.to_string()));
        }
        let worktree = Self::on_branch(executor, repo_path, title, &branch)?;
        Ok((worktree, branch))
    }

    /// A worktree pinned to an explicit branch.
    pub fn on_branch(
        executor: Arc<dyn Executor>,
        repo_path: &Path,
        title: &str,
        branch: &str,
    ) -> Result<Self, GitError> {
        let branch = branch.trim();
        if branch.is_empty() || branch.starts_with('-') || branch.contains("..") {
            return Err(GitError::InvalidBranch(branch.to_string()));
        }
        Ok(Self {
            executor,
            repo_path: repo_path.to_path_buf(),
            worktree_path: worktree_path_for(repo_path, branch),
            session_name: title.to_string(),
            branch_name: branch.to_string(),
            base_commit_sha: None,
        })
    }

    /// The one worktree every instance working on `plan_file` shares.
    pub fn for_plan(
        executor: Arc<dyn Executor>,
        repo_path: &Path,
        plan_file: &str,
    ) -> Result<Self, GitError> {
        let branch = plan::plan_branch_from_file(plan_file);
        if branch == plan::PLAN_BRANCH_PREFIX {
            return Err(GitError::InvalidBranch(plan_file.to_string()));
        }
        Self::on_branch(executor, repo_path, plan_file, &branch)
    }

    pub fn from_data(executor: Arc<dyn Executor>, data: &WorktreeData) -> Self {
        Self {
            executor,
            repo_path: data.repo_path.clone(),
            worktree_path: data.worktree_path.clone(),
            session_name: data.session_name.clone(),
            branch_name: data.branch_name.clone(),
            base_commit_sha: Some(data.base_commit_sha.clone()).filter(|s| !s.is_empty()),
        }
    }

    pub fn to_data(&self) -> WorktreeData {
        WorktreeData {
            repo_path: self.repo_path.clone(),
            worktree_path: self.worktree_path.clone(),
            session_name: self.session_name.clone(),
            branch_name: self.branch_name.clone(),
            base_commit_sha: self.base_commit_sha.clone().unwrap_or_default(),
        }
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    pub fn worktree_path(&self) -> &Path {
        &self.worktree_path
    }

    pub fn branch_name(&self) -> &str {
        &self.branch_name
    }

    pub fn base_commit_sha(&self) -> Option<&str> {
        self.base_commit_sha.as_deref()
    }

    pub fn repo_name(&self) -> String {
        self.repo_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    fn in_repo(&self, args: &[&str]) -> Result<String, GitError> {
        git(self.executor.as_ref(), &self.repo_path, args)
    }

    fn in_worktree(&self, args: &[&str]) -> Result<String, GitError> {
        git(self.executor.as_ref(), &self.worktree_path, args)
    }

    fn path_arg(&self) -> String {
        self.worktree_path.to_string_lossy().to_string()
    }

    /// Materialize the worktree and record the base commit diffs compare
    /// against.
    pub fn setup(&mut self) -> Result<(), GitError> {
        let worktrees_dir = self.repo_path.join(WORKTREES_DIR);

        let (dir_result, exists_result) = std::thread::scope(|s| {
            let dir = s.spawn(|| std::fs::create_dir_all(&worktrees_dir));
            let exists = s.spawn(|| {
                branch_exists(self.executor.as_ref(), &self.repo_path, &self.branch_name)
            });
            (dir.join(), exists.join())
        });
        let panicked = || std::io::Error::new(std::io::ErrorKind::Other, "setup worker panicked");
        dir_result.unwrap_or_else(|_| Err(panicked()))?;
        let exists = exists_result.unwrap_or_else(|_| Err(GitError::Io(panicked())))?;

        let path = self.path_arg();
        // A stale registration at the same path blocks `worktree add`
        let _ = self.in_repo(&["worktree", "remove", "-f", &path]);

        let base = if exists {
            tracing::info!("Creating worktree for existing branch {}", self.branch_name);
            self.in_repo(&["worktree", "add", &path, &self.branch_name])?;
            match self.in_repo(&["merge-base", "HEAD", &self.branch_name]) {
                Ok(sha) => sha,
                Err(_) => self.in_repo(&["rev-parse", &self.branch_name])?,
            }
        } else {
            tracing::info!("Creating worktree on new branch {}", self.branch_name);
            let head = self.in_repo(&["rev-parse", "HEAD"])?;
            let head = head.trim();
            self.in_repo(&["worktree", "add", "-b", &self.branch_name, &path, head])?;
            head.to_string()
        };

        self.base_commit_sha = Some(base.trim().to_string());
        Ok(())
    }

    pub fn is_dirty(&self) -> Result<bool, GitError> {
        Ok(!self.in_worktree(&["status", "--porcelain"])?.trim().is_empty())
    }

    /// Stage everything and commit locally, skipping hooks.
    pub fn commit_changes(&self, message: &str) -> Result<(), GitError> {
        self.in_worktree(&["add", "-A"])?;
        self.in_worktree(&["commit", "-m", message, "--no-verify"])?;
        Ok(())
    }

    /// Whether any worktree (including the main checkout) has this branch.
    pub fn is_branch_checked_out(&self) -> Result<bool, GitError> {
        let out = self.in_repo(&["worktree", "list", "--porcelain"])?;
        Ok(parse_worktree_list(&out)?
            .iter()
            .any(|w| w.branch == self.branch_name))
    }

    /// Force-remove the worktree; the branch stays.
    pub fn remove(&self) -> Result<(), GitError> {
        self.in_repo(&["worktree", "remove", "-f", &self.path_arg()])
            .map(|_| ())
    }

    pub fn prune(&self) -> Result<(), GitError> {
        self.in_repo(&["worktree", "prune"]).map(|_| ())
    }

    /// Remove the worktree, delete its branch and prune. Every step runs.
    pub fn cleanup(&self) -> Result<(), GitError> {
        let mut errors = Vec::new();

        if self.worktree_path.exists() {
            if let Err(e) = self.remove() {
                errors.push(e);
            }
        }
        match branch_exists(self.executor.as_ref(), &self.repo_path, &self.branch_name) {
            Ok(true) => {
                if let Err(e) = delete_branch(self.executor.as_ref(), &self.repo_path, &self.branch_name) {
                    errors.push(e);
                }
            }
            Ok(false) => {}
            Err(e) => errors.push(e),
        }
        if let Err(e) = self.prune() {
            errors.push(e);
        }

        collect_errors(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::SystemExecutor;
    use crate::test_utils::{init_repo, run_git};
    use tempfile::TempDir;

    fn exec() -> Arc<dyn Executor> {
        Arc::new(SystemExecutor)
    }

    #[test]
    fn test_sanitize_branch_name() {
        assert_eq!(sanitize_branch_name("coder-42"), "coder-42");
        assert_eq!(sanitize_branch_name("Fix The  Bug!"), "fix-the-bug");
        assert_eq!(sanitize_branch_name("feature/Auth flow"), "feature/auth-flow");
        assert_eq!(sanitize_branch_name("  --x--  "), "x");
        assert_eq!(sanitize_branch_name("!!!"), "");
    }

    #[test]
    fn test_new_derives_branch_and_path() {
        let (wt, branch) = GitWorktree::new(exec(), Path::new("/r"), "coder-42").unwrap();
        assert_eq!(branch, "coder-42");
        assert_eq!(wt.worktree_path(), Path::new("/r/.worktrees/coder-42"));
        assert!(wt.base_commit_sha().is_none());

        assert!(matches!(
            GitWorktree::new(exec(), Path::new("/r"), "???"),
            Err(GitError::InvalidBranch(_))
        ));
    }

    #[test]
    fn test_setup_on_new_branch_uses_head() {
        let repo = TempDir::new().unwrap();
        init_repo(repo.path());
        let head = run_git(repo.path(), &["rev-parse", "HEAD"]);

        let (mut wt, _) = GitWorktree::new(exec(), repo.path(), "fresh").unwrap();
        wt.setup().unwrap();

        assert!(wt.worktree_path().join("README.md").exists());
        assert_eq!(wt.base_commit_sha(), Some(head.as_str()));
        assert!(wt.is_branch_checked_out().unwrap());
        assert_eq!(current_branch(&SystemExecutor, repo.path()).unwrap(), "main");
    }

    #[test]
    fn test_setup_on_existing_branch_uses_merge_base() {
        let repo = TempDir::new().unwrap();
        init_repo(repo.path());
        let fork = run_git(repo.path(), &["rev-parse", "HEAD"]);

        run_git(repo.path(), &["checkout", "-q", "-b", "topic"]);
        std::fs::write(repo.path().join("topic.txt"), "t\n").unwrap();
        run_git(repo.path(), &["add", "topic.txt"]);
        run_git(repo.path(), &["commit", "-q", "-m", "topic"]);
        run_git(repo.path(), &["checkout", "-q", "main"]);
        std::fs::write(repo.path().join("main.txt"), "m\n").unwrap();
        run_git(repo.path(), &["add", "main.txt"]);
        run_git(repo.path(), &["commit", "-q", "-m", "main"]);

        let mut wt = GitWorktree::on_branch(exec(), repo.path(), "topic", "topic").unwrap();
        wt.setup().unwrap();

        assert_eq!(wt.base_commit_sha(), Some(fork.as_str()));
        assert!(wt.worktree_path().join("topic.txt").exists());
    }

    #[test]
    fn test_setup_on_unrelated_branch_uses_branch_head() {
        let repo = TempDir::new().unwrap();
        init_repo(repo.path());

        // No common ancestor with main, so merge-base fails
        run_git(repo.path(), &["checkout", "-q", "--orphan", "detached-history"]);
        run_git(repo.path(), &["commit", "-q", "-m", "unrelated root"]);
        run_git(repo.path(), &["checkout", "-q", "main"]);
        let tip = run_git(repo.path(), &["rev-parse", "detached-history"]);

        let mut wt =
            GitWorktree::on_branch(exec(), repo.path(), "detached-history", "detached-history").unwrap();
        wt.setup().unwrap();

        assert_eq!(wt.base_commit_sha(), Some(tip.as_str()));
        assert!(wt.worktree_path().join("README.md").exists());
    }

    #[test]
    fn test_dirty_commit_and_diff() {
        let repo = TempDir::new().unwrap();
        init_repo(repo.path());
        let (mut wt, _) = GitWorktree::new(exec(), repo.path(), "work").unwrap();
        wt.setup().unwrap();

        assert!(!wt.is_dirty().unwrap());
        std::fs::write(wt.worktree_path().join("new.txt"), "a\nb\n").unwrap();
        std::fs::write(wt.worktree_path().join("README.md"), "# changed\n").unwrap();
        assert!(wt.is_dirty().unwrap());

        let stats = wt.diff().unwrap();
        assert_eq!(stats.added, 3);
        assert_eq!(stats.removed, 1);
        assert!(stats.content.contains("new.txt"));

        wt.commit_changes("wip").unwrap();
        assert!(!wt.is_dirty().unwrap());
        // Committed work still counts against the base
        assert_eq!(wt.diff().unwrap().added, 3);
    }

    #[test]
    fn test_diff_transient_conditions() {
        let (wt, _) = GitWorktree::new(exec(), Path::new("/nonexistent"), "x").unwrap();
        let err = wt.diff().unwrap_err();
        assert!(matches!(err, GitError::BaseCommitUnset));
        assert!(err.is_transient());

        let mut data = wt.to_data();
        data.base_commit_sha = "abc123".into();
        let wt = GitWorktree::from_data(exec(), &data);
        let err = wt.diff().unwrap_err();
        assert!(matches!(err, GitError::WorktreeGone(_)));
        assert!(err.is_transient());
    }

    #[test]
    fn test_remove_keeps_branch_and_cleanup_deletes_it() {
        let repo = TempDir::new().unwrap();
        init_repo(repo.path());
        let (mut wt, branch) = GitWorktree::new(exec(), repo.path(), "gone soon").unwrap();
        wt.setup().unwrap();

        wt.remove().unwrap();
        wt.prune().unwrap();
        assert!(!wt.worktree_path().exists());
        assert!(branch_exists(&SystemExecutor, repo.path(), &branch).unwrap());
        assert!(!wt.is_branch_checked_out().unwrap());

        wt.setup().unwrap();
        wt.cleanup().unwrap();
        assert!(!wt.worktree_path().exists());
        assert!(!branch_exists(&SystemExecutor, repo.path(), &branch).unwrap());
    }

    #[test]
    fn test_worktree_data_roundtrip() {
        let data = WorktreeData {
            repo_path: "/r".into(),
            worktree_path: "/r/.worktrees/a".into(),
            session_name: "a".into(),
            branch_name: "a".into(),
            base_commit_sha: "deadbeef".into(),
        };
        let json = serde_json::to_string(&data).unwrap();
        assert!(json.contains("\"base_commit_sha\":\"deadbeef\""));
        let wt = GitWorktree::from_data(exec(), &serde_json::from_str(&json).unwrap());
        assert_eq!(wt.to_data(), data);
    }
}
