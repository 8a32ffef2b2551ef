//! Branches and worktrees shared by every instance working one plan.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;

use super::{branch_exists, delete_branch, git, sanitize_branch_name, worktree_path_for, GitError};
use crate::cmd::Executor;

pub const PLAN_BRANCH_PREFIX: &str = "plan/";

/// Where plan documents live, relative to the repository root.
pub const PLANS_DIR: &str = "docs/plans";

/// Registry tracking each plan's workflow state.
pub const PLAN_STATE_FILE: &str = "plan-state.json";

static DATE_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}-").expect("Invalid plan date prefix regex"));

/// `2026-01-05-auth-flow.md` -> `auth-flow`.
pub fn plan_slug(plan_file: &str) -> String {
    let name = Path::new(plan_file)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let name = DATE_PREFIX.replace(&name, "");
    sanitize_branch_name(&name).replace('/', "-")
}

pub fn plan_branch_from_file(plan_file: &str) -> String {
    format!("{}{}", PLAN_BRANCH_PREFIX, plan_slug(plan_file))
}

/// `<repo>/.worktrees/plan-<slug>`.
pub fn plan_worktree_path(repo_path: &Path, branch: &str) -> PathBuf {
    worktree_path_for(repo_path, branch)
}

/// Create `branch` off HEAD unless it already exists.
pub fn ensure_plan_branch(exec: &dyn Executor, repo_path: &Path, branch: &str) -> Result<(), GitError> {
    if branch_exists(exec, repo_path, branch)? {
        return Ok(());
    }
    tracing::info!("Creating plan branch {}", branch);
    git(exec, repo_path, &["branch", branch]).map(|_| ())
}

/// Throw away a plan's worktree and branch and start the branch again
/// from HEAD.
pub fn reset_plan_branch(exec: &dyn Executor, repo_path: &Path, branch: &str) -> Result<(), GitError> {
    let path = plan_worktree_path(repo_path, branch);
    let path_arg = path.to_string_lossy().to_string();

    if let Err(e) = git(exec, repo_path, &["worktree", "remove", "-f", &path_arg]) {
        tracing::debug!("No plan worktree to remove at {}: {}", path_arg, e);
    }
    if branch_exists(exec, repo_path, branch)? {
        delete_branch(exec, repo_path, branch)?;
    }
    git(exec, repo_path, &["branch", branch])?;
    git(exec, repo_path, &["worktree", "prune"])?;

    tracing::info!("Reset plan branch {}", branch);
    Ok(())
}

/// Commit the plan document and the state registry on the main checkout.
/// "Nothing to commit" counts as success.
pub fn commit_plan_scaffold_on_main(
    exec: &dyn Executor,
    repo_path: &Path,
    plan_file: &str,
) -> Result<(), GitError> {
    let mut paths = vec![format!("{}/{}", PLANS_DIR, plan_file)];
    let registry = format!("{}/{}", PLANS_DIR, PLAN_STATE_FILE);
    if repo_path.join(&registry).exists() {
        paths.push(registry);
    }

    let mut args = vec!["add", "--"];
    args.extend(paths.iter().map(String::as_str));
    git(exec, repo_path, &args)?;

    let message = format!("feat(plan): add {}", plan_file);
    match git(exec, repo_path, &["commit", "-m", &message]) {
        Ok(_) => Ok(()),
        Err(GitError::Command(e)) if e.stderr().contains("nothing to commit") => Ok(()),
        Err(e) => Err(e),
    }
}
