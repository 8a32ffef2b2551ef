use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Local, Utc};
use parking_lot::Mutex;

use super::{AgentType, Backend, InstanceError, LoadingProgress, Status};
use crate::errors::collect_errors;
use crate::git::{current_branch, DiffStats, GitError, GitWorktree};
use crate::procstat::ResourceUsage;
use crate::tmux::program::{ProgramFamily, WaveIdentity};
use crate::tmux::{sanitize_name, PermissionChoice, ProgressFn, TmuxSession};

const FIRST_START_STAGES: u32 = 8;
const RELOAD_STAGES: u32 = 6;

/// What to undo when the tmux session fails to come up on a fresh worktree.
#[derive(Clone, Copy)]
enum Rollback {
    /// Remove the worktree and delete its branch.
    Cleanup,
    /// Remove the worktree but keep the caller's branch.
    KeepBranch,
}

#[derive(Debug, Clone, Default)]
pub struct InstanceOptions {
    pub title: String,
    pub path: PathBuf,
    pub program: String,
    pub agent_type: AgentType,
    pub skip_permissions: bool,
    pub auto_yes: bool,
    pub plan_file: Option<String>,
    pub wave: Option<WaveIdentity>,
    /// Sent once the agent is up.
    pub prompt: Option<String>,
}

pub struct Instance {
    pub(super) title: String,
    pub(super) path: PathBuf,
    pub(super) branch: String,
    pub(super) status: Status,
    pub(super) program: String,
    pub(super) agent_type: AgentType,
    pub(super) skip_permissions: bool,
    pub(super) auto_yes: bool,
    pub(super) task_number: u32,
    pub(super) wave_number: u32,
    pub(super) peer_count: u32,
    pub(super) plan_file: Option<String>,
    pub(super) implementation_complete: bool,
    pub(super) queued_prompt: Option<String>,
    pub(super) created_at: DateTime<Utc>,
    pub(super) updated_at: DateTime<Utc>,
    pub(super) started: bool,
    pub(super) tmux_stopped: bool,
    pub(super) shared_worktree: bool,
    pub(super) tmux: Option<Arc<TmuxSession>>,
    pub(super) worktree: Option<GitWorktree>,
    pub(super) cached_content: Option<String>,
    pub(super) diff_stats: Option<DiffStats>,
    pub(super) resources: Option<ResourceUsage>,
    pub(super) progress: Arc<Mutex<LoadingProgress>>,
    pub(super) backend: Backend,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("title", &self.title)
            .field("status", &self.status)
            .field("branch", &self.branch)
            .field("started", &self.started)
            .finish_non_exhaustive()
    }
}

impl Instance {
    pub fn new(opts: InstanceOptions, backend: Backend) -> Result<Self, InstanceError> {
        let title = opts.title.trim().to_string();
        if title.is_empty() {
            return Err(InstanceError::EmptyTitle);
        }
        let program = opts.program.trim().to_string();
        if program.is_empty() {
            return Err(InstanceError::EmptyProgram);
        }

        let path = if opts.path.is_absolute() {
            opts.path
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(&opts.path))
                .unwrap_or(opts.path)
        };

        let wave = opts.wave.unwrap_or(WaveIdentity {
            task: 0,
            wave: 0,
            peers: 0,
        });
        let now = Utc::now();

        Ok(Self {
            title,
            path,
            branch: String::new(),
            status: Status::Loading,
            program,
            agent_type: opts.agent_type,
            skip_permissions: opts.skip_permissions,
            auto_yes: opts.auto_yes,
            task_number: wave.task,
            wave_number: wave.wave,
            peer_count: wave.peers,
            plan_file: opts.plan_file.filter(|p| !p.is_empty()),
            implementation_complete: false,
            queued_prompt: opts.prompt.filter(|p| !p.is_empty()),
            created_at: now,
            updated_at: now,
            started: false,
            tmux_stopped: false,
            shared_worktree: false,
            tmux: None,
            worktree: None,
            cached_content: None,
            diff_stats: None,
            resources: None,
            progress: Arc::new(Mutex::new(LoadingProgress::default())),
            backend,
        })
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn agent_type(&self) -> AgentType {
        self.agent_type
    }

    pub fn plan_file(&self) -> Option<&str> {
        self.plan_file.as_deref()
    }

    pub fn started(&self) -> bool {
        self.started
    }

    /// Session closed by `stop_tmux`.
    pub fn is_stopped(&self) -> bool {
        self.tmux_stopped
    }

    pub fn is_paused(&self) -> bool {
        self.status == Status::Paused
    }

    pub fn shared_worktree(&self) -> bool {
        self.shared_worktree
    }

    pub fn worktree(&self) -> Option<&GitWorktree> {
        self.worktree.as_ref()
    }

    pub fn tmux_session(&self) -> Option<&Arc<TmuxSession>> {
        self.tmux.as_ref()
    }

    /// The tmux name this instance uses (or will use).
    pub fn session_name(&self) -> String {
        self.tmux
            .as_ref()
            .map(|t| t.name().to_string())
            .unwrap_or_else(|| sanitize_name(&self.title))
    }

    pub fn cached_content(&self) -> Option<&str> {
        self.cached_content.as_deref()
    }

    pub fn diff_stats(&self) -> Option<&DiffStats> {
        self.diff_stats.as_ref()
    }

    pub fn resources(&self) -> Option<ResourceUsage> {
        self.resources
    }

    pub fn loading_progress(&self) -> LoadingProgress {
        self.progress.lock().clone()
    }

    pub fn queued_prompt(&self) -> Option<&str> {
        self.queued_prompt.as_deref()
    }

    pub fn set_queued_prompt(&mut self, prompt: Option<String>) {
        self.queued_prompt = prompt.filter(|p| !p.is_empty());
    }

    pub fn auto_yes(&self) -> bool {
        self.auto_yes
    }

    pub fn set_auto_yes(&mut self, auto_yes: bool) {
        self.auto_yes = auto_yes;
        self.touch();
    }

    pub fn implementation_complete(&self) -> bool {
        self.implementation_complete
    }

    pub fn set_implementation_complete(&mut self, complete: bool) {
        self.implementation_complete = complete;
        self.touch();
    }

    /// Wave identity, when this instance is one task of a parallel wave.
    pub fn wave(&self) -> Option<WaveIdentity> {
        (self.task_number > 0 && self.wave_number > 0).then_some(WaveIdentity {
            task: self.task_number,
            wave: self.wave_number,
            peers: self.peer_count,
        })
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn repo_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    pub(super) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// The worktree this instance may destroy.
    fn owned_worktree(&self) -> Option<&GitWorktree> {
        if self.shared_worktree {
            None
        } else {
            self.worktree.as_ref()
        }
    }

    fn work_dir(&self) -> PathBuf {
        self.worktree
            .as_ref()
            .map(|w| w.worktree_path().to_path_buf())
            .unwrap_or_else(|| self.path.clone())
    }

    fn begin_loading(&mut self, total: u32) {
        self.status = Status::Loading;
        self.progress.lock().reset(total);
        self.advance("Preparing session");
    }

    fn advance(&self, stage: &str) {
        self.progress.lock().advance(stage);
    }

    fn progress_fn(&self) -> ProgressFn {
        let progress = self.progress.clone();
        Arc::new(move |stage: &str| progress.lock().advance(stage))
    }

    fn new_tmux(&self, name: Option<String>, initial_prompt: Option<String>) -> TmuxSession {
        let executor = self.backend.executor.clone();
        let pty = self.backend.pty.clone();
        let session = match name {
            Some(name) => TmuxSession::with_raw_name(name, &self.program, executor, pty),
            None => TmuxSession::new(&self.title, &self.program, executor, pty),
        };
        session
            .skip_permissions(self.skip_permissions)
            .agent_type(self.agent_type.as_flag())
            .initial_prompt(initial_prompt)
            .wave(self.wave())
            .timings(self.backend.timings.clone())
            .progress(self.progress_fn())
    }

    /// Build the session for a start. The queued prompt moves onto the
    /// command line only for programs that accept one there.
    fn build_tmux(&mut self) -> Arc<TmuxSession> {
        let prompt = if ProgramFamily::detect(&self.program).supports_cli_prompt() {
            self.queued_prompt.take()
        } else {
            None
        };
        Arc::new(self.new_tmux(None, prompt))
    }

    fn require_tmux(&self) -> Result<&Arc<TmuxSession>, InstanceError> {
        self.tmux
            .as_ref()
            .filter(|_| self.started)
            .ok_or_else(|| InstanceError::NotStarted(self.title.clone()))
    }

    /// Fresh coder/reviewer start on a new worktree (`first_time_setup`),
    /// or reattach after a reload.
    pub fn start(&mut self, first_time_setup: bool) -> Result<(), InstanceError> {
        if self.title.is_empty() {
            return Err(InstanceError::EmptyTitle);
        }
        self.begin_loading(if first_time_setup {
            FIRST_START_STAGES
        } else {
            RELOAD_STAGES
        });

        let tmux = self.build_tmux();
        self.tmux = Some(tmux.clone());

        let result = if first_time_setup {
            self.create_worktree()
                .and_then(|_| self.setup_and_start(&tmux, Rollback::Cleanup))
        } else {
            self.advance("Restoring session");
            tmux.restore().map_err(InstanceError::from)
        };
        self.finish_start(result)
    }

    /// Planner start: no worktree, the agent runs in the repository root.
    pub fn start_on_main_branch(&mut self) -> Result<(), InstanceError> {
        self.begin_loading(RELOAD_STAGES);
        let tmux = self.build_tmux();
        self.tmux = Some(tmux.clone());
        self.worktree = None;
        self.shared_worktree = false;

        if self.branch.is_empty() {
            match current_branch(self.backend.executor.as_ref(), &self.path) {
                Ok(branch) => self.branch = branch,
                Err(e) => tracing::warn!("Could not resolve branch of {:?}: {}", self.path, e),
            }
        }

        let result = tmux.start(&self.path).map_err(InstanceError::from);
        self.finish_start(result)
    }

    /// Start on `branch`, reusing it if it exists.
    pub fn start_on_branch(&mut self, branch: &str) -> Result<(), InstanceError> {
        self.begin_loading(FIRST_START_STAGES);
        let tmux = self.build_tmux();
        self.tmux = Some(tmux.clone());

        let result = GitWorktree::on_branch(
            self.backend.executor.clone(),
            &self.path,
            &self.title,
            branch,
        )
        .map_err(InstanceError::from)
        .and_then(|worktree| {
            self.branch = worktree.branch_name().to_string();
            self.worktree = Some(worktree);
            self.shared_worktree = false;
            self.setup_and_start(&tmux, Rollback::KeepBranch)
        });
        self.finish_start(result)
    }

    /// Join a worktree owned by a peer group. This instance never removes it.
    pub fn start_in_shared_worktree(
        &mut self,
        worktree: GitWorktree,
        branch: &str,
    ) -> Result<(), InstanceError> {
        self.begin_loading(RELOAD_STAGES);
        let tmux = self.build_tmux();
        self.tmux = Some(tmux.clone());

        let dir = worktree.worktree_path().to_path_buf();
        self.worktree = Some(worktree);
        self.branch = branch.to_string();
        self.shared_worktree = true;

        let result = tmux.start(&dir).map_err(InstanceError::from);
        self.finish_start(result)
    }

    /// Attach an unstarted session handle so a loaded instance keeps a
    /// session binding while it waits for `resume`.
    pub(super) fn bind_detached_session(&mut self) {
        if self.tmux.is_none() {
            self.tmux = Some(Arc::new(self.new_tmux(None, None)));
        }
        self.started = true;
    }

    /// Bind to a surviving session by its exact tmux name.
    pub fn adopt_orphan_tmux_session(&mut self, session_name: &str) -> Result<(), InstanceError> {
        let tmux = Arc::new(self.new_tmux(Some(session_name.to_string()), None));
        tmux.restore()?;

        tracing::info!("Adopted tmux session {} as {}", session_name, self.title);
        self.tmux = Some(tmux);
        self.started = true;
        self.tmux_stopped = false;
        self.status = Status::Ready;
        self.progress.lock().finish();
        self.touch();
        Ok(())
    }

    fn create_worktree(&mut self) -> Result<(), InstanceError> {
        self.advance("Creating git worktree");
        let (worktree, branch) =
            GitWorktree::new(self.backend.executor.clone(), &self.path, &self.title)?;
        self.worktree = Some(worktree);
        self.branch = branch;
        self.shared_worktree = false;
        Ok(())
    }

    fn setup_and_start(&mut self, tmux: &TmuxSession, rollback: Rollback) -> Result<(), InstanceError> {
        self.advance("Setting up git worktree");
        let worktree = self
            .worktree
            .as_mut()
            .ok_or_else(|| InstanceError::NotStarted(self.title.clone()))?;
        worktree.setup()?;

        let dir = worktree.worktree_path().to_path_buf();
        let Err(e) = tmux.start(&dir) else {
            return Ok(());
        };

        let err = InstanceError::from(e);
        let undo = match rollback {
            Rollback::Cleanup => worktree.cleanup(),
            Rollback::KeepBranch => worktree.remove().and_then(|_| worktree.prune()),
        };
        match undo {
            Ok(()) => Err(err),
            Err(undo_err) => Err(InstanceError::Multiple(vec![err, undo_err.into()])),
        }
    }

    fn finish_start(&mut self, result: Result<(), InstanceError>) -> Result<(), InstanceError> {
        match result {
            Ok(()) => {
                self.started = true;
                self.tmux_stopped = false;
                self.status = Status::Running;
                self.progress.lock().finish();
                self.touch();
                tracing::info!("Started instance {} on branch {}", self.title, self.branch);
                Ok(())
            }
            Err(err) => {
                let err = match self.kill() {
                    Ok(()) => err,
                    Err(kill_err) => InstanceError::Multiple(vec![err, kill_err]),
                };
                tracing::error!("Failed to start instance {}: {}", self.title, err);
                Err(InstanceError::Start {
                    title: self.title.clone(),
                    source: Box::new(err),
                })
            }
        }
    }

    /// Commit work in progress, detach and drop the worktree. The branch
    /// keeps everything needed to resume.
    pub fn pause(&mut self) -> Result<(), InstanceError> {
        if !self.started {
            return Err(InstanceError::NotStarted(self.title.clone()));
        }
        if self.status == Status::Paused {
            return Err(InstanceError::AlreadyPaused(self.title.clone()));
        }

        if let Some(worktree) = self.owned_worktree() {
            if worktree.worktree_path().exists() {
                // Never tear down a worktree whose changes didn't make it into a commit
                let committed = worktree.is_dirty().and_then(|dirty| {
                    if !dirty {
                        return Ok(());
                    }
                    let message = format!(
                        "[kas] update from '{}' on {} (paused)",
                        self.title,
                        Local::now().format("%Y-%m-%d %H:%M:%S")
                    );
                    worktree.commit_changes(&message)
                });
                committed?;
            }
        }

        if let Some(ref tmux) = self.tmux {
            if let Err(e) = tmux.detach() {
                tracing::warn!("Failed to detach from {}: {}", tmux.name(), e);
            }
        }

        if let Some(worktree) = self.owned_worktree() {
            if worktree.worktree_path().exists() {
                worktree.remove()?;
                worktree.prune()?;
            }
        }

        self.status = Status::Paused;
        self.touch();
        tracing::info!("Paused instance {}", self.title);

        if let Err(e) = self.backend.clipboard.copy(&self.branch) {
            tracing::debug!("Could not copy branch name to clipboard: {}", e);
        }
        Ok(())
    }

    /// Recreate the worktree and reattach (or restart) the agent.
    /// A failed restart removes the checkout but keeps the branch, which
    /// holds the commit made on pause.
    pub fn resume(&mut self) -> Result<(), InstanceError> {
        if !self.started {
            return Err(InstanceError::NotStarted(self.title.clone()));
        }
        if self.status != Status::Paused {
            return Err(InstanceError::NotPaused(self.title.clone()));
        }

        if !self.shared_worktree {
            if let Some(worktree) = self.worktree.as_mut() {
                if worktree.is_branch_checked_out()? {
                    return Err(GitError::BranchCheckedOut(worktree.branch_name().to_string()).into());
                }
                worktree.setup()?;
            }
        }

        let dir = self.work_dir();
        let restored = match self.tmux.as_ref().filter(|t| t.does_session_exist()) {
            Some(tmux) => match tmux.restore() {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!("Failed to restore {}, starting a new session: {}", tmux.name(), e);
                    false
                }
            },
            None => false,
        };

        if !restored {
            let tmux = self.build_tmux();
            if let Err(e) = tmux.start(&dir) {
                let err = InstanceError::from(e);
                // The branch holds the paused commits; only drop the checkout
                let undo = self
                    .owned_worktree()
                    .map(|w| w.remove().and_then(|_| w.prune()))
                    .unwrap_or(Ok(()));
                return Err(match undo {
                    Ok(()) => err,
                    Err(undo_err) => InstanceError::Multiple(vec![err, undo_err.into()]),
                });
            }
            self.tmux = Some(tmux);
        }

        self.tmux_stopped = false;
        self.status = Status::Running;
        self.touch();
        tracing::info!("Resumed instance {}", self.title);
        Ok(())
    }

    /// Close the session and, unless shared, destroy the worktree and
    /// branch. Does nothing for an instance that never started.
    pub fn kill(&mut self) -> Result<(), InstanceError> {
        if !self.started {
            return Ok(());
        }

        let mut errors: Vec<InstanceError> = Vec::new();
        if let Some(ref tmux) = self.tmux {
            if let Err(e) = tmux.close() {
                errors.push(e.into());
            }
        }
        if let Some(worktree) = self.owned_worktree() {
            if let Err(e) = worktree.cleanup() {
                errors.push(e.into());
            }
        }

        tracing::info!("Killed instance {}", self.title);
        collect_errors(errors)
    }

    /// Close the tmux session only. Worktree and model entry stay, and
    /// metadata collection stops until the next start or resume.
    pub fn stop_tmux(&mut self) -> Result<(), InstanceError> {
        self.tmux_stopped = true;
        match self.tmux {
            Some(ref tmux) => tmux.close().map_err(InstanceError::from),
            None => Ok(()),
        }
    }

    /// Type a prompt and submit it.
    pub fn send_prompt(&self, prompt: &str) -> Result<(), InstanceError> {
        let tmux = self.require_tmux()?;
        tmux.send_keys(prompt)?;
        tmux.tap_enter()?;
        Ok(())
    }

    pub fn send_keys(&self, keys: &str) -> Result<(), InstanceError> {
        Ok(self.require_tmux()?.send_keys(keys)?)
    }

    pub fn tap_enter(&self) -> Result<(), InstanceError> {
        Ok(self.require_tmux()?.tap_enter()?)
    }

    pub fn send_permission_response(&self, choice: PermissionChoice) -> Result<(), InstanceError> {
        Ok(self.require_tmux()?.send_permission_response(choice)?)
    }

    /// Visible pane content; empty while paused or not started.
    pub fn preview(&self) -> Result<String, InstanceError> {
        if !self.started || self.is_paused() {
            return Ok(String::new());
        }
        Ok(self.require_tmux()?.capture_pane_content()?)
    }

    /// The whole scrollback.
    pub fn preview_full_history(&self) -> Result<String, InstanceError> {
        if !self.started || self.is_paused() {
            return Ok(String::new());
        }
        Ok(self.require_tmux()?.capture_pane_content_with_options("-", "-")?)
    }

    pub fn set_preview_size(&self, cols: u16, rows: u16) -> Result<(), InstanceError> {
        Ok(self.require_tmux()?.set_size(cols, rows)?)
    }

    /// Forward raw keystrokes to the attached client.
    pub fn write_input(&self, data: &[u8]) -> Result<(), InstanceError> {
        Ok(self.require_tmux()?.write_input(data)?)
    }
}
