//! One detached tmux session hosting an agent program.
//!
//! The session's sanitized name is the only identity ever handed to tmux.
//! Creation runs `new-session` inside a throwaway PTY, then attaches a
//! second PTY that stays open so the host can resize and type into it.

pub mod discovery;
pub mod monitor;
pub mod program;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;

use crate::cmd::{CmdError, CommandSpec, Executor};
use crate::errors::{collect_errors, format_joined, Joinable};
use crate::pty::{PtyError, PtyFactory, PtyHandle, PtySize};

use monitor::{strip_ansi, StatusMonitor};
use program::{build_launch_command, Acknowledge, LaunchOptions, ProgramFamily, WaveIdentity, MANAGED_ENV};

/// Prefix carried by every session this crate creates.
pub const SESSION_PREFIX: &str = "kas_";

/// Prefixes used by earlier releases; still swept by cleanup.
pub const LEGACY_PREFIXES: [&str; 2] = ["klique_", "claudesquad_"];

const HISTORY_LIMIT: &str = "10000";

#[derive(Debug, Error)]
pub enum TmuxError {
    #[error("tmux {op} failed for {session}: {source}")]
    Command {
        op: &'static str,
        session: String,
        #[source]
        source: CmdError,
    },
    #[error("PTY error for {session}: {source}")]
    Pty {
        session: String,
        #[source]
        source: PtyError,
    },
    #[error("timed out waiting for tmux session {0} to start")]
    StartTimeout(String),
    #[error("failed to write prompt file: {0}")]
    PromptFile(#[source] std::io::Error),
    #[error("failed to remove prompt file {path}: {source}")]
    PromptCleanup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("tmux session {0} is not attached")]
    NotAttached(String),
    #[error("unexpected tmux output: {0}")]
    Parse(String),
    #[error("{}", format_joined(.0))]
    Multiple(Vec<TmuxError>),
}

impl Joinable for TmuxError {
    fn joined(errors: Vec<Self>) -> Self {
        TmuxError::Multiple(errors)
    }
}

/// Turn a title into a tmux-safe session name.
pub fn sanitize_name(title: &str) -> String {
    let collapsed: String = title.chars().filter(|c| !c.is_whitespace()).collect();
    format!("{}{}", SESSION_PREFIX, collapsed.replace('.', "_"))
}

/// Polling schedule for session creation and program start-up.
#[derive(Debug, Clone)]
pub struct TmuxTimings {
    pub exist_initial: Duration,
    pub exist_max: Duration,
    pub exist_deadline: Duration,
    pub ready_initial: Duration,
    pub ready_max: Duration,
    pub ready_growth: f64,
    /// Overrides the per-family ready deadline when set.
    pub ready_deadline: Option<Duration>,
    pub permission_confirm: Duration,
}

impl Default for TmuxTimings {
    fn default() -> Self {
        Self {
            exist_initial: Duration::from_millis(5),
            exist_max: Duration::from_millis(50),
            exist_deadline: Duration::from_secs(2),
            ready_initial: Duration::from_millis(100),
            ready_max: Duration::from_secs(1),
            ready_growth: 1.2,
            ready_deadline: None,
            permission_confirm: Duration::from_millis(300),
        }
    }
}

/// Reports a loading stage; wired to the owning instance's progress bar.
pub type ProgressFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Answer to an opencode permission dialog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionChoice {
    AllowOnce,
    AllowAlways,
    Reject,
}

/// Result of one metadata tick's capture.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PaneUpdate {
    pub updated: bool,
    pub has_prompt: bool,
    pub content: String,
    pub captured: bool,
}

pub struct TmuxSession {
    name: String,
    program: String,
    family: ProgramFamily,
    skip_permissions: bool,
    agent_type: Option<String>,
    initial_prompt: Option<String>,
    wave: Option<WaveIdentity>,
    executor: Arc<dyn Executor>,
    pty_factory: Arc<dyn PtyFactory>,
    timings: TmuxTimings,
    progress: Option<ProgressFn>,
    pty: Mutex<Option<Box<dyn PtyHandle>>>,
    size: Mutex<PtySize>,
    monitor: Mutex<StatusMonitor>,
    prompt_file: Mutex<Option<PathBuf>>,
}

impl std::fmt::Debug for TmuxSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TmuxSession")
            .field("name", &self.name)
            .field("program", &self.program)
            .finish_non_exhaustive()
    }
}

impl TmuxSession {
    pub fn new(
        title: &str,
        program: &str,
        executor: Arc<dyn Executor>,
        pty_factory: Arc<dyn PtyFactory>,
    ) -> Self {
        Self::with_raw_name(sanitize_name(title), program, executor, pty_factory)
    }

    /// Bind to a session by its exact tmux name (orphan adoption).
    pub fn with_raw_name(
        name: String,
        program: &str,
        executor: Arc<dyn Executor>,
        pty_factory: Arc<dyn PtyFactory>,
    ) -> Self {
        Self {
            name,
            program: program.to_string(),
            family: ProgramFamily::detect(program),
            skip_permissions: false,
            agent_type: None,
            initial_prompt: None,
            wave: None,
            executor,
            pty_factory,
            timings: TmuxTimings::default(),
            progress: None,
            pty: Mutex::new(None),
            size: Mutex::new(PtySize::default()),
            monitor: Mutex::new(StatusMonitor::new()),
            prompt_file: Mutex::new(None),
        }
    }

    pub fn skip_permissions(mut self, skip: bool) -> Self {
        self.skip_permissions = skip;
        self
    }

    pub fn agent_type(mut self, agent: Option<&str>) -> Self {
        self.agent_type = agent.filter(|a| !a.is_empty()).map(str::to_string);
        self
    }

    pub fn initial_prompt(mut self, prompt: Option<String>) -> Self {
        self.initial_prompt = prompt.filter(|p| !p.is_empty());
        self
    }

    pub fn wave(mut self, wave: Option<WaveIdentity>) -> Self {
        self.wave = wave;
        self
    }

    pub fn timings(mut self, timings: TmuxTimings) -> Self {
        self.timings = timings;
        self
    }

    pub fn progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn family(&self) -> ProgramFamily {
        self.family
    }

    pub fn has_initial_prompt(&self) -> bool {
        self.initial_prompt.is_some()
    }

    pub fn prompt_file(&self) -> Option<PathBuf> {
        self.prompt_file.lock().clone()
    }

    pub fn is_attached(&self) -> bool {
        self.pty.lock().is_some()
    }

    fn report(&self, stage: &str) {
        if let Some(ref progress) = self.progress {
            progress(stage);
        }
    }

    fn tmux(&self, op: &'static str, args: &[&str]) -> Result<(), TmuxError> {
        let spec = CommandSpec::tmux().args(args.iter().copied());
        self.executor.run(&spec).map_err(|source| TmuxError::Command {
            op,
            session: self.name.clone(),
            source,
        })
    }

    fn tmux_output(&self, op: &'static str, args: &[&str]) -> Result<String, TmuxError> {
        let spec = CommandSpec::tmux().args(args.iter().copied());
        let out = self.executor.output(&spec).map_err(|source| TmuxError::Command {
            op,
            session: self.name.clone(),
            source,
        })?;
        Ok(String::from_utf8_lossy(&out).to_string())
    }

    fn pty_err(&self, source: PtyError) -> TmuxError {
        TmuxError::Pty {
            session: self.name.clone(),
            source,
        }
    }

    pub fn does_session_exist(&self) -> bool {
        let target = format!("-t={}", self.name);
        self.executor
            .run(&CommandSpec::tmux().args(["has-session", target.as_str()]))
            .is_ok()
    }

    /// Create the session (or reattach to a surviving one) and wait for
    /// the program inside it to come up.
    pub fn start(&self, work_dir: &Path) -> Result<(), TmuxError> {
        if self.does_session_exist() {
            tracing::info!("tmux session {} already exists, reattaching", self.name);
            return self.restore();
        }

        self.report("Creating tmux session");
        let launch = build_launch_command(
            &LaunchOptions {
                program: &self.program,
                skip_permissions: self.skip_permissions,
                agent_type: self.agent_type.as_deref(),
                initial_prompt: self.initial_prompt.as_deref(),
                wave: self.wave,
            },
            work_dir,
        )
        .map_err(TmuxError::PromptFile)?;
        *self.prompt_file.lock() = launch.prompt_file;

        let dir = work_dir.to_string_lossy().to_string();
        let spec = CommandSpec::tmux().args([
            "new-session",
            "-d",
            "-s",
            self.name.as_str(),
            "-c",
            dir.as_str(),
            launch.command_line.as_str(),
        ]);
        tracing::info!("Starting tmux session {} in {}", self.name, dir);

        let size = *self.size.lock();
        let mut spawn_pty = match self.pty_factory.start(&spec, size) {
            Ok(handle) => handle,
            Err(e) => {
                let err = self.pty_err(e);
                return Err(self.fold_close(err));
            }
        };

        self.report("Waiting for tmux session");
        if !self.wait_for_session() {
            let _ = spawn_pty.close();
            let err = TmuxError::StartTimeout(self.name.clone());
            return Err(self.fold_close(err));
        }

        if let Err(e) = spawn_pty.close() {
            tracing::warn!("Failed to close spawn PTY for {}: {}", self.name, e);
        }

        self.report("Configuring tmux session");
        let configured = self
            .tmux("set-option", &["set-option", "-t", &self.name, "history-limit", HISTORY_LIMIT])
            .and_then(|_| self.tmux("set-option", &["set-option", "-t", &self.name, "mouse", "on"]))
            .and_then(|_| {
                self.tmux(
                    "set-environment",
                    &["set-environment", "-t", &self.name, MANAGED_ENV, "1"],
                )
            });
        if let Err(e) = configured {
            return Err(self.fold_close(e));
        }

        self.report("Attaching to tmux session");
        if let Err(e) = self.restore() {
            return Err(self.fold_close(e));
        }

        self.report("Waiting for program to start");
        self.wait_for_program()
    }

    fn fold_close(&self, err: TmuxError) -> TmuxError {
        match self.close() {
            Ok(()) => err,
            Err(close_err) => TmuxError::Multiple(vec![err, close_err]),
        }
    }

    fn wait_for_session(&self) -> bool {
        let deadline = Instant::now() + self.timings.exist_deadline;
        let mut delay = self.timings.exist_initial;
        loop {
            if self.does_session_exist() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(delay);
            delay = (delay * 2).min(self.timings.exist_max);
        }
    }

    fn ready_acknowledgement(&self, content: &str) -> Option<Acknowledge> {
        let markers = self.family.ready_markers();
        if markers.is_empty() {
            // opencode has no splash: any content without the busy hint
            return (!content.trim().is_empty() && self.family.has_prompt(content))
                .then_some(Acknowledge::None);
        }
        markers
            .iter()
            .find(|(marker, _)| content.contains(marker))
            .map(|(_, ack)| *ack)
    }

    fn wait_for_program(&self) -> Result<(), TmuxError> {
        if !self.family.waits_for_ready() {
            return Ok(());
        }

        let timeout = self
            .timings
            .ready_deadline
            .unwrap_or_else(|| self.family.ready_timeout());
        let deadline = Instant::now() + timeout;
        let mut delay = self.timings.ready_initial;

        loop {
            if let Ok(content) = self.capture_pane_content() {
                if let Some(ack) = self.ready_acknowledgement(&strip_ansi(&content)) {
                    tracing::debug!("{} is ready ({:?})", self.name, ack);
                    return match ack {
                        Acknowledge::None => Ok(()),
                        Acknowledge::Enter => self.tap_enter(),
                        Acknowledge::DAndEnter => self.tap_d_and_enter(),
                    };
                }
            }

            if Instant::now() >= deadline {
                tracing::warn!(
                    "{} did not show a ready marker within {:?}, continuing",
                    self.name,
                    timeout
                );
                return Ok(());
            }
            std::thread::sleep(delay);
            delay = delay.mul_f64(self.timings.ready_growth).min(self.timings.ready_max);
        }
    }

    /// Attach a fresh PTY to the existing session and reset the monitor.
    pub fn restore(&self) -> Result<(), TmuxError> {
        let spec = CommandSpec::tmux().args(["attach-session", "-t", self.name.as_str()]);
        let size = *self.size.lock();
        let handle = self.pty_factory.start(&spec, size).map_err(|e| self.pty_err(e))?;

        if let Some(mut old) = self.pty.lock().replace(handle) {
            let _ = old.close();
        }
        *self.monitor.lock() = StatusMonitor::new();
        Ok(())
    }

    /// Drop the attached client but leave the session and its scrollback.
    pub fn detach(&self) -> Result<(), TmuxError> {
        let old = self.pty.lock().take();
        *self.monitor.lock() = StatusMonitor::new();
        match old {
            Some(mut handle) => handle.close().map_err(|e| self.pty_err(e)),
            None => Ok(()),
        }
    }

    /// Close the PTY, kill the session and remove the prompt scratch file.
    /// Every step runs; failures are joined.
    pub fn close(&self) -> Result<(), TmuxError> {
        let mut errors = Vec::new();

        if let Some(mut handle) = self.pty.lock().take() {
            if let Err(e) = handle.close() {
                errors.push(self.pty_err(e));
            }
        }

        if let Err(e) = self.tmux("kill-session", &["kill-session", "-t", &self.name]) {
            // Already gone is what we wanted
            if self.does_session_exist() {
                errors.push(e);
            }
        }

        if let Some(path) = self.prompt_file.lock().take() {
            if let Err(source) = std::fs::remove_file(&path) {
                if source.kind() != std::io::ErrorKind::NotFound {
                    errors.push(TmuxError::PromptCleanup { path, source });
                }
            }
        }

        collect_errors(errors)
    }

    pub fn tap_enter(&self) -> Result<(), TmuxError> {
        self.tmux("send-keys", &["send-keys", "-t", &self.name, "Enter"])
    }

    pub fn tap_right(&self) -> Result<(), TmuxError> {
        self.tmux("send-keys", &["send-keys", "-t", &self.name, "Right"])
    }

    pub fn tap_d_and_enter(&self) -> Result<(), TmuxError> {
        self.tmux("send-keys", &["send-keys", "-t", &self.name, "D", "Enter"])
    }

    /// Type `text` literally; key names inside it are not interpreted.
    pub fn send_keys(&self, text: &str) -> Result<(), TmuxError> {
        self.tmux("send-keys", &["send-keys", "-l", "-t", &self.name, text])
    }

    pub fn send_permission_response(&self, choice: PermissionChoice) -> Result<(), TmuxError> {
        match choice {
            PermissionChoice::AllowOnce => self.tap_enter(),
            PermissionChoice::AllowAlways => {
                self.tap_right()?;
                self.tap_enter()?;
                // "Always" opens a second confirmation dialog
                std::thread::sleep(self.timings.permission_confirm);
                self.tap_enter()
            }
            PermissionChoice::Reject => {
                self.tap_right()?;
                self.tap_right()?;
                self.tap_enter()
            }
        }
    }

    pub fn capture_pane_content(&self) -> Result<String, TmuxError> {
        self.tmux_output(
            "capture-pane",
            &["capture-pane", "-p", "-e", "-J", "-t", &self.name],
        )
    }

    /// Capture a line range; `"-"` for both reads the whole scrollback.
    pub fn capture_pane_content_with_options(
        &self,
        start: &str,
        end: &str,
    ) -> Result<String, TmuxError> {
        self.tmux_output(
            "capture-pane",
            &["capture-pane", "-p", "-e", "-J", "-S", start, "-E", end, "-t", &self.name],
        )
    }

    pub fn has_updated(&self) -> (bool, bool) {
        let update = self.has_updated_with_content();
        (update.updated, update.has_prompt)
    }

    /// One capture feeding the idle detector; the content is returned so
    /// callers don't capture twice.
    pub fn has_updated_with_content(&self) -> PaneUpdate {
        match self.capture_pane_content() {
            Ok(content) => {
                let (updated, has_prompt) = self.monitor.lock().observe(&content, self.family);
                PaneUpdate {
                    updated,
                    has_prompt,
                    content,
                    captured: true,
                }
            }
            Err(e) => {
                self.monitor.lock().record_failure(&self.name, &e);
                PaneUpdate::default()
            }
        }
    }

    pub fn pane_pid(&self) -> Result<u32, TmuxError> {
        let out = self.tmux_output(
            "display-message",
            &["display-message", "-p", "-t", &self.name, "#{pane_pid}"],
        )?;
        out.trim()
            .parse()
            .map_err(|_| TmuxError::Parse(format!("pane pid {:?}", out.trim())))
    }

    /// Resize the attached client. Remembered for later attaches.
    pub fn set_size(&self, cols: u16, rows: u16) -> Result<(), TmuxError> {
        let size = PtySize { cols, rows };
        *self.size.lock() = size;
        match self.pty.lock().as_mut() {
            Some(handle) => handle.resize(size).map_err(|e| self.pty_err(e)),
            None => Ok(()),
        }
    }

    /// Forward raw keystrokes to the attached client.
    pub fn write_input(&self, data: &[u8]) -> Result<(), TmuxError> {
        let mut guard = self.pty.lock();
        let handle = guard
            .as_mut()
            .ok_or_else(|| TmuxError::NotAttached(self.name.clone()))?;
        handle.write(data).map_err(|e| self.pty_err(e))
    }
}
