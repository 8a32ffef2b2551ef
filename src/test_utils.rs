//! In-process stand-in for the tmux server and process table.
//!
//! `git` commands go to the real binary so worktree code runs against a
//! real repository in a temp dir.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::io::{Cursor, Read};
use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::clipboard::Clipboard;
use crate::cmd::{CmdError, CommandSpec, Executor, SystemExecutor};
use crate::procstat::TmuxProcessInspector;
use crate::pty::{PtyError, PtyFactory, PtyHandle, PtySize};
use crate::session::Backend;
use crate::tmux::TmuxTimings;

#[derive(Default)]
struct FakeState {
    sessions: BTreeSet<String>,
    calls: Vec<String>,
    pty_calls: Vec<String>,
    captures: VecDeque<String>,
    capture_fails: bool,
    spawn_fails: bool,
    kill_fails: BTreeSet<String>,
    vanish_on_kill: bool,
    no_server: bool,
    pane_pid: Option<u32>,
    children: HashMap<u32, u32>,
    ps_output: Option<String>,
    pty_input: Vec<u8>,
    last_resize: Option<PtySize>,
}

#[derive(Default)]
pub(crate) struct FakeTmux {
    state: Arc<Mutex<FakeState>>,
}

fn failed(spec: &CommandSpec, stderr: &str) -> CmdError {
    CmdError::Failed {
        command: spec.to_string(),
        status: Some(1),
        stderr: stderr.to_string(),
    }
}

fn flag_value<'a>(spec: &'a CommandSpec, flag: &str) -> Option<&'a str> {
    spec.args
        .iter()
        .position(|a| a == flag)
        .and_then(|i| spec.args.get(i + 1))
        .map(String::as_str)
}

impl FakeTmux {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_session(&self, name: &str) {
        self.state.lock().sessions.insert(name.to_string());
    }

    pub fn remove_session(&self, name: &str) {
        self.state.lock().sessions.remove(name);
    }

    pub fn sessions(&self) -> Vec<String> {
        self.state.lock().sessions.iter().cloned().collect()
    }

    /// Successive capture-pane results; the last one repeats.
    pub fn queue_captures<I, S>(&self, captures: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state
            .lock()
            .captures
            .extend(captures.into_iter().map(Into::into));
    }

    pub fn set_capture_fails(&self, fails: bool) {
        self.state.lock().capture_fails = fails;
    }

    /// `new-session` runs but the session never shows up.
    pub fn set_session_spawn_fails(&self, fails: bool) {
        self.state.lock().spawn_fails = fails;
    }

    /// `kill-session` on `name` fails and the session stays.
    pub fn set_kill_fails(&self, name: &str) {
        self.state.lock().kill_fails.insert(name.to_string());
    }

    /// A failing kill still takes the session down, as when it exits on
    /// its own mid-kill.
    pub fn set_vanish_on_kill(&self, vanish: bool) {
        self.state.lock().vanish_on_kill = vanish;
    }

    pub fn set_no_server(&self, no_server: bool) {
        self.state.lock().no_server = no_server;
    }

    pub fn set_pane_pid(&self, pid: u32) {
        self.state.lock().pane_pid = Some(pid);
    }

    pub fn set_child(&self, parent: u32, child: u32) {
        self.state.lock().children.insert(parent, child);
    }

    pub fn set_ps_output(&self, out: &str) {
        self.state.lock().ps_output = Some(out.to_string());
    }

    /// Executor calls (everything except git), formatted as command lines.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    /// Commands started inside a PTY.
    pub fn pty_calls(&self) -> Vec<String> {
        self.state.lock().pty_calls.clone()
    }

    pub fn has_call(&self, call: &str) -> bool {
        self.state.lock().calls.iter().any(|c| c == call)
    }

    pub fn has_call_prefix(&self, prefix: &str) -> bool {
        self.state.lock().calls.iter().any(|c| c.starts_with(prefix))
    }

    pub fn pty_input(&self) -> Vec<u8> {
        self.state.lock().pty_input.clone()
    }

    pub fn last_resize(&self) -> Option<PtySize> {
        self.state.lock().last_resize
    }

    fn tmux(&self, spec: &CommandSpec) -> Result<Vec<u8>, CmdError> {
        let mut state = self.state.lock();
        let target = flag_value(spec, "-t").unwrap_or("").to_string();

        match spec.subcommand().unwrap_or("") {
            "has-session" => {
                let name = spec.args.get(1).and_then(|a| a.strip_prefix("-t=")).unwrap_or("");
                if state.sessions.contains(name) {
                    Ok(Vec::new())
                } else {
                    Err(failed(spec, &format!("can't find session: {}", name)))
                }
            }
            "kill-session" => {
                if state.kill_fails.contains(&target) {
                    if state.vanish_on_kill {
                        state.sessions.remove(&target);
                    }
                    return Err(failed(spec, "server exited unexpectedly"));
                }
                if state.sessions.remove(&target) {
                    Ok(Vec::new())
                } else {
                    Err(failed(spec, &format!("can't find session: {}", target)))
                }
            }
            "capture-pane" => {
                if state.capture_fails {
                    return Err(failed(spec, "can't find pane"));
                }
                let content = if state.captures.len() > 1 {
                    state.captures.pop_front().unwrap_or_default()
                } else {
                    state.captures.front().cloned().unwrap_or_default()
                };
                Ok(content.into_bytes())
            }
            "display-message" => match state.pane_pid {
                Some(pid) => Ok(format!("{}\n", pid).into_bytes()),
                None => Err(failed(spec, "no pane")),
            },
            "list-sessions" | "ls" if state.no_server => Err(failed(
                spec,
                "no server running on /tmp/tmux-1000/default",
            )),
            "list-sessions" => Ok(state
                .sessions
                .iter()
                .map(|s| format!("{}|1700000000|1|0|120|30\n", s))
                .collect::<String>()
                .into_bytes()),
            "ls" => Ok(state
                .sessions
                .iter()
                .map(|s| format!("{}: 1 windows (created Tue Nov 14 22:13:20 2023)\n", s))
                .collect::<String>()
                .into_bytes()),
            _ => Ok(Vec::new()),
        }
    }

    fn process(&self, spec: &CommandSpec) -> Result<Vec<u8>, CmdError> {
        let state = self.state.lock();
        match spec.program.as_str() {
            "pgrep" => {
                let parent: u32 = flag_value(spec, "-P").and_then(|p| p.parse().ok()).unwrap_or(0);
                match state.children.get(&parent) {
                    Some(child) => Ok(format!("{}\n", child).into_bytes()),
                    None => Err(failed(spec, "")),
                }
            }
            "ps" => match state.ps_output {
                Some(ref out) => Ok(out.clone().into_bytes()),
                None => Err(failed(spec, "")),
            },
            _ => Ok(Vec::new()),
        }
    }
}

impl Executor for FakeTmux {
    fn run(&self, cmd: &CommandSpec) -> Result<(), CmdError> {
        self.output(cmd).map(|_| ())
    }

    fn output(&self, cmd: &CommandSpec) -> Result<Vec<u8>, CmdError> {
        if cmd.program == "git" {
            return SystemExecutor.output(cmd);
        }
        self.state.lock().calls.push(cmd.to_string());
        if cmd.program == "tmux" {
            self.tmux(cmd)
        } else {
            self.process(cmd)
        }
    }
}

impl PtyFactory for FakeTmux {
    fn start(&self, cmd: &CommandSpec, _size: PtySize) -> Result<Box<dyn PtyHandle>, PtyError> {
        let mut state = self.state.lock();
        state.pty_calls.push(cmd.to_string());

        match cmd.subcommand() {
            Some("new-session") if !state.spawn_fails => {
                if let Some(name) = flag_value(cmd, "-s") {
                    state.sessions.insert(name.to_string());
                }
            }
            Some("attach-session") => {
                let name = flag_value(cmd, "-t").unwrap_or("");
                if !state.sessions.contains(name) {
                    return Err(PtyError::SpawnError(format!("can't find session: {}", name)));
                }
            }
            _ => {}
        }

        Ok(Box::new(FakePty {
            state: self.state.clone(),
            open: true,
        }))
    }
}

struct FakePty {
    state: Arc<Mutex<FakeState>>,
    open: bool,
}

impl PtyHandle for FakePty {
    fn write(&mut self, data: &[u8]) -> Result<(), PtyError> {
        if !self.open {
            return Err(PtyError::Closed);
        }
        self.state.lock().pty_input.extend_from_slice(data);
        Ok(())
    }

    fn resize(&mut self, size: PtySize) -> Result<(), PtyError> {
        self.state.lock().last_resize = Some(size);
        Ok(())
    }

    fn try_clone_reader(&self) -> Result<Box<dyn Read + Send>, PtyError> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    fn close(&mut self) -> Result<(), PtyError> {
        self.open = false;
        Ok(())
    }
}

/// Remembers the last copied value.
#[derive(Default)]
pub(crate) struct RecordingClipboard {
    pub copied: Mutex<Vec<String>>,
}

impl Clipboard for RecordingClipboard {
    fn copy(&self, text: &str) -> std::io::Result<()> {
        self.copied.lock().push(text.to_string());
        Ok(())
    }
}

pub(crate) fn fast_timings() -> TmuxTimings {
    TmuxTimings {
        exist_initial: Duration::from_millis(1),
        exist_max: Duration::from_millis(2),
        exist_deadline: Duration::from_millis(20),
        ready_initial: Duration::from_millis(1),
        ready_max: Duration::from_millis(5),
        ready_growth: 1.2,
        ready_deadline: Some(Duration::from_millis(50)),
        permission_confirm: Duration::from_millis(1),
    }
}

pub(crate) fn fake_backend(fake: &Arc<FakeTmux>) -> (Backend, Arc<RecordingClipboard>) {
    let clipboard = Arc::new(RecordingClipboard::default());
    let backend = Backend {
        executor: fake.clone(),
        pty: fake.clone(),
        inspector: Arc::new(TmuxProcessInspector::new(fake.clone())),
        clipboard: clipboard.clone(),
        timings: fast_timings(),
    };
    (backend, clipboard)
}

/// Run git in `dir` and return trimmed stdout; panics on failure.
pub(crate) fn run_git(dir: &Path, args: &[&str]) -> String {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap();
    assert!(
        out.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

/// Fresh repository on `main` with one commit.
pub(crate) fn init_repo(dir: &Path) {
    run_git(dir, &["init", "-q", "-b", "main"]);
    run_git(dir, &["config", "user.name", "Test User"]);
    run_git(dir, &["config", "user.email", "test@example.com"]);
    run_git(dir, &["config", "commit.gpgsign", "false"]);
    std::fs::write(dir.join("README.md"), "# test\n").unwrap();
    run_git(dir, &["add", "README.md"]);
    run_git(dir, &["commit", "-q", "-m", "initial"]);
}
