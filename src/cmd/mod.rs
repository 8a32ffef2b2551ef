//! Indirection over spawning external tools.
//!
//! Everything that talks to tmux, git or the process table builds a
//! [`CommandSpec`] and hands it to an [`Executor`]. Swapping the executor is
//! how the orchestration stack is tested without a real multiplexer.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;

use thiserror::Error;

#[cfg(windows)]
use std::os::windows::process::CommandExt;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x08000000;

#[derive(Debug, Error)]
pub enum CmdError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` exited with {}: {stderr}", describe_status(.status))]
    Failed {
        command: String,
        status: Option<i32>,
        stderr: String,
    },
}

fn describe_status(status: &Option<i32>) -> String {
    match status {
        Some(code) => format!("status {}", code),
        None => "signal".to_string(),
    }
}

impl CmdError {
    /// The captured diagnostic text of a failed command, empty for spawn errors.
    pub fn stderr(&self) -> &str {
        match self {
            CmdError::Failed { stderr, .. } => stderr,
            CmdError::Spawn { .. } => "",
        }
    }
}

/// A fully described external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            cwd: None,
        }
    }

    pub fn tmux() -> Self {
        Self::new("tmux")
    }

    pub fn git(dir: &Path) -> Self {
        Self::new("git").current_dir(dir)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.cwd = Some(dir.to_path_buf());
        self
    }

    /// The first positional argument (the tmux/git subcommand).
    pub fn subcommand(&self) -> Option<&str> {
        self.args.first().map(String::as_str)
    }

    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(ref dir) = self.cwd {
            cmd.current_dir(dir);
        }

        // Prevent console window from flashing on Windows
        #[cfg(windows)]
        cmd.creation_flags(CREATE_NO_WINDOW);

        cmd
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Runs external commands. `run` only reports success; `output` also
/// returns standard output. Standard error is never part of a success value.
pub trait Executor: Send + Sync {
    fn run(&self, cmd: &CommandSpec) -> Result<(), CmdError>;
    fn output(&self, cmd: &CommandSpec) -> Result<Vec<u8>, CmdError>;
}

/// Executor backed by `std::process::Command`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemExecutor;

impl SystemExecutor {
    fn exec(&self, spec: &CommandSpec) -> Result<std::process::Output, CmdError> {
        tracing::debug!("exec: {}", spec);

        let output = spec.to_command().output().map_err(|e| CmdError::Spawn {
            command: spec.to_string(),
            source: e,
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
            return Err(CmdError::Failed {
                command: spec.to_string(),
                status: output.status.code(),
                stderr: if !stderr.is_empty() { stderr } else { stdout },
            });
        }

        Ok(output)
    }
}

impl Executor for SystemExecutor {
    fn run(&self, cmd: &CommandSpec) -> Result<(), CmdError> {
        self.exec(cmd).map(|_| ())
    }

    fn output(&self, cmd: &CommandSpec) -> Result<Vec<u8>, CmdError> {
        self.exec(cmd).map(|out| out.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_joins_program_and_args() {
        let spec = CommandSpec::tmux().args(["has-session", "-t=kas_foo"]);
        assert_eq!(spec.to_string(), "tmux has-session -t=kas_foo");
        assert_eq!(spec.subcommand(), Some("has-session"));
    }

    #[test]
    fn test_git_spec_sets_cwd() {
        let spec = CommandSpec::git(Path::new("/repo")).args(["rev-parse", "HEAD"]);
        assert_eq!(spec.cwd.as_deref(), Some(Path::new("/repo")));
        assert_eq!(spec.to_string(), "git rev-parse HEAD");
    }

    #[cfg(unix)]
    #[test]
    fn test_system_executor_output_and_failure() {
        let exec = SystemExecutor;
        let out = exec.output(&CommandSpec::new("echo").arg("hello")).unwrap();
        assert_eq!(String::from_utf8_lossy(&out).trim(), "hello");

        let err = exec.run(&CommandSpec::new("false")).unwrap_err();
        assert!(matches!(err, CmdError::Failed { status: Some(1), .. }));
    }

    #[test]
    fn test_system_executor_spawn_error() {
        let err = SystemExecutor
            .run(&CommandSpec::new("kasmos-definitely-not-a-binary"))
            .unwrap_err();
        assert!(matches!(err, CmdError::Spawn { .. }));
        assert_eq!(err.stderr(), "");
    }
}
