//! Agent program families and the command line each one is launched with.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Prompts longer than this are written to a scratch file instead of inlined.
pub const INLINE_PROMPT_LIMIT: usize = 8192;

/// Scratch directory (relative to the session's working directory).
pub const SCRATCH_DIR: &str = ".kasmos";

/// Env var that tells a child it runs under the orchestrator.
pub const MANAGED_ENV: &str = "KASMOS_MANAGED";

const SKIP_PERMISSIONS_FLAG: &str = "--dangerously-skip-permissions";
const CLAUDE_SENTINEL: &str = "claude";
const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(30);
const SLOW_SPLASH_READY_TIMEOUT: Duration = Duration::from_secs(45);

/// Keystrokes that dismiss a program's startup screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acknowledge {
    None,
    Enter,
    DAndEnter,
}

/// How a family signals that it is waiting on the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleMarker {
    /// Waiting when the text is on screen.
    Present(&'static str),
    /// Waiting when the text is missing (a busy indicator).
    Absent(&'static str),
    Unknown,
}

/// How a family receives a prompt that is too long to inline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilePrompt {
    /// `@<relative-path>` positional argument.
    AtReference,
    /// `--prompt "$(cat '<path>')"` shell substitution.
    CatSubstitution,
    Unsupported,
}

/// Agent CLIs with dedicated handling. Everything else is `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgramFamily {
    Claude,
    Aider,
    Gemini,
    OpenCode,
    Other,
}

impl ProgramFamily {
    /// Classify a command line by the basename of its executable.
    pub fn detect(program: &str) -> Self {
        let exe = program.split_whitespace().next().unwrap_or("");
        let base = Path::new(exe)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(exe);

        match base {
            "claude" => ProgramFamily::Claude,
            "aider" => ProgramFamily::Aider,
            "gemini" => ProgramFamily::Gemini,
            "opencode" => ProgramFamily::OpenCode,
            _ => ProgramFamily::Other,
        }
    }

    /// Whether an initial prompt can be passed on the command line.
    pub fn supports_cli_prompt(self) -> bool {
        matches!(self, ProgramFamily::Claude | ProgramFamily::OpenCode)
    }

    /// Flag placed before an inlined prompt, `None` for a positional argument.
    fn inline_prompt_flag(self) -> Option<&'static str> {
        match self {
            ProgramFamily::OpenCode => Some("--prompt"),
            _ => None,
        }
    }

    pub fn file_prompt(self) -> FilePrompt {
        match self {
            ProgramFamily::Claude => FilePrompt::AtReference,
            ProgramFamily::OpenCode => FilePrompt::CatSubstitution,
            _ => FilePrompt::Unsupported,
        }
    }

    /// Startup screens to wait for and the keys that dismiss them.
    pub fn ready_markers(self) -> &'static [(&'static str, Acknowledge)] {
        match self {
            ProgramFamily::Claude => &[
                ("Do you trust the files in this folder?", Acknowledge::Enter),
                ("? for shortcuts", Acknowledge::None),
            ],
            ProgramFamily::Aider | ProgramFamily::Gemini => &[(
                "Open documentation url for more info",
                Acknowledge::DAndEnter,
            )],
            ProgramFamily::OpenCode | ProgramFamily::Other => &[],
        }
    }

    /// Whether start-up waits for the program at all.
    pub fn waits_for_ready(self) -> bool {
        !matches!(self, ProgramFamily::Other)
    }

    pub fn ready_timeout(self) -> Duration {
        match self {
            ProgramFamily::Gemini | ProgramFamily::OpenCode => SLOW_SPLASH_READY_TIMEOUT,
            _ => DEFAULT_READY_TIMEOUT,
        }
    }

    pub fn idle_marker(self) -> IdleMarker {
        match self {
            ProgramFamily::Claude => {
                IdleMarker::Present("No, and tell Claude what to do differently")
            }
            ProgramFamily::Aider => IdleMarker::Present("(Y)es/(N)o/(D)on't ask again"),
            ProgramFamily::Gemini => IdleMarker::Present("Yes, allow once"),
            ProgramFamily::OpenCode => IdleMarker::Absent("esc interrupt"),
            ProgramFamily::Other => IdleMarker::Unknown,
        }
    }

    /// "Has prompt" heuristic over ANSI-stripped pane content.
    pub fn has_prompt(self, content: &str) -> bool {
        match self.idle_marker() {
            IdleMarker::Present(marker) => content.contains(marker),
            IdleMarker::Absent(marker) => !content.contains(marker),
            IdleMarker::Unknown => false,
        }
    }
}

/// Identity of one task within a parallel wave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaveIdentity {
    pub task: u32,
    pub wave: u32,
    pub peers: u32,
}

/// Quote for a POSIX shell using single quotes.
pub fn shell_escape(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Everything needed to build the command a session runs.
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions<'a> {
    pub program: &'a str,
    pub skip_permissions: bool,
    pub agent_type: Option<&'a str>,
    pub initial_prompt: Option<&'a str>,
    pub wave: Option<WaveIdentity>,
}

/// A command line ready to hand to `tmux new-session`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub command_line: String,
    /// Scratch file holding a long prompt; owned by the session.
    pub prompt_file: Option<PathBuf>,
}

/// Build the full command line, writing a prompt scratch file under
/// `work_dir` when the prompt is too long to inline.
pub fn build_launch_command(
    opts: &LaunchOptions<'_>,
    work_dir: &Path,
) -> std::io::Result<LaunchCommand> {
    let family = ProgramFamily::detect(opts.program);
    let mut command = opts.program.trim().to_string();

    if opts.skip_permissions && command.ends_with(CLAUDE_SENTINEL) {
        command.push(' ');
        command.push_str(SKIP_PERMISSIONS_FLAG);
    }

    if let Some(agent) = opts.agent_type.filter(|a| !a.is_empty()) {
        let present = command
            .split_whitespace()
            .any(|t| t == "--agent" || t.starts_with("--agent="));
        if !present {
            command.push_str(&format!(" --agent {}", agent));
        }
    }

    let mut prompt_file = None;
    if let Some(prompt) = opts.initial_prompt.filter(|p| !p.is_empty()) {
        if family.supports_cli_prompt() {
            if prompt.chars().count() <= INLINE_PROMPT_LIMIT {
                match family.inline_prompt_flag() {
                    Some(flag) => command.push_str(&format!(" {} {}", flag, shell_escape(prompt))),
                    None => command.push_str(&format!(" {}", shell_escape(prompt))),
                }
            } else {
                let (abs, rel) = write_prompt_file(work_dir, prompt)?;
                match family.file_prompt() {
                    FilePrompt::AtReference => command.push_str(&format!(" @{}", rel)),
                    FilePrompt::CatSubstitution => command
                        .push_str(&format!(" --prompt \"$(cat {})\"", shell_escape(&rel))),
                    FilePrompt::Unsupported => {}
                }
                prompt_file = Some(abs);
            }
        }
    }

    let mut env = format!("{}=1 ", MANAGED_ENV);
    if let Some(wave) = opts.wave {
        env.push_str(&format!(
            "KASMOS_TASK={} KASMOS_WAVE={} KASMOS_PEERS={} ",
            wave.task, wave.wave, wave.peers
        ));
    }

    Ok(LaunchCommand {
        command_line: format!("{}{}", env, command),
        prompt_file,
    })
}

/// Returns the absolute path and the path relative to `work_dir`.
fn write_prompt_file(work_dir: &Path, prompt: &str) -> std::io::Result<(PathBuf, String)> {
    let dir = work_dir.join(SCRATCH_DIR);
    std::fs::create_dir_all(&dir)?;

    let mut file = tempfile::Builder::new()
        .prefix("prompt-")
        .suffix(".md")
        .tempfile_in(&dir)?;
    file.write_all(prompt.as_bytes())?;
    let (_, path) = file.keep().map_err(|e| e.error)?;

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    Ok((path, format!("{}/{}", SCRATCH_DIR, name)))
}
