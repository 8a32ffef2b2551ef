//! Best-effort system clipboard.

use std::io::Write;
use std::process::{Command, Stdio};

pub trait Clipboard: Send + Sync {
    fn copy(&self, text: &str) -> std::io::Result<()>;
}

/// Pipes text into the platform clipboard tool.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClipboard;

impl SystemClipboard {
    fn command() -> Command {
        #[cfg(target_os = "macos")]
        let cmd = Command::new("pbcopy");

        #[cfg(target_os = "windows")]
        let cmd = Command::new("clip");

        #[cfg(not(any(target_os = "macos", target_os = "windows")))]
        let cmd = {
            let mut cmd = Command::new("xclip");
            cmd.args(["-selection", "clipboard"]);
            cmd
        };

        cmd
    }
}

impl Clipboard for SystemClipboard {
    fn copy(&self, text: &str) -> std::io::Result<()> {
        let mut child = Self::command()
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(text.as_bytes())?;
        }

        let status = child.wait()?;
        if !status.success() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("clipboard tool exited with {}", status),
            ));
        }
        Ok(())
    }
}
