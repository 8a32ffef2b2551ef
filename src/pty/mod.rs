//! Pseudo-terminal allocation for multiplexer clients.
//!
//! tmux `new-session` and `attach-session` are run inside a PTY we own so the
//! host can resize it and forward keystrokes without touching the
//! developer's real terminal.

mod native;

pub use native::{NativePtyFactory, NativePtyHandle};

use std::io::Read;

use thiserror::Error;

use crate::cmd::CommandSpec;

#[derive(Debug, Error)]
pub enum PtyError {
    #[error("Failed to create PTY: {0}")]
    CreateError(String),
    #[error("Failed to spawn command: {0}")]
    SpawnError(String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("PTY is closed")]
    Closed,
}

/// Initial terminal geometry for a new PTY.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtySize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for PtySize {
    fn default() -> Self {
        Self { cols: 120, rows: 30 }
    }
}

/// A running command bound to a PTY.
pub trait PtyHandle: Send {
    fn write(&mut self, data: &[u8]) -> Result<(), PtyError>;
    fn resize(&mut self, size: PtySize) -> Result<(), PtyError>;
    /// A second reader over the PTY output.
    fn try_clone_reader(&self) -> Result<Box<dyn Read + Send>, PtyError>;
    /// Terminate the child (if still running) and release the PTY.
    fn close(&mut self) -> Result<(), PtyError>;
}

/// Starts commands inside freshly allocated PTYs.
pub trait PtyFactory: Send + Sync {
    fn start(&self, cmd: &CommandSpec, size: PtySize) -> Result<Box<dyn PtyHandle>, PtyError>;
}
