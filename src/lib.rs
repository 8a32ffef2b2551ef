//! kasmos: coding agents in tmux sessions, each on its own git worktree.

pub mod clipboard;
pub mod cmd;
pub mod errors;
pub mod git;
pub mod procstat;
pub mod pty;
pub mod session;
pub mod storage;
pub mod tmux;

#[cfg(test)]
mod test_utils;

use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use session::{Backend, Instance, InstanceController, InstanceOptions, Status};

const DEFAULT_LOG_FILTER: &str = "kasmos=info";

/// Install the global subscriber. `RUST_LOG` overrides the default filter.
/// The UI owns the terminal, so logs go to `log_file` when given.
pub fn init_tracing(log_file: Option<&Path>) -> io::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let registry = tracing_subscriber::registry().with(filter);

    let result = match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            registry
                .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
                .try_init()
        }
        None => registry.with(fmt::layer().with_writer(io::stderr)).try_init(),
    };
    result.map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
}
