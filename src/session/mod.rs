//! Instance lifecycle: a tmux session plus a git worktree plus the model
//! state the UI renders.

mod controller;
mod instance;
mod metadata;
mod persistence;

pub use controller::InstanceController;
pub use instance::{Instance, InstanceOptions};
pub use metadata::{DiffUpdate, InstanceMetadata, MetadataProbe};

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clipboard::{Clipboard, SystemClipboard};
use crate::cmd::{Executor, SystemExecutor};
use crate::errors::{format_joined, Joinable};
use crate::git::GitError;
use crate::procstat::{ProcessInspector, TmuxProcessInspector};
use crate::pty::{NativePtyFactory, PtyFactory};
use crate::storage::StorageError;
use crate::tmux::{TmuxError, TmuxTimings};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Running,
    Ready,
    Loading,
    Paused,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Running => "running",
            Status::Ready => "ready",
            Status::Loading => "loading",
            Status::Paused => "paused",
        };
        f.write_str(s)
    }
}

/// Workflow role; passed to the agent as `--agent <type>`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    #[default]
    #[serde(rename = "")]
    Unspecified,
    Planner,
    Coder,
    Reviewer,
}

impl AgentType {
    /// `None` when no flag should be passed.
    pub fn as_flag(self) -> Option<&'static str> {
        match self {
            AgentType::Unspecified => None,
            AgentType::Planner => Some("planner"),
            AgentType::Coder => Some("coder"),
            AgentType::Reviewer => Some("reviewer"),
        }
    }
}

#[derive(Debug, Error)]
pub enum InstanceError {
    #[error("instance title cannot be empty")]
    EmptyTitle,
    #[error("instance program cannot be empty")]
    EmptyProgram,
    #[error("instance {0} already exists")]
    DuplicateTitle(String),
    #[error("instance {title} would reuse tmux session {session}")]
    SessionCollision { title: String, session: String },
    #[error("instance {0} not found")]
    NotFound(String),
    #[error("instance {0} has not been started")]
    NotStarted(String),
    #[error("instance {0} is already paused")]
    AlreadyPaused(String),
    #[error("instance {0} is not paused")]
    NotPaused(String),
    #[error("failed to start instance {title}: {source}")]
    Start {
        title: String,
        #[source]
        source: Box<InstanceError>,
    },
    #[error(transparent)]
    Tmux(#[from] TmuxError),
    #[error(transparent)]
    Git(#[from] GitError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("{}", format_joined(.0))]
    Multiple(Vec<InstanceError>),
}

impl Joinable for InstanceError {
    fn joined(errors: Vec<Self>) -> Self {
        InstanceError::Multiple(errors)
    }
}

/// Loading bar state shown while an instance starts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadingProgress {
    pub stage: u32,
    pub total: u32,
    pub message: String,
}

impl LoadingProgress {
    pub fn reset(&mut self, total: u32) {
        self.stage = 0;
        self.total = total;
        self.message.clear();
    }

    pub fn advance(&mut self, message: &str) {
        self.stage = (self.stage + 1).min(self.total);
        self.message = message.to_string();
    }

    pub fn finish(&mut self) {
        self.stage = self.total;
        self.message.clear();
    }
}

/// External collaborators an instance talks to.
#[derive(Clone)]
pub struct Backend {
    pub executor: Arc<dyn Executor>,
    pub pty: Arc<dyn PtyFactory>,
    pub inspector: Arc<dyn ProcessInspector>,
    pub clipboard: Arc<dyn Clipboard>,
    pub timings: TmuxTimings,
}

impl Backend {
    /// Real tmux, git, PTYs and clipboard.
    pub fn system() -> Self {
        let executor: Arc<dyn Executor> = Arc::new(SystemExecutor);
        Self {
            inspector: Arc::new(TmuxProcessInspector::new(executor.clone())),
            executor,
            pty: Arc::new(NativePtyFactory),
            clipboard: Arc::new(SystemClipboard),
            timings: TmuxTimings::default(),
        }
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("timings", &self.timings)
            .finish_non_exhaustive()
    }
}
