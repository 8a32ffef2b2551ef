//! Per-tick observation of a live instance.
//!
//! Collection runs off the UI task on a blocking worker and only touches
//! the tmux session, the worktree and the process table. The result comes
//! back by value and is applied to the model on the caller's task.

use std::sync::Arc;

use serde::Serialize;

use super::{Instance, Status};
use crate::git::{DiffStats, GitWorktree};
use crate::procstat::{ProcessInspector, ResourceUsage};
use crate::tmux::TmuxSession;

/// What one tick learned about the worktree diff.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub enum DiffUpdate {
    Stats(DiffStats),
    /// Worktree or base commit gone; stale stats must not linger.
    Clear,
    /// Nothing to report, or the diff failed. Previous stats stand.
    #[default]
    Keep,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InstanceMetadata {
    pub content: String,
    pub captured: bool,
    pub updated: bool,
    pub has_prompt: bool,
    pub diff: DiffUpdate,
    pub cpu_percent: f64,
    pub mem_mb: f64,
    pub resources_valid: bool,
    pub tmux_alive: bool,
}

/// Everything one collection needs, detached from the instance so it can
/// move to a worker.
pub struct MetadataProbe {
    tmux: Arc<TmuxSession>,
    worktree: Option<GitWorktree>,
    inspector: Arc<dyn ProcessInspector>,
}

impl MetadataProbe {
    /// One capture, one diff, one process inspection, one existence check.
    pub fn collect(&self) -> InstanceMetadata {
        let pane = self.tmux.has_updated_with_content();

        let diff = match self.worktree.as_ref().map(|w| (w, w.diff())) {
            None => DiffUpdate::Keep,
            Some((_, Ok(stats))) => DiffUpdate::Stats(stats),
            Some((_, Err(e))) if e.is_transient() => DiffUpdate::Clear,
            Some((w, Err(e))) => {
                tracing::warn!("Diff failed for {}: {}", w.branch_name(), e);
                DiffUpdate::Keep
            }
        };

        let usage = self
            .tmux
            .pane_pid()
            .ok()
            .and_then(|pid| match self.inspector.usage(pid) {
                Ok(usage) => Some(usage),
                Err(e) => {
                    tracing::debug!("No resource usage for {}: {}", self.tmux.name(), e);
                    None
                }
            });

        InstanceMetadata {
            content: pane.content,
            captured: pane.captured,
            updated: pane.updated,
            has_prompt: pane.has_prompt,
            diff,
            cpu_percent: usage.map(|u| u.cpu_percent).unwrap_or_default(),
            mem_mb: usage.map(|u| u.mem_mb).unwrap_or_default(),
            resources_valid: usage.is_some(),
            tmux_alive: self.tmux.does_session_exist(),
        }
    }
}

impl Instance {
    /// `None` for instances with nothing to observe.
    pub fn metadata_probe(&self) -> Option<MetadataProbe> {
        if !self.started || self.tmux_stopped || self.status == Status::Paused {
            return None;
        }
        Some(MetadataProbe {
            tmux: self.tmux.clone()?,
            worktree: self.worktree.clone(),
            inspector: self.backend.inspector.clone(),
        })
    }

    /// Synchronous collection, for callers without a runtime.
    pub fn collect_metadata(&self) -> Option<InstanceMetadata> {
        self.metadata_probe().map(|probe| probe.collect())
    }

    pub fn apply_metadata(&mut self, metadata: InstanceMetadata) {
        // Paused, stopped or killed while the worker ran
        if !self.started || self.tmux_stopped || self.status == Status::Paused {
            return;
        }

        match metadata.diff {
            DiffUpdate::Stats(stats) => self.diff_stats = Some(stats),
            DiffUpdate::Clear => self.diff_stats = None,
            DiffUpdate::Keep => {}
        }
        if metadata.resources_valid {
            self.resources = Some(ResourceUsage {
                cpu_percent: metadata.cpu_percent,
                mem_mb: metadata.mem_mb,
            });
        }
        if !metadata.tmux_alive {
            tracing::debug!("tmux session for {} is gone", self.title);
        }
        if !metadata.captured {
            return;
        }

        self.cached_content = Some(metadata.content);
        if matches!(self.status, Status::Running | Status::Ready) {
            self.status = if metadata.updated {
                Status::Running
            } else {
                Status::Ready
            };
        }

        if self.auto_yes && metadata.has_prompt {
            if let Err(e) = self.tap_enter() {
                tracing::warn!("Auto-yes failed for {}: {}", self.title, e);
            }
        }

        if self.status == Status::Ready {
            if let Some(prompt) = self.queued_prompt.clone() {
                match self.send_prompt(&prompt) {
                    Ok(()) => {
                        tracing::info!("Sent queued prompt to {}", self.title);
                        self.queued_prompt = None;
                    }
                    Err(e) => tracing::warn!("Failed to send queued prompt to {}: {}", self.title, e),
                }
            }
        }
    }
}
