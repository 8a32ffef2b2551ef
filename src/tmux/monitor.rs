//! Content-change and idle detection over captured pane output.

use std::borrow::Cow;

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

use super::program::ProgramFamily;

/// Identical ticks needed before a session counts as "not updated".
/// Tuned for ~500ms ticks.
pub const DEBOUNCE_TICKS: u32 = 6;

const CAPTURE_FAILURE_LOG_EVERY: u32 = 30;

// CSI sequences, OSC sequences (BEL or ST terminated), then any other
// two-byte escape.
static ANSI_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]")
        .expect("Invalid ANSI escape regex")
});

pub fn strip_ansi(content: &str) -> Cow<'_, str> {
    ANSI_RE.replace_all(content, "")
}

fn hash_content(stripped: &str) -> [u8; 32] {
    Sha256::digest(stripped.as_bytes()).into()
}

/// Per-session counters. Only the metadata tick for the owning instance
/// touches these.
#[derive(Debug, Default)]
pub struct StatusMonitor {
    prev_hash: Option<[u8; 32]>,
    capture_failures: u32,
    unchanged_ticks: u32,
}

impl StatusMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn capture_failures(&self) -> u32 {
        self.capture_failures
    }

    pub fn unchanged_ticks(&self) -> u32 {
        self.unchanged_ticks
    }

    /// Count a failed capture and log it sparsely.
    pub fn record_failure(&mut self, session: &str, err: &dyn std::fmt::Display) {
        self.capture_failures += 1;
        if self.capture_failures == 1 {
            tracing::error!("capture-pane failed for {}: {}", session, err);
        } else if self.capture_failures % CAPTURE_FAILURE_LOG_EVERY == 0 {
            tracing::warn!(
                "capture-pane still failing for {} ({} consecutive): {}",
                session,
                self.capture_failures,
                err
            );
        }
    }

    /// Feed one successful capture. Returns `(updated, has_prompt)`.
    pub fn observe(&mut self, content: &str, family: ProgramFamily) -> (bool, bool) {
        self.capture_failures = 0;

        let stripped = strip_ansi(content);
        let has_prompt = family.has_prompt(&stripped);
        let hash = hash_content(&stripped);

        if self.prev_hash != Some(hash) {
            self.prev_hash = Some(hash);
            self.unchanged_ticks = 0;
            return (true, has_prompt);
        }

        self.unchanged_ticks = self.unchanged_ticks.saturating_add(1);
        (self.unchanged_ticks < DEBOUNCE_TICKS, has_prompt)
    }
}
