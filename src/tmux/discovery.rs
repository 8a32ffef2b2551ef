//! Enumerate prefixed tmux sessions and sweep stale ones.

use std::collections::HashSet;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;

use super::{TmuxError, LEGACY_PREFIXES, SESSION_PREFIX};
use crate::cmd::{CmdError, CommandSpec, Executor};
use crate::errors::collect_errors;

const LIST_FORMAT: &str = "#{session_name}|#{session_created}|#{session_windows}|#{session_attached}|#{window_width}|#{window_height}";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub name: String,
    pub created: Option<DateTime<Utc>>,
    pub windows: u32,
    pub attached: bool,
    pub cols: u16,
    pub rows: u16,
    /// Known to the in-memory model.
    pub managed: bool,
}

/// tmux reports a missing server as an error; for listing that just
/// means there are no sessions.
fn is_no_server(err: &CmdError) -> bool {
    let stderr = err.stderr();
    stderr.contains("no server running") || stderr.contains("error connecting")
}

fn list_command(exec: &dyn Executor, spec: &CommandSpec) -> Result<Option<String>, TmuxError> {
    match exec.output(spec) {
        Ok(out) => Ok(Some(String::from_utf8_lossy(&out).to_string())),
        Err(e) if is_no_server(&e) => Ok(None),
        Err(source) => Err(TmuxError::Command {
            op: "list-sessions",
            session: "*".to_string(),
            source,
        }),
    }
}

fn parse_line(line: &str) -> Option<SessionInfo> {
    // Split from the right so a '|' inside a session name survives
    let mut fields = line.rsplitn(6, '|');
    let rows = fields.next()?.trim().parse().unwrap_or(0);
    let cols = fields.next()?.trim().parse().unwrap_or(0);
    let attached = fields.next()?.trim().parse::<u32>().unwrap_or(0) > 0;
    let windows = fields.next()?.trim().parse().unwrap_or(0);
    let created = fields
        .next()?
        .trim()
        .parse::<i64>()
        .ok()
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single());
    let name = fields.next()?.to_string();

    Some(SessionInfo {
        name,
        created,
        windows,
        attached,
        cols,
        rows,
        managed: false,
    })
}

/// Every session carrying the orchestration prefix, tagged by whether
/// `known` contains its name.
pub fn discover_all(
    exec: &dyn Executor,
    known: &HashSet<String>,
) -> Result<Vec<SessionInfo>, TmuxError> {
    let spec = CommandSpec::tmux().args(["list-sessions", "-F", LIST_FORMAT]);
    let Some(out) = list_command(exec, &spec)? else {
        return Ok(Vec::new());
    };

    Ok(out
        .lines()
        .filter_map(parse_line)
        .filter(|s| s.name.starts_with(SESSION_PREFIX))
        .map(|mut s| {
            s.managed = known.contains(&s.name);
            s
        })
        .collect())
}

pub fn discover_orphans(
    exec: &dyn Executor,
    known: &HashSet<String>,
) -> Result<Vec<SessionInfo>, TmuxError> {
    Ok(discover_all(exec, known)?
        .into_iter()
        .filter(|s| !s.managed)
        .collect())
}

pub fn count_kas_sessions(exec: &dyn Executor) -> Result<usize, TmuxError> {
    Ok(discover_all(exec, &HashSet::new())?.len())
}

fn is_swept(name: &str) -> bool {
    name.starts_with(SESSION_PREFIX) || LEGACY_PREFIXES.iter().any(|p| name.starts_with(p))
}

/// Kill every session with the current or a legacy prefix. Returns the
/// names that were killed.
pub fn cleanup_sessions(exec: &dyn Executor) -> Result<Vec<String>, TmuxError> {
    let Some(out) = list_command(exec, &CommandSpec::tmux().arg("ls"))? else {
        return Ok(Vec::new());
    };

    let mut killed = Vec::new();
    let mut errors = Vec::new();
    for line in out.lines() {
        let Some((name, _)) = line.split_once(':') else {
            continue;
        };
        if !is_swept(name) {
            continue;
        }

        tracing::info!("Killing stale tmux session {}", name);
        match exec.run(&CommandSpec::tmux().args(["kill-session", "-t", name])) {
            Ok(()) => killed.push(name.to_string()),
            // Exited on its own between `ls` and the kill
            Err(_) if !session_exists(exec, name) => {
                tracing::debug!("tmux session {} already gone", name);
            }
            Err(source) => errors.push(TmuxError::Command {
                op: "kill-session",
                session: name.to_string(),
                source,
            }),
        }
    }

    collect_errors(errors)?;
    Ok(killed)
}

fn session_exists(exec: &dyn Executor, name: &str) -> bool {
    let target = format!("-t={}", name);
    exec.run(&CommandSpec::tmux().args(["has-session", target.as_str()]))
        .is_ok()
}
