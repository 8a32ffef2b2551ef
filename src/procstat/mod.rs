//! CPU and memory usage of the agent running inside a session.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::cmd::{CmdError, CommandSpec, Executor};

#[derive(Debug, Error)]
pub enum ProcStatError {
    #[error(transparent)]
    Command(#[from] CmdError),
    #[error("unexpected ps output: {0:?}")]
    Parse(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub mem_mb: f64,
}

/// Platform hook for process-tree introspection.
pub trait ProcessInspector: Send + Sync {
    /// Usage of the program hosted by the pane whose shell is `pane_pid`.
    fn usage(&self, pane_pid: u32) -> Result<ResourceUsage, ProcStatError>;
}

/// `pgrep`/`ps` based inspector for Unix-like hosts.
pub struct TmuxProcessInspector {
    executor: Arc<dyn Executor>,
}

impl TmuxProcessInspector {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self { executor }
    }

    /// The pane's first child is the real agent when the pane runs a
    /// shell wrapper; otherwise the pane process is the agent.
    fn agent_pid(&self, pane_pid: u32) -> u32 {
        let parent = pane_pid.to_string();
        let spec = CommandSpec::new("pgrep").args(["-P", parent.as_str()]);
        self.executor
            .output(&spec)
            .ok()
            .and_then(|out| {
                String::from_utf8_lossy(&out)
                    .lines()
                    .find_map(|l| l.trim().parse().ok())
            })
            .unwrap_or(pane_pid)
    }
}

impl ProcessInspector for TmuxProcessInspector {
    fn usage(&self, pane_pid: u32) -> Result<ResourceUsage, ProcStatError> {
        let pid = self.agent_pid(pane_pid).to_string();
        let spec = CommandSpec::new("ps").args(["-o", "%cpu=,rss=", "-p", pid.as_str()]);
        let out = self.executor.output(&spec)?;
        parse_ps(&String::from_utf8_lossy(&out))
    }
}

fn parse_ps(out: &str) -> Result<ResourceUsage, ProcStatError> {
    let mut fields = out.split_whitespace();
    let cpu = fields.next().and_then(|f| f.parse::<f64>().ok());
    let rss_kb = fields.next().and_then(|f| f.parse::<f64>().ok());

    match (cpu, rss_kb) {
        (Some(cpu_percent), Some(rss_kb)) => Ok(ResourceUsage {
            cpu_percent,
            mem_mb: rss_kb / 1024.0,
        }),
        _ => Err(ProcStatError::Parse(out.trim().to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FakeTmux;

    #[test]
    fn test_parse_ps() {
        let usage = parse_ps("  12.5 204800\n").unwrap();
        assert_eq!(usage.cpu_percent, 12.5);
        assert_eq!(usage.mem_mb, 200.0);
        assert!(parse_ps("").is_err());
        assert!(parse_ps("abc def").is_err());
    }

    #[test]
    fn test_descends_to_child_process() {
        let fake = Arc::new(FakeTmux::new());
        fake.set_child(100, 101);
        fake.set_ps_output(" 3.0 1024");
        let inspector = TmuxProcessInspector::new(fake.clone());

        let usage = inspector.usage(100).unwrap();
        assert_eq!(usage, ResourceUsage { cpu_percent: 3.0, mem_mb: 1.0 });
        assert!(fake.has_call("ps -o %cpu=,rss= -p 101"));
    }

    #[test]
    fn test_falls_back_to_pane_pid() {
        let fake = Arc::new(FakeTmux::new());
        fake.set_ps_output("0.0 2048");
        let inspector = TmuxProcessInspector::new(fake.clone());

        inspector.usage(200).unwrap();
        assert!(fake.has_call("ps -o %cpu=,rss= -p 200"));
    }
}
