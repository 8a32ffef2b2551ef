use std::collections::HashSet;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use kasmos::cmd::SystemExecutor;
use kasmos::git::{self, plan};
use kasmos::storage::{InstanceStorage, CONFIG_DIR_ENV};
use kasmos::tmux::{discovery, sanitize_name};

/// Maintenance commands for kasmos sessions and worktrees.
#[derive(Parser)]
#[command(name = "kas")]
#[command(author, version, about = "kasmos session and worktree maintenance", long_about = None)]
struct Cli {
    /// Directory holding config.json and instances.json
    #[arg(long, env = CONFIG_DIR_ENV)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List kasmos tmux sessions, tagged managed or orphan
    Sessions,

    /// Kill kasmos tmux sessions (current and legacy prefixes)
    Cleanup {
        /// Also remove every worktree under <repo>/.worktrees
        #[arg(long)]
        repo: Option<PathBuf>,
    },

    /// Recreate a plan's branch from HEAD, dropping its worktree
    ResetPlan {
        repo: PathBuf,
        plan_file: String,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let storage = match cli.config_dir {
        Some(dir) => InstanceStorage::new_with_base(dir)?,
        None => InstanceStorage::new()?,
    };
    kasmos::init_tracing(Some(&storage.log_path()))?;

    let exec = SystemExecutor;
    match cli.command {
        Commands::Sessions => {
            let known: HashSet<String> = storage
                .saved_titles()?
                .iter()
                .map(|title| sanitize_name(title))
                .collect();
            let sessions = discovery::discover_all(&exec, &known)?;
            if sessions.is_empty() {
                println!("No kasmos sessions running");
            }
            for session in sessions {
                println!(
                    "{:<32} {:>2} windows  {:>3}x{:<3}  {}{}",
                    session.name,
                    session.windows,
                    session.cols,
                    session.rows,
                    if session.managed { "managed" } else { "orphan" },
                    if session.attached { "  (attached)" } else { "" },
                );
            }
        }
        Commands::Cleanup { repo } => {
            let killed = discovery::cleanup_sessions(&exec)?;
            println!("Killed {} tmux sessions", killed.len());
            for name in killed {
                println!("  {}", name);
            }

            if let Some(repo) = repo {
                let removed = git::cleanup_worktrees(&exec, &repo)?;
                println!("Removed {} worktrees", removed.len());
                for path in removed {
                    println!("  {}", path);
                }
            }
        }
        Commands::ResetPlan { repo, plan_file } => {
            let branch = plan::plan_branch_from_file(&plan_file);
            plan::reset_plan_branch(&exec, &repo, &branch)?;
            println!("Reset {} to HEAD", branch);
        }
    }

    Ok(())
}
