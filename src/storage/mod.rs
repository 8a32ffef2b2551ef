use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::git::WorktreeData;
use crate::session::{AgentType, Status};

/// Overrides the config directory (tests, multiple profiles).
pub const CONFIG_DIR_ENV: &str = "KASMOS_CONFIG_DIR";

const CONFIG_FILE: &str = "config.json";
const INSTANCES_FILE: &str = "instances.json";
const LOCK_FILE: &str = "instances.lock";
const LOG_FILE: &str = "kasmos.log";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid path: {0}")]
    InvalidPath(String),
}

/// Flat, persisted form of an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceData {
    pub title: String,
    pub path: PathBuf,
    pub branch: String,
    pub status: Status,
    pub program: String,
    #[serde(default)]
    pub plan_file: String,
    #[serde(default)]
    pub agent_type: AgentType,
    #[serde(default)]
    pub implementation_complete: bool,
    #[serde(default)]
    pub wave_number: u32,
    #[serde(default)]
    pub task_number: u32,
    #[serde(default)]
    pub peer_count: u32,
    #[serde(default)]
    pub worktree: WorktreeData,
    #[serde(default)]
    pub shared_worktree: bool,
    #[serde(default)]
    pub skip_permissions: bool,
    #[serde(default)]
    pub auto_yes: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

/// Per-family launch settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramConfig {
    pub command: String,
    #[serde(default)]
    pub extra_flags: Vec<String>,
}

impl ProgramConfig {
    /// The command line handed to tmux.
    pub fn command_line(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.extra_flags.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub default_program: String,
    #[serde(default)]
    pub auto_yes: bool,
    #[serde(default)]
    pub skip_permissions: bool,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default)]
    pub programs: HashMap<String, ProgramConfig>,
}

fn default_tick_interval_ms() -> u64 {
    500
}

impl Default for AppConfig {
    fn default() -> Self {
        let mut programs = HashMap::new();
        for name in ["claude", "opencode", "aider", "gemini"] {
            programs.insert(
                name.to_string(),
                ProgramConfig {
                    command: name.to_string(),
                    extra_flags: Vec::new(),
                },
            );
        }

        Self {
            default_program: "claude".to_string(),
            auto_yes: false,
            skip_permissions: false,
            tick_interval_ms: default_tick_interval_ms(),
            programs,
        }
    }
}

impl AppConfig {
    /// Resolve a program name through `programs`; unknown names pass
    /// through as a literal command line.
    pub fn program_command(&self, name: &str) -> String {
        self.programs
            .get(name)
            .map(ProgramConfig::command_line)
            .unwrap_or_else(|| name.to_string())
    }
}

/// Config and instance state under `$HOME/.config/kasmos`.
pub struct InstanceStorage {
    base_dir: PathBuf,
}

impl InstanceStorage {
    pub fn new() -> Result<Self, StorageError> {
        Self::new_with_base(Self::config_dir()?)
    }

    /// Storage rooted at a custom directory (for testing)
    pub fn new_with_base(base_dir: PathBuf) -> Result<Self, StorageError> {
        fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir })
    }

    /// `$KASMOS_CONFIG_DIR`, else the platform config location.
    pub fn config_dir() -> Result<PathBuf, StorageError> {
        if let Ok(dir) = std::env::var(CONFIG_DIR_ENV) {
            if !dir.is_empty() {
                return Ok(PathBuf::from(dir));
            }
        }

        #[cfg(windows)]
        {
            std::env::var("APPDATA")
                .map(|p| PathBuf::from(p).join("kasmos"))
                .map_err(|_| StorageError::InvalidPath("APPDATA not set".to_string()))
        }
        #[cfg(not(windows))]
        {
            std::env::var("HOME")
                .map(|p| PathBuf::from(p).join(".config").join("kasmos"))
                .map_err(|_| StorageError::InvalidPath("HOME not set".to_string()))
        }
    }

    pub fn base_dir(&self) -> &PathBuf {
        &self.base_dir
    }

    pub fn config_path(&self) -> PathBuf {
        self.base_dir.join(CONFIG_FILE)
    }

    pub fn instances_path(&self) -> PathBuf {
        self.base_dir.join(INSTANCES_FILE)
    }

    pub fn log_path(&self) -> PathBuf {
        self.base_dir.join(LOG_FILE)
    }

    /// Load the app config, writing defaults on first use.
    pub fn load_config(&self) -> Result<AppConfig, StorageError> {
        let config_path = self.config_path();
        if !config_path.exists() {
            let default_config = AppConfig::default();
            self.save_config(&default_config)?;
            return Ok(default_config);
        }

        let json = fs::read_to_string(config_path)?;
        let config: AppConfig = serde_json::from_str(&json)?;
        Ok(config)
    }

    pub fn save_config(&self, config: &AppConfig) -> Result<(), StorageError> {
        let json = serde_json::to_string_pretty(config)?;
        fs::write(self.config_path(), json)?;
        Ok(())
    }

    fn lock(&self) -> Result<fs::File, StorageError> {
        let file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(self.base_dir.join(LOCK_FILE))?;

        // Blocks until any other kasmos process finishes its write
        file.lock_exclusive().map_err(|e| {
            StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("Failed to acquire file lock: {}", e),
            ))
        })?;
        Ok(file)
    }

    /// Instances from the last save; a missing file means none.
    pub fn load_instances(&self) -> Result<Vec<InstanceData>, StorageError> {
        let path = self.instances_path();
        if !path.exists() {
            return Ok(Vec::new());
        }

        let lock = self.lock()?;
        let json = fs::read_to_string(&path);
        let _ = lock.unlock();

        let json = json?;
        if json.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&json)?)
    }

    /// Replace the saved instance list atomically.
    pub fn save_instances(&self, instances: &[InstanceData]) -> Result<(), StorageError> {
        let json = serde_json::to_string_pretty(instances)?;
        let lock = self.lock()?;

        let result = (|| -> Result<(), StorageError> {
            let mut temp = tempfile::NamedTempFile::new_in(&self.base_dir)?;
            temp.write_all(json.as_bytes())?;
            temp.persist(self.instances_path())
                .map_err(|e| StorageError::Io(e.error))?;
            Ok(())
        })();

        let _ = lock.unlock();
        tracing::debug!("Saved {} instances to {:?}", instances.len(), self.instances_path());
        result
    }

    /// Titles of every saved instance.
    pub fn saved_titles(&self) -> Result<Vec<String>, StorageError> {
        Ok(self
            .load_instances()?
            .into_iter()
            .map(|d| d.title)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_storage() -> (InstanceStorage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let storage = InstanceStorage::new_with_base(temp_dir.path().to_path_buf()).unwrap();
        (storage, temp_dir)
    }

    fn sample(title: &str) -> InstanceData {
        InstanceData {
            title: title.to_string(),
            path: PathBuf::from("/r"),
            branch: title.to_string(),
            status: Status::Paused,
            program: "claude".to_string(),
            plan_file: "2026-01-05-auth.md".to_string(),
            agent_type: AgentType::Coder,
            implementation_complete: true,
            wave_number: 2,
            task_number: 3,
            peer_count: 4,
            worktree: WorktreeData {
                repo_path: "/r".into(),
                worktree_path: format!("/r/.worktrees/{}", title).into(),
                session_name: title.to_string(),
                branch_name: title.to_string(),
                base_commit_sha: "abc123".to_string(),
            },
            shared_worktree: false,
            skip_permissions: true,
            auto_yes: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_load_config_creates_defaults() {
        let (storage, _dir) = create_test_storage();
        assert!(!storage.config_path().exists());

        let config = storage.load_config().unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.default_program, "claude");
        assert_eq!(config.tick_interval_ms, 500);
        assert!(storage.config_path().exists());
    }

    #[test]
    fn test_config_roundtrip_and_partial_file() {
        let (storage, _dir) = create_test_storage();
        let mut config = AppConfig::default();
        config.auto_yes = true;
        config.programs.get_mut("claude").unwrap().extra_flags = vec!["--model".into(), "opus".into()];
        storage.save_config(&config).unwrap();
        assert_eq!(storage.load_config().unwrap(), config);
        assert_eq!(config.program_command("claude"), "claude --model opus");
        assert_eq!(config.program_command("codex --full-auto"), "codex --full-auto");

        fs::write(storage.config_path(), r#"{"default_program":"aider"}"#).unwrap();
        let partial = storage.load_config().unwrap();
        assert_eq!(partial.default_program, "aider");
        assert_eq!(partial.tick_interval_ms, 500);
        assert!(partial.programs.is_empty());
    }

    #[test]
    fn test_missing_instances_file_is_empty() {
        let (storage, _dir) = create_test_storage();
        assert!(storage.load_instances().unwrap().is_empty());
    }

    #[test]
    fn test_instances_roundtrip() {
        let (storage, _dir) = create_test_storage();
        let instances = vec![sample("a"), sample("b")];
        storage.save_instances(&instances).unwrap();

        assert_eq!(storage.load_instances().unwrap(), instances);
        assert_eq!(storage.saved_titles().unwrap(), vec!["a", "b"]);

        storage.save_instances(&instances[..1]).unwrap();
        assert_eq!(storage.load_instances().unwrap().len(), 1);
    }

    #[test]
    fn test_older_records_get_defaults() {
        let json = r#"[{
            "title": "old",
            "path": "/r",
            "branch": "old",
            "status": "ready",
            "program": "claude"
        }]"#;
        let (storage, _dir) = create_test_storage();
        fs::write(storage.instances_path(), json).unwrap();

        let loaded = storage.load_instances().unwrap();
        assert_eq!(loaded[0].title, "old");
        assert_eq!(loaded[0].agent_type, AgentType::Unspecified);
        assert_eq!(loaded[0].worktree, WorktreeData::default());
        assert!(!loaded[0].shared_worktree);
    }
}
