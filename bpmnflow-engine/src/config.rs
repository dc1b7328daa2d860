//! Engine configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via BPMNFLOW_CONFIG)
//! 3. Environment variables

use bpmnflow_core::Timeouts;
use bpmnflow_storage::SnapshotPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Snapshot configuration.
    pub snapshot: SnapshotConfig,
    /// Instance timeouts.
    pub instance: InstanceConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("BPMNFLOW_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Self::from_yaml(&content).map_err(|e| ConfigError::ParseError(path.to_path_buf(), e))
    }

    fn from_yaml(content: &str) -> Result<Self, String> {
        serde_yaml::from_str(content).map_err(|e| e.to_string())
    }

    fn apply_env_overrides(&mut self) {
        self.storage.apply_env_overrides();
        self.snapshot.apply_env_overrides();
        self.instance.apply_env_overrides();
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage.backend == StoreBackend::File
            && self.storage.data_dir.as_os_str().is_empty()
        {
            return Err(ConfigError::ValidationError(
                "file backend requires storage.data_dir".to_string(),
            ));
        }
        Ok(())
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }
}

/// Durable store backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// In-memory; history is lost when the process exits.
    Memory,
    /// One directory per instance under `data_dir`.
    File,
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StoreBackend,
    /// Data directory for the file backend.
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::File,
            data_dir: PathBuf::from("./data"),
        }
    }
}

impl StorageConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("BPMNFLOW_DATA") {
            self.data_dir = PathBuf::from(dir);
        }

        if let Ok(backend) = std::env::var("BPMNFLOW_STORE") {
            match backend.to_lowercase().as_str() {
                "memory" => self.backend = StoreBackend::Memory,
                "file" => self.backend = StoreBackend::File,
                other => tracing::warn!("Ignoring unknown BPMNFLOW_STORE value '{}'", other),
            }
        }
    }

    /// Returns the instances directory path.
    pub fn instances_dir(&self) -> PathBuf {
        self.data_dir.join("instances")
    }
}

/// Snapshot configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Write a fresh snapshot after this many events (0 = every persist).
    pub events_threshold: u64,
}

impl SnapshotConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(events) = std::env::var("BPMNFLOW_SNAPSHOT_EVENTS") {
            if let Ok(n) = events.parse() {
                self.events_threshold = n;
            }
        }
    }

    pub fn policy(&self) -> SnapshotPolicy {
        SnapshotPolicy::from_threshold(self.events_threshold)
    }
}

/// Instance quiescence timeouts (0 = no timeout).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    /// Seconds an instance may stay `created` without progress.
    pub created_timeout_secs: u64,
    /// Seconds an instance may stay `running` without progress.
    pub running_timeout_secs: u64,
}

impl InstanceConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(timeout) = std::env::var("BPMNFLOW_CREATED_TIMEOUT") {
            if let Ok(secs) = timeout.parse() {
                self.created_timeout_secs = secs;
            }
        }

        if let Ok(timeout) = std::env::var("BPMNFLOW_RUNNING_TIMEOUT") {
            if let Ok(secs) = timeout.parse() {
                self.running_timeout_secs = secs;
            }
        }
    }

    pub fn timeouts(&self) -> Timeouts {
        let secs = |n: u64| (n > 0).then(|| Duration::from_secs(n));
        Timeouts {
            created: secs(self.created_timeout_secs),
            running: secs(self.running_timeout_secs),
        }
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
