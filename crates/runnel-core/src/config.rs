//! Configuration resolution for runnel.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/runnel/settings.json)
//! 3. Explicit config file (e.g. `--config` on the worker binary)
//! 4. Environment variables

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Complete runnel configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub worker: WorkerConfig,
}

/// Settings for the execution manager and its polling loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Shell used to interpret commands (`<shell> -c <command>`).
    pub shell: PathBuf,
    /// Upper bound on bytes taken from one stream in one read.
    pub read_chunk_bytes: usize,
    /// Wait budget handed to each `read_output` pass by the worker loop.
    pub poll_interval_ms: u64,
    pub log_level: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            shell: PathBuf::from("/bin/sh"),
            read_chunk_bytes: 1024,
            poll_interval_ms: 100,
            log_level: "info".to_string(),
        }
    }
}

impl WorkerConfig {
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Reject settings the manager cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.read_chunk_bytes == 0 {
            return Err(Error::Config(
                "read_chunk_bytes must be greater than zero".to_string(),
            ));
        }
        if self.shell.as_os_str().is_empty() {
            return Err(Error::Config("shell must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(explicit_path: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    if let Some(global_path) = global_config_path() {
        if global_path.exists() {
            let global = load_config_file(&global_path)?;
            merge_config(&mut config, global);
        }
    }

    // An explicitly requested file must exist.
    if let Some(path) = explicit_path {
        let explicit = load_config_file(path)?;
        merge_config(&mut config, explicit);
    }

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config.worker.validate()?;

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/runnel/settings.json"))
    }
    #[cfg(not(target_os = "macos"))]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("runnel").join("settings.json"))
    }
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn merge_config(base: &mut Config, overlay: Config) {
    base.worker = overlay.worker;
}

fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(val) = lookup("RUNNEL_SHELL") {
        config.worker.shell = PathBuf::from(val);
    }
    if let Some(val) = lookup("RUNNEL_READ_CHUNK_BYTES") {
        if let Ok(n) = val.parse() {
            config.worker.read_chunk_bytes = n;
        }
    }
    if let Some(val) = lookup("RUNNEL_POLL_INTERVAL_MS") {
        if let Ok(n) = val.parse() {
            config.worker.poll_interval_ms = n;
        }
    }
    if let Some(val) = lookup("RUNNEL_LOG_LEVEL") {
        config.worker.log_level = val;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_worker_config() {
        let config = WorkerConfig::default();
        assert_eq!(config.shell, PathBuf::from("/bin/sh"));
        assert_eq!(config.read_chunk_bytes, 1024);
        assert_eq!(config.poll_interval(), Duration::from_millis(100));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"worker": {"poll_interval_ms": 250}}"#).unwrap();

        let config = load_config_file(&path).unwrap();
        assert_eq!(config.worker.poll_interval_ms, 250);
        assert_eq!(config.worker.read_chunk_bytes, 1024);
        assert_eq!(config.worker.log_level, "info");
    }

    #[test]
    fn malformed_file_is_config_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();

        let err = load_config_file(&path).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn missing_explicit_file_is_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let result = load_config(Some(&dir.path().join("absent.json")));
        assert!(result.is_err());
    }

    #[test]
    fn env_overrides_apply_and_ignore_garbage() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("RUNNEL_SHELL", "/bin/bash"),
            ("RUNNEL_READ_CHUNK_BYTES", "not-a-number"),
            ("RUNNEL_POLL_INTERVAL_MS", "20"),
        ]);
        let mut config = Config::default();
        apply_env_overrides(&mut config, |key| vars.get(key).map(ToString::to_string));

        assert_eq!(config.worker.shell, PathBuf::from("/bin/bash"));
        assert_eq!(config.worker.read_chunk_bytes, 1024);
        assert_eq!(config.worker.poll_interval_ms, 20);
    }

    #[test]
    fn zero_chunk_size_rejected() {
        let config = WorkerConfig {
            read_chunk_bytes: 0,
            ..WorkerConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}
