//! # riptide-config
//!
//! Configuration management for Riptide.
//!
//! Loads configuration from:
//! 1. `~/.riptide/config.toml` (global)
//! 2. `.riptide/config.toml` (project-local, overrides global)
//! 3. Environment variables (highest priority)

pub mod logging;
pub mod testing;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::debug;

/// Global config instance
static CONFIG: Lazy<RwLock<Config>> = Lazy::new(|| RwLock::new(Config::load().unwrap_or_default()));

/// Get global config (read-only)
pub fn config() -> std::sync::RwLockReadGuard<'static, Config> {
    CONFIG.read().unwrap()
}

/// Reload config from disk
pub fn reload() -> Result<(), ConfigError> {
    let new_config = Config::load()?;
    *CONFIG.write().unwrap() = new_config;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
        }
    }
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        // 1. Load global config (~/.riptide/config.toml)
        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                debug!("Loading global config from {:?}", global_path);
                let contents = std::fs::read_to_string(&global_path)?;
                config = toml::from_str(&contents)?;
            }
        }

        // 2. Load project config (.riptide/config.toml) - overrides global
        let project_path = Path::new(".riptide/config.toml");
        if project_path.exists() {
            debug!("Loading project config from {:?}", project_path);
            let contents = std::fs::read_to_string(project_path)?;
            let project_config: Config = toml::from_str(&contents)?;
            config.merge(project_config);
        }

        // 3. Apply environment variable overrides
        config.apply_env_overrides();

        Ok(config)
    }

    /// Global config path: ~/.riptide/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".riptide/config.toml"))
    }

    /// Merge another config (project overrides)
    fn merge(&mut self, other: Config) {
        // Only merge non-default values (simplified: field-wise replace)
        let defaults = EngineConfig::default();
        if other.engine.buffer_size != defaults.buffer_size {
            self.engine.buffer_size = other.engine.buffer_size;
        }
        if other.engine.max_events != defaults.max_events {
            self.engine.max_events = other.engine.max_events;
        }
        if other.engine.backlog != defaults.backlog {
            self.engine.backlog = other.engine.backlog;
        }
        if other.engine.worker_threads.is_some() {
            self.engine.worker_threads = other.engine.worker_threads;
        }
        if other.engine.fatal_policy != defaults.fatal_policy {
            self.engine.fatal_policy = other.engine.fatal_policy;
        }
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(size) = std::env::var("RIPTIDE_BUFFER_SIZE") {
            if let Ok(n) = size.parse() {
                self.engine.buffer_size = n;
            }
        }
        if let Ok(threads) = std::env::var("RIPTIDE_WORKER_THREADS") {
            if let Ok(n) = threads.parse() {
                self.engine.worker_threads = Some(n);
            }
        }
        if let Ok(policy) = std::env::var("RIPTIDE_FATAL_POLICY") {
            match policy.as_str() {
                "continue" => self.engine.fatal_policy = FatalPolicy::Continue,
                "terminate" => self.engine.fatal_policy = FatalPolicy::Terminate,
                _ => {}
            }
        }
    }

    /// Generate default config TOML string
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Config::default()).unwrap()
    }
}

/// Reactor engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Bytes requested per recv() syscall
    pub buffer_size: usize,
    /// Maximum events returned by one epoll_wait
    pub max_events: usize,
    /// Default listen(2) backlog
    pub backlog: i32,
    /// Number of reactor worker threads (None = auto)
    pub worker_threads: Option<usize>,
    /// What a worker does when event dispatch hits an unclassified OS error
    pub fatal_policy: FatalPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            buffer_size: 8192,
            max_events: 1024,
            backlog: 5,
            worker_threads: None,
            fatal_policy: FatalPolicy::default(),
        }
    }
}

/// Worker behavior when a dispatch iteration returns an unclassified error.
///
/// The reactor classifies transient and teardown-race errors inline; anything
/// else reaches this policy. `Continue` logs and keeps the worker alive,
/// `Terminate` ends that worker thread (shrinking the pool).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FatalPolicy {
    #[default]
    Continue,
    Terminate,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_engine_config() {
        let config = Config::default();
        assert_eq!(config.engine.buffer_size, 8192);
        assert_eq!(config.engine.max_events, 1024);
        assert_eq!(config.engine.backlog, 5);
        assert_eq!(config.engine.worker_threads, None);
        assert_eq!(config.engine.fatal_policy, FatalPolicy::Continue);
    }

    #[test]
    fn test_parse_engine_section() {
        let toml_str = r#"
[engine]
buffer_size = 16384
max_events = 256
backlog = 128
worker_threads = 4
fatal_policy = "terminate"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.engine.buffer_size, 16384);
        assert_eq!(config.engine.max_events, 256);
        assert_eq!(config.engine.backlog, 128);
        assert_eq!(config.engine.worker_threads, Some(4));
        assert_eq!(config.engine.fatal_policy, FatalPolicy::Terminate);
    }

    #[test]
    fn test_partial_section_keeps_defaults() {
        let toml_str = r#"
[engine]
buffer_size = 4096
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.engine.buffer_size, 4096);
        assert_eq!(config.engine.max_events, 1024);
        assert_eq!(config.engine.fatal_policy, FatalPolicy::Continue);
    }

    #[test]
    fn test_merge_prefers_project_values() {
        let mut global = Config::default();
        let mut project = Config::default();
        project.engine.worker_threads = Some(8);
        project.engine.backlog = 64;
        global.merge(project);
        assert_eq!(global.engine.worker_threads, Some(8));
        assert_eq!(global.engine.backlog, 64);
        // untouched fields stay at defaults
        assert_eq!(global.engine.buffer_size, 8192);
    }

    #[test]
    fn test_default_toml_round_trips() {
        let rendered = Config::default_toml();
        let parsed: Config = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.engine.buffer_size, 8192);
    }
}
