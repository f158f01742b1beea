//! Configuration: scheduler options and application paths.
//!
//! `Config` is plain serde JSON; every section and field has a default, so a
//! partial file (or none at all) is valid. Paths follow the usual priority:
//! CLI `--config-dir` > `STACKFETCH_CONFIG_DIR` > local folder with config
//! files > platform directories.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::core::clip_player::ClipConfig;
use crate::core::prefetch::PrefetchConfig;
use crate::core::study_prefetch::StudyPrefetchConfig;
use crate::core::workers::Workers;
use crate::entities::{ConcurrencyHint, CpuHint, FixedHint};

pub const CONFIG_FILE: &str = "stackfetch.json";
pub const LOG_FILE: &str = "stackfetch.log";
const CONFIG_DIR_ENV: &str = "STACKFETCH_CONFIG_DIR";
const APP_DIR: &str = "stackfetch";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Concurrency hint; None = logical CPU count
    pub max_simultaneous_requests: Option<usize>,
    /// Loader threads; None = 3/4 of the CPUs
    pub workers: Option<usize>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_simultaneous_requests: Some(6),
            workers: None,
        }
    }
}

impl SchedulerConfig {
    pub fn hint(&self) -> Arc<dyn ConcurrencyHint> {
        match self.max_simultaneous_requests {
            Some(n) => Arc::new(FixedHint(n.max(1))),
            None => Arc::new(CpuHint),
        }
    }

    pub fn worker_threads(&self) -> usize {
        self.workers.unwrap_or_else(Workers::default_threads).max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Max resolved frames kept
    pub capacity: usize,
    /// Max pixel bytes kept
    pub max_bytes: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            max_bytes: 512 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub prefetch: PrefetchConfig,
    pub clip: ClipConfig,
    pub study: StudyPrefetchConfig,
    pub scheduler: SchedulerConfig,
    pub store: StoreConfig,
}

impl Config {
    /// Load from `path`. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let config: Config = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;
        config.warn_suspicious();
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, text)
            .with_context(|| format!("Failed to write config: {}", path.display()))
    }

    /// Values that load fine but make parts of the engine inert
    fn warn_suspicious(&self) {
        let fps = self.clip.frames_per_second;
        if !fps.is_finite() || fps == 0.0 {
            warn!("clip.frames_per_second = {} will not play", fps);
        }
        if self.store.capacity == 0 {
            warn!("store.capacity = 0: every frame is evicted on insert");
        }
        if self.prefetch.max_images_to_prefetch == Some(0) {
            warn!("prefetch.max_images_to_prefetch = 0 disables stack prefetch");
        }
    }
}

/// Configuration for overriding default application paths
#[derive(Debug, Clone, Default)]
pub struct PathConfig {
    /// Custom config directory (from CLI or ENV)
    pub config_dir: Option<PathBuf>,
}

impl PathConfig {
    /// Priority: CLI args -> ENV var (STACKFETCH_CONFIG_DIR) -> None (use defaults)
    pub fn from_env_and_cli(cli_dir: Option<PathBuf>) -> Self {
        let config_dir = cli_dir.or_else(|| std::env::var(CONFIG_DIR_ENV).ok().map(PathBuf::from));
        Self { config_dir }
    }
}

/// Path to a configuration file
///
/// Platform paths:
/// - Linux: ~/.config/stackfetch/{name}
/// - macOS: ~/Library/Application Support/stackfetch/{name}
/// - Windows: %APPDATA%\stackfetch\{name}
pub fn config_file(name: &str, config: &PathConfig) -> PathBuf {
    config_dir(config).join(name)
}

/// Path to a data file (logs, ...)
pub fn data_file(name: &str, config: &PathConfig) -> PathBuf {
    data_dir(config).join(name)
}

/// Create the configuration and data directories if missing.
pub fn ensure_dirs(config: &PathConfig) -> Result<()> {
    let config_dir = config_dir(config);
    let data_dir = data_dir(config);

    std::fs::create_dir_all(&config_dir)
        .with_context(|| format!("Failed to create config directory: {}", config_dir.display()))?;
    if data_dir != config_dir {
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;
    }
    Ok(())
}

fn has_local_config_files(dir: &Path) -> bool {
    [CONFIG_FILE, LOG_FILE].iter().any(|f| dir.join(f).exists())
}

fn resolve_dir(config: &PathConfig, platform: Option<PathBuf>) -> PathBuf {
    if let Some(dir) = &config.config_dir {
        return dir.clone();
    }
    if let Ok(current_dir) = std::env::current_dir()
        && has_local_config_files(&current_dir)
    {
        return current_dir;
    }
    platform
        .map(|dir| dir.join(APP_DIR))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn config_dir(config: &PathConfig) -> PathBuf {
    resolve_dir(config, dirs_next::config_dir())
}

fn data_dir(config: &PathConfig) -> PathBuf {
    resolve_dir(config, dirs_next::data_dir())
}
