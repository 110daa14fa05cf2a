//! Pipeline configuration.
//!
//! Loaded from JSON, first match wins:
//! 1. `--config FILE` on the command line
//! 2. `SEQLOAD_CONFIG` environment variable
//! 3. `<platform config dir>/seqload/seqload.json` (if it exists)
//! 4. Built-in defaults
//!
//! Missing fields fall back to their defaults, so a file may set only what it changes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::core::workers::IdleMode;
use crate::error::PipelineError;

/// Environment variable naming a config file
pub const CONFIG_ENV: &str = "SEQLOAD_CONFIG";
const CONFIG_FILE: &str = "seqload.json";
const APP_DIR: &str = "seqload";

/// Worker idle strategy as written in config files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IdleStrategy {
    /// Sleep `poll_interval_ms` between looks at the queue
    #[default]
    Poll,
    /// Block until new work is enqueued
    Wait,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub idle_mode: IdleStrategy,
    pub poll_interval_ms: u64,
    /// Skip sniffing and decode every still with the generic decoder
    pub force_generic: bool,
    /// Invalidate frames when their source file changes
    pub watch_files: bool,
    /// Retained entries before completed ones are evicted, 0 = unbounded
    pub cache_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            idle_mode: IdleStrategy::Poll,
            poll_interval_ms: 10,
            force_generic: false,
            watch_files: true,
            cache_capacity: 0,
        }
    }
}

impl PipelineConfig {
    pub fn idle(&self) -> IdleMode {
        match self.idle_mode {
            IdleStrategy::Poll => IdleMode::Poll(Duration::from_millis(self.poll_interval_ms.max(1))),
            IdleStrategy::Wait => IdleMode::Wait,
        }
    }

    pub fn from_json(json: &str) -> Result<Self, PipelineError> {
        serde_json::from_str(json).map_err(|e| PipelineError::Config(e.to_string()))
    }

    pub fn from_file(path: &Path) -> Result<Self, PipelineError> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| PipelineError::Config(format!("{}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&json)
            .map_err(|e| PipelineError::Config(format!("{}: {}", path.display(), e)))?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Resolve and load the config file; an explicit path must exist
    pub fn load(explicit: Option<&Path>) -> Result<Self, PipelineError> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Self::from_file(Path::new(&path));
        }
        match default_config_path() {
            Some(path) if path.is_file() => Self::from_file(&path),
            _ => {
                debug!("No config file, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn to_json(&self) -> Result<String, PipelineError> {
        serde_json::to_string_pretty(self).map_err(|e| PipelineError::Config(e.to_string()))
    }
}

/// `<platform config dir>/seqload/seqload.json`
pub fn default_config_path() -> Option<PathBuf> {
    dirs_next::config_dir().map(|dir| dir.join(APP_DIR).join(CONFIG_FILE))
}
