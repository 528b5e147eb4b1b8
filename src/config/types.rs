use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::loader::get_data_dir;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecboxConfig {
    pub engine: EngineConfig,
    pub docker: DockerConfig,
    /// Language overrides and additions, keyed by language id.
    pub languages: BTreeMap<String, LanguageConfig>,
}

/// How staged files reach the execution unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum MountStrategy {
    /// Bind-mount host files from the staging root
    #[default]
    #[serde(rename = "bind")]
    #[value(name = "bind")]
    BindMount,
    /// Write files into a per-request named volume mounted at the container root
    #[serde(rename = "volume")]
    #[value(name = "volume")]
    NamedVolume,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Host directory for staged code and uploads (default: data dir `staging`)
    pub staging_root: Option<PathBuf>,
    /// Directory inside the unit where code is mounted and output is collected
    pub container_root: String,
    /// Prefix of the per-language unit name
    pub unit_prefix: String,
    /// Prefix of per-request volume names
    pub volume_prefix: String,
    /// Default mount strategy
    pub mount_strategy: MountStrategy,
    /// Deadline for one execution in seconds (0 disables it)
    pub timeout_seconds: u64,
    /// Buffered output chunks between the unit and the caller
    pub channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            staging_root: None,
            container_root: "/app".to_string(),
            unit_prefix: "code-exec-container".to_string(),
            volume_prefix: "code-exec-volume".to_string(),
            mount_strategy: MountStrategy::default(),
            timeout_seconds: 30,
            channel_capacity: 32,
        }
    }
}

impl EngineConfig {
    pub fn staging_root(&self) -> PathBuf {
        self.staging_root
            .clone()
            .unwrap_or_else(|| get_data_dir().join("staging"))
    }

    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_seconds > 0).then(|| Duration::from_secs(self.timeout_seconds))
    }
}

/// Docker-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    /// Unix socket of the daemon (default: local defaults / DOCKER_HOST)
    pub socket: Option<PathBuf>,
    /// Request timeout of the API client in seconds
    pub timeout_seconds: u64,
    /// Grace period given to a unit on stop before it is killed
    pub stop_timeout_seconds: u64,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            socket: None,
            timeout_seconds: 120,
            stop_timeout_seconds: 2,
        }
    }
}

/// One `[languages.<id>]` table. Fields left unset keep the built-in value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LanguageConfig {
    /// File extension of the staged code file
    pub extension: Option<String>,
    /// Image the unit runs
    pub image: Option<String>,
    /// Command template; `{file}` is replaced with the in-unit code path
    pub command: Option<Vec<String>>,
}
