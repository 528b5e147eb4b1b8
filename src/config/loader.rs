use std::path::{Path, PathBuf};

use crate::config::types::ExecboxConfig;
use crate::error::{ExecboxError, Result};

/// Get the default configuration file path
pub fn get_config_path() -> PathBuf {
    if let Some(proj_dirs) = directories::ProjectDirs::from("com", "execbox", "execbox") {
        proj_dirs.config_dir().join("config.toml")
    } else {
        dirs_fallback().join(".execbox").join("config.toml")
    }
}

fn dirs_fallback() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

/// Load configuration from file, with defaults for missing values.
///
/// A missing default file yields the defaults; a missing file that was
/// asked for explicitly is an error.
pub fn load_config(config_path: Option<&Path>) -> Result<ExecboxConfig> {
    let path = match config_path {
        Some(path) => {
            if !path.exists() {
                return Err(ExecboxError::ConfigNotFound {
                    path: path.display().to_string(),
                });
            }
            path.to_path_buf()
        }
        None => get_config_path(),
    };

    if !path.exists() {
        return Ok(ExecboxConfig::default());
    }

    let content = std::fs::read_to_string(&path)?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<ExecboxConfig> {
    toml::from_str(content).map_err(|e| ExecboxError::TomlParse(e.to_string()))
}

/// Render the default configuration, as written by `execbox init`.
pub fn default_config_toml() -> Result<String> {
    toml::to_string_pretty(&ExecboxConfig::default())
        .map_err(|e| ExecboxError::Config(format!("Failed to render config: {}", e)))
}

/// Get the data directory (staging root lives below it)
pub fn get_data_dir() -> PathBuf {
    if let Some(proj_dirs) = directories::ProjectDirs::from("com", "execbox", "execbox") {
        proj_dirs.data_dir().to_path_buf()
    } else {
        dirs_fallback().join(".local").join("share").join("execbox")
    }
}
