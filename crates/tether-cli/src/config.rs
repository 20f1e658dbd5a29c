//! Configuration loading.
//!
//! A missing or broken config file never stops the process: it is logged and
//! the defaults are used instead.

use std::path::{Path, PathBuf};
use tether_types::config::TetherConfig;
use tracing::info;

/// Load configuration from `path`, or from `~/.tether/config.toml`.
pub fn load_config(path: Option<&Path>) -> TetherConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
        return TetherConfig::default();
    }

    match std::fs::read_to_string(&config_path) {
        Ok(contents) => match toml::from_str::<TetherConfig>(&contents) {
            Ok(config) => {
                info!(path = %config_path.display(), "Loaded configuration");
                config
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Failed to parse config, using defaults"
                );
                TetherConfig::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to read config file, using defaults"
            );
            TetherConfig::default()
        }
    }
}

/// Get the default config file path.
pub fn default_config_path() -> PathBuf {
    tether_home().join("config.toml")
}

/// Get the tether home directory.
pub fn tether_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".tether")
}
