//! Centralized path utilities
//!
//! All application paths in one place for consistency

use std::path::PathBuf;

use crate::constants::ui;

/// Get the forgeline config directory (~/.forgeline)
pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(ui::CONFIG_DIR_NAME)
}

/// Get the config file path (~/.forgeline/config.toml)
pub fn config_file() -> PathBuf {
    config_dir().join(ui::CONFIG_FILE_NAME)
}

/// Get the default workspace root (~/.forgeline/workspaces)
/// Cloned repositories live here, one directory per session
pub fn workspaces_dir() -> PathBuf {
    config_dir().join("workspaces")
}

/// Get the logs directory (~/.forgeline/logs)
pub fn logs_dir() -> PathBuf {
    config_dir().join("logs")
}
