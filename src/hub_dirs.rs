//! Centralized application directory paths.
//!
//! Uses the [`dirs`] crate for platform-appropriate directory resolution.
//!
//! # Directory Layout
//!
//! | Purpose | macOS | Linux |
//! |---------|-------|-------|
//! | App data | `~/Library/Application Support/taskhub/` | `~/.local/share/taskhub/` |
//! | Config | `~/Library/Application Support/taskhub/` | `~/.config/taskhub/` |
//!
//! # Environment Overrides
//!
//! - `TASKHUB_DATA_DIR` overrides [`data_dir`]
//! - `TASKHUB_CONFIG_DIR` overrides [`config_dir`]

use std::path::PathBuf;

/// Application data root directory.
///
/// Holds module templates, task instances, and logs.
#[must_use]
pub fn data_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("TASKHUB_DATA_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::data_dir()
        .map(|d| d.join("taskhub"))
        .unwrap_or_else(|| PathBuf::from("/tmp/taskhub-data"))
}

/// Application config directory.
#[must_use]
pub fn config_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("TASKHUB_CONFIG_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::config_dir()
        .map(|d| d.join("taskhub"))
        .unwrap_or_else(|| PathBuf::from("/tmp/taskhub-config"))
}

/// Log file directory (`data_dir()/logs/`).
#[must_use]
pub fn logs_dir() -> PathBuf {
    data_dir().join("logs")
}

/// Module template root (`data_dir()/modules/`).
#[must_use]
pub fn modules_dir() -> PathBuf {
    data_dir().join("modules")
}

/// Task instance root (`data_dir()/tasks/`).
#[must_use]
pub fn tasks_dir() -> PathBuf {
    data_dir().join("tasks")
}

/// Main config file path (`config_dir()/config.toml`).
#[must_use]
pub fn config_file() -> PathBuf {
    config_dir().join("config.toml")
}
