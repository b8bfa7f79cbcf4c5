//! Configuration management for tokfork.
//!
//! Loads configuration from ${TOKFORK_HOME}/config.toml with sensible defaults.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::layout::LayoutConfig;

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter directive (e.g. "info", "tokfork_core=debug").
    pub level: String,
    /// Log to a file under `$TOKFORK_HOME/logs` instead of stderr.
    pub file: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Last successfully loaded model.
    pub model_path: Option<PathBuf>,
    /// Overrides the sample settings location.
    pub settings_file: Option<PathBuf>,
    pub layout: LayoutConfig,
    pub log: LogConfig,
}

/// Default config template with comments.
fn default_config_template() -> &'static str {
    include_str!("../default_config.toml")
}

pub mod paths {
    //! Path resolution for tokfork configuration and data directories.
    //!
    //! TOKFORK_HOME resolution order:
    //! 1. TOKFORK_HOME environment variable (if set)
    //! 2. ~/.config/tokfork (default)

    use std::path::PathBuf;

    pub fn tokfork_home() -> PathBuf {
        if let Ok(home) = std::env::var("TOKFORK_HOME") {
            return PathBuf::from(home);
        }

        dirs::home_dir()
            .map(|h| h.join(".config"))
            .or_else(dirs::config_dir)
            .unwrap_or_default()
            .join("tokfork")
    }

    pub fn config_path() -> PathBuf {
        tokfork_home().join("config.toml")
    }

    /// Default location of the persisted sample settings.
    pub fn settings_path() -> PathBuf {
        tokfork_home().join("settings.json")
    }

    pub fn log_dir() -> PathBuf {
        tokfork_home().join("logs")
    }
}

impl Config {
    /// Loads configuration from the default path.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        Self::load_from(&paths::config_path())
    }

    /// Loads configuration from a specific path.
    /// Returns defaults if file doesn't exist.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config from {}", path.display()))
        } else {
            Ok(Config::default())
        }
    }

    /// Where sample settings are stored: `settings_file` or the default.
    pub fn settings_path(&self) -> PathBuf {
        self.settings_file
            .clone()
            .unwrap_or_else(paths::settings_path)
    }

    /// Remembers the last loaded model in the default config file.
    ///
    /// # Errors
    /// Returns an error if the config cannot be read, parsed or written.
    pub fn save_model_path(model: &Path) -> Result<()> {
        Self::save_model_path_to(&paths::config_path(), model)
    }

    /// Sets `model_path` in a specific config file.
    ///
    /// Creates the file from the template if it doesn't exist. Other fields
    /// and comments are preserved.
    ///
    /// # Errors
    /// Returns an error if the config cannot be read, parsed or written.
    pub fn save_model_path_to(path: &Path, model: &Path) -> Result<()> {
        use toml_edit::{DocumentMut, value};

        let contents = if path.exists() {
            fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?
        } else {
            default_config_template().to_string()
        };

        let mut doc: DocumentMut = contents
            .parse()
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;
        doc["model_path"] = value(model.to_string_lossy().as_ref());

        Self::write_config(path, &doc.to_string())
    }

    /// Writes the commented default config.
    ///
    /// # Errors
    /// Fails if the file already exists or cannot be written.
    pub fn init(path: &Path) -> Result<()> {
        if path.exists() {
            anyhow::bail!("Config file already exists at {}", path.display());
        }

        Self::write_config(path, default_config_template())
    }

    /// Writes config content, creating parent directories as needed.
    /// Uses a temp file and rename so a failed write never truncates the config.
    fn write_config(path: &Path, content: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        let tmp_path = path.with_extension("toml.tmp");
        fs::write(&tmp_path, content)
            .with_context(|| format!("Failed to write config to {}", tmp_path.display()))?;
        fs::rename(&tmp_path, path).with_context(|| {
            format!(
                "Failed to rename {} to {}",
                tmp_path.display(),
                path.display()
            )
        })?;

        Ok(())
    }
}
