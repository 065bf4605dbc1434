//! Binary settings.
//!
//! Settings are loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML settings file (if specified via RSTM_CONFIG or --config)
//! 3. Environment variables

use rstm_core::EngineConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Settings for the `rstm` binary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Engine configuration passed to every demo machine.
    pub engine: EngineConfig,
    /// Demo runner configuration.
    pub demo: DemoConfig,
}

impl Settings {
    /// Loads settings from `path` (or `RSTM_CONFIG`), then applies
    /// environment variable overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, SettingsError> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os("RSTM_CONFIG").map(PathBuf::from));

        let mut settings = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        settings.apply_env_overrides();
        settings.validate()?;
        Ok(settings)
    }

    /// Loads settings from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| SettingsError::IoError(path.to_path_buf(), e))?;
        serde_yaml::from_str(&content)
            .map_err(|e| SettingsError::ParseError(path.to_path_buf(), e.to_string()))
    }

    fn apply_env_overrides(&mut self) {
        self.engine.apply_env_overrides();
        self.demo.apply_env_overrides();
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.engine.worker_name.trim().is_empty() {
            return Err(SettingsError::ValidationError(
                "engine.worker_name must not be empty".to_string(),
            ));
        }
        if self.demo.join_timeout_secs == 0 {
            return Err(SettingsError::ValidationError(
                "demo.join_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Renders the settings as YAML.
    pub fn to_yaml(&self) -> Result<String, SettingsError> {
        serde_yaml::to_string(self)
            .map_err(|e| SettingsError::ParseError(PathBuf::from("<settings>"), e.to_string()))
    }
}

/// Demo runner configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    /// How long to wait for a demo machine to terminate.
    pub join_timeout_secs: u64,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            join_timeout_secs: 10,
        }
    }
}

impl DemoConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(secs) = std::env::var("RSTM_JOIN_TIMEOUT_SECS") {
            if let Ok(secs) = secs.parse() {
                self.join_timeout_secs = secs;
            }
        }
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }
}

/// Settings error.
#[derive(Debug)]
pub enum SettingsError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for SettingsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SettingsError::IoError(path, e) => {
                write!(f, "failed to read settings file '{}': {}", path.display(), e)
            }
            SettingsError::ParseError(path, e) => {
                write!(f, "failed to parse settings file '{}': {}", path.display(), e)
            }
            SettingsError::ValidationError(msg) => {
                write!(f, "settings validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for SettingsError {}
