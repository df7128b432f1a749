// Standard library imports
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

// External crate imports
use thiserror::Error;
use tracing::debug;

// Internal imports
use crate::config::PanelConfig;
use hostpanel_core::HostError;

/// Environment variable naming an alternative configuration file.
pub const CONFIG_ENV_VAR: &str = "HOSTPANEL_CONFIG";

/// Default system-wide configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/hostpanel/config.yaml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid configuration in {origin}: {message}")]
    Invalid { origin: String, message: String },
}

impl From<ConfigError> for HostError {
    fn from(err: ConfigError) -> Self {
        HostError::Config(err.to_string())
    }
}

/// Finds and loads the panel configuration.
///
/// Priority chain:
/// 1. **Explicit path:** `--config <file>`; a missing file is an error.
/// 2. **Environment:** `HOSTPANEL_CONFIG`; a missing file is an error.
/// 3. **System file:** `/etc/hostpanel/config.yaml` when it exists.
/// 4. **Built-in defaults.**
#[derive(Debug, Default)]
pub struct ConfigLoader {
    explicit: Option<PathBuf>,
    system_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_path(mut self, path: Option<PathBuf>) -> Self {
        self.explicit = path;
        self
    }

    /// Override the system-wide fallback location.
    pub fn with_system_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.system_path = Some(path.into());
        self
    }

    pub fn load(&self) -> Result<PanelConfig, ConfigError> {
        if let Some(path) = &self.explicit {
            debug!("Loading config from --config: {}", path.display());
            return Self::load_file(path);
        }

        if let Ok(value) = env::var(CONFIG_ENV_VAR) {
            if !value.trim().is_empty() {
                let path = PathBuf::from(value);
                debug!("Loading config from {}: {}", CONFIG_ENV_VAR, path.display());
                return Self::load_file(&path);
            }
        }

        let system = self
            .system_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        if system.exists() {
            debug!("Loading config from: {}", system.display());
            return Self::load_file(&system);
        }

        debug!("No configuration file found, using defaults");
        let config = PanelConfig::default();
        config.validate().map_err(|message| ConfigError::Invalid {
            origin: "defaults".to_string(),
            message,
        })?;
        Ok(config)
    }

    /// Read, parse and validate a single file.
    pub fn load_file(path: &Path) -> Result<PanelConfig, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let mut config: PanelConfig = if contents.trim().is_empty() {
            PanelConfig::default()
        } else {
            serde_yaml_ng::from_str(&contents).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?
        };

        config.validate().map_err(|message| ConfigError::Invalid {
            origin: path.display().to_string(),
            message,
        })?;

        config.source_path = Some(path.to_path_buf());
        Ok(config)
    }
}
