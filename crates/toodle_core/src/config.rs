//! Environment-driven configuration.
//!
//! Recognized variables:
//! - `TOODLE_DB_PATH`: database file; defaults to `toodle.sqlite3` in the
//!   system temp directory.
//! - `TOODLE_LOG_LEVEL`: `trace|debug|info|warn|error`; defaults by build mode.
//! - `TOODLE_LOG_DIR`: absolute directory for rolling logs; logging stays off
//!   when unset.
//!
//! Blank values count as unset.

use crate::logging::{default_log_level, init_logging, normalize_level, LoggingError};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;

pub const DB_PATH_VAR: &str = "TOODLE_DB_PATH";
pub const LOG_LEVEL_VAR: &str = "TOODLE_LOG_LEVEL";
pub const LOG_DIR_VAR: &str = "TOODLE_LOG_DIR";
pub const DEFAULT_DB_FILE_NAME: &str = "toodle.sqlite3";

#[derive(Debug)]
pub enum ConfigError {
    InvalidValue {
        var: &'static str,
        source: LoggingError,
    },
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidValue { var, source } => write!(f, "invalid `{var}`: {source}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::InvalidValue { source, .. } => Some(source),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreConfig {
    pub db_path: PathBuf,
    pub log_level: &'static str,
    pub log_dir: Option<PathBuf>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            db_path: std::env::temp_dir().join(DEFAULT_DB_FILE_NAME),
            log_level: default_log_level(),
            log_dir: None,
        }
    }
}

impl CoreConfig {
    /// Reads configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Reads configuration through `lookup`, which maps a variable name to
    /// its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let read = |var: &str| {
            lookup(var)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let mut config = Self::default();
        if let Some(path) = read(DB_PATH_VAR) {
            config.db_path = PathBuf::from(path);
        }
        if let Some(level) = read(LOG_LEVEL_VAR) {
            config.log_level = normalize_level(&level).map_err(|source| {
                ConfigError::InvalidValue {
                    var: LOG_LEVEL_VAR,
                    source,
                }
            })?;
        }
        config.log_dir = read(LOG_DIR_VAR).map(PathBuf::from);
        Ok(config)
    }

    /// Starts logging when a directory is configured.
    ///
    /// Returns `false` when logging stays off.
    pub fn init_logging(&self) -> Result<bool, LoggingError> {
        let Some(dir) = &self.log_dir else {
            return Ok(false);
        };
        init_logging(self.log_level, &dir.to_string_lossy())?;
        Ok(true)
    }
}
