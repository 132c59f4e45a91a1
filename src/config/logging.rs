//! Logging configuration

use serde::Deserialize;
use std::path::PathBuf;

/// Runtime logging settings
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Default level when RUST_LOG is unset: "error", "warn", "info", "debug", "trace"
    pub level: String,

    /// Optional directory for a rotated log file; stdout only when unset
    pub dir: Option<PathBuf>,

    /// Emit JSON-formatted log lines instead of human-readable ones
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
            json: false,
        }
    }
}

/// Optional [logging] section of the config file
#[derive(Debug, Deserialize, Default)]
pub struct FileLogging {
    pub level: Option<String>,
    pub dir: Option<String>,
    pub json: Option<bool>,
}

impl LoggingConfig {
    pub fn from_file(file: Option<FileLogging>) -> Self {
        let file = file.unwrap_or_default();
        let defaults = Self::default();
        Self {
            level: file.level.unwrap_or(defaults.level),
            dir: file.dir.map(PathBuf::from),
            json: file.json.unwrap_or(false),
        }
    }
}
