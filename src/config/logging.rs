//! Logging configuration

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing_subscriber::EnvFilter;

/// Log output format
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

/// Log severity level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    /// Level selected by `-v` flags, never quieter than `self`
    pub fn with_verbosity(self, verbose: u8) -> Self {
        match verbose {
            0 => self,
            1 => self.min(Self::Debug),
            _ => Self::Trace,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: LogLevel,
}

fn default_log_format() -> LogFormat {
    LogFormat::Text
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Text,
            level: LogLevel::Info,
        }
    }
}

impl LoggingConfig {
    /// Install the global tracing subscriber.
    ///
    /// `RUST_LOG` takes precedence over the configured level.
    pub fn init(&self, verbose: u8) -> anyhow::Result<()> {
        let level = self.level.with_verbosity(verbose);
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(level.as_str()));

        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false);

        match self.format {
            LogFormat::Text => builder
                .try_init()
                .map_err(|e| anyhow::anyhow!("Failed to install log subscriber: {}", e)),
            LogFormat::Json => builder
                .json()
                .try_init()
                .map_err(|e| anyhow::anyhow!("Failed to install log subscriber: {}", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_only_lowers_level() {
        assert_eq!(LogLevel::Info.with_verbosity(0), LogLevel::Info);
        assert_eq!(LogLevel::Info.with_verbosity(1), LogLevel::Debug);
        assert_eq!(LogLevel::Trace.with_verbosity(1), LogLevel::Trace);
        assert_eq!(LogLevel::Error.with_verbosity(3), LogLevel::Trace);
    }
}
