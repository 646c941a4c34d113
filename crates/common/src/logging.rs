//! Logging setup and configuration

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing_subscriber::{EnvFilter, fmt as tracing_fmt, prelude::*};

/// Output format of the fmt layer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, human oriented output
    #[default]
    Pretty,
    /// Single line per event
    Compact,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Pretty => write!(f, "pretty"),
            LogFormat::Compact => write!(f, "compact"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "compact" => Ok(LogFormat::Compact),
            other => Err(crate::Error::Config(format!(
                "Unknown log format '{}', expected 'pretty' or 'compact'",
                other
            ))),
        }
    }
}

/// Build the level filter
///
/// `RUST_LOG` wins over `default_level` when it is set and valid.
pub fn build_filter(default_level: &str) -> crate::Result<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| crate::Error::Logging(format!("Invalid log filter: {}", e)))
}

/// Setup tracing subscriber for the application
///
/// Thread names are always printed: background scans run on the blocking
/// pool and are easier to tell apart from caller threads that way.
pub fn setup_logging(default_level: &str, format: LogFormat) -> crate::Result<()> {
    let filter = build_filter(default_level)?;

    let result = match format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_fmt::layer().with_thread_names(true))
            .try_init(),
        LogFormat::Compact => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_fmt::layer().compact().with_thread_names(true))
            .try_init(),
    };

    result.map_err(|e| crate::Error::Logging(format!("Failed to install subscriber: {}", e)))
}
