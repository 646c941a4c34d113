//! Topology configuration management

use anyhow::{Context, Result, anyhow};
use common::LogFormat;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::usb::DEFAULT_SCAN_INTERVAL;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TopologyConfig {
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub scanner: ScannerSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "LoggingSettings::default_level")]
    pub level: String,
    /// Output format (pretty, compact)
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            format: LogFormat::default(),
        }
    }
}

impl LoggingSettings {
    fn default_level() -> String {
        "info".to_string()
    }
}

/// Background scanning
///
/// # Example Configuration
/// ```toml
/// [scanner]
/// interval = "250ms"
/// background = true
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerSettings {
    /// Time between two scans (e.g. "500ms", "2s", "1m")
    #[serde(default = "ScannerSettings::default_interval", with = "duration_serde")]
    pub interval: Duration,
    /// Keep scanning in the background in watch mode
    #[serde(default = "ScannerSettings::default_background")]
    pub background: bool,
}

impl Default for ScannerSettings {
    fn default() -> Self {
        Self {
            interval: Self::default_interval(),
            background: Self::default_background(),
        }
    }
}

impl ScannerSettings {
    fn default_interval() -> Duration {
        DEFAULT_SCAN_INTERVAL
    }

    fn default_background() -> bool {
        true
    }
}

/// Custom serde module for Duration
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        format_duration(*duration).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    /// Parse a duration string like "500ms", "2s", "1m30s"
    ///
    /// A bare number is taken as milliseconds.
    pub fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim().to_lowercase();
        let mut total_ms: u64 = 0;
        let mut chars = s.chars().peekable();

        if s.is_empty() {
            return Err("Empty duration".to_string());
        }

        while chars.peek().is_some() {
            let mut number = String::new();
            while let Some(c) = chars.peek().filter(|c| c.is_ascii_digit()) {
                number.push(*c);
                chars.next();
            }
            if number.is_empty() {
                return Err(format!("Invalid duration format: {}", s));
            }
            let value: u64 = number
                .parse()
                .map_err(|_| format!("Invalid number in duration: {}", number))?;

            let mut unit = String::new();
            while let Some(c) = chars.peek().filter(|c| c.is_ascii_alphabetic()) {
                unit.push(*c);
                chars.next();
            }

            let factor = match unit.as_str() {
                "" | "ms" => 1,
                "s" => 1_000,
                "m" => 60_000,
                other => return Err(format!("Invalid duration unit: {}", other)),
            };
            total_ms = value
                .checked_mul(factor)
                .and_then(|ms| total_ms.checked_add(ms))
                .ok_or_else(|| format!("Duration too large: {}", s))?;
        }

        if total_ms == 0 {
            return Err("Duration must be greater than 0".to_string());
        }

        Ok(Duration::from_millis(total_ms))
    }

    pub fn format_duration(d: Duration) -> String {
        let ms = d.as_millis();
        if ms % 60_000 == 0 && ms > 0 {
            format!("{}m", ms / 60_000)
        } else if ms % 1_000 == 0 && ms > 0 {
            format!("{}s", ms / 1_000)
        } else {
            format!("{}ms", ms)
        }
    }
}

impl TopologyConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            PathBuf::from(shellexpand::tilde(&p.to_string_lossy()).into_owned())
        } else {
            Self::candidate_paths()
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: TopologyConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    ///
    /// Running without a config file is normal and only logged at debug
    /// level; a file that exists but cannot be loaded is a warning.
    pub fn load_or_default() -> Self {
        Self::load_first_of(&Self::candidate_paths())
    }

    /// Standard locations, in lookup order
    fn candidate_paths() -> Vec<PathBuf> {
        vec![
            Self::default_path(),
            PathBuf::from("/etc/usb-topology/config.toml"),
        ]
    }

    fn load_first_of(candidates: &[PathBuf]) -> Self {
        let Some(path) = candidates.iter().find(|p| p.exists()) else {
            tracing::debug!("No configuration file found, using defaults");
            return Self::default();
        };

        match Self::load(Some(path.clone())) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {:#}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usb-topology").join("config.toml")
        } else {
            PathBuf::from(".config/usb-topology/config.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        Self::validate_log_level(&self.logging.level)?;

        if self.scanner.interval.is_zero() {
            return Err(anyhow!("Scan interval must be greater than 0"));
        }

        Ok(())
    }

    /// Validate a log level name
    pub fn validate_log_level(level: &str) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&level) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                level,
                valid_levels.join(", ")
            ));
        }
        Ok(())
    }
}
