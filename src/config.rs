// Configuration File Support
//
// TOML configuration for rpsguard with environment variable overrides.
// Configuration files are loaded from $RPSGUARD_CONFIG or ~/.config/rpsguard/config.toml

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::throttle::{LookupLatency, Quota, StaticQuotaLookup, ThrottleConfig};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// Admission control configuration
    pub throttle: ThrottleConfig,

    /// In-memory quota backend used by the simulator
    pub stub: StubConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

/// A token known to the stub backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StubToken {
    pub token: String,
    pub user_id: String,
    pub max_rps: u32,
}

impl StubToken {
    fn new(token: &str, user_id: &str, max_rps: u32) -> Self {
        Self {
            token: token.to_string(),
            user_id: user_id.to_string(),
            max_rps,
        }
    }
}

/// Stub quota backend configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StubConfig {
    /// Lookup latency in milliseconds
    pub latency_ms: u64,

    /// Draw each lookup's latency uniformly below `latency_ms`
    pub randomize_latency: bool,

    /// Known tokens
    pub tokens: Vec<StubToken>,
}

impl Default for StubConfig {
    fn default() -> Self {
        Self {
            latency_ms: 300,
            randomize_latency: true,
            tokens: vec![
                StubToken::new("token-1-1", "User1", 8),
                StubToken::new("token-1-2", "User1", 8),
                StubToken::new("token-2-1", "User2", 16),
                StubToken::new("token-2-2", "User2", 16),
            ],
        }
    }
}

impl StubConfig {
    /// Latency profile of the stub backend
    pub fn latency(&self) -> LookupLatency {
        let latency = Duration::from_millis(self.latency_ms);
        match (self.latency_ms, self.randomize_latency) {
            (0, _) => LookupLatency::None,
            (_, true) => LookupLatency::UpTo(latency),
            (_, false) => LookupLatency::Fixed(latency),
        }
    }

    /// Build the stub backend
    pub fn lookup(&self) -> StaticQuotaLookup {
        let mut lookup = StaticQuotaLookup::empty().with_latency(self.latency());
        for entry in &self.tokens {
            lookup.insert(entry.token.clone(), Quota::new(entry.user_id.clone(), entry.max_rps));
        }
        lookup
    }
}

impl Config {
    /// Load configuration from the default location
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    /// If the config file does not exist, returns default configuration.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed or
    /// fails validation. If the config file does not exist, returns default
    /// configuration with environment overrides applied.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let config = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file from {:?}", path))?;

            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file from {:?}", path))?;

            tracing::info!("Loaded configuration from {:?}", path);
            config
        } else {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            Self::default()
        };

        let config = config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path
    ///
    /// `$RPSGUARD_CONFIG` when set, otherwise `~/.config/rpsguard/config.toml`
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("RPSGUARD_CONFIG") {
            return PathBuf::from(path);
        }
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home)
            .join(".config")
            .join("rpsguard")
            .join("config.toml")
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Environment variables take precedence over config file values:
    /// - RPSGUARD_LOG_LEVEL
    /// - RPSGUARD_LOG_FORMAT
    /// - RPSGUARD_STUB_LATENCY_MS
    /// - every `RPSGUARD_*` variable read by [`ThrottleConfig::with_env_overrides`]
    fn apply_env_overrides(mut self) -> Self {
        if let Ok(level) = std::env::var("RPSGUARD_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("RPSGUARD_LOG_FORMAT") {
            self.logging.format = format;
        }

        if let Ok(latency) = std::env::var("RPSGUARD_STUB_LATENCY_MS") {
            if let Ok(latency) = latency.parse::<u64>() {
                self.stub.latency_ms = latency;
            }
        }

        self.throttle = self.throttle.with_env_overrides();
        self
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                self.logging.level
            ),
        }

        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" | "compact" => {}
            _ => anyhow::bail!(
                "Invalid log format: {}. Must be one of: json, pretty, compact",
                self.logging.format
            ),
        }

        self.throttle
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid throttle configuration: {}", e))?;

        for entry in &self.stub.tokens {
            if entry.token.trim().is_empty() {
                anyhow::bail!("Stub token for user '{}' is blank", entry.user_id);
            }
            if entry.user_id.is_empty() {
                anyhow::bail!("Stub token '{}' has empty user id", entry.token);
            }
        }

        Ok(())
    }

    /// Convert log level string to tracing::Level
    pub fn log_level(&self) -> Result<tracing::Level> {
        self.logging
            .level
            .to_lowercase()
            .parse()
            .map_err(|e| anyhow::anyhow!("Failed to parse log level: {}", e))
    }
}
