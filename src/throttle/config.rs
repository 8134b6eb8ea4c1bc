//! Throttle Configuration
//!
//! Pool quotas, engine selection and resolver sizing.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Default guest pool quota (requests per second)
pub const DEFAULT_GUEST_RPS: u32 = 20;
/// Default unresolved-token pool quota (requests per second)
pub const DEFAULT_UNRESOLVED_RPS: u32 = 20;
/// Default resolver worker threads
pub const DEFAULT_RESOLVER_THREADS: usize = 2;
/// Default concurrent backend calls
pub const DEFAULT_MAX_IN_FLIGHT: usize = 64;
/// Longest accepted idle TTL (30 days)
pub const MAX_IDLE_TTL_SECS: u64 = 30 * 24 * 60 * 60;

/// Admission algorithm
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Algorithm {
    /// Calendar-second buckets with per-token counters
    #[default]
    FixedSecond,
    /// Rolling one-second windows keyed by user
    SlidingWindow,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::FixedSecond => "fixed-second",
            Algorithm::SlidingWindow => "sliding-window",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fixed-second" | "fixed" => Ok(Algorithm::FixedSecond),
            "sliding-window" | "sliding" => Ok(Algorithm::SlidingWindow),
            other => Err(format!(
                "Invalid algorithm: {}. Must be one of: fixed-second, sliding-window",
                other
            )),
        }
    }
}

/// Throttle configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Quota shared by all requests without a token
    pub guest_rps: u32,

    /// Quota shared by all tokens whose quota is not resolved yet
    pub unresolved_rps: u32,

    /// Admission engine
    pub algorithm: Algorithm,

    /// Worker threads of a dedicated resolver runtime
    pub resolver_threads: usize,

    /// Maximum concurrent quota backend calls
    pub max_in_flight: usize,

    /// Evict counters idle for this long. Never evicts when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_ttl_secs: Option<u64>,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            guest_rps: DEFAULT_GUEST_RPS,
            unresolved_rps: DEFAULT_UNRESOLVED_RPS,
            algorithm: Algorithm::default(),
            resolver_threads: DEFAULT_RESOLVER_THREADS,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            idle_ttl_secs: None,
        }
    }
}

impl ThrottleConfig {
    /// Create a new throttle configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Apply `RPSGUARD_*` environment variables. Unparseable values are
    /// ignored.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(val) = std::env::var("RPSGUARD_GUEST_RPS") {
            if let Ok(rps) = val.parse() {
                self.guest_rps = rps;
            }
        }

        if let Ok(val) = std::env::var("RPSGUARD_UNRESOLVED_RPS") {
            if let Ok(rps) = val.parse() {
                self.unresolved_rps = rps;
            }
        }

        if let Ok(val) = std::env::var("RPSGUARD_ALGORITHM") {
            if let Ok(algorithm) = val.parse() {
                self.algorithm = algorithm;
            }
        }

        if let Ok(val) = std::env::var("RPSGUARD_RESOLVER_THREADS") {
            if let Ok(threads) = val.parse::<usize>() {
                if threads > 0 {
                    self.resolver_threads = threads;
                }
            }
        }

        if let Ok(val) = std::env::var("RPSGUARD_MAX_IN_FLIGHT") {
            if let Ok(max) = val.parse::<usize>() {
                if max > 0 {
                    self.max_in_flight = max;
                }
            }
        }

        if let Ok(val) = std::env::var("RPSGUARD_IDLE_TTL_SECS") {
            if let Ok(ttl) = val.parse::<u64>() {
                self.idle_ttl_secs = Some(ttl).filter(|ttl| *ttl > 0);
            }
        }

        self
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), String> {
        if self.resolver_threads == 0 {
            return Err("Resolver threads must be > 0".to_string());
        }
        if self.max_in_flight == 0 {
            return Err("Max in-flight lookups must be > 0".to_string());
        }
        match self.idle_ttl_secs {
            Some(0) => return Err("Idle TTL must be > 0 seconds when set".to_string()),
            Some(ttl) if ttl > MAX_IDLE_TTL_SECS => {
                return Err(format!(
                    "Idle TTL must be at most {} seconds, got {}",
                    MAX_IDLE_TTL_SECS, ttl
                ))
            }
            _ => {}
        }
        Ok(())
    }

    /// Idle TTL, if eviction is enabled
    pub fn idle_ttl(&self) -> Option<Duration> {
        self.idle_ttl_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ThrottleConfig::default();
        assert_eq!(config.guest_rps, DEFAULT_GUEST_RPS);
        assert_eq!(config.unresolved_rps, DEFAULT_UNRESOLVED_RPS);
        assert_eq!(config.algorithm, Algorithm::FixedSecond);
        assert!(config.idle_ttl().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_algorithm_parsing() {
        assert_eq!("sliding".parse::<Algorithm>().unwrap(), Algorithm::SlidingWindow);
        assert_eq!(
            "Fixed-Second".parse::<Algorithm>().unwrap(),
            Algorithm::FixedSecond
        );
        assert!("leaky-bucket".parse::<Algorithm>().is_err());
        assert_eq!(Algorithm::SlidingWindow.to_string(), "sliding-window");
    }

    #[test]
    fn test_validation() {
        let mut config = ThrottleConfig::default();
        config.max_in_flight = 0;
        assert!(config.validate().is_err());

        let mut config = ThrottleConfig::default();
        config.idle_ttl_secs = Some(0);
        assert!(config.validate().is_err());

        let mut config = ThrottleConfig::default();
        config.resolver_threads = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_idle_ttl_upper_bound() {
        let mut config = ThrottleConfig::default();
        config.idle_ttl_secs = Some(MAX_IDLE_TTL_SECS);
        assert!(config.validate().is_ok());

        config.idle_ttl_secs = Some(MAX_IDLE_TTL_SECS + 1);
        assert!(config.validate().is_err());

        config.idle_ttl_secs = Some(u64::MAX);
        assert!(config.validate().unwrap_err().contains("at most"));
    }

    #[test]
    fn test_idle_ttl() {
        let config = ThrottleConfig {
            idle_ttl_secs: Some(30),
            ..ThrottleConfig::default()
        };
        assert_eq!(config.idle_ttl(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_config_serialization() {
        let config = ThrottleConfig {
            algorithm: Algorithm::SlidingWindow,
            ..ThrottleConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"sliding-window\""));

        let parsed: ThrottleConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }
}
