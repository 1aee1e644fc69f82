//! Service configuration, loaded from YAML.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::FixedOffset;
use serde::Deserialize;
use thiserror::Error;

use crate::model::Coupon;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub ledger: LedgerConfig,
    pub rate_limit: RateLimitConfig,
    pub quota: QuotaConfig,
    /// Coupons seeded into the store at startup.
    pub coupons: Vec<Coupon>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Retries of an optimistic commit that lost a race, on top of the first attempt.
    pub max_retries: u32,
    pub store_timeout_ms: u64,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            store_timeout_ms: 2_000,
            retry_base_delay_ms: 2,
            retry_max_delay_ms: 50,
        }
    }
}

impl LedgerConfig {
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RateLimitRule {
    pub limit: u32,
    pub window_ms: u64,
}

impl RateLimitRule {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

impl Default for RateLimitRule {
    fn default() -> Self {
        Self {
            limit: 60,
            window_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Rule for endpoints absent from `endpoints`.
    pub default: RateLimitRule,
    pub endpoints: HashMap<String, RateLimitRule>,
    /// Chance that a request triggers a sweep of expired windows.
    pub prune_probability: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default: RateLimitRule::default(),
            endpoints: HashMap::new(),
            prune_probability: 0.01,
        }
    }
}

impl RateLimitConfig {
    pub fn rule_for(&self, endpoint: &str) -> RateLimitRule {
        self.endpoints
            .get(endpoint)
            .copied()
            .unwrap_or(self.default)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Actions allowed per (user, counterparty) per service-local day.
    pub daily_limit: u32,
    /// Offset of the service-local day from UTC.
    pub utc_offset_minutes: i32,
    /// Counters older than this many days are removed by cleanup.
    pub retention_days: u32,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            daily_limit: 10,
            utc_offset_minutes: 0,
            retention_days: 30,
        }
    }
}

impl QuotaConfig {
    pub fn offset(&self) -> Result<FixedOffset, ConfigError> {
        FixedOffset::east_opt(self.utc_offset_minutes * 60).ok_or_else(|| {
            ConfigError::Invalid(format!(
                "quota.utc_offset_minutes {} out of range",
                self.utc_offset_minutes
            ))
        })
    }
}

impl Config {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&yaml)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let rules = std::iter::once(("default", &self.rate_limit.default)).chain(
            self.rate_limit
                .endpoints
                .iter()
                .map(|(name, rule)| (name.as_str(), rule)),
        );
        for (name, rule) in rules {
            if rule.limit == 0 || rule.window_ms == 0 {
                return Err(ConfigError::Invalid(format!(
                    "rate limit rule {name} needs a positive limit and window"
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.rate_limit.prune_probability) {
            return Err(ConfigError::Invalid(
                "rate_limit.prune_probability must be within [0, 1]".to_string(),
            ));
        }
        if self.quota.daily_limit == 0 {
            return Err(ConfigError::Invalid(
                "quota.daily_limit must be positive".to_string(),
            ));
        }
        self.quota.offset()?;
        if self.ledger.store_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "ledger.store_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
