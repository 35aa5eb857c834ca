//! Ledger configuration.
//!
//! # Environment Variables
//!
//! All optional:
//! - `LOTLEDGER_MAX_COMMIT_RETRIES` - optimistic commit retries (default: 3)
//! - `LOTLEDGER_EXPIRY_ALERT_DAYS` - comma-separated alert thresholds in days (default: 90,30,7)
//! - `LOTLEDGER_REORDER_THRESHOLD` - reorder threshold for materials without their own
//! - `LOTLEDGER_SWEEP_INTERVAL_SECS` - maintenance sweep period (default: 3600)
//!
//! Per-material reorder thresholds are only loadable from JSON.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use lotledger_core::{MaterialId, Quantity};

pub const ENV_MAX_COMMIT_RETRIES: &str = "LOTLEDGER_MAX_COMMIT_RETRIES";
pub const ENV_EXPIRY_ALERT_DAYS: &str = "LOTLEDGER_EXPIRY_ALERT_DAYS";
pub const ENV_REORDER_THRESHOLD: &str = "LOTLEDGER_REORDER_THRESHOLD";
pub const ENV_SWEEP_INTERVAL_SECS: &str = "LOTLEDGER_SWEEP_INTERVAL_SECS";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid environment variable {0}: {1}")]
    InvalidEnvVar(String, String),
    #[error("Invalid configuration document: {0}")]
    InvalidDocument(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Commit attempts after the first one when a version check fails.
    pub max_commit_retries: u32,
    /// Days-before-expiry thresholds that raise an expiring-soon alert.
    pub expiry_alert_days: Vec<u32>,
    /// Threshold for materials without an entry in `reorder_thresholds`.
    pub default_reorder_threshold: Option<Quantity>,
    pub reorder_thresholds: HashMap<MaterialId, Quantity>,
    pub sweep_interval_secs: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_commit_retries: 3,
            expiry_alert_days: vec![90, 30, 7],
            default_reorder_threshold: None,
            reorder_thresholds: HashMap::new(),
            sweep_interval_secs: 3600,
        }
    }
}

impl LedgerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(raw) = lookup(ENV_MAX_COMMIT_RETRIES) {
            config.max_commit_retries = parse_var(ENV_MAX_COMMIT_RETRIES, &raw)?;
        }
        if let Some(raw) = lookup(ENV_EXPIRY_ALERT_DAYS) {
            config.expiry_alert_days = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| parse_var(ENV_EXPIRY_ALERT_DAYS, s))
                .collect::<Result<_, _>>()?;
        }
        if let Some(raw) = lookup(ENV_REORDER_THRESHOLD) {
            config.default_reorder_threshold = Some(parse_var(ENV_REORDER_THRESHOLD, &raw)?);
        }
        if let Some(raw) = lookup(ENV_SWEEP_INTERVAL_SECS) {
            config.sweep_interval_secs = parse_var(ENV_SWEEP_INTERVAL_SECS, &raw)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid("sweep_interval_secs must be positive".to_string()));
        }
        let negative = self
            .default_reorder_threshold
            .into_iter()
            .chain(self.reorder_thresholds.values().copied())
            .any(|t| t < 0);
        if negative {
            return Err(ConfigError::Invalid("reorder thresholds cannot be negative".to_string()));
        }
        Ok(())
    }

    pub fn reorder_threshold_for(&self, material_id: MaterialId) -> Option<Quantity> {
        self.reorder_thresholds
            .get(&material_id)
            .copied()
            .or(self.default_reorder_threshold)
    }

    /// Alert thresholds, largest first, without duplicates.
    pub fn alert_thresholds(&self) -> Vec<u32> {
        let mut days = self.expiry_alert_days.clone();
        days.sort_unstable_by(|a, b| b.cmp(a));
        days.dedup();
        days
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn parse_var<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidEnvVar(key.to_string(), e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = LedgerConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, LedgerConfig::default());
        assert_eq!(config.max_commit_retries, 3);
        assert_eq!(config.alert_thresholds(), vec![90, 30, 7]);
        assert_eq!(config.sweep_interval(), Duration::from_secs(3600));
    }

    #[test]
    fn env_values_override_defaults() {
        let config = LedgerConfig::from_lookup(lookup_from(&[
            (ENV_MAX_COMMIT_RETRIES, "5"),
            (ENV_EXPIRY_ALERT_DAYS, "7, 60 ,7"),
            (ENV_REORDER_THRESHOLD, "25"),
            (ENV_SWEEP_INTERVAL_SECS, "60"),
        ]))
        .unwrap();

        assert_eq!(config.max_commit_retries, 5);
        assert_eq!(config.alert_thresholds(), vec![60, 7]);
        assert_eq!(config.reorder_threshold_for(MaterialId::new()), Some(25));
        assert_eq!(config.sweep_interval_secs, 60);
    }

    #[test]
    fn malformed_values_are_rejected() {
        let err = LedgerConfig::from_lookup(lookup_from(&[(ENV_MAX_COMMIT_RETRIES, "many")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnvVar(ref k, _) if k == ENV_MAX_COMMIT_RETRIES));

        let err = LedgerConfig::from_lookup(lookup_from(&[(ENV_SWEEP_INTERVAL_SECS, "0")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = LedgerConfig::from_lookup(lookup_from(&[(ENV_REORDER_THRESHOLD, "-1")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn json_supports_per_material_thresholds() {
        let material = MaterialId::new();
        let json = format!(
            r#"{{"max_commit_retries": 1, "default_reorder_threshold": 10, "reorder_thresholds": {{"{material}": 40}}}}"#
        );
        let config = LedgerConfig::from_json_str(&json).unwrap();

        assert_eq!(config.max_commit_retries, 1);
        assert_eq!(config.reorder_threshold_for(material), Some(40));
        assert_eq!(config.reorder_threshold_for(MaterialId::new()), Some(10));
        assert_eq!(config.expiry_alert_days, vec![90, 30, 7]);
    }

    #[test]
    fn invalid_json_is_a_document_error() {
        assert!(matches!(
            LedgerConfig::from_json_str("{not json"),
            Err(ConfigError::InvalidDocument(_))
        ));
    }
}
