//! Configuration surface shared by the crosswire core.
//!
//! These structs are deserialized by an external loader; the core only reads
//! them. Field names follow the documented kebab-case option keys.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("threshold out of range for {0}: must be within 0.0..=1.0")]
    ThresholdOutOfRange(&'static str),
    #[error("retry-policy.max-attempts must be at least 1")]
    ZeroAttempts,
    #[error("fallback chain for {0} is empty")]
    EmptyChain(String),
}

/// Credential selection strategy applied by the pool on every acquire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionStrategy {
    FillFirst,
    RoundRobin,
    Random,
    LeastBusy,
    LowestLatency,
}

impl Default for SelectionStrategy {
    fn default() -> Self {
        SelectionStrategy::FillFirst
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RoutingConfig {
    pub strategy: SelectionStrategy,
    /// Exclude COOLDOWN/ERROR credentials from selection.
    pub health_aware: bool,
    /// Exclude DEGRADED credentials when at least one HEALTHY one exists.
    pub prefer_healthy: bool,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            strategy: SelectionStrategy::FillFirst,
            health_aware: true,
            prefer_healthy: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct HealthTrackingConfig {
    pub window_seconds: u64,
    /// Failure rate at or above which a credential is classified ERROR.
    pub failure_threshold: f64,
    /// Failure rate at or above which a credential is classified DEGRADED.
    pub degraded_threshold: f64,
    /// Minimum in-window samples before classification leaves HEALTHY.
    pub min_requests: usize,
    pub cleanup_interval_seconds: u64,
}

impl Default for HealthTrackingConfig {
    fn default() -> Self {
        Self {
            window_seconds: 60,
            failure_threshold: 0.5,
            degraded_threshold: 0.2,
            min_requests: 5,
            cleanup_interval_seconds: 120,
        }
    }
}

impl HealthTrackingConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 250,
            max_delay_ms: 10_000,
        }
    }
}

impl RetryPolicy {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// One step of a fallback chain: which provider to call and as which model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainStep {
    pub provider: String,
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub capacity: usize,
    pub ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            capacity: 256,
            ttl_seconds: 300,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

/// Root configuration for the proxy core.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct CoreConfig {
    pub routing: RoutingConfig,
    pub health_tracking: HealthTrackingConfig,
    pub retry_policy: RetryPolicy,
    /// Ordered (provider, model) fallback lists keyed by client-facing model.
    pub fallback_chains: HashMap<String, Vec<ChainStep>>,
    /// Provider used when the requested model has no fallback chain.
    pub default_provider: Option<String>,
    /// Path of the embedded usage store; `None` disables persistence.
    pub usage_db_path: Option<String>,
    pub response_cache: CacheConfig,
}

impl CoreConfig {
    /// Resolve the fallback chain for a client-facing model. Models without a
    /// configured chain route as a single step to the default provider.
    pub fn chain_for(&self, model: &str) -> Vec<ChainStep> {
        if let Some(chain) = self.fallback_chains.get(model) {
            return chain.clone();
        }
        match &self.default_provider {
            Some(provider) => vec![ChainStep {
                provider: provider.clone(),
                model: model.to_string(),
            }],
            None => Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("health-tracking.failure-threshold", self.health_tracking.failure_threshold),
            ("health-tracking.degraded-threshold", self.health_tracking.degraded_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::ThresholdOutOfRange(field));
            }
        }
        if self.retry_policy.max_attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }
        for (model, chain) in &self.fallback_chains {
            if chain.is_empty() {
                return Err(ConfigError::EmptyChain(model.clone()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_parses_kebab_case() {
        let strategy: SelectionStrategy = serde_json::from_str("\"lowest-latency\"").unwrap();
        assert_eq!(strategy, SelectionStrategy::LowestLatency);
    }

    #[test]
    fn chain_for_falls_back_to_default_provider() {
        let config = CoreConfig {
            default_provider: Some("gemini-cli".to_string()),
            ..CoreConfig::default()
        };
        let chain = config.chain_for("gemini-2.5-pro");
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].provider, "gemini-cli");
        assert_eq!(chain[0].model, "gemini-2.5-pro");
    }

    #[test]
    fn validate_rejects_bad_threshold() {
        let mut config = CoreConfig::default();
        config.health_tracking.failure_threshold = 1.5;
        assert!(config.validate().is_err());
    }
}
