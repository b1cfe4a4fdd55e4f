use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::env::Env;
use crate::error::ConfigError;
use crate::money::UsdMicros;
use crate::types::Tier;

pub const DEFAULT_OPERATIONS: &[&str] = &[
    "convert", "compress", "merge", "split", "protect", "unlock", "watermark", "sign", "rotate",
    "ocr", "repair", "edit", "annotate", "extract", "redact", "organize", "chat", "remove",
];

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MeterConfig {
    pub free_monthly_quota: u32,
    pub pricing: PricingConfig,
    pub tiers: TierTable,
    pub cache: KeyCacheConfig,
    pub system_key: Option<SystemKeyConfig>,
    pub rate_limit_failure_policy: FailurePolicy,
    pub charge_timeout_ms: u64,
    /// Known operation names. `None` accepts any well-formed name.
    pub operations: Option<Vec<String>>,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            free_monthly_quota: 500,
            pricing: PricingConfig::default(),
            tiers: TierTable::default(),
            cache: KeyCacheConfig::default(),
            system_key: None,
            rate_limit_failure_policy: FailurePolicy::FailClosed,
            charge_timeout_ms: 5_000,
            operations: Some(DEFAULT_OPERATIONS.iter().map(|op| op.to_string()).collect()),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingConfig {
    pub default_unit_cost: UsdMicros,
    /// Per-operation overrides of `default_unit_cost`.
    pub operations: BTreeMap<String, UsdMicros>,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            default_unit_cost: UsdMicros::from_micros(5_000),
            operations: BTreeMap::new(),
        }
    }
}

impl PricingConfig {
    pub fn unit_cost(&self, operation: &str) -> UsdMicros {
        self.operations
            .get(operation)
            .copied()
            .unwrap_or(self.default_unit_cost)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLimits {
    /// Requests allowed per `window_seconds`. `None` disables the limiter.
    #[serde(default)]
    pub requests_per_hour: Option<u32>,
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
    /// Metered operations per calendar month. `None` means no ceiling.
    #[serde(default)]
    pub monthly_operations: Option<u64>,
}

fn default_window_seconds() -> u64 {
    3600
}

impl TierLimits {
    pub fn new(requests_per_hour: Option<u32>, monthly_operations: Option<u64>) -> Self {
        Self {
            requests_per_hour,
            window_seconds: default_window_seconds(),
            monthly_operations,
        }
    }

    pub fn unlimited() -> Self {
        Self::new(None, None)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierTable {
    pub free: TierLimits,
    pub basic: TierLimits,
    pub pro: TierLimits,
    pub enterprise: TierLimits,
}

impl Default for TierTable {
    fn default() -> Self {
        Self {
            free: TierLimits::new(Some(600), Some(1_000)),
            basic: TierLimits::new(Some(3_000), Some(10_000)),
            pro: TierLimits::new(Some(15_000), Some(100_000)),
            enterprise: TierLimits::new(Some(60_000), None),
        }
    }
}

impl TierTable {
    pub fn unlimited() -> Self {
        Self {
            free: TierLimits::unlimited(),
            basic: TierLimits::unlimited(),
            pro: TierLimits::unlimited(),
            enterprise: TierLimits::unlimited(),
        }
    }

    pub fn get(&self, tier: Tier) -> &TierLimits {
        match tier {
            Tier::Free => &self.free,
            Tier::Basic => &self.basic,
            Tier::Pro => &self.pro,
            Tier::Enterprise => &self.enterprise,
        }
    }

    pub fn get_mut(&mut self, tier: Tier) -> &mut TierLimits {
        match tier {
            Tier::Free => &mut self.free,
            Tier::Basic => &mut self.basic,
            Tier::Pro => &mut self.pro,
            Tier::Enterprise => &mut self.enterprise,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyCacheConfig {
    pub ttl_seconds: u64,
    pub cleanup_interval_seconds: u64,
    pub negative_caching: bool,
    /// Oldest entries are evicted beyond this; 0 disables caching.
    pub max_entries: usize,
}

impl Default for KeyCacheConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: 5 * 60,
            cleanup_interval_seconds: 15 * 60,
            negative_caching: true,
            max_entries: 100_000,
        }
    }
}

impl KeyCacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds.max(1))
    }
}

/// Escape hatch honored only when the credential store is unreachable.
#[derive(Clone, Serialize, Deserialize)]
pub struct SystemKeyConfig {
    pub key: String,
    pub account_id: String,
    #[serde(default = "system_key_default_tier")]
    pub tier: Tier,
}

fn system_key_default_tier() -> Tier {
    Tier::Enterprise
}

impl std::fmt::Debug for SystemKeyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemKeyConfig")
            .field("key", &"<redacted>")
            .field("account_id", &self.account_id)
            .field("tier", &self.tier)
            .finish()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Treat an unreachable limiter as a refusal.
    #[default]
    FailClosed,
    /// Let requests through when the limiter cannot be consulted.
    FailOpen,
}

impl std::str::FromStr for FailurePolicy {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim() {
            "fail_closed" | "closed" => Ok(FailurePolicy::FailClosed),
            "fail_open" | "open" => Ok(FailurePolicy::FailOpen),
            other => Err(format!("expected fail_closed or fail_open, got {other:?}")),
        }
    }
}

impl MeterConfig {
    pub fn charge_timeout(&self) -> Duration {
        Duration::from_millis(self.charge_timeout_ms.max(1))
    }

    pub fn is_known_operation(&self, operation: &str) -> bool {
        match self.operations.as_ref() {
            Some(names) if !names.is_empty() => names.iter().any(|name| name == operation),
            _ => true,
        }
    }

    /// Reads a JSON, TOML or (with `config-yaml`) YAML file, chosen by extension.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);
        match extension.as_deref() {
            Some("toml") => Self::from_toml_str(&raw),
            Some("yaml") | Some("yml") => Self::from_yaml_str(&raw),
            _ => Self::from_json_str(&raw),
        }
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(raw).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    #[cfg(feature = "config-yaml")]
    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_yaml::from_str(raw).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    #[cfg(not(feature = "config-yaml"))]
    pub fn from_yaml_str(_raw: &str) -> Result<Self, ConfigError> {
        Err(ConfigError::Parse(
            "yaml config requires the `config-yaml` feature".to_string(),
        ))
    }

    /// Applies `PDF_METER_*` overrides on top of the current values.
    pub fn apply_env(&mut self, env: &Env) -> Result<(), ConfigError> {
        if let Some(quota) = env.parse("FREE_MONTHLY_QUOTA")? {
            self.free_monthly_quota = quota;
        }
        if let Some(cost) = env.parse("UNIT_COST")? {
            self.pricing.default_unit_cost = cost;
        }
        if let Some(ttl) = env.parse("CACHE_TTL_SECONDS")? {
            self.cache.ttl_seconds = ttl;
        }
        if let Some(interval) = env.parse("CACHE_CLEANUP_INTERVAL_SECONDS")? {
            self.cache.cleanup_interval_seconds = interval;
        }
        if let Some(max_entries) = env.parse("CACHE_MAX_ENTRIES")? {
            self.cache.max_entries = max_entries;
        }
        if let Some(timeout) = env.parse("CHARGE_TIMEOUT_MS")? {
            self.charge_timeout_ms = timeout;
        }
        if let Some(policy) = env.parse("RATE_LIMIT_FAILURE_POLICY")? {
            self.rate_limit_failure_policy = policy;
        }

        for tier in Tier::ALL {
            let upper = tier.as_str().to_ascii_uppercase();
            let limits = self.tiers.get_mut(tier);
            if let Some(limit) = env.limit(&format!("{upper}_REQUESTS_PER_HOUR"))? {
                limits.requests_per_hour = limit;
            }
            if let Some(limit) = env.limit(&format!("{upper}_MONTHLY_OPERATIONS"))? {
                limits.monthly_operations = limit;
            }
        }

        if let Some(key) = env.get("SYSTEM_KEY") {
            let account_id = env
                .get("SYSTEM_ACCOUNT_ID")
                .ok_or_else(|| ConfigError::Invalid {
                    field: Env::var_name("SYSTEM_ACCOUNT_ID"),
                    reason: format!("required when {} is set", Env::var_name("SYSTEM_KEY")),
                })?;
            self.system_key = Some(SystemKeyConfig {
                key,
                account_id,
                tier: system_key_default_tier(),
            });
        }

        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pricing.default_unit_cost.is_negative() {
            return Err(ConfigError::Invalid {
                field: "pricing.default_unit_cost".to_string(),
                reason: "must not be negative".to_string(),
            });
        }
        if let Some((operation, _)) = self
            .pricing
            .operations
            .iter()
            .find(|(_, cost)| cost.is_negative())
        {
            return Err(ConfigError::Invalid {
                field: format!("pricing.operations.{operation}"),
                reason: "must not be negative".to_string(),
            });
        }
        for tier in Tier::ALL {
            if self.tiers.get(tier).window_seconds == 0 {
                return Err(ConfigError::Invalid {
                    field: format!("tiers.{tier}.window_seconds"),
                    reason: "must be positive".to_string(),
                });
            }
        }
        if let Some(system_key) = self.system_key.as_ref() {
            if system_key.key.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    field: "system_key.key".to_string(),
                    reason: "must not be empty".to_string(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_pricing() {
        let config = MeterConfig::default();
        assert_eq!(config.free_monthly_quota, 500);
        assert_eq!(config.pricing.unit_cost("compress").micros(), 5_000);
        assert_eq!(config.cache.ttl_seconds, 300);
        assert_eq!(config.cache.cleanup_interval_seconds, 900);
        assert_eq!(config.rate_limit_failure_policy, FailurePolicy::FailClosed);
        assert!(config.is_known_operation("ocr"));
        assert!(!config.is_known_operation("mine-bitcoin"));
    }

    #[test]
    fn json_config_fills_missing_fields_with_defaults() {
        let config = MeterConfig::from_json_str(
            r#"{
                "free_monthly_quota": 100,
                "pricing": { "default_unit_cost": "0.01", "operations": { "ocr": "0.02" } },
                "tiers": { "pro": { "requests_per_hour": 10 } },
                "operations": null
            }"#,
        )
        .expect("parse");
        assert_eq!(config.free_monthly_quota, 100);
        assert_eq!(config.pricing.unit_cost("merge").micros(), 10_000);
        assert_eq!(config.pricing.unit_cost("ocr").micros(), 20_000);
        assert_eq!(config.tiers.pro.requests_per_hour, Some(10));
        assert_eq!(config.tiers.pro.window_seconds, 3600);
        assert_eq!(config.tiers.pro.monthly_operations, None);
        assert_eq!(config.tiers.free, TierTable::default().free);
        assert!(config.is_known_operation("anything"));
    }

    #[test]
    fn toml_config_parses() {
        let config = MeterConfig::from_toml_str(
            r#"
            free_monthly_quota = 42
            rate_limit_failure_policy = "fail_open"

            [cache]
            ttl_seconds = 60

            [tiers.enterprise]
            requests_per_hour = 100000
            "#,
        )
        .expect("parse");
        assert_eq!(config.free_monthly_quota, 42);
        assert_eq!(config.rate_limit_failure_policy, FailurePolicy::FailOpen);
        assert_eq!(config.cache.ttl_seconds, 60);
        assert_eq!(config.cache.cleanup_interval_seconds, 900);
        assert_eq!(config.tiers.enterprise.requests_per_hour, Some(100_000));
    }

    #[test]
    fn env_overrides_take_effect() {
        let env = Env::default()
            .with_var("PDF_METER_FREE_MONTHLY_QUOTA", "10")
            .with_var("PDF_METER_UNIT_COST", "0.0025")
            .with_var("PDF_METER_BASIC_REQUESTS_PER_HOUR", "unlimited")
            .with_var("PDF_METER_FREE_MONTHLY_OPERATIONS", "20")
            .with_var("PDF_METER_SYSTEM_KEY", "sys")
            .with_var("PDF_METER_SYSTEM_ACCOUNT_ID", "ops");
        let mut config = MeterConfig::default();
        config.apply_env(&env).expect("apply");
        assert_eq!(config.free_monthly_quota, 10);
        assert_eq!(config.pricing.default_unit_cost.micros(), 2_500);
        assert_eq!(config.tiers.basic.requests_per_hour, None);
        assert_eq!(config.tiers.free.monthly_operations, Some(20));
        let system_key = config.system_key.expect("system key");
        assert_eq!(system_key.account_id, "ops");
        assert_eq!(system_key.tier, Tier::Enterprise);
    }

    #[test]
    fn invalid_env_value_is_reported_with_field_name() {
        let env = Env::default().with_var("PDF_METER_CHARGE_TIMEOUT_MS", "soon");
        let err = MeterConfig::default().apply_env(&env).unwrap_err();
        match err {
            ConfigError::Invalid { field, .. } => assert_eq!(field, "PDF_METER_CHARGE_TIMEOUT_MS"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn negative_costs_are_rejected() {
        let err = MeterConfig::from_json_str(r#"{ "pricing": { "default_unit_cost": "-1" } }"#);
        assert!(matches!(err, Err(ConfigError::Invalid { .. })));
    }
}
