//! Configuration types
//!
//! Settings are plain serde structs so they can come from TOML, JSON or the
//! environment. Per-cache settings are loaded before an instance starts and
//! stay fixed while it runs.

use crate::error::{CacheError, CacheResult};
use serde::{Deserialize, Serialize};

/// Negative-marker lifetime applied when nothing else is configured.
pub const DEFAULT_NEGATIVE_CACHE_EXPIRY_SECS: u64 = 10;

/// Delay before the second eviction of a `delay_remove`.
pub const DEFAULT_DELAY_EVICTION_MILLIS: u64 = 1000;

/// Settings for one named cache instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Unique cache name; also the identity of the instance.
    pub name: String,
    /// Human readable description. Empty means "same as name".
    pub description: String,
    /// Entry lifetime in seconds, 0 = never expires.
    pub expiry_secs: u64,
    /// Count hits, negative hits and misses.
    pub stats_enabled: bool,
    /// Store negative markers for loads that found nothing.
    pub breakdown_prevention_enabled: bool,
    /// Negative marker lifetime in seconds.
    pub negative_cache_expiry_secs: u64,
    /// Delay of the second eviction in milliseconds, 0 = disabled.
    pub delay_eviction_millis: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            name: String::new(),
            description: String::new(),
            expiry_secs: 0,
            stats_enabled: false,
            breakdown_prevention_enabled: false,
            negative_cache_expiry_secs: DEFAULT_NEGATIVE_CACHE_EXPIRY_SECS,
            delay_eviction_millis: DEFAULT_DELAY_EVICTION_MILLIS,
        }
    }
}

impl CacheSettings {
    /// Create settings for the named cache with default values.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_expiry_secs(mut self, secs: u64) -> Self {
        self.expiry_secs = secs;
        self
    }

    pub fn with_stats(mut self, enabled: bool) -> Self {
        self.stats_enabled = enabled;
        self
    }

    pub fn with_breakdown_prevention(mut self, enabled: bool) -> Self {
        self.breakdown_prevention_enabled = enabled;
        self
    }

    pub fn with_negative_expiry_secs(mut self, secs: u64) -> Self {
        self.negative_cache_expiry_secs = secs;
        self
    }

    pub fn with_delay_eviction_millis(mut self, millis: u64) -> Self {
        self.delay_eviction_millis = millis;
        self
    }

    /// Description, falling back to the name.
    pub fn effective_description(&self) -> &str {
        if self.description.is_empty() {
            &self.name
        } else {
            &self.description
        }
    }

    /// Check the invariants between fields.
    pub fn validate(&self) -> CacheResult<()> {
        if self.name.trim().is_empty() {
            return Err(CacheError::invalid_argument(
                "name",
                "the name should not be null or empty",
            ));
        }
        if self.breakdown_prevention_enabled && self.negative_cache_expiry_secs == 0 {
            return Err(CacheError::invalid_argument(
                "negative_cache_expiry_secs",
                "must be larger than 0 when breakdown prevention is enabled",
            ));
        }
        Ok(())
    }

    /// Create settings for `name` from environment variables.
    ///
    /// # Environment Variables
    /// - `{PREFIX}_DESCRIPTION`: Cache description (default: name)
    /// - `{PREFIX}_EXPIRY_SECS`: Entry lifetime (default: 0, never expires)
    /// - `{PREFIX}_STATS_ENABLED`: "true" or "false" (default: false)
    /// - `{PREFIX}_BREAKDOWN_PREVENTION`: "true" or "false" (default: false)
    /// - `{PREFIX}_NEGATIVE_EXPIRY_SECS`: Negative marker lifetime (default: 10)
    /// - `{PREFIX}_DELAY_EVICTION_MILLIS`: Second eviction delay (default: 1000)
    pub fn from_env(name: impl Into<String>, prefix: &str) -> Self {
        let var = |suffix: &str| std::env::var(format!("{}_{}", prefix, suffix)).ok();
        let defaults = Self::new(name);

        Self {
            description: var("DESCRIPTION").unwrap_or_default(),
            expiry_secs: var("EXPIRY_SECS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.expiry_secs),
            stats_enabled: var("STATS_ENABLED")
                .map(|s| s.to_lowercase() == "true")
                .unwrap_or(defaults.stats_enabled),
            breakdown_prevention_enabled: var("BREAKDOWN_PREVENTION")
                .map(|s| s.to_lowercase() == "true")
                .unwrap_or(defaults.breakdown_prevention_enabled),
            negative_cache_expiry_secs: var("NEGATIVE_EXPIRY_SECS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.negative_cache_expiry_secs),
            delay_eviction_millis: var("DELAY_EVICTION_MILLIS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.delay_eviction_millis),
            ..defaults
        }
    }
}

/// Policy a registry pushes onto every cache it starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryPolicy {
    pub stats_enabled: bool,
    pub breakdown_prevention_enabled: bool,
    pub negative_cache_expiry_secs: u64,
}

impl Default for RegistryPolicy {
    fn default() -> Self {
        Self {
            stats_enabled: false,
            breakdown_prevention_enabled: false,
            negative_cache_expiry_secs: DEFAULT_NEGATIVE_CACHE_EXPIRY_SECS,
        }
    }
}

impl RegistryPolicy {
    pub fn validate(&self) -> CacheResult<()> {
        if self.negative_cache_expiry_secs < 1 {
            return Err(CacheError::invalid_argument(
                "negative_cache_expiry_secs",
                "the value should be larger than 0",
            ));
        }
        Ok(())
    }

    /// Overwrite the policy-owned fields of `settings`.
    pub fn apply_to(&self, settings: &mut CacheSettings) {
        settings.stats_enabled = self.stats_enabled;
        settings.breakdown_prevention_enabled = self.breakdown_prevention_enabled;
        settings.negative_cache_expiry_secs = self.negative_cache_expiry_secs;
    }

    /// Create a policy from environment variables.
    ///
    /// # Environment Variables
    /// - `BULWARK_STATS_ENABLED`: "true" or "false" (default: false)
    /// - `BULWARK_BREAKDOWN_PREVENTION`: "true" or "false" (default: false)
    /// - `BULWARK_NEGATIVE_EXPIRY_SECS`: Negative marker lifetime (default: 10)
    pub fn from_env() -> Self {
        let stats_enabled = std::env::var("BULWARK_STATS_ENABLED")
            .ok()
            .map(|s| s.to_lowercase() == "true")
            .unwrap_or(false);

        let breakdown_prevention_enabled = std::env::var("BULWARK_BREAKDOWN_PREVENTION")
            .ok()
            .map(|s| s.to_lowercase() == "true")
            .unwrap_or(false);

        let negative_cache_expiry_secs = std::env::var("BULWARK_NEGATIVE_EXPIRY_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|secs: &u64| *secs > 0)
            .unwrap_or(DEFAULT_NEGATIVE_CACHE_EXPIRY_SECS);

        Self {
            stats_enabled,
            breakdown_prevention_enabled,
            negative_cache_expiry_secs,
        }
    }
}

/// Declarative registry setup: one policy plus the caches to create.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub policy: RegistryPolicy,
    pub caches: Vec<CacheSettings>,
}

impl RegistryConfig {
    /// Parse and validate a TOML document.
    ///
    /// ```toml
    /// [policy]
    /// stats_enabled = true
    ///
    /// [[caches]]
    /// name = "orders"
    /// expiry_secs = 60
    /// ```
    pub fn from_toml_str(input: &str) -> CacheResult<Self> {
        let config: RegistryConfig = toml::from_str(input)
            .map_err(|e| CacheError::invalid_argument("config", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> CacheResult<()> {
        self.policy.validate()?;
        for (i, cache) in self.caches.iter().enumerate() {
            cache.validate()?;
            if self.caches[..i].iter().any(|c| c.name == cache.name) {
                return Err(CacheError::invalid_argument(
                    "caches",
                    format!("duplicate cache name {}", cache.name),
                ));
            }
        }
        Ok(())
    }

    pub fn cache(&self, name: &str) -> Option<&CacheSettings> {
        self.caches.iter().find(|c| c.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_defaults() {
        let s = CacheSettings::new("orders");
        assert_eq!(s.expiry_secs, 0);
        assert!(!s.stats_enabled);
        assert_eq!(s.negative_cache_expiry_secs, DEFAULT_NEGATIVE_CACHE_EXPIRY_SECS);
        assert_eq!(s.delay_eviction_millis, DEFAULT_DELAY_EVICTION_MILLIS);
        assert_eq!(s.effective_description(), "orders");
    }

    #[test]
    fn test_builder() {
        let s = CacheSettings::new("orders")
            .with_description("order lookups")
            .with_expiry_secs(60)
            .with_stats(true)
            .with_breakdown_prevention(true)
            .with_negative_expiry_secs(5)
            .with_delay_eviction_millis(0);
        assert_eq!(s.effective_description(), "order lookups");
        assert_eq!(s.expiry_secs, 60);
        assert!(s.stats_enabled);
        assert!(s.breakdown_prevention_enabled);
        assert_eq!(s.negative_cache_expiry_secs, 5);
        assert_eq!(s.delay_eviction_millis, 0);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_name() {
        assert!(matches!(
            CacheSettings::new(" ").validate(),
            Err(CacheError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_zero_negative_ttl_with_prevention() {
        let s = CacheSettings::new("orders")
            .with_breakdown_prevention(true)
            .with_negative_expiry_secs(0);
        assert!(s.validate().is_err());

        // Without prevention the value is never used.
        let s = s.with_breakdown_prevention(false);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_policy_apply() {
        let policy = RegistryPolicy {
            stats_enabled: true,
            breakdown_prevention_enabled: true,
            negative_cache_expiry_secs: 3,
        };
        let mut s = CacheSettings::new("orders").with_expiry_secs(60);
        policy.apply_to(&mut s);
        assert!(s.stats_enabled);
        assert!(s.breakdown_prevention_enabled);
        assert_eq!(s.negative_cache_expiry_secs, 3);
        assert_eq!(s.expiry_secs, 60);
    }

    #[test]
    fn test_policy_validate() {
        let policy = RegistryPolicy {
            negative_cache_expiry_secs: 0,
            ..RegistryPolicy::default()
        };
        assert!(policy.validate().is_err());
        assert!(RegistryPolicy::default().validate().is_ok());
    }

    #[test]
    fn test_registry_config_from_toml() {
        let input = r#"
            [policy]
            stats_enabled = true
            breakdown_prevention_enabled = true
            negative_cache_expiry_secs = 5

            [[caches]]
            name = "orders"
            expiry_secs = 60

            [[caches]]
            name = "users"
            delay_eviction_millis = 0
        "#;
        let config = RegistryConfig::from_toml_str(input).expect("valid config");
        assert!(config.policy.stats_enabled);
        assert_eq!(config.caches.len(), 2);
        assert_eq!(config.cache("orders").map(|c| c.expiry_secs), Some(60));
        assert_eq!(config.cache("users").map(|c| c.delay_eviction_millis), Some(0));
        assert!(config.cache("missing").is_none());
    }

    #[test]
    fn test_registry_config_rejects_duplicates() {
        let input = r#"
            [[caches]]
            name = "orders"

            [[caches]]
            name = "orders"
        "#;
        assert!(RegistryConfig::from_toml_str(input).is_err());
    }

    #[test]
    fn test_registry_config_rejects_bad_toml() {
        assert!(matches!(
            RegistryConfig::from_toml_str("caches = 3"),
            Err(CacheError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_settings_json_roundtrip_with_defaults() {
        let s: CacheSettings = serde_json::from_str(r#"{"name":"orders"}"#).expect("parse");
        assert_eq!(s, CacheSettings::new("orders"));
    }

    proptest! {
        #[test]
        fn prop_validate_matches_invariant(
            name in "[a-z]{0,6}",
            prevention in any::<bool>(),
            negative in 0u64..4,
        ) {
            let s = CacheSettings::new(name.clone())
                .with_breakdown_prevention(prevention)
                .with_negative_expiry_secs(negative);
            let expected = !name.is_empty() && !(prevention && negative == 0);
            prop_assert_eq!(s.validate().is_ok(), expected);
        }
    }
}
