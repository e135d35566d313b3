//! Engine-level settings.
//!
//! These are operator settings for the engine process, as opposed to the
//! mount configuration written through the `config` endpoint (see
//! [`crate::azure_config`]).

use std::collections::HashMap;
use std::time::Duration;

/// Option keys consulted when the mount configuration leaves a client
/// identifier empty, and the environment variables they are read from.
pub const FALLBACK_OPTIONS: [(&str, &str); 5] = [
    ("subscription_id", "AZURE_SUBSCRIPTION_ID"),
    ("tenant_id", "AZURE_TENANT_ID"),
    ("client_id", "AZURE_CLIENT_ID"),
    ("client_secret", "AZURE_CLIENT_SECRET"),
    ("environment", "AZURE_ENVIRONMENT"),
];

/// Configuration for creating an engine.
///
/// Use the builder pattern for ergonomic configuration:
///
/// ```
/// use azsecrets::EngineConfig;
/// use std::time::Duration;
///
/// let config = EngineConfig::new("azure")
///     .with_default_lease_ttl(Duration::from_secs(3600))
///     .with_max_lease_ttl(Duration::from_secs(24 * 3600))
///     .with_option("tenant_id", "7ac36e27-80fc-4209-a453-e8ad83dc18c2");
///
/// assert_eq!(config.mount, "azure");
/// ```
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Mount name, used in log fields and generated display names
    pub mount: String,

    /// Lease TTL when a role sets none (default: 768 hours)
    pub default_lease_ttl: Duration,

    /// Upper bound on any lease (default: 768 hours)
    pub max_lease_ttl: Duration,

    /// How often the rotation scheduler checks whether rotation is due
    /// (default: 60 seconds)
    pub rotation_check_interval: Duration,

    /// Deadline applied to control-plane calls when the caller supplies none
    /// (default: 60 seconds)
    pub request_timeout: Option<Duration>,

    /// Remove the previous root password after a successful rotation
    /// (default: true)
    pub revoke_previous_root: bool,

    /// Fallback client options (see [`FALLBACK_OPTIONS`])
    pub options: HashMap<String, String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mount: "azure".to_string(),
            default_lease_ttl: Duration::from_secs(768 * 3600),
            max_lease_ttl: Duration::from_secs(768 * 3600),
            rotation_check_interval: Duration::from_secs(60),
            request_timeout: Some(Duration::from_secs(60)),
            revoke_previous_root: true,
            options: HashMap::new(),
        }
    }
}

impl EngineConfig {
    /// Creates a configuration for the given mount with default settings.
    pub fn new(mount: impl Into<String>) -> Self {
        Self {
            mount: mount.into(),
            ..Default::default()
        }
    }

    /// Creates a configuration whose fallback options are read from the
    /// process environment (`AZURE_TENANT_ID`, `AZURE_CLIENT_ID`, ...).
    pub fn from_env(mount: impl Into<String>) -> Self {
        FALLBACK_OPTIONS
            .iter()
            .fold(Self::new(mount), |config, (key, var)| match std::env::var(var) {
                Ok(value) if !value.is_empty() => config.with_option(*key, value),
                _ => config,
            })
    }

    /// Sets the lease TTL used when a role does not set one.
    pub fn with_default_lease_ttl(mut self, ttl: Duration) -> Self {
        self.default_lease_ttl = ttl;
        self
    }

    /// Sets the maximum lease TTL.
    pub fn with_max_lease_ttl(mut self, ttl: Duration) -> Self {
        self.max_lease_ttl = ttl;
        self
    }

    /// Sets the rotation scheduler's polling interval.
    pub fn with_rotation_check_interval(mut self, interval: Duration) -> Self {
        self.rotation_check_interval = interval;
        self
    }

    /// Sets the default control-plane deadline. `None` disables it.
    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Controls removal of the previous root password after rotation.
    pub fn with_revoke_previous_root(mut self, revoke: bool) -> Self {
        self.revoke_previous_root = revoke;
        self
    }

    /// Adds a fallback client option.
    ///
    /// Recognized keys: `subscription_id`, `tenant_id`, `client_id`,
    /// `client_secret`, `environment`. Values are used only when the mount
    /// configuration leaves the corresponding field empty.
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Gets a fallback option value.
    pub fn get_option(&self, key: &str) -> Option<&String> {
        self.options.get(key)
    }

    /// Returns `value` unless empty, otherwise the fallback option `key`.
    pub(crate) fn or_option(&self, value: &str, key: &str) -> String {
        if value.is_empty() {
            self.get_option(key).cloned().unwrap_or_default()
        } else {
            value.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = EngineConfig::new("azure-prod")
            .with_default_lease_ttl(Duration::from_secs(3600))
            .with_max_lease_ttl(Duration::from_secs(7200))
            .with_request_timeout(None)
            .with_option("tenant_id", "t-1");

        assert_eq!(config.mount, "azure-prod");
        assert_eq!(config.default_lease_ttl, Duration::from_secs(3600));
        assert_eq!(config.max_lease_ttl, Duration::from_secs(7200));
        assert_eq!(config.request_timeout, None);
        assert_eq!(config.get_option("tenant_id"), Some(&"t-1".to_string()));
    }

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.mount, "azure");
        assert_eq!(config.default_lease_ttl, Duration::from_secs(2_764_800));
        assert_eq!(config.rotation_check_interval, Duration::from_secs(60));
        assert!(config.revoke_previous_root);
        assert!(config.options.is_empty());
    }

    #[test]
    fn test_or_option() {
        let config = EngineConfig::default().with_option("tenant_id", "fallback");
        assert_eq!(config.or_option("", "tenant_id"), "fallback");
        assert_eq!(config.or_option("explicit", "tenant_id"), "explicit");
        assert_eq!(config.or_option("", "subscription_id"), "");
    }
}
