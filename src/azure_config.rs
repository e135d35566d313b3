//! Mount configuration: persisted record, partial updates and validation.
//!
//! The configuration is persisted as a flat record ([`StoredConfig`]) and
//! validated into a typed [`AzureConfig`] in which the authentication mode is
//! a tagged union, so a validated configuration cannot carry both a static
//! secret and a federated audience.

use crate::duration::DurationInput;
use crate::environment::{parse_environment, AzureEnvironment};
use crate::schedule::CronSchedule;
use crate::{AzSecretsError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// Storage path of the configuration record.
pub const CONFIG_PATH: &str = "config";

/// Root password lifetime applied when none is configured (6 months).
pub const DEFAULT_ROOT_PASSWORD_TTL: Duration = Duration::from_secs(15_768_000);

/// Smallest non-zero rotation window.
pub const MIN_ROTATION_WINDOW: Duration = Duration::from_secs(3600);

/// Largest rotation window (one year).
pub const MAX_ROTATION_WINDOW: Duration = Duration::from_secs(365 * 86_400);

/// Fields that belong to a different rotation contract and must not be mixed
/// with root-rotation settings.
const FOREIGN_ROTATION_FIELDS: &[&str] = &["resource"];

/// Persisted configuration record.
///
/// Durations are stored as whole seconds. `root_password_key_id` tracks the
/// root password minted by the last rotation and is never part of the read
/// view.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoredConfig {
    pub subscription_id: String,
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
    pub environment: String,
    pub root_password_ttl: u64,
    pub identity_token_audience: String,
    pub identity_token_ttl: u64,
    pub rotation_window: u64,
    pub rotation_period: u64,
    pub rotation_schedule: String,
    pub disable_automated_rotation: bool,
    pub root_password_key_id: String,
}

impl std::fmt::Debug for StoredConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredConfig")
            .field("subscription_id", &self.subscription_id)
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &redact(&self.client_secret))
            .field("environment", &self.environment)
            .field("root_password_ttl", &self.root_password_ttl)
            .field("identity_token_audience", &self.identity_token_audience)
            .field("identity_token_ttl", &self.identity_token_ttl)
            .field("rotation_window", &self.rotation_window)
            .field("rotation_period", &self.rotation_period)
            .field("rotation_schedule", &self.rotation_schedule)
            .field("disable_automated_rotation", &self.disable_automated_rotation)
            .field("root_password_key_id", &self.root_password_key_id)
            .finish()
    }
}

pub(crate) fn redact(secret: &str) -> &'static str {
    if secret.is_empty() {
        ""
    } else {
        "<redacted>"
    }
}

/// Read view of the configuration. Every key is always present; secret
/// material is never included.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigView {
    pub subscription_id: String,
    pub tenant_id: String,
    pub client_id: String,
    pub environment: String,
    pub root_password_ttl: u64,
    pub identity_token_audience: String,
    pub identity_token_ttl: u64,
    pub rotation_window: u64,
    pub rotation_period: u64,
    pub rotation_schedule: String,
    pub disable_automated_rotation: bool,
}

impl From<&StoredConfig> for ConfigView {
    fn from(s: &StoredConfig) -> Self {
        Self {
            subscription_id: s.subscription_id.clone(),
            tenant_id: s.tenant_id.clone(),
            client_id: s.client_id.clone(),
            environment: s.environment.clone(),
            root_password_ttl: s.root_password_ttl,
            identity_token_audience: s.identity_token_audience.clone(),
            identity_token_ttl: s.identity_token_ttl,
            rotation_window: s.rotation_window,
            rotation_period: s.rotation_period,
            rotation_schedule: s.rotation_schedule.clone(),
            disable_automated_rotation: s.disable_automated_rotation,
        }
    }
}

/// Partial configuration update. `None` leaves the stored value untouched.
#[derive(Clone, Default, Deserialize)]
pub struct ConfigPatch {
    pub subscription_id: Option<String>,
    pub tenant_id: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub environment: Option<String>,
    pub root_password_ttl: Option<DurationInput>,
    pub identity_token_audience: Option<String>,
    pub identity_token_ttl: Option<DurationInput>,
    pub rotation_window: Option<DurationInput>,
    pub rotation_period: Option<DurationInput>,
    pub rotation_schedule: Option<String>,
    pub disable_automated_rotation: Option<bool>,

    /// Fields this engine does not recognize.
    #[serde(flatten)]
    pub unknown: BTreeMap<String, Value>,
}

impl ConfigPatch {
    /// Decodes a request body.
    ///
    /// # Example
    ///
    /// ```
    /// use azsecrets::azure_config::ConfigPatch;
    /// use serde_json::json;
    ///
    /// let patch = ConfigPatch::from_value(json!({
    ///     "tenant_id": "t",
    ///     "root_password_ttl": "1m",
    /// })).unwrap();
    /// assert_eq!(patch.tenant_id.as_deref(), Some("t"));
    /// assert!(patch.client_id.is_none());
    /// ```
    pub fn from_value(data: Value) -> Result<Self> {
        serde_json::from_value(data)
            .map_err(|e| AzSecretsError::invalid(format!("malformed configuration: {}", e)))
    }

    /// Names of unrecognized fields, for response warnings.
    pub fn unknown_fields(&self) -> Vec<String> {
        self.unknown.keys().cloned().collect()
    }

    fn touches_rotation(&self) -> bool {
        self.rotation_period.is_some()
            || self.rotation_schedule.is_some()
            || self.rotation_window.is_some()
    }

    fn foreign_rotation_fields(&self) -> Vec<&str> {
        FOREIGN_ROTATION_FIELDS
            .iter()
            .copied()
            .filter(|f| self.unknown.contains_key(*f))
            .collect()
    }
}

/// How the engine authenticates to the control plane.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthMode {
    /// Static client secret (the root credential).
    StaticSecret {
        client_id: String,
        client_secret: String,
    },
    /// Federated workload identity token exchange.
    FederatedIdentity {
        /// Empty means "taken from the engine's fallback options".
        client_id: String,
        audience: String,
    },
    /// No credentials configured here; resolved from the environment.
    Unconfigured,
}

impl std::fmt::Debug for AuthMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StaticSecret { client_id, .. } => f
                .debug_struct("StaticSecret")
                .field("client_id", client_id)
                .field("client_secret", &"<redacted>")
                .finish(),
            Self::FederatedIdentity { client_id, audience } => f
                .debug_struct("FederatedIdentity")
                .field("client_id", client_id)
                .field("audience", audience)
                .finish(),
            Self::Unconfigured => f.write_str("Unconfigured"),
        }
    }
}

/// When automated root rotation runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotationTiming {
    /// No automated rotation; manual rotation only.
    Manual,
    /// Every `period` after the last rotation.
    Period(Duration),
    /// On a cron schedule.
    Schedule(CronSchedule),
}

/// Root credential rotation policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationPolicy {
    pub timing: RotationTiming,
    /// How long after a scheduled instant rotation may still run.
    pub window: Duration,
    pub disable_automated_rotation: bool,
}

impl RotationPolicy {
    /// Returns true when the scheduler should rotate automatically.
    pub fn is_automated(&self) -> bool {
        !self.disable_automated_rotation && self.timing != RotationTiming::Manual
    }
}

/// Validated configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AzureConfig {
    pub subscription_id: String,
    pub tenant_id: String,
    pub auth: AuthMode,
    pub environment: Option<AzureEnvironment>,
    pub root_password_ttl: Duration,
    pub identity_token_ttl: Duration,
    pub rotation: RotationPolicy,
    pub root_password_key_id: Option<String>,
}

impl AzureConfig {
    /// Validates a stored record: authentication mode, rotation policy, then
    /// environment.
    pub fn from_stored(stored: &StoredConfig) -> Result<Self> {
        let auth = auth_mode(stored)?;
        let rotation = rotation_policy(stored, &auth)?;
        let environment = parse_environment(&stored.environment)?;

        Ok(Self {
            subscription_id: stored.subscription_id.clone(),
            tenant_id: stored.tenant_id.clone(),
            auth,
            environment,
            root_password_ttl: Duration::from_secs(stored.root_password_ttl),
            identity_token_ttl: Duration::from_secs(stored.identity_token_ttl),
            rotation,
            root_password_key_id: Some(stored.root_password_key_id.clone())
                .filter(|id| !id.is_empty()),
        })
    }

    /// Returns the static root client id, if the engine owns a root secret.
    pub fn root_client_id(&self) -> Option<&str> {
        match &self.auth {
            AuthMode::StaticSecret { client_id, .. } => Some(client_id),
            _ => None,
        }
    }
}

fn auth_mode(stored: &StoredConfig) -> Result<AuthMode> {
    let has_secret = !stored.client_secret.is_empty();
    let has_audience = !stored.identity_token_audience.is_empty();

    match (has_secret, has_audience) {
        (true, true) => Err(AzSecretsError::invalid(
            "only one of client_secret or identity_token_audience can be set",
        )),
        (true, false) => {
            if stored.client_id.is_empty() {
                return Err(AzSecretsError::invalid(
                    "client_id is required when client_secret is set",
                ));
            }
            Ok(AuthMode::StaticSecret {
                client_id: stored.client_id.clone(),
                client_secret: stored.client_secret.clone(),
            })
        }
        (false, true) => Ok(AuthMode::FederatedIdentity {
            client_id: stored.client_id.clone(),
            audience: stored.identity_token_audience.clone(),
        }),
        (false, false) => {
            if !stored.client_id.is_empty() {
                return Err(AzSecretsError::invalid(
                    "client_id requires either client_secret or identity_token_audience",
                ));
            }
            Ok(AuthMode::Unconfigured)
        }
    }
}

fn rotation_policy(stored: &StoredConfig, auth: &AuthMode) -> Result<RotationPolicy> {
    let period = Duration::from_secs(stored.rotation_period);
    let window = Duration::from_secs(stored.rotation_window);
    let schedule = stored.rotation_schedule.trim();

    if !period.is_zero() && !schedule.is_empty() {
        return Err(AzSecretsError::invalid(
            "rotation_period and rotation_schedule are mutually exclusive",
        ));
    }
    if !window.is_zero() && !period.is_zero() {
        return Err(AzSecretsError::invalid(
            "rotation_window is only valid with rotation_schedule",
        ));
    }
    if !window.is_zero() && window < MIN_ROTATION_WINDOW {
        return Err(AzSecretsError::invalid(format!(
            "rotation_window must be at least {} seconds",
            MIN_ROTATION_WINDOW.as_secs()
        )));
    }
    if window > MAX_ROTATION_WINDOW {
        return Err(AzSecretsError::invalid(format!(
            "rotation_window must be at most {} seconds",
            MAX_ROTATION_WINDOW.as_secs()
        )));
    }

    let timing = if !schedule.is_empty() {
        RotationTiming::Schedule(CronSchedule::parse(schedule)?)
    } else if !period.is_zero() {
        RotationTiming::Period(period)
    } else {
        RotationTiming::Manual
    };

    let policy = RotationPolicy {
        timing,
        window,
        disable_automated_rotation: stored.disable_automated_rotation,
    };

    if policy.is_automated() && !matches!(auth, AuthMode::StaticSecret { .. }) {
        return Err(AzSecretsError::invalid(
            "automated root rotation requires client_id and client_secret",
        ));
    }

    Ok(policy)
}

/// Merges `patch` onto `base`, normalizes and validates the result.
///
/// On success returns the new record and its validated form; `base` is not
/// modified, so a failed validation leaves nothing to roll back.
pub fn merge_and_validate(
    base: &StoredConfig,
    patch: &ConfigPatch,
) -> Result<(StoredConfig, AzureConfig)> {
    let parse = |input: &Option<DurationInput>, field: &str| -> Result<Option<u64>> {
        input
            .as_ref()
            .map(|d| d.parse(field).map(|d| d.as_secs()))
            .transpose()
    };

    // (a) durations
    let root_password_ttl = parse(&patch.root_password_ttl, "root_password_ttl")?;
    let identity_token_ttl = parse(&patch.identity_token_ttl, "identity_token_ttl")?;
    let rotation_window = parse(&patch.rotation_window, "rotation_window")?;
    let rotation_period = parse(&patch.rotation_period, "rotation_period")?;

    let mut next = base.clone();
    let set = |dst: &mut String, src: &Option<String>| {
        if let Some(v) = src {
            dst.clone_from(v);
        }
    };
    set(&mut next.subscription_id, &patch.subscription_id);
    set(&mut next.tenant_id, &patch.tenant_id);
    set(&mut next.client_id, &patch.client_id);
    set(&mut next.client_secret, &patch.client_secret);
    set(&mut next.environment, &patch.environment);
    set(&mut next.identity_token_audience, &patch.identity_token_audience);
    set(&mut next.rotation_schedule, &patch.rotation_schedule);
    next.root_password_ttl = root_password_ttl.unwrap_or(next.root_password_ttl);
    next.identity_token_ttl = identity_token_ttl.unwrap_or(next.identity_token_ttl);
    next.rotation_window = rotation_window.unwrap_or(next.rotation_window);
    next.rotation_period = rotation_period.unwrap_or(next.rotation_period);
    if let Some(disabled) = patch.disable_automated_rotation {
        next.disable_automated_rotation = disabled;
    }

    // (b) defaults
    if next.root_password_ttl == 0 {
        next.root_password_ttl = DEFAULT_ROOT_PASSWORD_TTL.as_secs();
    }

    // A new static secret supplied by the operator is not one we minted.
    if patch.client_secret.is_some() && patch.client_secret.as_ref() != Some(&base.client_secret) {
        next.root_password_key_id.clear();
    }

    let foreign = patch.foreign_rotation_fields();
    if !foreign.is_empty() && patch.touches_rotation() {
        return Err(AzSecretsError::invalid(format!(
            "{} cannot be combined with root rotation settings",
            foreign.join(", ")
        )));
    }

    // (c), (d), (e)
    let validated = AzureConfig::from_stored(&next)?;
    Ok((next, validated))
}
