//! Root credential rotation.
//!
//! A rotation mints a new password on the root application, proves it
//! authenticates, commits it to the configuration and only then removes the
//! previous password. Until the commit the old secret stays in use, so a
//! failed rotation never leaves the engine without a working credential.

use crate::azure_config::{AzureConfig, RotationPolicy, RotationTiming};
use crate::client::ClientResolver;
use crate::config_store::ConfigStore;
use crate::context::RequestContext;
use crate::{AzSecretsError, EngineConfig, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Rotation lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationState {
    Active,
    Rotating,
    /// The last rotation failed; the previous credential is still in use.
    RotationFailed,
}

/// What started a rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationTrigger {
    /// Explicit `rotate-root` request; always runs.
    Manual,
    /// Scheduler; a no-op unless automated rotation is configured.
    Scheduled,
}

/// Observable rotation status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RotationStatus {
    pub state: RotationState,
    pub last_rotated: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub next_rotation: Option<DateTime<Utc>>,
}

/// Result of a completed rotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RotationReport {
    pub key_id: String,
    pub expires_at: DateTime<Utc>,
    pub previous_key_id: Option<String>,
}

/// Next time automated rotation is due after a rotation at `last`.
///
/// For schedules with a window, instants that ended more than `window`
/// before `now` are skipped.
///
/// # Example
///
/// ```
/// use azsecrets::azure_config::{RotationPolicy, RotationTiming};
/// use azsecrets::rotation::next_rotation;
/// use chrono::{TimeZone, Utc};
/// use std::time::Duration;
///
/// let policy = RotationPolicy {
///     timing: RotationTiming::Period(Duration::from_secs(3600)),
///     window: Duration::ZERO,
///     disable_automated_rotation: false,
/// };
/// let last = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
/// assert_eq!(
///     next_rotation(&policy, last, last),
///     Some(Utc.with_ymd_and_hms(2026, 1, 1, 1, 0, 0).unwrap())
/// );
/// ```
pub fn next_rotation(
    policy: &RotationPolicy,
    last: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if !policy.is_automated() {
        return None;
    }
    match &policy.timing {
        RotationTiming::Manual => None,
        RotationTiming::Period(period) => {
            let period = chrono::Duration::from_std(*period).ok()?;
            last.checked_add_signed(period)
        }
        RotationTiming::Schedule(schedule) => {
            let mut next = schedule.next_after(last)?;
            if policy.window.is_zero() {
                return Some(next);
            }
            let window = chrono::Duration::from_std(policy.window).ok()?;
            while next.checked_add_signed(window)? < now {
                next = schedule.next_after(next)?;
            }
            Some(next)
        }
    }
}

/// Runs rotations one at a time and tracks their status.
pub struct RotationEngine {
    configs: Arc<ConfigStore>,
    clients: Arc<ClientResolver>,
    engine: EngineConfig,
    gate: Mutex<()>,
    status: RwLock<RotationStatus>,
    started_at: DateTime<Utc>,
}

impl RotationEngine {
    pub fn new(configs: Arc<ConfigStore>, clients: Arc<ClientResolver>, engine: EngineConfig) -> Self {
        Self {
            configs,
            clients,
            engine,
            gate: Mutex::new(()),
            status: RwLock::new(RotationStatus {
                state: RotationState::Active,
                last_rotated: None,
                last_error: None,
                next_rotation: None,
            }),
            started_at: Utc::now(),
        }
    }

    /// Current status.
    pub async fn status(&self) -> RotationStatus {
        self.status.read().await.clone()
    }

    /// Rotates the root credential.
    ///
    /// Concurrent calls are serialized; a waiting call runs against the
    /// configuration committed by the one before it. Returns `None` when a
    /// scheduled trigger finds automated rotation disabled.
    #[instrument(skip(self, ctx), fields(mount = %self.engine.mount))]
    pub async fn rotate(
        &self,
        ctx: &RequestContext,
        trigger: RotationTrigger,
    ) -> Result<Option<RotationReport>> {
        let _gate = self.gate.lock().await;

        let config = self.configs.load_validated().await?;
        if trigger == RotationTrigger::Scheduled && !config.rotation.is_automated() {
            debug!("automated rotation not configured");
            return Ok(None);
        }

        self.status.write().await.state = RotationState::Rotating;
        let result = self.rotate_locked(ctx, &config).await;

        let mut status = self.status.write().await;
        match &result {
            Ok(report) => {
                let now = Utc::now();
                status.state = RotationState::Active;
                status.last_rotated = Some(now);
                status.last_error = None;
                status.next_rotation = next_rotation(&config.rotation, now, now);
                info!(key_id = %report.key_id, "root credential rotated");
            }
            Err(e) => {
                status.state = RotationState::RotationFailed;
                status.last_error = Some(e.to_string());
                warn!(error = %e, "root credential rotation failed");
            }
        }
        result.map(Some)
    }

    async fn rotate_locked(&self, ctx: &RequestContext, config: &AzureConfig) -> Result<RotationReport> {
        let client_id = config.root_client_id().ok_or_else(|| {
            AzSecretsError::invalid("root rotation requires client_id and client_secret")
        })?;

        let client = self.clients.client(ctx).await?;
        let app = ctx
            .run("look up root application", client.application_by_app_id(client_id))
            .await?;

        let now = Utc::now();
        let expires_at = chrono::Duration::from_std(config.root_password_ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let display_name = format!("{}-root-{}", self.engine.mount, now.format("%Y%m%dT%H%M%SZ"));
        let password = ctx
            .run(
                "add root password",
                client.add_password(&app.object_id, &display_name, expires_at),
            )
            .await?;
        debug!(key_id = %password.key_id, "new root password added");

        let committed = async {
            let settings = self
                .clients
                .settings()
                .await?
                .with_client_secret(client_id, &password.secret);
            let fresh = self.clients.build(&settings, ctx).await?;
            ctx.run("verify new root password", fresh.check_access())
                .await?;
            let previous = self
                .configs
                .commit_root_secret(client_id, &password.secret, &password.key_id)
                .await?;
            Ok::<_, AzSecretsError>((fresh, previous))
        }
        .await;

        let (fresh, previous) = match committed {
            Ok(v) => v,
            Err(e) => {
                let cleanup = RequestContext::new().or_timeout(self.engine.request_timeout);
                if let Err(err) = cleanup
                    .run(
                        "remove unused root password",
                        client.remove_password(&app.object_id, &password.key_id),
                    )
                    .await
                {
                    warn!(error = %err, key_id = %password.key_id, "failed to remove unused root password");
                }
                return Err(e);
            }
        };

        self.clients.invalidate().await;

        if let (true, Some(previous)) = (self.engine.revoke_previous_root, &previous) {
            let cleanup = RequestContext::new().or_timeout(self.engine.request_timeout);
            match cleanup
                .run(
                    "remove previous root password",
                    fresh.remove_password(&app.object_id, previous),
                )
                .await
            {
                Ok(()) | Err(AzSecretsError::NotFound(_)) => {
                    debug!(key_id = %previous, "previous root password removed")
                }
                Err(e) => warn!(error = %e, key_id = %previous, "failed to remove previous root password"),
            }
        }

        Ok(RotationReport {
            key_id: password.key_id,
            expires_at,
            previous_key_id: previous,
        })
    }

    /// Runs a scheduled rotation if one is due at `now`.
    ///
    /// Returns true when a rotation ran and succeeded.
    pub async fn tick(&self, now: DateTime<Utc>, ctx: &RequestContext) -> bool {
        let config = match self.configs.load_validated().await {
            Ok(config) => config,
            Err(e) => {
                debug!(error = %e, "skipping rotation check");
                return false;
            }
        };

        let last = self.status.read().await.last_rotated.unwrap_or(self.started_at);
        let next = next_rotation(&config.rotation, last, now);
        self.status.write().await.next_rotation = next;

        match next {
            Some(due) if due <= now => {
                matches!(self.rotate(ctx, RotationTrigger::Scheduled).await, Ok(Some(_)))
            }
            _ => false,
        }
    }

    /// Polls for due rotations every `rotation_check_interval` until `token`
    /// is cancelled.
    pub fn spawn_scheduler(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let interval = self.engine.rotation_check_interval;
        tokio::spawn(async move {
            info!(interval = ?interval, "rotation scheduler started");
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let ctx = RequestContext::new()
                    .with_cancellation(token.child_token())
                    .or_timeout(self.engine.request_timeout);
                self.tick(Utc::now(), &ctx).await;
            }
            info!("rotation scheduler stopped");
        })
    }
}
