//! The secrets engine and the trait the host drives it through.
//!
//! The host routes typed [`Request`]s to [`Backend::handle_request`] and
//! forwards storage change notifications to [`Backend::invalidate`].

use crate::azure_config::{ConfigPatch, CONFIG_PATH};
use crate::client::{ClientResolver, ClientSettings};
use crate::config_store::ConfigStore;
use crate::context::RequestContext;
use crate::issuance::Issuer;
use crate::providers::{ClientFactory, CloudClient};
use crate::request::{LeaseInfo, Request, Response};
use crate::role::{resolve_role, Role, RolePatch, RoleStore};
use crate::rotation::{RotationEngine, RotationStatus, RotationTrigger};
use crate::storage::Storage;
use crate::validation::validate_role_name;
use crate::{EngineConfig, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Change notifications relevant to cached state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageEvent {
    /// The configuration record was written or deleted, possibly by another
    /// process.
    ConfigChanged,
}

/// A secrets engine as seen by its host.
///
/// All implementations must be `Send + Sync`; the host calls
/// [`handle_request`](Backend::handle_request) concurrently.
#[async_trait]
pub trait Backend: Send + Sync {
    // ========================================================================
    // Metadata
    // ========================================================================

    /// Engine type name.
    fn name(&self) -> &str;

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Starts background work (the rotation scheduler).
    async fn init(&self) -> Result<()>;

    /// Stops background work.
    async fn close(&self) -> Result<()>;

    // ========================================================================
    // Requests
    // ========================================================================

    /// Handles one request.
    ///
    /// # Errors
    ///
    /// Storage, upstream and cancellation failures. Caller mistakes are
    /// returned as [`Response::error`] instead.
    async fn handle_request(&self, ctx: &RequestContext, request: Request) -> Result<Response>;

    /// Storage invalidation hook, keyed by storage path.
    async fn invalidate(&self, key: &str);
}

/// Azure service-principal secrets engine.
///
/// # Example
///
/// ```
/// use azsecrets::providers::mock::MockCloud;
/// use azsecrets::storage::InMemoryStorage;
/// use azsecrets::{AzureSecretsBackend, Backend, EngineConfig, Request, RequestContext};
/// use serde_json::json;
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> azsecrets::Result<()> {
///     let backend = AzureSecretsBackend::new(
///         EngineConfig::new("azure"),
///         Arc::new(InMemoryStorage::new()),
///         Arc::new(MockCloud::new()),
///     );
///
///     let ctx = RequestContext::new();
///     backend
///         .handle_request(&ctx, Request::WriteConfig {
///             data: json!({"subscription_id": "sub", "tenant_id": "tenant"}),
///             create: true,
///         })
///         .await?;
///
///     let resp = backend.handle_request(&ctx, Request::ReadConfig).await?;
///     assert_eq!(resp.get("root_password_ttl"), Some(&json!(15_768_000)));
///     Ok(())
/// }
/// ```
pub struct AzureSecretsBackend {
    engine: EngineConfig,
    configs: Arc<ConfigStore>,
    roles: RoleStore,
    clients: Arc<ClientResolver>,
    issuer: Issuer,
    rotation: Arc<RotationEngine>,
    scheduler: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl AzureSecretsBackend {
    /// Creates an engine over `storage`, building clients with `factory`.
    pub fn new(engine: EngineConfig, storage: Arc<dyn Storage>, factory: Arc<dyn ClientFactory>) -> Self {
        let configs = Arc::new(ConfigStore::new(Arc::clone(&storage)));
        let clients = Arc::new(ClientResolver::new(
            Arc::clone(&configs),
            factory,
            engine.clone(),
        ));
        let rotation = Arc::new(RotationEngine::new(
            Arc::clone(&configs),
            Arc::clone(&clients),
            engine.clone(),
        ));

        Self {
            roles: RoleStore::new(Arc::clone(&storage)),
            issuer: Issuer::new(storage, engine.clone()),
            engine,
            configs,
            clients,
            rotation,
            scheduler: Mutex::new(None),
        }
    }

    /// Engine settings.
    pub fn engine_config(&self) -> &EngineConfig {
        &self.engine
    }

    /// Client settings derived from the stored configuration.
    pub async fn client_settings(&self) -> Result<ClientSettings> {
        self.clients.settings().await
    }

    /// The shared control-plane client, built on first use.
    pub async fn client(&self, ctx: &RequestContext) -> Result<Arc<dyn CloudClient>> {
        self.clients.client(ctx).await
    }

    /// True when a client is cached.
    pub async fn has_cached_client(&self) -> bool {
        self.clients.cache().is_cached().await
    }

    /// Rotation status.
    pub async fn rotation_status(&self) -> RotationStatus {
        self.rotation.status().await
    }

    /// Rotation engine, for driving scheduled checks directly.
    pub fn rotation(&self) -> &Arc<RotationEngine> {
        &self.rotation
    }

    /// Applies a storage change notification.
    pub async fn on_storage_event(&self, event: StorageEvent) {
        match event {
            StorageEvent::ConfigChanged => {
                debug!("configuration changed, invalidating client");
                self.clients.invalidate().await;
            }
        }
    }

    fn lock_scheduler(&self) -> std::sync::MutexGuard<'_, Option<(CancellationToken, JoinHandle<()>)>> {
        self.scheduler
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn dispatch(&self, ctx: &RequestContext, request: Request) -> Result<Response> {
        match request {
            Request::WriteConfig { data, create } => self.write_config(data, create).await,
            Request::ReadConfig => {
                let view = self.configs.read().await?;
                Ok(Response::with_data(serde_json::to_value(view)?))
            }
            Request::DeleteConfig => {
                self.configs.delete().await?;
                self.on_storage_event(StorageEvent::ConfigChanged).await;
                Ok(Response::empty())
            }
            Request::WriteRole { name, data } => self.write_role(ctx, &name, data).await,
            Request::ReadRole { name } => {
                let role = self.roles.require(&name).await?;
                Ok(Response::with_data(serde_json::to_value(role)?))
            }
            Request::ListRoles => {
                let keys = self.roles.list().await?;
                Ok(Response::with_data(json!({ "keys": keys })))
            }
            Request::DeleteRole { name } => {
                self.roles.delete(&name).await?;
                info!(role = %name, "role deleted");
                Ok(Response::empty())
            }
            Request::ReadCreds { role } => self.read_creds(ctx, &role).await,
            Request::RotateRoot => {
                let report = self.rotation.rotate(ctx, RotationTrigger::Manual).await?;
                Ok(match report {
                    Some(report) => Response::with_data(serde_json::to_value(report)?),
                    None => Response::empty(),
                })
            }
            Request::ReadRotationStatus => {
                let status = self.rotation.status().await;
                Ok(Response::with_data(serde_json::to_value(status)?))
            }
            Request::RevokeLease { lease_id } => {
                let record = match self.issuer.lease(&lease_id).await? {
                    Some(record) => record,
                    None => {
                        debug!(lease_id = %lease_id, "lease already revoked");
                        return Ok(Response::empty());
                    }
                };
                let client = self.clients.client(ctx).await?;
                self.issuer.revoke(client.as_ref(), ctx, &record).await?;
                Ok(Response::empty())
            }
            Request::RenewLease { lease_id } => {
                let renewal = self.issuer.renew(&self.roles, &lease_id).await?;
                Ok(Response::empty().with_lease(LeaseInfo {
                    lease_id: renewal.lease_id,
                    ttl: renewal.ttl.as_secs(),
                    expires_at: renewal.expires_at,
                    renewable: true,
                }))
            }
        }
    }

    async fn write_config(&self, data: Value, create: bool) -> Result<Response> {
        let patch = ConfigPatch::from_value(data)?;
        let view = self.configs.create_or_update(&patch, create).await?;
        self.on_storage_event(StorageEvent::ConfigChanged).await;

        Ok(Response::with_data(serde_json::to_value(view)?).with_warnings(
            patch
                .unknown_fields()
                .into_iter()
                .map(|f| format!("ignored unknown field {:?}", f)),
        ))
    }

    async fn write_role(&self, ctx: &RequestContext, name: &str, data: Value) -> Result<Response> {
        validate_role_name(name)?;
        let patch = RolePatch::from_value(data)?;
        let existing = self.roles.get(name).await?.unwrap_or_default();
        let mut role: Role = patch.apply(&existing)?;

        let needs_lookup = role.uses_existing_application()
            || role.azure_roles.iter().any(|r| r.role_id.is_empty());
        if needs_lookup {
            let client = self.clients.client(ctx).await?;
            resolve_role(client.as_ref(), ctx, &mut role).await?;
        }

        self.roles.put(name, &role).await?;
        info!(role = %name, assignments = role.azure_roles.len(), "role written");

        let warnings = patch
            .unknown
            .keys()
            .map(|f| format!("ignored unknown field {:?}", f))
            .collect::<Vec<_>>();
        Ok(Response::with_data(serde_json::to_value(role)?).with_warnings(warnings))
    }

    async fn read_creds(&self, ctx: &RequestContext, role_name: &str) -> Result<Response> {
        let role = self.roles.require(role_name).await?;
        let client = self.clients.client(ctx).await?;
        let cred = self.issuer.issue(client, ctx, role_name, role).await?;

        let ttl = cred.ttl.as_secs();
        let lease = LeaseInfo {
            lease_id: cred.lease_id.clone(),
            ttl,
            expires_at: cred.expires_at,
            renewable: true,
        };
        Ok(Response::with_data(json!({
            "client_id": cred.client_id,
            "client_secret": cred.client_secret,
        }))
        .with_lease(lease))
    }
}

#[async_trait]
impl Backend for AzureSecretsBackend {
    fn name(&self) -> &str {
        "azure"
    }

    async fn init(&self) -> Result<()> {
        let mut scheduler = self.lock_scheduler();
        if scheduler.is_none() {
            let token = CancellationToken::new();
            let handle = Arc::clone(&self.rotation).spawn_scheduler(token.clone());
            *scheduler = Some((token, handle));
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let running = self.lock_scheduler().take();
        if let Some((token, handle)) = running {
            token.cancel();
            if let Err(e) = handle.await {
                warn!(error = %e, "rotation scheduler did not stop cleanly");
            }
        }
        Ok(())
    }

    async fn handle_request(&self, ctx: &RequestContext, request: Request) -> Result<Response> {
        let ctx = ctx.clone().or_timeout(self.engine.request_timeout);
        let operation = request.operation();
        let started = Utc::now();

        match self.dispatch(&ctx, request).await {
            Ok(response) => {
                debug!(
                    mount = %self.engine.mount,
                    operation,
                    elapsed_ms = (Utc::now() - started).num_milliseconds(),
                    "request handled"
                );
                Ok(response)
            }
            Err(e) if e.is_user_error() => {
                debug!(mount = %self.engine.mount, operation, error = %e, "request rejected");
                Ok(Response::error(e.to_string()))
            }
            Err(e) => {
                warn!(mount = %self.engine.mount, operation, error = %e, "request failed");
                Err(e)
            }
        }
    }

    async fn invalidate(&self, key: &str) {
        if key == CONFIG_PATH {
            self.on_storage_event(StorageEvent::ConfigChanged).await;
        }
    }
}
