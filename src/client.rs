//! Client settings resolution and the cached control-plane client.

use crate::azure_config::{redact, AuthMode, AzureConfig};
use crate::environment::{parse_environment, AzureEnvironment};
use crate::config_store::ConfigStore;
use crate::context::RequestContext;
use crate::providers::{ClientFactory, CloudClient};
use crate::{AzSecretsError, EngineConfig, Result};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

/// Federated token lifetime used when `identity_token_ttl` is zero.
pub const DEFAULT_IDENTITY_TOKEN_TTL: Duration = Duration::from_secs(3600);

/// Where the client's credential comes from.
#[derive(Clone, PartialEq, Eq)]
pub enum CredentialSource {
    /// Static client secret.
    ClientSecret {
        client_id: String,
        client_secret: String,
    },
    /// Signed identity token exchanged for an access token.
    FederatedToken {
        client_id: String,
        audience: String,
        ttl: Duration,
    },
    /// Credentials of the host (managed identity or similar).
    Ambient {
        /// Optional user-assigned identity client id
        client_id: String,
    },
}

impl CredentialSource {
    /// Client id the credential authenticates as, possibly empty for ambient.
    pub fn client_id(&self) -> &str {
        match self {
            Self::ClientSecret { client_id, .. }
            | Self::FederatedToken { client_id, .. }
            | Self::Ambient { client_id } => client_id,
        }
    }
}

impl std::fmt::Debug for CredentialSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ClientSecret { client_id, client_secret } => f
                .debug_struct("ClientSecret")
                .field("client_id", client_id)
                .field("client_secret", &redact(client_secret))
                .finish(),
            Self::FederatedToken { client_id, audience, ttl } => f
                .debug_struct("FederatedToken")
                .field("client_id", client_id)
                .field("audience", audience)
                .field("ttl", ttl)
                .finish(),
            Self::Ambient { client_id } => {
                f.debug_struct("Ambient").field("client_id", client_id).finish()
            }
        }
    }
}

/// Everything needed to construct a control-plane client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub subscription_id: String,
    pub tenant_id: String,
    pub environment: AzureEnvironment,
    pub graph_uri: String,
    pub resource_manager_uri: String,
    pub authority_uri: String,
    pub credential: CredentialSource,
}

impl ClientSettings {
    /// Returns a copy authenticating with a different static secret.
    pub fn with_client_secret(&self, client_id: &str, client_secret: &str) -> Self {
        Self {
            credential: CredentialSource::ClientSecret {
                client_id: client_id.to_string(),
                client_secret: client_secret.to_string(),
            },
            ..self.clone()
        }
    }
}

/// Derives client settings from a validated configuration, filling empty
/// identifiers from the engine's fallback options.
///
/// # Errors
///
/// Returns [`AzSecretsError::InvalidConfiguration`] when the subscription or
/// tenant is missing, or when federated mode has no client id.
pub fn client_settings(config: &AzureConfig, engine: &EngineConfig) -> Result<ClientSettings> {
    let subscription_id = engine.or_option(&config.subscription_id, "subscription_id");
    if subscription_id.is_empty() {
        return Err(AzSecretsError::invalid("subscription_id is required"));
    }
    let tenant_id = engine.or_option(&config.tenant_id, "tenant_id");
    if tenant_id.is_empty() {
        return Err(AzSecretsError::invalid("tenant_id is required"));
    }

    let environment = match config.environment {
        Some(env) => env,
        None => {
            let fallback = engine.or_option("", "environment");
            parse_environment(&fallback)?.unwrap_or(AzureEnvironment::Public)
        }
    };

    let credential = match &config.auth {
        AuthMode::StaticSecret { client_id, client_secret } => CredentialSource::ClientSecret {
            client_id: client_id.clone(),
            client_secret: client_secret.clone(),
        },
        AuthMode::FederatedIdentity { client_id, audience } => {
            let client_id = engine.or_option(client_id, "client_id");
            if client_id.is_empty() {
                return Err(AzSecretsError::invalid(
                    "client_id is required for identity token authentication",
                ));
            }
            let ttl = if config.identity_token_ttl.is_zero() {
                DEFAULT_IDENTITY_TOKEN_TTL
            } else {
                config.identity_token_ttl
            };
            CredentialSource::FederatedToken {
                client_id,
                audience: audience.clone(),
                ttl,
            }
        }
        AuthMode::Unconfigured => {
            let client_id = engine.or_option("", "client_id");
            let client_secret = engine.or_option("", "client_secret");
            if !client_id.is_empty() && !client_secret.is_empty() {
                CredentialSource::ClientSecret { client_id, client_secret }
            } else {
                CredentialSource::Ambient { client_id }
            }
        }
    };

    let endpoints = environment.endpoints();
    Ok(ClientSettings {
        subscription_id,
        tenant_id,
        environment,
        graph_uri: endpoints.graph_uri.to_string(),
        resource_manager_uri: endpoints.resource_manager_uri.to_string(),
        authority_uri: endpoints.authority_uri.to_string(),
        credential,
    })
}

/// Lazily-built control-plane client shared by all requests.
///
/// Readers share the cached client under the read lock; building takes the
/// write lock. [`reset`](Self::reset) bumps a generation counter before
/// clearing, so a client whose build started before an invalidation is
/// handed to its caller but never stored.
#[derive(Default)]
pub struct ClientCache {
    slot: RwLock<Option<Arc<dyn CloudClient>>>,
    generation: AtomicU64,
}

impl ClientCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached client, building and storing one if absent.
    pub async fn get_or_build<F, Fut>(&self, build: F) -> Result<Arc<dyn CloudClient>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<dyn CloudClient>>>,
    {
        if let Some(client) = self.slot.read().await.as_ref() {
            return Ok(Arc::clone(client));
        }

        let mut slot = self.slot.write().await;
        if let Some(client) = slot.as_ref() {
            return Ok(Arc::clone(client));
        }

        let generation = self.generation.load(Ordering::SeqCst);
        let client = build().await?;
        if self.generation.load(Ordering::SeqCst) == generation {
            *slot = Some(Arc::clone(&client));
            debug!(generation, "control-plane client built");
        } else {
            debug!("configuration changed during client build, not caching");
        }
        Ok(client)
    }

    /// Drops the cached client.
    pub async fn reset(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let mut slot = self.slot.write().await;
        if slot.take().is_some() {
            debug!("control-plane client invalidated");
        }
    }

    /// Returns true when a client is cached.
    pub async fn is_cached(&self) -> bool {
        self.slot.read().await.is_some()
    }
}

/// Resolves the current configuration into a client, through the cache.
pub struct ClientResolver {
    configs: Arc<ConfigStore>,
    factory: Arc<dyn ClientFactory>,
    engine: EngineConfig,
    cache: ClientCache,
}

impl ClientResolver {
    pub fn new(configs: Arc<ConfigStore>, factory: Arc<dyn ClientFactory>, engine: EngineConfig) -> Self {
        Self {
            configs,
            factory,
            engine,
            cache: ClientCache::new(),
        }
    }

    /// Client settings for the stored configuration.
    pub async fn settings(&self) -> Result<ClientSettings> {
        let config = self.configs.load_validated().await?;
        client_settings(&config, &self.engine)
    }

    /// Returns the cached client, building one from the stored
    /// configuration if needed.
    pub async fn client(&self, ctx: &RequestContext) -> Result<Arc<dyn CloudClient>> {
        self.cache
            .get_or_build(|| async {
                let settings = self.settings().await?;
                self.build(&settings, ctx).await
            })
            .await
    }

    /// Builds an uncached client.
    pub async fn build(&self, settings: &ClientSettings, ctx: &RequestContext) -> Result<Arc<dyn CloudClient>> {
        debug!(
            environment = settings.environment.name(),
            client_id = settings.credential.client_id(),
            "building control-plane client"
        );
        ctx.run("build client", self.factory.build(settings)).await
    }

    /// Drops the cached client.
    pub async fn invalidate(&self) {
        self.cache.reset().await;
    }

    pub fn cache(&self) -> &ClientCache {
        &self.cache
    }
}
