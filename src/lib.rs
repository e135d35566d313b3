//! azsecrets - Azure service-principal secrets engine.
//!
//! The engine owns a root service principal and uses it to mint short-lived
//! Azure credentials on demand. It covers:
//!
//! - **Configuration**: a persisted, validated mount configuration with
//!   static-secret or federated (workload identity) authentication
//! - **Cloud environments**: public, China and US Government endpoints
//! - **Client caching**: one control-plane client shared by all requests,
//!   rebuilt whenever the configuration changes
//! - **Root rotation**: manual or scheduled replacement of the root password
//!   without a window in which no valid secret is stored
//! - **Dynamic credentials**: per-lease applications or passwords with role
//!   assignments, revoked idempotently
//!
//! # Quick Start
//!
//! ```
//! use azsecrets::providers::mock::MockCloud;
//! use azsecrets::storage::InMemoryStorage;
//! use azsecrets::{AzureSecretsBackend, Backend, EngineConfig, Request, RequestContext};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> azsecrets::Result<()> {
//!     let cloud = MockCloud::new();
//!     cloud.seed_application("root-app", "root-secret").await;
//!
//!     let backend = AzureSecretsBackend::new(
//!         EngineConfig::new("azure"),
//!         Arc::new(InMemoryStorage::new()),
//!         Arc::new(cloud),
//!     );
//!     let ctx = RequestContext::new();
//!
//!     backend
//!         .handle_request(&ctx, Request::WriteConfig {
//!             data: json!({
//!                 "subscription_id": "sub",
//!                 "tenant_id": "tenant",
//!                 "client_id": "root-app",
//!                 "client_secret": "root-secret",
//!             }),
//!             create: true,
//!         })
//!         .await?;
//!
//!     let resp = backend.handle_request(&ctx, Request::RotateRoot).await?;
//!     assert!(resp.get("key_id").is_some());
//!     Ok(())
//! }
//! ```
//!
//! # Feature Flags
//!
//! | Feature | Default | Notes |
//! |---------|---------|-------|
//! | `mock` | yes | In-memory control plane for tests and demos |

pub mod azure_config;
pub mod backend;
pub mod client;
pub mod config;
pub mod config_store;
pub mod context;
pub mod credential;
pub mod duration;
pub mod environment;
pub mod error;
pub mod issuance;
pub mod providers;
pub mod request;
pub mod role;
pub mod rotation;
pub mod schedule;
pub mod storage;
pub mod validation;

pub use azure_config::{AuthMode, AzureConfig, ConfigPatch, ConfigView};
pub use backend::{AzureSecretsBackend, Backend, StorageEvent};
pub use client::{ClientSettings, CredentialSource};
pub use config::EngineConfig;
pub use context::RequestContext;
pub use credential::IssuedCredential;
pub use environment::{resolve_environment, AzureEnvironment, Endpoints};
pub use error::{AzSecretsError, Result};
pub use request::{LeaseInfo, Request, Response};
pub use rotation::{RotationState, RotationStatus};
