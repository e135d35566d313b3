//! Root rotation and dynamic credential walkthrough.
//!
//! Configures the engine against the in-memory control plane, issues a
//! credential, rotates the root secret twice and revokes the lease.
//!
//! Run with: RUST_LOG=azsecrets=debug cargo run --example rotate_root

use azsecrets::providers::mock::MockCloud;
use azsecrets::storage::FileStorage;
use azsecrets::{AzureSecretsBackend, Backend, EngineConfig, Request, RequestContext};
use serde_json::json;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> azsecrets::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("=== Root Rotation Example ===\n");

    let cloud = MockCloud::new();
    let (root, _) = cloud.seed_application("root-app", "initial-secret").await;
    cloud.seed_role_definition("Reader", "acdd72a7-3385-48ef-bd42-f606fba81ae7").await;

    let state = tempfile::tempdir()?;
    let storage = FileStorage::new(state.path()).await?;
    let backend = AzureSecretsBackend::new(
        EngineConfig::from_env("azure"),
        Arc::new(storage),
        Arc::new(cloud.clone()),
    );
    backend.init().await?;
    let ctx = RequestContext::new();

    println!("1. Writing configuration...");
    let resp = backend
        .handle_request(&ctx, Request::WriteConfig {
            data: json!({
                "subscription_id": "a228ceec-bf1a-4411-9f95-39678d8cdb34",
                "tenant_id": "7ac36e27-80fc-4209-a453-e8ad83dc18c2",
                "client_id": "root-app",
                "client_secret": "initial-secret",
                "root_password_ttl": "30d",
            }),
            create: true,
        })
        .await?;
    println!("   ✓ {}", serde_json::to_string(&resp.data)?);

    println!("\n2. Creating role and issuing a credential...");
    backend
        .handle_request(&ctx, Request::WriteRole {
            name: "reader".into(),
            data: json!({
                "azure_roles": [{"role_name": "Reader", "scope": "/subscriptions/a228ceec-bf1a-4411-9f95-39678d8cdb34"}],
                "ttl": "1h",
            }),
        })
        .await?;
    let resp = backend
        .handle_request(&ctx, Request::ReadCreds { role: "reader".into() })
        .await?;
    let lease = resp.lease.clone();
    println!("   ✓ client_id: {}", resp.get("client_id").unwrap_or(&json!(null)));

    for round in 1..=2 {
        println!("\n{}. Rotating root secret (round {})...", round + 2, round);
        let resp = backend.handle_request(&ctx, Request::RotateRoot).await?;
        match resp.error {
            Some(err) => println!("   ✗ {}", err),
            None => println!(
                "   ✓ key {} (root passwords on app: {})",
                resp.get("key_id").unwrap_or(&json!(null)),
                cloud.password_key_ids(&root.object_id).await.len()
            ),
        }
    }

    if let Some(lease) = lease {
        println!("\n5. Revoking lease {}...", lease.lease_id);
        backend
            .handle_request(&ctx, Request::RevokeLease { lease_id: lease.lease_id })
            .await?;
        println!("   ✓ applications remaining: {}", cloud.application_count().await);
    }

    let status = backend.rotation_status().await;
    println!("\nRotation status: {:?}", status.state);

    backend.close().await?;
    Ok(())
}
