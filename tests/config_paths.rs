//! Configuration endpoint tests, driven through the request interface.
//!
//! Run with:
//!   cargo test --test config_paths

#![cfg(feature = "mock")]

use azsecrets::providers::mock::MockCloud;
use azsecrets::storage::{InMemoryStorage, Storage};
use azsecrets::{AzureSecretsBackend, Backend, EngineConfig, Request, RequestContext, Response};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::sync::Arc;

const SUBSCRIPTION_ID: &str = "a228ceec-bf1a-4411-9f95-39678d8cdb34";
const TENANT_ID: &str = "7ac36e27-80fc-4209-a453-e8ad83dc18c2";
const NEW_TENANT_ID: &str = "800e371d-ee51-4145-9ac8-5c43e4ceb79b";

fn setup_backend() -> (AzureSecretsBackend, Arc<InMemoryStorage>) {
    let storage = Arc::new(InMemoryStorage::new());
    let backend = AzureSecretsBackend::new(
        EngineConfig::new("azure"),
        storage.clone(),
        Arc::new(MockCloud::new()),
    );
    (backend, storage)
}

async fn write_config(backend: &AzureSecretsBackend, data: Value, create: bool) -> Response {
    backend
        .handle_request(&RequestContext::new(), Request::WriteConfig { data, create })
        .await
        .expect("config write should not fail at the engine level")
}

async fn read_config(backend: &AzureSecretsBackend) -> Value {
    backend
        .handle_request(&RequestContext::new(), Request::ReadConfig)
        .await
        .expect("config read failed")
        .data
        .expect("config read returned no data")
}

fn expected_view(overrides: Value) -> Value {
    let mut view = json!({
        "subscription_id": SUBSCRIPTION_ID,
        "tenant_id": TENANT_ID,
        "client_id": "testClientId",
        "environment": "",
        "root_password_ttl": 15_768_000,
        "identity_token_ttl": 0,
        "identity_token_audience": "",
        "rotation_window": 0,
        "rotation_period": 0,
        "rotation_schedule": "",
        "disable_automated_rotation": false,
    });
    if let (Some(view), Some(overrides)) = (view.as_object_mut(), overrides.as_object()) {
        for (k, v) in overrides {
            view.insert(k.clone(), v.clone());
        }
    }
    view
}

fn static_config(extra: Value) -> Value {
    let mut config = json!({
        "subscription_id": SUBSCRIPTION_ID,
        "tenant_id": TENANT_ID,
        "client_id": "testClientId",
        "client_secret": "testClientSecret",
    });
    if let (Some(config), Some(extra)) = (config.as_object_mut(), extra.as_object()) {
        for (k, v) in extra {
            config.insert(k.clone(), v.clone());
        }
    }
    config
}

/// Writes `config`, checks the read view, then updates only the tenant and
/// checks every other field survived.
async fn check_create_then_update(config: Value, expected: Value) {
    let (backend, _) = setup_backend();

    let resp = write_config(&backend, config, true).await;
    assert!(!resp.is_error(), "unexpected error: {:?}", resp.error);
    assert_eq!(read_config(&backend).await, expected);

    let resp = write_config(&backend, json!({"tenant_id": NEW_TENANT_ID}), false).await;
    assert!(!resp.is_error(), "unexpected error: {:?}", resp.error);

    let mut expected = expected;
    expected["tenant_id"] = json!(NEW_TENANT_ID);
    assert_eq!(read_config(&backend).await, expected);
}

#[tokio::test]
async fn test_root_password_ttl_defaults_to_six_months() {
    check_create_then_update(static_config(json!({})), expected_view(json!({}))).await;
}

#[tokio::test]
async fn test_root_password_ttl_set_if_provided() {
    check_create_then_update(
        static_config(json!({"root_password_ttl": "1m"})),
        expected_view(json!({"root_password_ttl": 60})),
    )
    .await;
}

#[tokio::test]
async fn test_environment_set_if_provided() {
    check_create_then_update(
        static_config(json!({"environment": "AZURECHINACLOUD"})),
        expected_view(json!({"environment": "AZURECHINACLOUD"})),
    )
    .await;
}

#[tokio::test]
async fn test_workload_identity_round_trip() {
    check_create_then_update(
        json!({
            "subscription_id": SUBSCRIPTION_ID,
            "tenant_id": TENANT_ID,
            "identity_token_ttl": 500,
            "identity_token_audience": "vault-azure-secrets-d0f0d253",
        }),
        expected_view(json!({
            "client_id": "",
            "identity_token_ttl": 500,
            "identity_token_audience": "vault-azure-secrets-d0f0d253",
        })),
    )
    .await;
}

#[tokio::test]
async fn test_secret_and_audience_are_mutually_exclusive() {
    let (backend, storage) = setup_backend();

    let resp = write_config(
        &backend,
        static_config(json!({
            "environment": "AZURECHINACLOUD",
            "identity_token_audience": "vault-azure-secrets-d0f0d253",
        })),
        true,
    )
    .await;

    assert!(resp.is_error());
    assert!(storage.get("config").await.unwrap().is_none());
}

#[tokio::test]
async fn test_reserved_rotation_field_rejected() {
    let (backend, storage) = setup_backend();

    let resp = write_config(
        &backend,
        json!({"tenant_id": "tid", "resource": "res", "rotation_period": 10}),
        true,
    )
    .await;

    assert!(resp.is_error());
    assert!(storage.get("config").await.unwrap().is_none());
}

#[tokio::test]
async fn test_environment_clouds() {
    let (backend, _) = setup_backend();
    let resp = write_config(
        &backend,
        static_config(json!({
            "environment": "AZURECHINACLOUD",
            "root_password_ttl": 86_400,
        })),
        true,
    )
    .await;
    assert!(!resp.is_error());

    let cases = [
        ("AZURECHINACLOUD", Some("https://microsoftgraph.chinacloudapi.cn")),
        ("AZUREPUBLICCLOUD", Some("https://graph.microsoft.com")),
        ("AZUREUSGOVERNMENTCLOUD", Some("https://graph.microsoft.us")),
        ("invalidEnv", None),
    ];

    for (env, url) in cases {
        // The error is in the response, not an Err.
        let resp = write_config(&backend, json!({"environment": env}), false).await;
        match url {
            Some(url) => {
                assert!(!resp.is_error(), "{}: {:?}", env, resp.error);
                let settings = backend.client_settings().await.unwrap();
                assert_eq!(settings.graph_uri, url, "environment {}", env);
            }
            None => assert!(resp.is_error(), "expected {} to be rejected", env),
        }
    }
}

#[tokio::test]
async fn test_config_delete() {
    let (backend, _) = setup_backend();

    let resp = write_config(
        &backend,
        static_config(json!({
            "environment": "AZURECHINACLOUD",
            "root_password_ttl": 86_400,
            "identity_token_audience": "",
            "identity_token_ttl": 0,
            "rotation_window": "1h",
            "rotation_schedule": "",
            "disable_automated_rotation": false,
        })),
        true,
    )
    .await;
    assert!(!resp.is_error(), "unexpected error: {:?}", resp.error);
    assert_eq!(
        read_config(&backend).await,
        expected_view(json!({
            "environment": "AZURECHINACLOUD",
            "root_password_ttl": 86_400,
            "rotation_window": 3600,
        }))
    );

    backend
        .handle_request(&RequestContext::new(), Request::DeleteConfig)
        .await
        .unwrap();

    assert_eq!(
        read_config(&backend).await,
        json!({
            "subscription_id": "",
            "tenant_id": "",
            "client_id": "",
            "environment": "",
            "root_password_ttl": 0,
            "identity_token_ttl": 0,
            "identity_token_audience": "",
            "rotation_window": 0,
            "rotation_period": 0,
            "rotation_schedule": "",
            "disable_automated_rotation": false,
        })
    );
}

#[tokio::test]
async fn test_read_never_returns_secret() {
    let (backend, _) = setup_backend();
    write_config(&backend, static_config(json!({})), true).await;

    let view = read_config(&backend).await;
    assert!(view.get("client_secret").is_none());
    assert_eq!(view.as_object().map(|o| o.len()), Some(11));
}

#[tokio::test]
async fn test_rotation_policy_rules() {
    let (backend, _) = setup_backend();

    let rejected = [
        json!({"rotation_period": "24h", "rotation_schedule": "0 0 * * *"}),
        json!({"rotation_schedule": "not a cron"}),
        json!({"rotation_period": "24h", "rotation_window": "2h"}),
        json!({"rotation_schedule": "0 0 * * *", "rotation_window": "10m"}),
        json!({"rotation_schedule": "0 0 * * *", "rotation_window": 9_000_000_000_000_000u64}),
        json!({"rotation_schedule": "1/4294967295 * * * *"}),
    ];
    for data in rejected {
        let resp = write_config(&backend, static_config(data.clone()), true).await;
        assert!(resp.is_error(), "expected {} to be rejected", data);
    }

    let resp = write_config(
        &backend,
        static_config(json!({"rotation_schedule": "0 0 * * SUN", "rotation_window": "2h"})),
        true,
    )
    .await;
    assert!(!resp.is_error(), "unexpected error: {:?}", resp.error);

    // Scheduled rotation cannot apply to a federated identity.
    let resp = write_config(
        &backend,
        json!({
            "subscription_id": SUBSCRIPTION_ID,
            "tenant_id": TENANT_ID,
            "identity_token_audience": "aud",
            "rotation_period": "24h",
        }),
        true,
    )
    .await;
    assert!(resp.is_error());
}

#[tokio::test]
async fn test_config_write_invalidates_client() {
    let cloud = MockCloud::new();
    cloud.seed_application("testClientId", "testClientSecret").await;
    let backend = AzureSecretsBackend::new(
        EngineConfig::new("azure"),
        Arc::new(InMemoryStorage::new()),
        Arc::new(cloud.clone()),
    );
    let ctx = RequestContext::new();

    write_config(&backend, static_config(json!({})), true).await;
    backend.client(&ctx).await.unwrap();
    backend.client(&ctx).await.unwrap();
    assert_eq!(cloud.build_count(), 1);
    assert!(backend.has_cached_client().await);

    write_config(&backend, json!({"environment": "AZUREUSGOVERNMENTCLOUD"}), false).await;
    assert!(!backend.has_cached_client().await);

    backend.client(&ctx).await.unwrap();
    assert_eq!(cloud.build_count(), 2);

    backend.invalidate("config").await;
    assert!(!backend.has_cached_client().await);
}
