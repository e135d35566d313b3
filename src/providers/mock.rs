//! In-memory control plane for testing.
//!
//! [`MockCloud`] keeps applications, service principals, passwords and role
//! assignments in memory, authenticates clients against the passwords it
//! holds, and supports fault injection to simulate upstream failures and
//! hanging calls.

use crate::client::{ClientSettings, CredentialSource};
use crate::providers::{
    Application, ClientFactory, CloudClient, PasswordCredential, RoleAssignment, ServicePrincipal,
};
use crate::{AzSecretsError, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Control-plane operation, for fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    Build,
    CheckAccess,
    /// Application and role definition lookups
    Read,
    CreateApplication,
    DeleteApplication,
    CreateServicePrincipal,
    AddPassword,
    RemovePassword,
    AssignRole,
    DeleteRoleAssignment,
}

/// Injected behavior for an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Fail with [`AzSecretsError::UpstreamUnavailable`].
    Fail(String),
    /// Never complete; used to exercise cancellation.
    Hang,
    /// Apply the operation, then never return its result.
    LoseResponse,
}

#[derive(Default)]
struct MockState {
    applications: HashMap<String, MockApplication>,
    service_principals: HashMap<String, ServicePrincipal>,
    role_assignments: HashMap<String, RoleAssignment>,
    role_definitions: Vec<(String, String)>,
}

struct MockApplication {
    app: Application,
    passwords: Vec<PasswordCredential>,
}

#[derive(Default)]
struct Inner {
    state: RwLock<MockState>,
    faults: Mutex<HashMap<MockOp, Fault>>,
    builds: AtomicUsize,
}

/// In-memory control plane. Cloning shares state.
///
/// # Example
///
/// ```
/// use azsecrets::providers::mock::{MockCloud, MockOp};
///
/// #[tokio::main]
/// async fn main() {
///     let cloud = MockCloud::new();
///     let (app, _password) = cloud.seed_application("root-app", "root-secret").await;
///     assert!(cloud.application_exists(&app.object_id).await);
///
///     cloud.fail(MockOp::AddPassword, "throttled");
///     cloud.clear_faults();
/// }
/// ```
#[derive(Clone, Default)]
pub struct MockCloud {
    inner: Arc<Inner>,
}

impl MockCloud {
    /// Creates an empty control plane.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an application with the given client id and one password.
    pub async fn seed_application(
        &self,
        app_id: &str,
        secret: &str,
    ) -> (Application, PasswordCredential) {
        let app = Application {
            object_id: Uuid::new_v4().to_string(),
            app_id: app_id.to_string(),
            display_name: app_id.to_string(),
        };
        let password = PasswordCredential {
            key_id: Uuid::new_v4().to_string(),
            display_name: app_id.to_string(),
            secret: secret.to_string(),
            end_date: Utc::now() + chrono::Duration::days(365),
        };

        let mut state = self.inner.state.write().await;
        state.applications.insert(
            app.object_id.clone(),
            MockApplication {
                app: app.clone(),
                passwords: vec![password.clone()],
            },
        );
        (app, password)
    }

    /// Registers a role definition resolvable by name.
    pub async fn seed_role_definition(&self, name: &str, id: &str) {
        let mut state = self.inner.state.write().await;
        state
            .role_definitions
            .push((name.to_string(), id.to_string()));
    }

    /// Injects a fault for `op` until cleared.
    pub fn fail(&self, op: MockOp, reason: impl Into<String>) {
        self.set_fault(op, Fault::Fail(reason.into()));
    }

    /// Makes `op` hang until the caller gives up.
    pub fn hang(&self, op: MockOp) {
        self.set_fault(op, Fault::Hang);
    }

    /// Makes `op` take effect but never return, as when a response is lost
    /// after the remote side committed. Applies to password and role
    /// assignment creation.
    pub fn lose_response(&self, op: MockOp) {
        self.set_fault(op, Fault::LoseResponse);
    }

    /// Removes every injected fault.
    pub fn clear_faults(&self) {
        self.lock_faults().clear();
    }

    /// Number of clients built so far.
    pub fn build_count(&self) -> usize {
        self.inner.builds.load(Ordering::SeqCst)
    }

    /// Number of registered applications.
    pub async fn application_count(&self) -> usize {
        self.inner.state.read().await.applications.len()
    }

    /// Returns true if an application with this object id exists.
    pub async fn application_exists(&self, object_id: &str) -> bool {
        self.inner
            .state
            .read()
            .await
            .applications
            .contains_key(object_id)
    }

    /// Key ids of the passwords on an application.
    pub async fn password_key_ids(&self, object_id: &str) -> Vec<String> {
        self.inner
            .state
            .read()
            .await
            .applications
            .get(object_id)
            .map(|a| a.passwords.iter().map(|p| p.key_id.clone()).collect())
            .unwrap_or_default()
    }

    /// Returns true if `secret` currently authenticates as `app_id`.
    pub async fn secret_is_valid(&self, app_id: &str, secret: &str) -> bool {
        let state = self.inner.state.read().await;
        let now = Utc::now();
        state.applications.values().any(|a| {
            a.app.app_id == app_id
                && a.passwords
                    .iter()
                    .any(|p| p.secret == secret && p.end_date > now)
        })
    }

    /// Number of live role assignments.
    pub async fn role_assignment_count(&self) -> usize {
        self.inner.state.read().await.role_assignments.len()
    }

    /// Number of service principals.
    pub async fn service_principal_count(&self) -> usize {
        self.inner.state.read().await.service_principals.len()
    }

    fn lock_faults(&self) -> std::sync::MutexGuard<'_, HashMap<MockOp, Fault>> {
        self.inner
            .faults
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_fault(&self, op: MockOp, fault: Fault) {
        self.lock_faults().insert(op, fault);
    }

    async fn check_fault(&self, op: MockOp) -> Result<()> {
        let fault = self.lock_faults().get(&op).cloned();
        match fault {
            Some(Fault::Fail(reason)) => Err(AzSecretsError::upstream(format!("{:?}", op), reason)),
            Some(Fault::Hang) => {
                std::future::pending::<()>().await;
                Ok(())
            }
            Some(Fault::LoseResponse) | None => Ok(()),
        }
    }

    /// Called once `op` has taken effect.
    async fn respond(&self, op: MockOp) {
        let lost = matches!(self.lock_faults().get(&op), Some(Fault::LoseResponse));
        if lost {
            std::future::pending::<()>().await;
        }
    }
}

fn generate_secret() -> String {
    let mut bytes = Vec::with_capacity(32);
    bytes.extend_from_slice(Uuid::new_v4().as_bytes());
    bytes.extend_from_slice(Uuid::new_v4().as_bytes());
    URL_SAFE_NO_PAD.encode(bytes)
}

#[async_trait]
impl ClientFactory for MockCloud {
    async fn build(&self, settings: &ClientSettings) -> Result<Arc<dyn CloudClient>> {
        self.check_fault(MockOp::Build).await?;

        if let CredentialSource::ClientSecret { client_id, client_secret } = &settings.credential {
            if !self.secret_is_valid(client_id, client_secret).await {
                return Err(AzSecretsError::upstream(
                    "authenticate",
                    format!("invalid client secret for application {}", client_id),
                ));
            }
        }

        self.inner.builds.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockClient {
            cloud: self.clone(),
            credential: settings.credential.clone(),
        }))
    }
}

/// Client handed out by [`MockCloud`]. Static-secret clients are
/// re-authenticated on every call, so a removed password stops working.
pub struct MockClient {
    cloud: MockCloud,
    credential: CredentialSource,
}

impl MockClient {
    async fn enter(&self, op: MockOp) -> Result<()> {
        if let CredentialSource::ClientSecret { client_id, client_secret } = &self.credential {
            if !self.cloud.secret_is_valid(client_id, client_secret).await {
                return Err(AzSecretsError::upstream(format!("{:?}", op), "401 Unauthorized"));
            }
        }
        self.cloud.check_fault(op).await
    }
}

#[async_trait]
impl CloudClient for MockClient {
    async fn check_access(&self) -> Result<()> {
        self.enter(MockOp::CheckAccess).await
    }

    async fn application_by_app_id(&self, app_id: &str) -> Result<Application> {
        self.enter(MockOp::Read).await?;
        let state = self.cloud.inner.state.read().await;
        state
            .applications
            .values()
            .find(|a| a.app.app_id == app_id)
            .map(|a| a.app.clone())
            .ok_or_else(|| AzSecretsError::NotFound(format!("application {}", app_id)))
    }

    async fn application(&self, object_id: &str) -> Result<Application> {
        self.enter(MockOp::Read).await?;
        let state = self.cloud.inner.state.read().await;
        state
            .applications
            .get(object_id)
            .map(|a| a.app.clone())
            .ok_or_else(|| AzSecretsError::NotFound(format!("application {}", object_id)))
    }

    async fn create_application(&self, display_name: &str) -> Result<Application> {
        self.enter(MockOp::CreateApplication).await?;
        let app = Application {
            object_id: Uuid::new_v4().to_string(),
            app_id: Uuid::new_v4().to_string(),
            display_name: display_name.to_string(),
        };
        let mut state = self.cloud.inner.state.write().await;
        state.applications.insert(
            app.object_id.clone(),
            MockApplication {
                app: app.clone(),
                passwords: Vec::new(),
            },
        );
        Ok(app)
    }

    async fn delete_application(&self, object_id: &str) -> Result<()> {
        self.enter(MockOp::DeleteApplication).await?;
        let mut state = self.cloud.inner.state.write().await;
        let removed = state
            .applications
            .remove(object_id)
            .ok_or_else(|| AzSecretsError::NotFound(format!("application {}", object_id)))?;
        state
            .service_principals
            .retain(|_, sp| sp.app_id != removed.app.app_id);
        Ok(())
    }

    async fn create_service_principal(&self, app_id: &str) -> Result<ServicePrincipal> {
        self.enter(MockOp::CreateServicePrincipal).await?;
        let mut state = self.cloud.inner.state.write().await;
        if !state.applications.values().any(|a| a.app.app_id == app_id) {
            return Err(AzSecretsError::NotFound(format!("application {}", app_id)));
        }
        let sp = ServicePrincipal {
            object_id: Uuid::new_v4().to_string(),
            app_id: app_id.to_string(),
        };
        state
            .service_principals
            .insert(sp.object_id.clone(), sp.clone());
        Ok(sp)
    }

    async fn add_password(
        &self,
        app_object_id: &str,
        display_name: &str,
        end_date: DateTime<Utc>,
    ) -> Result<PasswordCredential> {
        self.enter(MockOp::AddPassword).await?;
        let password = PasswordCredential {
            key_id: Uuid::new_v4().to_string(),
            display_name: display_name.to_string(),
            secret: generate_secret(),
            end_date,
        };
        {
            let mut state = self.cloud.inner.state.write().await;
            let app = state
                .applications
                .get_mut(app_object_id)
                .ok_or_else(|| AzSecretsError::NotFound(format!("application {}", app_object_id)))?;
            app.passwords.push(password.clone());
        }
        self.cloud.respond(MockOp::AddPassword).await;
        Ok(password)
    }

    async fn find_passwords(&self, app_object_id: &str, display_name: &str) -> Result<Vec<String>> {
        self.enter(MockOp::Read).await?;
        let state = self.cloud.inner.state.read().await;
        let app = state
            .applications
            .get(app_object_id)
            .ok_or_else(|| AzSecretsError::NotFound(format!("application {}", app_object_id)))?;
        Ok(app
            .passwords
            .iter()
            .filter(|p| p.display_name == display_name)
            .map(|p| p.key_id.clone())
            .collect())
    }

    async fn remove_password(&self, app_object_id: &str, key_id: &str) -> Result<()> {
        self.enter(MockOp::RemovePassword).await?;
        let mut state = self.cloud.inner.state.write().await;
        let app = state
            .applications
            .get_mut(app_object_id)
            .ok_or_else(|| AzSecretsError::NotFound(format!("application {}", app_object_id)))?;
        let before = app.passwords.len();
        app.passwords.retain(|p| p.key_id != key_id);
        if app.passwords.len() == before {
            return Err(AzSecretsError::NotFound(format!("password {}", key_id)));
        }
        Ok(())
    }

    async fn find_role_definitions(&self, _scope: &str, role_name: &str) -> Result<Vec<String>> {
        self.enter(MockOp::Read).await?;
        let state = self.cloud.inner.state.read().await;
        Ok(state
            .role_definitions
            .iter()
            .filter(|(name, _)| name == role_name)
            .map(|(_, id)| id.clone())
            .collect())
    }

    async fn assign_role(
        &self,
        principal_id: &str,
        role_id: &str,
        scope: &str,
    ) -> Result<RoleAssignment> {
        self.enter(MockOp::AssignRole).await?;
        let mut state = self.cloud.inner.state.write().await;
        if !state.service_principals.contains_key(principal_id) {
            return Err(AzSecretsError::NotFound(format!("principal {}", principal_id)));
        }
        let assignment = RoleAssignment {
            id: format!("{}/providers/Microsoft.Authorization/roleAssignments/{}", scope, Uuid::new_v4()),
            principal_id: principal_id.to_string(),
            role_id: role_id.to_string(),
            scope: scope.to_string(),
        };
        state
            .role_assignments
            .insert(assignment.id.clone(), assignment.clone());
        drop(state);
        self.cloud.respond(MockOp::AssignRole).await;
        Ok(assignment)
    }

    async fn delete_role_assignment(&self, assignment_id: &str) -> Result<()> {
        self.enter(MockOp::DeleteRoleAssignment).await?;
        let mut state = self.cloud.inner.state.write().await;
        state
            .role_assignments
            .remove(assignment_id)
            .map(|_| ())
            .ok_or_else(|| AzSecretsError::NotFound(format!("role assignment {}", assignment_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::AzureEnvironment;

    fn settings(credential: CredentialSource) -> ClientSettings {
        let endpoints = AzureEnvironment::Public.endpoints();
        ClientSettings {
            subscription_id: "sub".into(),
            tenant_id: "tenant".into(),
            environment: AzureEnvironment::Public,
            graph_uri: endpoints.graph_uri.into(),
            resource_manager_uri: endpoints.resource_manager_uri.into(),
            authority_uri: endpoints.authority_uri.into(),
            credential,
        }
    }

    fn secret(client_id: &str, client_secret: &str) -> CredentialSource {
        CredentialSource::ClientSecret {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }

    #[tokio::test]
    async fn test_build_authenticates_secret() {
        let cloud = MockCloud::new();
        cloud.seed_application("root", "pw").await;

        assert!(cloud.build(&settings(secret("root", "pw"))).await.is_ok());
        let err = cloud.build(&settings(secret("root", "wrong"))).await.err().unwrap();
        assert!(err.is_retryable());
        assert_eq!(cloud.build_count(), 1);
    }

    #[tokio::test]
    async fn test_application_lifecycle() {
        let cloud = MockCloud::new();
        cloud.seed_application("root", "pw").await;
        let client = cloud.build(&settings(secret("root", "pw"))).await.unwrap();

        let app = client.create_application("vault-web").await.unwrap();
        let sp = client.create_service_principal(&app.app_id).await.unwrap();
        let password = client
            .add_password(&app.object_id, "vault-web", Utc::now() + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(password.secret.len(), 43);
        client.assign_role(&sp.object_id, "reader", "/subscriptions/sub").await.unwrap();

        assert_eq!(cloud.service_principal_count().await, 1);
        assert_eq!(cloud.role_assignment_count().await, 1);

        client.delete_application(&app.object_id).await.unwrap();
        assert_eq!(cloud.service_principal_count().await, 0);
        let again = client.delete_application(&app.object_id).await.unwrap_err();
        assert!(matches!(again, AzSecretsError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_removed_password_stops_authenticating() {
        let cloud = MockCloud::new();
        let (app, password) = cloud.seed_application("root", "pw").await;
        let client = cloud.build(&settings(secret("root", "pw"))).await.unwrap();

        client.remove_password(&app.object_id, &password.key_id).await.unwrap();
        let err = client.check_access().await.unwrap_err();
        assert!(err.to_string().contains("401"));
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let cloud = MockCloud::new();
        let client = cloud
            .build(&settings(CredentialSource::Ambient { client_id: String::new() }))
            .await
            .unwrap();

        cloud.fail(MockOp::CreateApplication, "throttled");
        let err = client.create_application("x").await.unwrap_err();
        assert!(err.to_string().contains("throttled"));

        cloud.clear_faults();
        assert!(client.create_application("x").await.is_ok());
    }
}
