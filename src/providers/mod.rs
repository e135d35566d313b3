//! Cloud control-plane collaborator.
//!
//! [`CloudClient`] is the narrow slice of the Microsoft Graph and Azure
//! Resource Manager APIs the engine needs; [`ClientFactory`] authenticates and
//! builds one from resolved [`ClientSettings`]. Implementations map a missing
//! remote object to [`AzSecretsError::NotFound`](crate::AzSecretsError::NotFound)
//! and every other failure to
//! [`AzSecretsError::UpstreamUnavailable`](crate::AzSecretsError::UpstreamUnavailable).

#[cfg(feature = "mock")]
pub mod mock;

use crate::client::ClientSettings;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// An application registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    /// Directory object id
    pub object_id: String,
    /// Application (client) id
    pub app_id: String,
    pub display_name: String,
}

/// A service principal backing an application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePrincipal {
    pub object_id: String,
    pub app_id: String,
}

/// A password credential on an application.
#[derive(Clone, PartialEq, Eq)]
pub struct PasswordCredential {
    pub key_id: String,
    pub display_name: String,
    pub secret: String,
    pub end_date: DateTime<Utc>,
}

impl std::fmt::Debug for PasswordCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswordCredential")
            .field("key_id", &self.key_id)
            .field("display_name", &self.display_name)
            .field("secret", &"<redacted>")
            .field("end_date", &self.end_date)
            .finish()
    }
}

/// A role assignment granted to a principal at a scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleAssignment {
    pub id: String,
    pub principal_id: String,
    pub role_id: String,
    pub scope: String,
}

/// Control-plane operations used by issuance and rotation.
#[async_trait]
pub trait CloudClient: Send + Sync {
    /// Verifies the client's credentials are accepted.
    async fn check_access(&self) -> Result<()>;

    /// Looks up an application by its application (client) id.
    async fn application_by_app_id(&self, app_id: &str) -> Result<Application>;

    /// Looks up an application by object id.
    async fn application(&self, object_id: &str) -> Result<Application>;

    /// Registers a new application.
    async fn create_application(&self, display_name: &str) -> Result<Application>;

    /// Deletes an application and its service principal.
    async fn delete_application(&self, object_id: &str) -> Result<()>;

    /// Creates the service principal for an application.
    async fn create_service_principal(&self, app_id: &str) -> Result<ServicePrincipal>;

    /// Adds a generated password to an application.
    async fn add_password(
        &self,
        app_object_id: &str,
        display_name: &str,
        end_date: DateTime<Utc>,
    ) -> Result<PasswordCredential>;

    /// Key ids of the passwords on an application carrying `display_name`.
    async fn find_passwords(&self, app_object_id: &str, display_name: &str) -> Result<Vec<String>>;

    /// Removes a password from an application.
    async fn remove_password(&self, app_object_id: &str, key_id: &str) -> Result<()>;

    /// Resolves a role definition name to its id at `scope`. Returns every
    /// match; callers decide how to treat ambiguity.
    async fn find_role_definitions(&self, scope: &str, role_name: &str) -> Result<Vec<String>>;

    /// Assigns a role to a principal.
    async fn assign_role(
        &self,
        principal_id: &str,
        role_id: &str,
        scope: &str,
    ) -> Result<RoleAssignment>;

    /// Deletes a role assignment.
    async fn delete_role_assignment(&self, assignment_id: &str) -> Result<()>;
}

/// Authenticates and builds a [`CloudClient`].
#[async_trait]
pub trait ClientFactory: Send + Sync {
    /// Builds a client. Token exchange for federated credentials happens here.
    async fn build(&self, settings: &ClientSettings) -> Result<Arc<dyn CloudClient>>;
}
