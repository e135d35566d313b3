//! Roles: what an issued credential is allowed to do.

use crate::context::RequestContext;
use crate::duration::DurationInput;
use crate::providers::CloudClient;
use crate::storage::{get_json, put_json, Storage};
use crate::validation::validate_role_name;
use crate::{AzSecretsError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Storage prefix of role records.
pub const ROLES_PREFIX: &str = "roles/";

fn role_path(name: &str) -> String {
    format!("{}{}", ROLES_PREFIX, name)
}

/// A role assignment granted to principals issued under a role.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AzureRoleSpec {
    /// Role definition name, resolved to `role_id` on write when the id is empty
    pub role_name: String,
    pub role_id: String,
    pub scope: String,
}

/// Persisted role. Durations are whole seconds; zero means engine default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Role {
    pub azure_roles: Vec<AzureRoleSpec>,
    pub application_object_id: String,
    pub ttl: u64,
    pub max_ttl: u64,
}

impl Role {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl)
    }

    pub fn max_ttl(&self) -> Duration {
        Duration::from_secs(self.max_ttl)
    }

    /// True when credentials are passwords on an existing application.
    pub fn uses_existing_application(&self) -> bool {
        !self.application_object_id.is_empty()
    }
}

/// Body of a role write. Omitted fields keep their stored values.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RolePatch {
    pub azure_roles: Option<Vec<AzureRoleSpec>>,
    pub application_object_id: Option<String>,
    pub ttl: Option<DurationInput>,
    pub max_ttl: Option<DurationInput>,

    #[serde(flatten)]
    pub unknown: BTreeMap<String, Value>,
}

impl RolePatch {
    /// Decodes a request body.
    pub fn from_value(data: Value) -> Result<Self> {
        serde_json::from_value(data)
            .map_err(|e| AzSecretsError::invalid(format!("malformed role: {}", e)))
    }

    /// Applies the patch onto `base` and checks the result is issuable.
    pub fn apply(&self, base: &Role) -> Result<Role> {
        let mut role = base.clone();
        if let Some(roles) = &self.azure_roles {
            role.azure_roles = roles.clone();
        }
        if let Some(id) = &self.application_object_id {
            role.application_object_id = id.trim().to_string();
        }
        if let Some(ttl) = &self.ttl {
            role.ttl = ttl.parse("ttl")?.as_secs();
        }
        if let Some(max_ttl) = &self.max_ttl {
            role.max_ttl = max_ttl.parse("max_ttl")?.as_secs();
        }

        if role.max_ttl > 0 && role.ttl > role.max_ttl {
            return Err(AzSecretsError::invalid("ttl cannot be greater than max_ttl"));
        }
        if role.azure_roles.is_empty() && !role.uses_existing_application() {
            return Err(AzSecretsError::invalid(
                "either azure_roles or application_object_id must be provided",
            ));
        }
        for spec in &role.azure_roles {
            if spec.scope.is_empty() {
                return Err(AzSecretsError::invalid("every azure role requires a scope"));
            }
            if spec.role_name.is_empty() && spec.role_id.is_empty() {
                return Err(AzSecretsError::invalid(
                    "every azure role requires role_name or role_id",
                ));
            }
        }
        Ok(role)
    }
}

/// Resolves role names to definition ids and checks that a referenced
/// existing application is reachable.
pub async fn resolve_role(
    client: &dyn CloudClient,
    ctx: &RequestContext,
    role: &mut Role,
) -> Result<()> {
    for spec in role.azure_roles.iter_mut().filter(|s| s.role_id.is_empty()) {
        let ids = ctx
            .run(
                "find role definitions",
                client.find_role_definitions(&spec.scope, &spec.role_name),
            )
            .await?;
        match ids.as_slice() {
            [id] => {
                debug!(role_name = %spec.role_name, role_id = %id, "resolved role definition");
                spec.role_id = id.clone();
            }
            [] => {
                return Err(AzSecretsError::invalid(format!(
                    "no role definition named {:?} at scope {}",
                    spec.role_name, spec.scope
                )))
            }
            _ => {
                return Err(AzSecretsError::invalid(format!(
                    "multiple role definitions named {:?} at scope {}, specify role_id",
                    spec.role_name, spec.scope
                )))
            }
        }
    }

    if role.uses_existing_application() {
        match ctx
            .run("read application", client.application(&role.application_object_id))
            .await
        {
            Ok(_) => {}
            Err(AzSecretsError::NotFound(_)) => {
                return Err(AzSecretsError::invalid(format!(
                    "application {} does not exist",
                    role.application_object_id
                )))
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Role records in storage.
pub struct RoleStore {
    storage: Arc<dyn Storage>,
}

impl RoleStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Loads a role, `None` if absent.
    pub async fn get(&self, name: &str) -> Result<Option<Role>> {
        validate_role_name(name)?;
        get_json(self.storage.as_ref(), &role_path(name)).await
    }

    /// Loads a role or fails with [`AzSecretsError::RoleNotFound`].
    pub async fn require(&self, name: &str) -> Result<Role> {
        self.get(name)
            .await?
            .ok_or_else(|| AzSecretsError::RoleNotFound(name.to_string()))
    }

    pub async fn put(&self, name: &str, role: &Role) -> Result<()> {
        validate_role_name(name)?;
        put_json(self.storage.as_ref(), &role_path(name), role).await
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        validate_role_name(name)?;
        self.storage.delete(&role_path(name)).await
    }

    /// Role names, sorted.
    pub async fn list(&self) -> Result<Vec<String>> {
        self.storage.list(ROLES_PREFIX).await
    }
}
