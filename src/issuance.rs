//! Dynamic credential issuance, revocation and renewal.
//!
//! Issuance for a dynamic role creates an application, its service principal,
//! a password and the role's assignments. If anything fails after the
//! application exists, including cancellation of the request, the partially
//! created identity is deleted before the error is returned.

use crate::context::RequestContext;
use crate::credential::{lease_path, IssuedCredential, LeaseRecord, LeaseRenewal, LeaseResources};
use crate::providers::{Application, CloudClient};
use crate::role::{Role, RoleStore};
use crate::storage::{get_json, put_json, Storage};
use crate::validation::validate_lease_id;
use crate::{AzSecretsError, EngineConfig, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Issues and revokes credentials, keeping lease records in storage.
pub struct Issuer {
    storage: Arc<dyn Storage>,
    engine: EngineConfig,
}

/// Lease TTL for `role`: the role's ttl or the engine default, capped by the
/// role's max_ttl or the engine maximum.
pub fn lease_ttls(role: &Role, engine: &EngineConfig) -> (Duration, Duration) {
    let max = if role.max_ttl == 0 {
        engine.max_lease_ttl
    } else {
        role.max_ttl().min(engine.max_lease_ttl)
    };
    let ttl = if role.ttl == 0 {
        engine.default_lease_ttl
    } else {
        role.ttl()
    };
    (ttl.min(max), max)
}

fn after(start: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| start.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Treats a missing remote object as already deleted.
fn ignore_not_found(result: Result<()>) -> Result<()> {
    match result {
        Err(AzSecretsError::NotFound(what)) => {
            debug!(%what, "already deleted");
            Ok(())
        }
        other => other,
    }
}

impl Issuer {
    pub fn new(storage: Arc<dyn Storage>, engine: EngineConfig) -> Self {
        Self { storage, engine }
    }

    /// Loads a lease record, `None` if absent.
    pub async fn lease(&self, lease_id: &str) -> Result<Option<LeaseRecord>> {
        validate_lease_id(lease_id)?;
        get_json(self.storage.as_ref(), &lease_path(lease_id)).await
    }

    /// Issues a credential for `role`.
    ///
    /// The work runs on its own task so that dropping the caller's future
    /// does not skip cleanup; cancel through `ctx` instead.
    #[instrument(skip(self, client, ctx, role), fields(mount = %self.engine.mount))]
    pub async fn issue(
        &self,
        client: Arc<dyn CloudClient>,
        ctx: &RequestContext,
        role_name: &str,
        role: Role,
    ) -> Result<IssuedCredential> {
        let task = IssueTask {
            storage: Arc::clone(&self.storage),
            engine: self.engine.clone(),
            client,
            ctx: ctx.clone(),
            role_name: role_name.to_string(),
            role,
        };

        tokio::spawn(task.run())
            .await
            .map_err(|e| AzSecretsError::Other(anyhow::anyhow!("issuance task failed: {}", e)))?
    }

    /// Deletes the cloud objects behind a lease, then its record.
    ///
    /// Objects that no longer exist count as deleted. On any other failure
    /// the record is kept so the caller can retry.
    #[instrument(
        skip(self, client, ctx, record),
        fields(lease_id = %record.lease_id, role = %record.role, app_object_id = %record.app_object_id())
    )]
    pub async fn revoke(
        &self,
        client: &dyn CloudClient,
        ctx: &RequestContext,
        record: &LeaseRecord,
    ) -> Result<()> {
        match &record.resources {
            LeaseResources::Dynamic {
                app_object_id,
                role_assignment_ids,
                ..
            } => {
                delete_assignments(client, ctx, role_assignment_ids)
                    .await
                    .into_iter()
                    .collect::<Result<Vec<()>>>()?;
                ignore_not_found(
                    ctx.run("delete application", client.delete_application(app_object_id))
                        .await,
                )?;
            }
            LeaseResources::ExistingApplication { app_object_id, key_id } => {
                ignore_not_found(
                    ctx.run(
                        "remove password",
                        client.remove_password(app_object_id, key_id),
                    )
                    .await,
                )?;
            }
        }

        self.storage.delete(&lease_path(&record.lease_id)).await?;
        info!("lease revoked");
        Ok(())
    }

    /// Extends a lease without regenerating its credential.
    ///
    /// The new expiry is now plus the role's TTL, capped at the issue time
    /// plus the maximum TTL.
    #[instrument(skip(self, roles))]
    pub async fn renew(&self, roles: &RoleStore, lease_id: &str) -> Result<LeaseRenewal> {
        let mut record = self
            .lease(lease_id)
            .await?
            .ok_or_else(|| AzSecretsError::LeaseExpired(format!("lease {} not found", lease_id)))?;
        let role = roles.require(&record.role).await?;

        let (ttl, max) = lease_ttls(&role, &self.engine);
        let now = Utc::now();
        let max_expiry = after(record.issued_at, max);
        if now >= max_expiry {
            return Err(AzSecretsError::LeaseExpired(format!(
                "lease {} reached its maximum TTL",
                lease_id
            )));
        }

        let expires_at = after(now, ttl).min(max_expiry);
        record.expires_at = expires_at;
        put_json(self.storage.as_ref(), &lease_path(lease_id), &record).await?;

        let ttl = (expires_at - now).to_std().unwrap_or_default();
        debug!(expires_at = %expires_at, "lease renewed");
        Ok(LeaseRenewal {
            lease_id: lease_id.to_string(),
            expires_at,
            ttl,
        })
    }
}

async fn delete_assignments(
    client: &dyn CloudClient,
    ctx: &RequestContext,
    ids: &[String],
) -> Vec<Result<()>> {
    join_all(ids.iter().map(|id| async move {
        ignore_not_found(
            ctx.run("delete role assignment", client.delete_role_assignment(id))
                .await,
        )
    }))
    .await
}

/// One issuance, owned so it can run on a spawned task.
struct IssueTask {
    storage: Arc<dyn Storage>,
    engine: EngineConfig,
    client: Arc<dyn CloudClient>,
    ctx: RequestContext,
    role_name: String,
    role: Role,
}

impl IssueTask {
    async fn run(self) -> Result<IssuedCredential> {
        let lease_id = uuid::Uuid::new_v4().to_string();
        let (ttl, max) = lease_ttls(&self.role, &self.engine);
        let issued_at = Utc::now();
        let expires_at = after(issued_at, ttl);
        let display_name = format!("{}-{}-{}", self.engine.mount, self.role_name, &lease_id[..8]);

        let (record, secret) = if self.role.uses_existing_application() {
            self.add_existing_password(&lease_id, &display_name, after(issued_at, max))
                .await?
        } else {
            self.create_dynamic(&lease_id, &display_name, after(issued_at, max))
                .await?
        };

        let record = LeaseRecord {
            issued_at,
            expires_at,
            ..record
        };

        if let Err(e) = put_json(self.storage.as_ref(), &lease_path(&lease_id), &record).await {
            warn!(error = %e, "failed to persist lease record, cleaning up");
            self.cleanup_record(&record).await;
            return Err(e);
        }

        info!(lease_id = %lease_id, role = %self.role_name, client_id = %record.client_id, "credential issued");
        Ok(IssuedCredential {
            lease_id,
            client_id: record.client_id,
            client_secret: secret,
            expires_at,
            ttl,
        })
    }

    async fn add_existing_password(
        &self,
        lease_id: &str,
        display_name: &str,
        end_date: DateTime<Utc>,
    ) -> Result<(LeaseRecord, String)> {
        let app_object_id = &self.role.application_object_id;
        let app = self
            .ctx
            .run("read application", self.client.application(app_object_id))
            .await?;
        let password = match self
            .ctx
            .run_create(
                "add password",
                self.client.add_password(app_object_id, display_name, end_date),
            )
            .await
        {
            Ok(password) => password,
            Err(e) => {
                // The password may exist even though its key id never arrived.
                if matches!(e, AzSecretsError::Cancelled(_)) {
                    self.sweep_passwords(app_object_id, display_name).await;
                }
                return Err(e);
            }
        };

        let record = LeaseRecord {
            lease_id: lease_id.to_string(),
            role: self.role_name.clone(),
            client_id: app.app_id,
            issued_at: Utc::now(),
            expires_at: end_date,
            resources: LeaseResources::ExistingApplication {
                app_object_id: app_object_id.clone(),
                key_id: password.key_id,
            },
        };
        Ok((record, password.secret))
    }

    async fn create_dynamic(
        &self,
        lease_id: &str,
        display_name: &str,
        end_date: DateTime<Utc>,
    ) -> Result<(LeaseRecord, String)> {
        let app = self
            .ctx
            .run_create("create application", self.client.create_application(display_name))
            .await?;
        debug!(app_object_id = %app.object_id, "application created");

        let mut assignment_ids = Vec::new();
        match self
            .provision(&app, display_name, end_date, &mut assignment_ids)
            .await
        {
            Ok((service_principal_id, secret)) => {
                let record = LeaseRecord {
                    lease_id: lease_id.to_string(),
                    role: self.role_name.clone(),
                    client_id: app.app_id.clone(),
                    issued_at: Utc::now(),
                    expires_at: end_date,
                    resources: LeaseResources::Dynamic {
                        app_object_id: app.object_id.clone(),
                        service_principal_id,
                        role_assignment_ids: assignment_ids,
                    },
                };
                Ok((record, secret))
            }
            Err(e) => {
                warn!(error = %e, app_object_id = %app.object_id, "issuance failed, cleaning up");
                self.cleanup(&app.object_id, &assignment_ids).await;
                Err(e)
            }
        }
    }

    /// Creates the service principal, password and role assignments for
    /// `app`. Assignment ids are pushed as they are created so a failure can
    /// delete them.
    async fn provision(
        &self,
        app: &Application,
        display_name: &str,
        end_date: DateTime<Utc>,
        assignment_ids: &mut Vec<String>,
    ) -> Result<(String, String)> {
        let sp = self
            .ctx
            .run_create(
                "create service principal",
                self.client.create_service_principal(&app.app_id),
            )
            .await?;
        let password = self
            .ctx
            .run_create(
                "add password",
                self.client.add_password(&app.object_id, display_name, end_date),
            )
            .await?;

        let results = join_all(self.role.azure_roles.iter().map(|spec| {
            self.ctx.run_create(
                "assign role",
                self.client.assign_role(&sp.object_id, &spec.role_id, &spec.scope),
            )
        }))
        .await;

        let mut first_error = None;
        for result in results {
            match result {
                Ok(assignment) => assignment_ids.push(assignment.id),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok((sp.object_id, password.secret)),
        }
    }

    /// Best-effort deletion on a context detached from the request, since
    /// the request's own context may be the thing that was cancelled.
    async fn cleanup(&self, app_object_id: &str, assignment_ids: &[String]) {
        let ctx = RequestContext::new().or_timeout(self.engine.request_timeout);
        for result in delete_assignments(self.client.as_ref(), &ctx, assignment_ids).await {
            if let Err(e) = result {
                warn!(error = %e, "failed to delete role assignment during cleanup");
            }
        }
        if let Err(e) = ignore_not_found(
            ctx.run(
                "delete application",
                self.client.delete_application(app_object_id),
            )
            .await,
        ) {
            warn!(error = %e, app_object_id, "failed to delete application during cleanup");
        }
    }

    /// Removes every password on a shared application carrying this lease's
    /// display name.
    async fn sweep_passwords(&self, app_object_id: &str, display_name: &str) {
        let ctx = RequestContext::new().or_timeout(self.engine.request_timeout);
        let key_ids = match ctx
            .run("find passwords", self.client.find_passwords(app_object_id, display_name))
            .await
        {
            Ok(key_ids) => key_ids,
            Err(e) => {
                warn!(error = %e, app_object_id, "failed to list passwords during cleanup");
                return;
            }
        };
        for key_id in key_ids {
            if let Err(e) = ignore_not_found(
                ctx.run("remove password", self.client.remove_password(app_object_id, &key_id))
                    .await,
            ) {
                warn!(error = %e, %key_id, "failed to remove password during cleanup");
            }
        }
    }

    async fn cleanup_record(&self, record: &LeaseRecord) {
        match &record.resources {
            LeaseResources::Dynamic {
                app_object_id,
                role_assignment_ids,
                ..
            } => self.cleanup(app_object_id, role_assignment_ids).await,
            LeaseResources::ExistingApplication { app_object_id, key_id } => {
                let ctx = RequestContext::new().or_timeout(self.engine.request_timeout);
                if let Err(e) = ctx
                    .run("remove password", self.client.remove_password(app_object_id, key_id))
                    .await
                {
                    warn!(error = %e, "failed to remove password during cleanup");
                }
            }
        }
    }
}


#[cfg(all(test, feature = "mock"))]
mod mock_tests {
    use super::*;
    use crate::client::client_settings;
    use crate::providers::mock::{MockCloud, MockOp};
    use crate::providers::ClientFactory;
    use crate::role::AzureRoleSpec;
    use crate::storage::InMemoryStorage;

    struct Fixture {
        cloud: MockCloud,
        client: Arc<dyn CloudClient>,
        storage: Arc<InMemoryStorage>,
        issuer: Issuer,
        roles: RoleStore,
    }

    async fn fixture() -> Fixture {
        let cloud = MockCloud::new();
        let engine = EngineConfig::default()
            .with_option("subscription_id", "sub")
            .with_option("tenant_id", "tenant");
        let config = crate::azure_config::AzureConfig::from_stored(&Default::default()).unwrap();
        let client = cloud.build(&client_settings(&config, &engine).unwrap()).await.unwrap();
        let storage = Arc::new(InMemoryStorage::new());
        Fixture {
            cloud,
            client,
            issuer: Issuer::new(storage.clone(), engine),
            roles: RoleStore::new(storage.clone()),
            storage,
        }
    }

    fn dynamic_role(assignments: usize) -> Role {
        Role {
            azure_roles: (0..assignments)
                .map(|i| AzureRoleSpec {
                    role_name: format!("role-{}", i),
                    role_id: format!("def-{}", i),
                    scope: "/subscriptions/sub".into(),
                })
                .collect(),
            ttl: 3600,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_issue_and_revoke_dynamic() {
        let f = fixture().await;
        let ctx = RequestContext::new();

        let cred = f
            .issuer
            .issue(f.client.clone(), &ctx, "web", dynamic_role(2))
            .await
            .unwrap();
        assert_eq!(cred.ttl, Duration::from_secs(3600));
        assert!(!cred.client_secret.is_empty());
        assert_eq!(f.cloud.application_count().await, 1);
        assert_eq!(f.cloud.role_assignment_count().await, 2);

        let record = f.issuer.lease(&cred.lease_id).await.unwrap().unwrap();
        assert_eq!(record.client_id, cred.client_id);

        f.issuer.revoke(f.client.as_ref(), &ctx, &record).await.unwrap();
        assert_eq!(f.cloud.application_count().await, 0);
        assert_eq!(f.cloud.role_assignment_count().await, 0);
        assert!(f.issuer.lease(&cred.lease_id).await.unwrap().is_none());

        // Second revoke of the same objects succeeds.
        f.issuer.revoke(f.client.as_ref(), &ctx, &record).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_assignment_cleans_up() {
        let f = fixture().await;
        f.cloud.fail(MockOp::AssignRole, "403 Forbidden");

        let err = f
            .issuer
            .issue(f.client.clone(), &RequestContext::new(), "web", dynamic_role(3))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(f.cloud.application_count().await, 0);
        assert_eq!(f.cloud.service_principal_count().await, 0);
        assert!(f.storage.list("creds/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_existing_application_password() {
        let f = fixture().await;
        let (app, _) = f.cloud.seed_application("shared-app", "root-pw").await;
        let role = Role {
            application_object_id: app.object_id.clone(),
            ..Default::default()
        };

        let ctx = RequestContext::new();
        let cred = f.issuer.issue(f.client.clone(), &ctx, "shared", role).await.unwrap();
        assert_eq!(cred.client_id, "shared-app");
        assert_eq!(f.cloud.password_key_ids(&app.object_id).await.len(), 2);
        assert!(f.cloud.secret_is_valid("shared-app", &cred.client_secret).await);

        let record = f.issuer.lease(&cred.lease_id).await.unwrap().unwrap();
        f.issuer.revoke(f.client.as_ref(), &ctx, &record).await.unwrap();
        assert_eq!(f.cloud.password_key_ids(&app.object_id).await.len(), 1);
        assert!(f.cloud.application_exists(&app.object_id).await);
    }

    #[tokio::test]
    async fn test_cancelled_password_on_existing_application_is_removed() {
        let f = fixture().await;
        let (app, _) = f.cloud.seed_application("shared-app", "root-pw").await;
        let role = Role {
            application_object_id: app.object_id.clone(),
            ..Default::default()
        };
        f.cloud.lose_response(MockOp::AddPassword);

        let ctx = RequestContext::new();
        let canceller = ctx.clone();
        let cloud = f.cloud.clone();
        let object_id = app.object_id.clone();
        let cancel_once_added = async move {
            while cloud.password_key_ids(&object_id).await.len() < 2 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            canceller.cancel();
        };

        let (result, ()) = tokio::join!(
            f.issuer.issue(f.client.clone(), &ctx, "shared", role),
            cancel_once_added
        );
        assert!(matches!(result, Err(AzSecretsError::Cancelled(_))));

        f.cloud.clear_faults();
        assert_eq!(f.cloud.password_key_ids(&app.object_id).await.len(), 1);
        assert!(f.cloud.secret_is_valid("shared-app", "root-pw").await);
        assert!(f.storage.list("creds/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_revoke_failure_keeps_record() {
        let f = fixture().await;
        let ctx = RequestContext::new();
        let cred = f
            .issuer
            .issue(f.client.clone(), &ctx, "web", dynamic_role(1))
            .await
            .unwrap();
        let record = f.issuer.lease(&cred.lease_id).await.unwrap().unwrap();

        f.cloud.fail(MockOp::DeleteApplication, "503 Service Unavailable");
        let err = f.issuer.revoke(f.client.as_ref(), &ctx, &record).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(f.issuer.lease(&cred.lease_id).await.unwrap().is_some());

        f.cloud.clear_faults();
        f.issuer.revoke(f.client.as_ref(), &ctx, &record).await.unwrap();
    }

    #[tokio::test]
    async fn test_renew_caps_at_max_ttl() {
        let f = fixture().await;
        let role = Role {
            ttl: 600,
            max_ttl: 900,
            ..dynamic_role(0)
        };
        let role = Role {
            application_object_id: f.cloud.seed_application("app", "pw").await.0.object_id,
            ..role
        };
        f.roles.put("web", &role).await.unwrap();

        let ctx = RequestContext::new();
        let cred = f.issuer.issue(f.client.clone(), &ctx, "web", role).await.unwrap();

        let renewal = f.issuer.renew(&f.roles, &cred.lease_id).await.unwrap();
        assert!(renewal.ttl <= Duration::from_secs(600));

        let mut record = f.issuer.lease(&cred.lease_id).await.unwrap().unwrap();
        record.issued_at = Utc::now() - chrono::Duration::seconds(850);
        put_json(f.storage.as_ref(), &lease_path(&cred.lease_id), &record)
            .await
            .unwrap();
        let renewal = f.issuer.renew(&f.roles, &cred.lease_id).await.unwrap();
        assert!(renewal.ttl <= Duration::from_secs(50));

        record.issued_at = Utc::now() - chrono::Duration::seconds(901);
        put_json(f.storage.as_ref(), &lease_path(&cred.lease_id), &record)
            .await
            .unwrap();
        let err = f.issuer.renew(&f.roles, &cred.lease_id).await.unwrap_err();
        assert!(matches!(err, AzSecretsError::LeaseExpired(_)));

        f.roles.delete("web").await.unwrap();
        let err = f.issuer.renew(&f.roles, &cred.lease_id).await.unwrap_err();
        assert!(matches!(err, AzSecretsError::RoleNotFound(_)));
    }
}
