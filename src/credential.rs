//! Issued credentials and the lease records that back them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Storage prefix of lease records.
pub const CREDS_PREFIX: &str = "creds/";

/// Storage path of a lease record.
pub fn lease_path(lease_id: &str) -> String {
    format!("{}{}", CREDS_PREFIX, lease_id)
}

/// A credential returned to the caller.
///
/// `client_secret` is shown once and never persisted.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct IssuedCredential {
    pub lease_id: String,
    pub client_id: String,
    pub client_secret: String,
    pub expires_at: DateTime<Utc>,
    /// Lease duration
    #[serde(with = "secs")]
    pub ttl: Duration,
}

impl std::fmt::Debug for IssuedCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedCredential")
            .field("lease_id", &self.lease_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("ttl", &self.ttl)
            .finish()
    }
}

/// Cloud objects created for a lease, deleted on revocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LeaseResources {
    /// A fresh application and service principal.
    Dynamic {
        app_object_id: String,
        service_principal_id: String,
        #[serde(default)]
        role_assignment_ids: Vec<String>,
    },
    /// A password added to an existing application.
    ExistingApplication {
        app_object_id: String,
        key_id: String,
    },
}

/// Persisted at `creds/<lease_id>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub lease_id: String,
    pub role: String,
    pub client_id: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub resources: LeaseResources,
}

impl LeaseRecord {
    /// Application object the lease's credential belongs to.
    pub fn app_object_id(&self) -> &str {
        match &self.resources {
            LeaseResources::Dynamic { app_object_id, .. }
            | LeaseResources::ExistingApplication { app_object_id, .. } => app_object_id,
        }
    }
}

/// Lease extension returned by renewal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaseRenewal {
    pub lease_id: String,
    pub expires_at: DateTime<Utc>,
    #[serde(with = "secs")]
    pub ttl: Duration,
}

mod secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
}
