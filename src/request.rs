//! Typed requests and responses exchanged with the host.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// An operation routed to the engine by the host.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// Create (`create == true`) or update the mount configuration.
    WriteConfig { data: Value, create: bool },
    ReadConfig,
    DeleteConfig,
    WriteRole { name: String, data: Value },
    ReadRole { name: String },
    ListRoles,
    DeleteRole { name: String },
    /// Issue a credential for a role.
    ReadCreds { role: String },
    RotateRoot,
    ReadRotationStatus,
    RevokeLease { lease_id: String },
    RenewLease { lease_id: String },
}

impl Request {
    /// Short operation name for logs.
    pub fn operation(&self) -> &'static str {
        match self {
            Self::WriteConfig { create: true, .. } => "config.create",
            Self::WriteConfig { create: false, .. } => "config.update",
            Self::ReadConfig => "config.read",
            Self::DeleteConfig => "config.delete",
            Self::WriteRole { .. } => "role.write",
            Self::ReadRole { .. } => "role.read",
            Self::ListRoles => "role.list",
            Self::DeleteRole { .. } => "role.delete",
            Self::ReadCreds { .. } => "creds.read",
            Self::RotateRoot => "rotate-root",
            Self::ReadRotationStatus => "rotate-root.status",
            Self::RevokeLease { .. } => "lease.revoke",
            Self::RenewLease { .. } => "lease.renew",
        }
    }
}

/// Lease attached to a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaseInfo {
    pub lease_id: String,
    /// Seconds until expiry
    pub ttl: u64,
    pub expires_at: DateTime<Utc>,
    pub renewable: bool,
}

/// Result of a request.
///
/// Caller mistakes (invalid configuration, unknown role, expired lease) are
/// reported in `error` rather than as an `Err` from the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Response {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease: Option<LeaseInfo>,
}

impl Response {
    /// Response with no body.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Response carrying `data`.
    pub fn with_data(data: Value) -> Self {
        Self {
            data: Some(data),
            ..Default::default()
        }
    }

    /// Error response.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn with_warnings(mut self, warnings: impl IntoIterator<Item = String>) -> Self {
        self.warnings.extend(warnings);
        self
    }

    pub fn with_lease(mut self, lease: LeaseInfo) -> Self {
        self.lease = Some(lease);
        self
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Field of `data`, if present.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.as_ref().and_then(|d| d.get(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_response_builders() {
        let resp = Response::with_data(json!({"tenant_id": "t"}))
            .with_warnings(vec!["ignored unknown field \"x\"".to_string()]);
        assert_eq!(resp.get("tenant_id"), Some(&json!("t")));
        assert_eq!(resp.warnings.len(), 1);
        assert!(!resp.is_error());

        let resp = Response::error("invalid configuration: bad");
        assert!(resp.is_error());
        assert_eq!(resp.get("tenant_id"), None);
    }

    #[test]
    fn test_response_serialization_skips_empty() {
        let value = serde_json::to_value(Response::empty()).unwrap();
        assert_eq!(value, json!({}));
    }

    #[test]
    fn test_operation_names() {
        let req = Request::WriteConfig {
            data: json!({}),
            create: true,
        };
        assert_eq!(req.operation(), "config.create");
        assert_eq!(Request::RotateRoot.operation(), "rotate-root");
    }
}
