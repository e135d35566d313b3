//! Azure cloud environments and their endpoints.

use crate::{AzSecretsError, Result};
use std::str::FromStr;

/// Named deployment of the Azure platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AzureEnvironment {
    /// Global Azure
    Public,
    /// Azure operated by 21Vianet
    China,
    /// Azure US Government
    UsGovernment,
}

/// Endpoint URIs for one environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoints {
    /// Microsoft Graph
    pub graph_uri: &'static str,
    /// Azure Resource Manager
    pub resource_manager_uri: &'static str,
    /// Entra ID (Active Directory) authority
    pub authority_uri: &'static str,
}

impl AzureEnvironment {
    /// All environments, in declaration order.
    pub const ALL: [AzureEnvironment; 3] = [Self::Public, Self::China, Self::UsGovernment];

    /// Returns the configuration name of this environment.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Public => "AZUREPUBLICCLOUD",
            Self::China => "AZURECHINACLOUD",
            Self::UsGovernment => "AZUREUSGOVERNMENTCLOUD",
        }
    }

    /// Returns the endpoint set of this environment.
    pub fn endpoints(&self) -> Endpoints {
        match self {
            Self::Public => Endpoints {
                graph_uri: "https://graph.microsoft.com",
                resource_manager_uri: "https://management.azure.com/",
                authority_uri: "https://login.microsoftonline.com/",
            },
            Self::China => Endpoints {
                graph_uri: "https://microsoftgraph.chinacloudapi.cn",
                resource_manager_uri: "https://management.chinacloudapi.cn/",
                authority_uri: "https://login.chinacloudapi.cn/",
            },
            Self::UsGovernment => Endpoints {
                graph_uri: "https://graph.microsoft.us",
                resource_manager_uri: "https://management.usgovcloudapi.net/",
                authority_uri: "https://login.microsoftonline.us/",
            },
        }
    }
}

impl std::fmt::Display for AzureEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AzureEnvironment {
    type Err = AzSecretsError;

    /// Names are matched case-sensitively.
    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|env| env.name() == s)
            .ok_or_else(|| AzSecretsError::invalid(format!("unknown environment: {:?}", s)))
    }
}

/// Parses an optional environment name; the empty string means "unset".
pub fn parse_environment(name: &str) -> Result<Option<AzureEnvironment>> {
    if name.is_empty() {
        Ok(None)
    } else {
        name.parse().map(Some)
    }
}

/// Resolves an environment name to its endpoints. Empty selects public cloud.
///
/// # Example
///
/// ```
/// use azsecrets::environment::resolve_environment;
///
/// let endpoints = resolve_environment("AZURECHINACLOUD").unwrap();
/// assert_eq!(endpoints.graph_uri, "https://microsoftgraph.chinacloudapi.cn");
/// assert!(resolve_environment("azurechinacloud").is_err());
/// ```
pub fn resolve_environment(name: &str) -> Result<Endpoints> {
    Ok(parse_environment(name)?
        .unwrap_or(AzureEnvironment::Public)
        .endpoints())
}
