//! Azure cloud provider configuration (`azure.json`)
//!
//! Kubernetes nodes on Azure carry a cloud config file describing the
//! subscription, tenant and service principal. Only the fields needed to
//! reach ARM are read; everything else in the file is ignored.

use std::fmt;
use std::path::Path;

use serde::Deserialize;

use crate::{Error, Result};

/// Default location of the cloud config on AKS/aks-engine nodes
pub const DEFAULT_CLOUD_CONFIG_PATH: &str = "/etc/kubernetes/azure.json";

/// Parsed cloud config
#[derive(Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AzureCloudConfig {
    /// Cloud name (e.g., "AzurePublicCloud")
    #[serde(default)]
    pub cloud: Option<String>,

    /// Azure AD tenant
    #[serde(default)]
    pub tenant_id: Option<String>,

    /// Subscription holding the compute resources
    #[serde(default)]
    pub subscription_id: Option<String>,

    /// Resource group of the cluster nodes
    #[serde(default)]
    pub resource_group: Option<String>,

    /// Service principal client ID
    #[serde(default)]
    pub aad_client_id: Option<String>,

    /// Service principal secret
    #[serde(default)]
    pub aad_client_secret: Option<String>,

    /// Authenticate through the node's managed identity instead
    #[serde(default)]
    pub use_managed_identity_extension: bool,

    /// Client ID of the managed identity to authenticate with
    #[serde(default, rename = "userAssignedIdentityID")]
    pub user_assigned_identity_id: Option<String>,

    /// Explicit ARM endpoint, overriding the cloud default
    #[serde(default)]
    pub resource_manager_endpoint: Option<String>,
}

impl fmt::Debug for AzureCloudConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AzureCloudConfig")
            .field("cloud", &self.cloud)
            .field("tenant_id", &self.tenant_id)
            .field("subscription_id", &self.subscription_id)
            .field("resource_group", &self.resource_group)
            .field("aad_client_id", &self.aad_client_id)
            .field(
                "aad_client_secret",
                &self.aad_client_secret.as_ref().map(|_| "<redacted>"),
            )
            .field(
                "use_managed_identity_extension",
                &self.use_managed_identity_extension,
            )
            .field("user_assigned_identity_id", &self.user_assigned_identity_id)
            .field("resource_manager_endpoint", &self.resource_manager_endpoint)
            .finish()
    }
}

impl AzureCloudConfig {
    /// Parse a cloud config document
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::configuration(format!("invalid cloud config: {}", e)))
    }

    /// Read and parse a cloud config file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let display = path.display().to_string();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration_in(&display, format!("failed reading azure config: {}", e))
        })?;
        serde_json::from_str(&contents).map_err(|e| {
            Error::configuration_in(&display, format!("invalid cloud config: {}", e))
        })
    }

    /// Subscription ID, required to address any resource
    pub fn subscription_id(&self) -> Result<&str> {
        self.subscription_id
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| Error::configuration("cloud config has no subscriptionId"))
    }

    /// ARM endpoint for the configured cloud
    ///
    /// An explicit `resourceManagerEndpoint` wins; otherwise the endpoint is
    /// derived from the cloud name, defaulting to the public cloud.
    pub fn resource_manager_endpoint(&self) -> Result<String> {
        if let Some(endpoint) = self
            .resource_manager_endpoint
            .as_deref()
            .filter(|e| !e.trim().is_empty())
        {
            return Ok(endpoint.to_string());
        }

        let cloud = self.cloud.as_deref().unwrap_or("").trim();
        let endpoint = match cloud.to_ascii_lowercase().as_str() {
            "" | "azurepubliccloud" | "azurecloud" => "https://management.azure.com/",
            "azurechinacloud" => "https://management.chinacloudapi.cn/",
            "azureusgovernmentcloud" => "https://management.usgovcloudapi.net/",
            "azuregermancloud" => "https://management.microsoftazure.de/",
            _ => {
                return Err(Error::configuration(format!(
                    "unknown azure cloud '{}'",
                    cloud
                )))
            }
        };
        Ok(endpoint.to_string())
    }
}
