//! Azure Resource Manager documents for compute resources
//!
//! Only the identity sub-object is modeled in detail. Every other property
//! of a VM or scale set is kept opaquely so a document can be read, mutated
//! and inspected without loss.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity classification of a compute resource (`identity.type` in ARM)
///
/// ARM spells the combined value `"SystemAssigned, UserAssigned"`. Parsing is
/// case-insensitive and ignores whitespace; any other string is kept verbatim
/// in [`ResourceIdentityType::Unrecognized`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ResourceIdentityType {
    /// No identity attached
    None,
    /// Only user-assigned identities
    UserAssigned,
    /// Only the system-assigned identity
    SystemAssigned,
    /// System-assigned identity plus user-assigned identities
    SystemAssignedUserAssigned,
    /// A value this crate does not know about
    Unrecognized(String),
}

impl ResourceIdentityType {
    /// ARM wire value
    pub fn as_str(&self) -> &str {
        match self {
            Self::None => "None",
            Self::UserAssigned => "UserAssigned",
            Self::SystemAssigned => "SystemAssigned",
            Self::SystemAssignedUserAssigned => "SystemAssigned, UserAssigned",
            Self::Unrecognized(raw) => raw,
        }
    }

    /// Whether the resource carries a system-assigned identity
    pub fn has_system_assigned(&self) -> bool {
        matches!(self, Self::SystemAssigned | Self::SystemAssignedUserAssigned)
    }
}

impl From<String> for ResourceIdentityType {
    fn from(raw: String) -> Self {
        let normalized: String = raw
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "none" => Self::None,
            "userassigned" => Self::UserAssigned,
            "systemassigned" => Self::SystemAssigned,
            "systemassigned,userassigned" => Self::SystemAssignedUserAssigned,
            _ => Self::Unrecognized(raw),
        }
    }
}

impl From<&str> for ResourceIdentityType {
    fn from(raw: &str) -> Self {
        Self::from(raw.to_string())
    }
}

impl From<ResourceIdentityType> for String {
    fn from(value: ResourceIdentityType) -> Self {
        match value {
            ResourceIdentityType::Unrecognized(raw) => raw,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for ResourceIdentityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value of one entry in `userAssignedIdentities`
///
/// Both fields are filled in by ARM and never sent back, so an entry
/// serializes as `{}`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserAssignedIdentityValue {
    /// Object ID of the identity's service principal
    #[serde(default, skip_serializing)]
    pub principal_id: Option<String>,

    /// Client (application) ID of the identity
    #[serde(default, skip_serializing)]
    pub client_id: Option<String>,
}

/// Map of user-assigned identities keyed by identity resource ID
///
/// `None` is an explicit detach marker and serializes as `null`, which ARM
/// PATCH semantics interpret as "remove this identity".
pub type UserAssignedIdentities = BTreeMap<String, Option<UserAssignedIdentityValue>>;

/// The `identity` sub-object shared by virtual machines and scale sets
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceIdentity {
    /// Identity classification; unset when ARM omits it
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub identity_type: Option<ResourceIdentityType>,

    /// Principal ID of the system-assigned identity (read-only)
    #[serde(default, skip_serializing)]
    pub principal_id: Option<String>,

    /// Tenant ID of the system-assigned identity (read-only)
    #[serde(default, skip_serializing)]
    pub tenant_id: Option<String>,

    /// User-assigned identities, including detach markers for a pending patch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_assigned_identities: Option<UserAssignedIdentities>,
}

impl ResourceIdentity {
    /// A `UserAssigned` identity with an empty identity map
    pub fn empty_user_assigned() -> Self {
        Self {
            identity_type: Some(ResourceIdentityType::UserAssigned),
            user_assigned_identities: Some(BTreeMap::new()),
            ..Default::default()
        }
    }
}

/// A virtual machine scale set as returned by ARM
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineScaleSet {
    /// Fully qualified resource ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Resource name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Azure region
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,

    /// Resource tags
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<BTreeMap<String, String>>,

    /// Managed identities; `None` when the scale set has none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<ResourceIdentity>,

    /// Everything else ARM returned (sku, properties, zones, ...)
    #[serde(flatten)]
    pub other: serde_json::Map<String, serde_json::Value>,
}

/// A virtual machine as returned by ARM
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachine {
    /// Fully qualified resource ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Resource name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Azure region
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,

    /// Resource tags
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<BTreeMap<String, String>>,

    /// Managed identities; `None` when the VM has none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<ResourceIdentity>,

    /// Everything else ARM returned
    #[serde(flatten)]
    pub other: serde_json::Map<String, serde_json::Value>,
}

/// PATCH body for a scale set; carries only the identity
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct VirtualMachineScaleSetUpdate {
    /// Identity to apply
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<ResourceIdentity>,
}

impl VirtualMachineScaleSetUpdate {
    /// Build an identity-only patch from a (mutated) scale set
    pub fn identity_of(vmss: &VirtualMachineScaleSet) -> Self {
        Self {
            identity: vmss.identity.clone(),
        }
    }
}
