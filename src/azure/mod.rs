//! Azure Resource Manager integration
//!
//! - [`model`] - VM and scale-set documents and their identity sub-object
//! - [`arm`] - HTTP transport and long-running operation polling
//! - [`throttle`] - client-side back-off after ARM throttling
//! - [`vmss`] - rate-limited scale-set client with metrics
//! - [`cloud_config`] - `azure.json` parsing and endpoint resolution

pub mod arm;
pub mod cloud_config;
pub mod model;
pub mod throttle;
pub mod vmss;

pub use arm::{ArmError, ArmScaleSetApi, Authorizer, ScaleSetApi, StaticToken};
pub use cloud_config::AzureCloudConfig;
pub use model::{
    ResourceIdentity, ResourceIdentityType, VirtualMachine, VirtualMachineScaleSet,
};
pub use vmss::{ScaleSetClient, VmssClient};
