//! Azure identity controller - keeps managed identities attached to compute
//!
//! Attaches and detaches Azure AD user-assigned managed identities on
//! virtual machines and virtual machine scale sets, preserving any
//! system-assigned identity, and patches scale sets through a rate-limited
//! Azure Resource Manager client.
//!
//! # Modules
//!
//! - [`identity`] - identity-type transitions and the per-resource identity view
//! - [`azure`] - ARM documents, transport, throttling and the scale-set client
//! - [`reconcile`] - read, mutate and patch one scale set
//! - [`metrics`] - call latency, error counts and per-client call statistics
//! - [`telemetry`] - logging and metrics export setup
//! - [`error`] - Error types for the controller

#![deny(missing_docs)]

pub mod azure;
pub mod error;
pub mod identity;
pub mod metrics;
pub mod reconcile;
pub mod telemetry;

pub use error::Error;
pub use identity::{next_identity_type, IdentityHolder, IdentityInfo};
pub use reconcile::{reconcile_scale_set_identities, ReconcileOutcome};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
