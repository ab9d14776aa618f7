//! Error types for the identity controller
//!
//! Errors are structured with fields to aid debugging in production.
//! Control-plane failures always carry the operation, resource group and
//! resource name alongside the underlying ARM error.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::azure::arm::ArmError;

/// Main error type for identity reconciliation
#[derive(Debug, Error)]
pub enum Error {
    /// The client refused to send a request because ARM asked it to back off
    #[error("{operation} client throttled, retry after: {retry_after}")]
    Throttled {
        /// Operation that was refused (e.g., "get-vmss")
        operation: String,
        /// Earliest instant at which the call may be attempted again
        retry_after: DateTime<Utc>,
    },

    /// Azure Resource Manager rejected or failed the call
    #[error("{operation} failed for {name} in resource group {resource_group}: {source}")]
    ControlPlane {
        /// Operation that failed (e.g., "update-vmss")
        operation: String,
        /// Resource group of the target resource
        resource_group: String,
        /// Name of the target resource
        name: String,
        /// The underlying ARM error
        #[source]
        source: ArmError,
    },

    /// Startup configuration is unusable (cloud config, log level, telemetry)
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of what's wrong
        message: String,
        /// File the configuration was read from, if any
        path: Option<String>,
    },
}

impl Error {
    /// Create a throttled error for the given operation
    pub fn throttled(operation: impl Into<String>, retry_after: DateTime<Utc>) -> Self {
        Self::Throttled {
            operation: operation.into(),
            retry_after,
        }
    }

    /// Wrap an ARM error with the resource it was issued against
    pub fn control_plane(
        operation: impl Into<String>,
        resource_group: impl Into<String>,
        name: impl Into<String>,
        source: ArmError,
    ) -> Self {
        Self::ControlPlane {
            operation: operation.into(),
            resource_group: resource_group.into(),
            name: name.into(),
            source,
        }
    }

    /// Create a configuration error with the given message
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
            path: None,
        }
    }

    /// Create a configuration error for a specific file
    pub fn configuration_in(path: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
            path: Some(path.into()),
        }
    }

    /// Whether re-invoking the same call later may succeed
    ///
    /// Nothing in this crate retries on its own; callers use this to decide
    /// whether to requeue.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Throttled { .. } => true,
            Self::ControlPlane { source, .. } => source.is_retryable(),
            Self::Configuration { .. } => false,
        }
    }

    /// Instant after which a throttled call may be retried
    pub fn retry_after(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Throttled { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}
