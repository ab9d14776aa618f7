//! Rate-limited scale-set client
//!
//! Wraps a [`ScaleSetApi`] with client-side throttling, call timing and
//! operation counters. Nothing here retries: a throttled or failed call is
//! returned to the caller, who decides when to come back.

use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
#[cfg(test)]
use mockall::automock;
use tracing::{debug, warn};

use super::arm::{ArmError, ScaleSetApi};
use super::model::{VirtualMachineScaleSet, VirtualMachineScaleSetUpdate};
use super::throttle::{CallKind, Throttle, DEFAULT_RETRY_AFTER};
use crate::metrics::{
    CallCategory, CallCounter, CallStats, Operation, OperationTimer, OtelReporter, Reporter,
    StatsSnapshot,
};
use crate::{Error, Result};

/// Scale-set operations consumed by the reconciliation loop
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ScaleSetClient: Send + Sync {
    /// Read a scale set
    async fn get(&self, resource_group: &str, name: &str) -> Result<VirtualMachineScaleSet>;

    /// Patch the identity of a scale set and wait for ARM to apply it
    async fn update_identities(
        &self,
        resource_group: &str,
        name: &str,
        vmss: &VirtualMachineScaleSet,
    ) -> Result<()>;
}

/// Scale-set client with throttling and metrics
pub struct VmssClient<A, R = OtelReporter> {
    api: A,
    reporter: R,
    throttle: Throttle,
    stats: CallStats,
}

impl<A: ScaleSetApi> VmssClient<A> {
    /// Create a client reporting to OpenTelemetry
    pub fn new(api: A) -> Self {
        Self::with_reporter(api, OtelReporter)
    }
}

impl<A: ScaleSetApi, R: Reporter> VmssClient<A, R> {
    /// Create a client with a custom metrics reporter
    pub fn with_reporter(api: A, reporter: R) -> Self {
        Self {
            api,
            reporter,
            throttle: Throttle::new(),
            stats: CallStats::new(),
        }
    }

    /// Throttle state shared by all calls on this client
    pub fn throttle(&self) -> &Throttle {
        &self.throttle
    }

    /// Current call counters and aggregated call time
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    fn ensure_not_throttled(&self, kind: CallKind, operation: Operation) -> Result<()> {
        self.throttle
            .check(kind, Utc::now())
            .map_err(|until| Error::throttled(operation.as_str(), until))
    }

    /// Wrap an ARM failure, advancing the throttle if ARM asked us to back off
    fn control_plane_error(
        &self,
        kind: CallKind,
        operation: Operation,
        resource_group: &str,
        name: &str,
        source: ArmError,
    ) -> Error {
        if source.is_throttled() {
            let retry_after = source.retry_after().unwrap_or(DEFAULT_RETRY_AFTER);
            let until = self.throttle.defer_for(kind, Utc::now(), retry_after);
            warn!(
                resource_group,
                vmss = name,
                kind = kind.as_str(),
                retry_after = %until,
                "ARM throttled the client"
            );
        }
        Error::control_plane(operation.as_str(), resource_group, name, source)
    }

    async fn try_get(&self, resource_group: &str, name: &str) -> Result<VirtualMachineScaleSet> {
        self.ensure_not_throttled(CallKind::Read, Operation::GetVmss)?;
        self.api.get(resource_group, name).await.map_err(|e| {
            self.control_plane_error(CallKind::Read, Operation::GetVmss, resource_group, name, e)
        })
    }

    async fn try_update(
        &self,
        resource_group: &str,
        name: &str,
        vmss: &VirtualMachineScaleSet,
    ) -> Result<()> {
        self.ensure_not_throttled(CallKind::Write, Operation::UpdateVmss)?;
        let wrap = |e| {
            self.control_plane_error(CallKind::Write, Operation::UpdateVmss, resource_group, name, e)
        };

        let pending = self
            .api
            .begin_update(
                resource_group,
                name,
                VirtualMachineScaleSetUpdate::identity_of(vmss),
            )
            .await
            .map_err(wrap)?;
        self.api.wait_for_completion(pending).await.map_err(wrap)
    }
}

#[async_trait]
impl<A: ScaleSetApi, R: Reporter> ScaleSetClient for VmssClient<A, R> {
    async fn get(&self, resource_group: &str, name: &str) -> Result<VirtualMachineScaleSet> {
        let timer = OperationTimer::start(Operation::GetVmss);
        let begin = timer.started_at();
        let result = self.try_get(resource_group, name).await;

        if result.is_ok() {
            self.stats.increment(CallCounter::GetCallsTotal, 1);
            self.stats
                .aggregate_concurrent(CallCategory::CloudGet, begin, Instant::now());
            debug!(resource_group, vmss = name, "Fetched scale set");
        }
        timer.finish(&self.reporter, result.is_ok());
        result
    }

    async fn update_identities(
        &self,
        resource_group: &str,
        name: &str,
        vmss: &VirtualMachineScaleSet,
    ) -> Result<()> {
        let timer = OperationTimer::start(Operation::UpdateVmss);
        let begin = timer.started_at();
        let result = self.try_update(resource_group, name, vmss).await;

        if result.is_ok() {
            self.stats.increment(CallCounter::PatchCallsTotal, 1);
            self.stats
                .aggregate_concurrent(CallCategory::CloudPatch, begin, Instant::now());
            debug!(resource_group, vmss = name, "Updated scale set identities");
        }
        timer.finish(&self.reporter, result.is_ok());
        result
    }
}
