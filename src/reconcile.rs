//! Apply a desired identity mutation to one scale set
//!
//! Read the scale set, compute the identity delta, and patch only when
//! something changed. Deciding *which* identities belong on a scale set is
//! the caller's job.

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::azure::ScaleSetClient;
use crate::identity::IdentityHolder;
use crate::Result;

/// Result of a single reconciliation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Whether a patch was sent to ARM
    pub patched: bool,
    /// Identities attached before the mutation
    pub before: Vec<String>,
}

/// Reconcile the user-assigned identities of a scale set
///
/// `desired` maps identity resource IDs to `true` (ensure present) or
/// `false` (ensure absent). The read, the local mutation and the patch are
/// separate steps; concurrent reconciliations of the same scale set must be
/// serialized by the caller.
pub async fn reconcile_scale_set_identities<C: ScaleSetClient + ?Sized>(
    client: &C,
    resource_group: &str,
    name: &str,
    desired: &BTreeMap<String, bool>,
) -> Result<ReconcileOutcome> {
    let mut vmss = client.get(resource_group, name).await?;

    let (changed, before) = {
        if vmss.identity.is_none() {
            debug!(resource_group, vmss = name, "Scale set has no identity, resetting");
        }
        let mut info = vmss.identity_info_or_reset();
        let before = info.user_identity_list();
        (info.set_user_identities(desired), before)
    };

    if !changed {
        debug!(resource_group, vmss = name, "Identities already up to date");
        return Ok(ReconcileOutcome {
            patched: false,
            before,
        });
    }

    client.update_identities(resource_group, name, &vmss).await?;
    info!(
        resource_group,
        vmss = name,
        identities = desired.len(),
        "Reconciled scale set identities"
    );
    Ok(ReconcileOutcome {
        patched: true,
        before,
    })
}
