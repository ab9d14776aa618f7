//! Identity attachment for Azure compute resources
//!
//! Virtual machines and scale sets both carry an `identity` sub-object.
//! [`IdentityHolder`] lets either kind be mutated the same way, and
//! [`IdentityInfo`] computes the minimal user-assigned identity patch.
//!
//! Identity resource IDs are case-insensitive; this module always stores
//! them lower-cased.

use std::collections::{BTreeMap, BTreeSet};

use crate::azure::model::{
    ResourceIdentity, ResourceIdentityType, UserAssignedIdentities, UserAssignedIdentityValue,
    VirtualMachine, VirtualMachineScaleSet,
};

/// Next identity classification once user-assigned identities are added
///
/// A system-assigned identity is never dropped. Unrecognized
/// classifications map to `None` rather than being guessed at.
pub fn next_identity_type(current: Option<&ResourceIdentityType>) -> ResourceIdentityType {
    match current {
        None | Some(ResourceIdentityType::None) | Some(ResourceIdentityType::UserAssigned) => {
            ResourceIdentityType::UserAssigned
        }
        Some(ResourceIdentityType::Unrecognized(raw)) if raw.is_empty() => {
            ResourceIdentityType::UserAssigned
        }
        Some(ResourceIdentityType::SystemAssigned)
        | Some(ResourceIdentityType::SystemAssignedUserAssigned) => {
            ResourceIdentityType::SystemAssignedUserAssigned
        }
        Some(ResourceIdentityType::Unrecognized(_)) => ResourceIdentityType::None,
    }
}

/// Mutable view over one resource's identity
#[derive(Debug)]
pub struct IdentityInfo<'a> {
    identity: &'a mut ResourceIdentity,
}

impl<'a> IdentityInfo<'a> {
    /// Wrap an identity sub-object
    pub fn new(identity: &'a mut ResourceIdentity) -> Self {
        Self { identity }
    }

    /// Current identity classification
    pub fn identity_type(&self) -> Option<&ResourceIdentityType> {
        self.identity.identity_type.as_ref()
    }

    /// IDs of all attached user-assigned identities
    ///
    /// Detach markers left by [`set_user_identities`](Self::set_user_identities)
    /// are not attached and are not listed.
    pub fn user_identity_list(&self) -> Vec<String> {
        self.attached().map(str::to_string).collect()
    }

    /// Apply a desired mutation (`true` = ensure present, `false` = ensure absent)
    ///
    /// Afterwards the identity map holds only the delta to send to ARM:
    /// empty values for additions and detach markers for removals. Returns
    /// whether there is anything to patch.
    ///
    /// When nothing changes the identity is left alone, so a delta from an
    /// earlier call keeps its detach markers.
    pub fn set_user_identities(&mut self, desired: &BTreeMap<String, bool>) -> bool {
        let mut membership: BTreeSet<String> =
            self.attached().map(|id| id.to_lowercase()).collect();

        let mut patch = UserAssignedIdentities::new();
        let mut removed_any = false;
        for (id, &add) in desired {
            let id = id.to_lowercase();
            let exists = membership.contains(&id);
            if exists && !add {
                membership.remove(&id);
                patch.insert(id, None);
                removed_any = true;
            } else if !exists && add {
                membership.insert(id.clone());
                patch.insert(id, Some(UserAssignedIdentityValue::default()));
            }
            // present + add and absent + remove are already satisfied
        }

        // Only a removal made by this call may clear the map; an empty view
        // of a pending delta still has identities attached in ARM.
        if membership.is_empty() && removed_any {
            let keeps_system = self
                .identity
                .identity_type
                .as_ref()
                .is_some_and(ResourceIdentityType::has_system_assigned);
            self.identity.user_assigned_identities = None;
            self.identity.identity_type = Some(if keeps_system {
                ResourceIdentityType::SystemAssigned
            } else {
                ResourceIdentityType::None
            });
            return true;
        }

        if patch.is_empty() {
            return false;
        }
        self.identity.identity_type = Some(next_identity_type(self.identity.identity_type.as_ref()));
        self.identity.user_assigned_identities = Some(patch);
        true
    }

    /// Remove a single user-assigned identity
    ///
    /// Returns false when the identity is not present. The classification is
    /// left untouched.
    pub fn remove_user_identity(&mut self, id: &str) -> bool {
        let Some(identities) = self.identity.user_assigned_identities.as_mut() else {
            return false;
        };
        let id = id.to_lowercase();
        let key = identities.keys().find(|k| k.to_lowercase() == id).cloned();
        match key {
            Some(key) => identities.remove(&key).is_some(),
            None => false,
        }
    }

    fn attached(&self) -> impl Iterator<Item = &str> {
        self.identity
            .user_assigned_identities
            .iter()
            .flatten()
            .filter(|(_, value)| value.is_some())
            .map(|(id, _)| id.as_str())
    }
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for super::VirtualMachine {}
    impl Sealed for super::VirtualMachineScaleSet {}
}

/// A compute resource that carries an identity sub-object
///
/// Implemented for [`VirtualMachine`] and [`VirtualMachineScaleSet`] only.
pub trait IdentityHolder: sealed::Sealed {
    /// The resource's `identity` field
    fn identity_slot(&mut self) -> &mut Option<ResourceIdentity>;

    /// View over the current identity, `None` when the resource has none
    fn identity_info(&mut self) -> Option<IdentityInfo<'_>> {
        self.identity_slot().as_mut().map(IdentityInfo::new)
    }

    /// Replace the identity with an empty `UserAssigned` one
    fn reset_identity(&mut self) -> IdentityInfo<'_> {
        IdentityInfo::new(self.identity_slot().insert(ResourceIdentity::empty_user_assigned()))
    }

    /// Current identity, resetting it first when absent
    fn identity_info_or_reset(&mut self) -> IdentityInfo<'_> {
        IdentityInfo::new(
            self.identity_slot()
                .get_or_insert_with(ResourceIdentity::empty_user_assigned),
        )
    }
}

impl IdentityHolder for VirtualMachineScaleSet {
    fn identity_slot(&mut self) -> &mut Option<ResourceIdentity> {
        &mut self.identity
    }
}

impl IdentityHolder for VirtualMachine {
    fn identity_slot(&mut self) -> &mut Option<ResourceIdentity> {
        &mut self.identity
    }
}
