//! Decides how a host counts toward a product's usage.
//!
//! Classification is a single forward pass over an account's facts. A guest
//! is only recognised as running on a known hypervisor if that hypervisor's
//! fact was seen earlier in the same pass. A guest that arrives before its
//! hypervisor is counted under the unknown-hypervisor rule and is not
//! corrected once the hypervisor shows up.

use crate::accumulator::{MeasurementType, UsageTotals};
use crate::facts::HostFact;
use std::collections::HashSet;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HostClassification {
    Physical,
    Hypervisor,
    /// Already represented by its hypervisor, never counted.
    GuestWithKnownHypervisor,
    /// The hypervisor is outside the inventory, so the guest stands in for it.
    GuestWithUnknownHypervisor,
}

impl HostClassification {
    /// Where, and how much, `fact` adds to a product's totals.
    pub fn contribution(&self, fact: &HostFact) -> Option<(MeasurementType, UsageTotals)> {
        let cores = u64::from(fact.cores);
        let sockets = round_sockets(fact.sockets);
        match self {
            HostClassification::Physical => Some((
                MeasurementType::Physical,
                UsageTotals::new(cores, sockets, 1),
            )),
            HostClassification::Hypervisor => Some((
                MeasurementType::Hypervisor,
                UsageTotals::new(cores, sockets, 1),
            )),
            HostClassification::GuestWithKnownHypervisor => None,
            HostClassification::GuestWithUnknownHypervisor => Some((
                MeasurementType::Hypervisor,
                UsageTotals::new(cores, 1, 1),
            )),
        }
    }
}

/// Subscription manager ids of the hypervisors seen so far for one account.
#[derive(Clone, Debug, Default)]
pub struct KnownHypervisors {
    ids: HashSet<String>,
}

impl KnownHypervisors {
    /// Remembers `fact` if it is a hypervisor with an id guests can refer to.
    pub fn register(&mut self, fact: &HostFact) {
        if !fact.is_hypervisor {
            return;
        }
        if let Some(id) = &fact.subscription_manager_id {
            self.ids.insert(id.clone());
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }
}

/// Classifies `fact` for `product`. Returns `None` when the host does not
/// declare the product.
pub fn classify(
    fact: &HostFact,
    product: &str,
    hypervisors: &KnownHypervisors,
) -> Option<HostClassification> {
    if !fact.declares(product) {
        return None;
    }

    let classification = if fact.is_hypervisor {
        HostClassification::Hypervisor
    } else if fact.is_virtual {
        match fact.hypervisor_uuid.as_deref() {
            Some(id) if hypervisors.contains(id) => HostClassification::GuestWithKnownHypervisor,
            _ => HostClassification::GuestWithUnknownHypervisor,
        }
    } else {
        HostClassification::Physical
    };
    Some(classification)
}

/// Odd socket counts are rounded up to the next even number.
pub fn round_sockets(sockets: u32) -> u64 {
    u64::from(sockets) + u64::from(sockets % 2)
}
