//! Host facts as reported by the inventory.

use crate::error::TallyError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// One host as seen by the inventory at collection time.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct HostFact {
    pub account: String,
    pub owner_id: String,
    #[serde(default)]
    pub subscription_manager_id: Option<String>,
    #[serde(default)]
    pub products: BTreeSet<String>,
    #[serde(default)]
    pub cores: u32,
    #[serde(default)]
    pub sockets: u32,
    #[serde(default)]
    pub is_virtual: bool,
    /// Subscription manager id of the hypervisor running this guest.
    #[serde(default)]
    pub hypervisor_uuid: Option<String>,
    #[serde(default)]
    pub is_hypervisor: bool,
    pub sync_timestamp: DateTime<Utc>,
}

impl HostFact {
    pub fn declares(&self, product: &str) -> bool {
        self.products.contains(product)
    }
}

/// A single forward pass over host facts. Items may fail mid-stream.
pub type FactStream<'a> = Box<dyn Iterator<Item = Result<HostFact, TallyError>> + 'a>;

/// The inventory. Restartable only by asking again with the same accounts.
pub trait FactSource {
    fn stream_facts(&self, accounts: &BTreeSet<String>) -> Result<FactStream<'_>, TallyError>;
}

impl<S: FactSource + ?Sized> FactSource for &S {
    fn stream_facts(&self, accounts: &BTreeSet<String>) -> Result<FactStream<'_>, TallyError> {
        (**self).stream_facts(accounts)
    }
}
