//! This module contains the structures that accumulate usage per
//! account and product while the host facts are traversed.
//!
//! Totals are kept per measurement type. A missing measurement type
//! means no host of that kind was observed, which is not the same as
//! a zero total.
//!

use crate::classifier::{self, KnownHypervisors};
use crate::error::TallyError;
use crate::facts::HostFact;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::{Add, AddAssign};

/// The kind of capacity a total represents.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MeasurementType {
    Physical,
    Hypervisor,
    Virtual,
    Aws,
    Azure,
    Google,
    Alibaba,
    /// Sum of every other type. Never populated from a single host.
    Total,
}

impl MeasurementType {
    pub fn is_cloud(&self) -> bool {
        matches!(
            self,
            MeasurementType::Aws
                | MeasurementType::Azure
                | MeasurementType::Google
                | MeasurementType::Alibaba
        )
    }
}

impl fmt::Display for MeasurementType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MeasurementType::Physical => write!(f, "PHYSICAL"),
            MeasurementType::Hypervisor => write!(f, "HYPERVISOR"),
            MeasurementType::Virtual => write!(f, "VIRTUAL"),
            MeasurementType::Aws => write!(f, "AWS"),
            MeasurementType::Azure => write!(f, "AZURE"),
            MeasurementType::Google => write!(f, "GOOGLE"),
            MeasurementType::Alibaba => write!(f, "ALIBABA"),
            MeasurementType::Total => write!(f, "TOTAL"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub cores: u64,
    pub sockets: u64,
    pub instances: u64,
}

impl UsageTotals {
    pub fn new(cores: u64, sockets: u64, instances: u64) -> Self {
        Self {
            cores,
            sockets,
            instances,
        }
    }

    /// Component-wise maximum, the high-water mark of two observations.
    pub fn max(self, other: UsageTotals) -> UsageTotals {
        UsageTotals {
            cores: self.cores.max(other.cores),
            sockets: self.sockets.max(other.sockets),
            instances: self.instances.max(other.instances),
        }
    }
}

impl Add for UsageTotals {
    type Output = UsageTotals;

    fn add(self, other: UsageTotals) -> UsageTotals {
        UsageTotals {
            cores: self.cores + other.cores,
            sockets: self.sockets + other.sockets,
            instances: self.instances + other.instances,
        }
    }
}

impl AddAssign for UsageTotals {
    fn add_assign(&mut self, other: UsageTotals) {
        *self = *self + other;
    }
}

/// Usage of one product, keyed by measurement type.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProductUsageCalculation {
    product_id: String,
    totals: BTreeMap<MeasurementType, UsageTotals>,
}

impl ProductUsageCalculation {
    pub fn new(product_id: &str) -> Self {
        Self {
            product_id: product_id.to_string(),
            totals: BTreeMap::new(),
        }
    }

    pub fn product_id(&self) -> &str {
        &self.product_id
    }

    pub fn add(&mut self, measurement: MeasurementType, amount: UsageTotals) {
        *self.totals.entry(measurement).or_default() += amount;
    }

    pub fn totals(&self, measurement: MeasurementType) -> Option<&UsageTotals> {
        self.totals.get(&measurement)
    }

    pub fn measurements(&self) -> &BTreeMap<MeasurementType, UsageTotals> {
        &self.totals
    }

    /// Sum over every measurement type present, `None` if nothing was observed.
    pub fn combined(&self) -> Option<UsageTotals> {
        self.totals
            .iter()
            .filter(|(measurement, _)| **measurement != MeasurementType::Total)
            .map(|(_, totals)| *totals)
            .reduce(|sum, totals| sum + totals)
    }
}

/// Usage of every relevant product for one account.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AccountUsageCalculation {
    account: String,
    owner_id: Option<String>,
    products: BTreeMap<String, ProductUsageCalculation>,
}

impl AccountUsageCalculation {
    pub fn new(account: &str) -> Self {
        Self {
            account: account.to_string(),
            owner_id: None,
            products: BTreeMap::new(),
        }
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn owner_id(&self) -> Option<&str> {
        self.owner_id.as_deref()
    }

    /// Associates the account with `owner_id`. An account has exactly one owner.
    pub fn set_owner(&mut self, owner_id: &str) -> Result<(), TallyError> {
        match &self.owner_id {
            Some(existing) if existing != owner_id => Err(TallyError::OwnerConflict {
                account: self.account.clone(),
                existing: existing.clone(),
                conflicting: owner_id.to_string(),
            }),
            Some(_) => Ok(()),
            None => {
                self.owner_id = Some(owner_id.to_string());
                Ok(())
            }
        }
    }

    pub fn product(&self, product_id: &str) -> Option<&ProductUsageCalculation> {
        self.products.get(product_id)
    }

    pub fn product_mut(&mut self, product_id: &str) -> &mut ProductUsageCalculation {
        self.products
            .entry(product_id.to_string())
            .or_insert_with(|| ProductUsageCalculation::new(product_id))
    }

    pub fn products(&self) -> impl Iterator<Item = &ProductUsageCalculation> {
        self.products.values()
    }

    pub fn product_ids(&self) -> impl Iterator<Item = &str> {
        self.products.keys().map(String::as_str)
    }
}

/// Folds one account's facts into an [`AccountUsageCalculation`].
///
/// Only products in the applicable set are tallied. Hypervisors become
/// known as soon as their fact is accumulated.
pub struct AccountAccumulator<'p> {
    calculation: AccountUsageCalculation,
    hypervisors: KnownHypervisors,
    applicable_products: &'p BTreeSet<String>,
}

impl<'p> AccountAccumulator<'p> {
    pub fn new(account: &str, applicable_products: &'p BTreeSet<String>) -> Self {
        Self {
            calculation: AccountUsageCalculation::new(account),
            hypervisors: KnownHypervisors::default(),
            applicable_products,
        }
    }

    /// Adds `fact` to every applicable product it declares.
    pub fn accumulate(&mut self, fact: &HostFact) -> Result<(), TallyError> {
        self.calculation.set_owner(&fact.owner_id)?;
        self.hypervisors.register(fact);

        for product in fact.products.intersection(self.applicable_products) {
            self.accumulate_product(fact, product);
        }
        Ok(())
    }

    /// Adds `fact` to `product` only. Hosts not declaring the product are ignored.
    pub fn accumulate_product(&mut self, fact: &HostFact, product: &str) {
        let Some(classification) = classifier::classify(fact, product, &self.hypervisors) else {
            return;
        };
        let calculation = self.calculation.product_mut(product);
        if let Some((measurement, amount)) = classification.contribution(fact) {
            calculation.add(measurement, amount);
        }
    }

    /// Hands over the finished calculation. No TOTAL is synthesized here.
    pub fn finalize(self) -> AccountUsageCalculation {
        self.calculation
    }
}
