//! Turns a batch of accounts into usage calculations.
//!
//! The inventory facts are folded per account, then every secondary
//! collector adds what it knows (cloud instances, for example) to the same
//! calculations. An account whose facts disagree on the owner is dropped
//! from the result and reported on its own; the rest of the batch is
//! unaffected.

use crate::accumulator::{
    AccountAccumulator, AccountUsageCalculation, MeasurementType, UsageTotals,
};
use crate::error::TallyError;
use crate::facts::FactSource;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{event, Level};

/// Adds usage from outside the inventory to calculations in place.
pub trait SecondaryUsageCollector {
    fn merge_secondary_usage(
        &self,
        calculations: &mut BTreeMap<String, AccountUsageCalculation>,
        accounts: &BTreeSet<String>,
    ) -> Result<(), TallyError>;
}

/// An account that could not be tallied while the rest of its batch was.
#[derive(Debug)]
pub struct AccountFailure {
    pub account: String,
    pub error: TallyError,
}

/// The outcome of collecting one batch.
#[derive(Debug, Default)]
pub struct CollectedUsage {
    pub calculations: BTreeMap<String, AccountUsageCalculation>,
    pub failures: Vec<AccountFailure>,
}

pub struct UsageCollector<'a> {
    facts: Box<dyn FactSource + 'a>,
    secondary: Vec<Box<dyn SecondaryUsageCollector + 'a>>,
    applicable_products: BTreeSet<String>,
}

impl<'a> UsageCollector<'a> {
    pub fn new(facts: Box<dyn FactSource + 'a>, applicable_products: BTreeSet<String>) -> Self {
        Self {
            facts,
            secondary: Vec::new(),
            applicable_products,
        }
    }

    pub fn with_secondary(mut self, collector: Box<dyn SecondaryUsageCollector + 'a>) -> Self {
        self.secondary.push(collector);
        self
    }

    pub fn applicable_products(&self) -> &BTreeSet<String> {
        &self.applicable_products
    }

    /// Collects usage for `accounts`. Fails as a whole only when a data
    /// source fails.
    pub fn collect(&self, accounts: &[String]) -> Result<CollectedUsage, TallyError> {
        let requested: BTreeSet<String> = accounts.iter().cloned().collect();
        let mut accumulators: BTreeMap<String, AccountAccumulator<'_>> = BTreeMap::new();
        let mut failed: BTreeMap<String, TallyError> = BTreeMap::new();

        for fact in self.facts.stream_facts(&requested)? {
            let fact = fact?;
            if !requested.contains(&fact.account) {
                event!(
                    Level::DEBUG,
                    account = %fact.account,
                    "Skipping fact for an account outside the batch."
                );
                continue;
            }
            if failed.contains_key(&fact.account) {
                continue;
            }

            let accumulator = accumulators.entry(fact.account.clone()).or_insert_with(|| {
                AccountAccumulator::new(&fact.account, &self.applicable_products)
            });
            if let Err(err) = accumulator.accumulate(&fact) {
                event!(
                    Level::ERROR,
                    account = %fact.account,
                    error = %err,
                    "Unable to tally account."
                );
                accumulators.remove(&fact.account);
                failed.insert(fact.account.clone(), err);
            }
        }

        let mut calculations: BTreeMap<String, AccountUsageCalculation> = accumulators
            .into_iter()
            .map(|(account, accumulator)| (account, accumulator.finalize()))
            .collect();

        for collector in &self.secondary {
            collector.merge_secondary_usage(&mut calculations, &requested)?;
        }
        // Secondary data cannot revive an account already known to be inconsistent.
        for account in failed.keys() {
            calculations.remove(account);
        }

        Ok(CollectedUsage {
            calculations,
            failures: failed
                .into_iter()
                .map(|(account, error)| AccountFailure { account, error })
                .collect(),
        })
    }
}

/// Cloud instance usage of one account and product.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct CloudInstanceUsage {
    pub account: String,
    pub product_id: String,
    /// One of the cloud measurement types.
    pub provider: MeasurementType,
    pub instances: u64,
    #[serde(default)]
    pub cores: u64,
    #[serde(default)]
    pub sockets: u64,
}

/// Where cloud instance usage comes from.
pub trait CloudInstanceSource {
    fn instance_usage(
        &self,
        accounts: &BTreeSet<String>,
    ) -> Result<Vec<CloudInstanceUsage>, TallyError>;
}

impl<S: CloudInstanceSource + ?Sized> CloudInstanceSource for &S {
    fn instance_usage(
        &self,
        accounts: &BTreeSet<String>,
    ) -> Result<Vec<CloudInstanceUsage>, TallyError> {
        (**self).instance_usage(accounts)
    }
}

/// Merges cloud instance usage under its provider's measurement type.
pub struct CloudInstanceCollector<'a> {
    source: Box<dyn CloudInstanceSource + 'a>,
}

impl<'a> CloudInstanceCollector<'a> {
    pub fn new(source: Box<dyn CloudInstanceSource + 'a>) -> Self {
        Self { source }
    }
}

impl SecondaryUsageCollector for CloudInstanceCollector<'_> {
    fn merge_secondary_usage(
        &self,
        calculations: &mut BTreeMap<String, AccountUsageCalculation>,
        accounts: &BTreeSet<String>,
    ) -> Result<(), TallyError> {
        for usage in self.source.instance_usage(accounts)? {
            if !accounts.contains(&usage.account) {
                continue;
            }
            if !usage.provider.is_cloud() {
                event!(
                    Level::WARN,
                    account = %usage.account,
                    provider = %usage.provider,
                    "Ignoring cloud usage with a non-cloud measurement type."
                );
                continue;
            }
            calculations
                .entry(usage.account.clone())
                .or_insert_with(|| AccountUsageCalculation::new(&usage.account))
                .product_mut(&usage.product_id)
                .add(
                    usage.provider,
                    UsageTotals::new(usage.cores, usage.sockets, usage.instances),
                );
        }
        Ok(())
    }
}
