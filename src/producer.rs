use crate::clock::ApplicationClock;
use crate::collector::{AccountFailure, CollectedUsage, SecondaryUsageCollector, UsageCollector};
use crate::config::TallyConfig;
use crate::error::TallyError;
use crate::facts::FactSource;
use crate::retry::RetryPolicy;
use crate::roller::ROLLERS;
use crate::snapshot::SnapshotStore;
use crate::summary::SummaryEmitter;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{event, Level};

/// Lists every account a full run should tally.
pub trait AccountListSource {
    fn list_accounts(&self) -> Result<Vec<String>, TallyError>;
}

impl AccountListSource for Vec<String> {
    fn list_accounts(&self) -> Result<Vec<String>, TallyError> {
        Ok(self.clone())
    }
}

/// A batch that was skipped, with the error that made it give up.
#[derive(Debug)]
pub struct FailedBatch {
    pub accounts: Vec<String>,
    pub error: TallyError,
}

/// What a run achieved. Callers needing every account tallied re-trigger
/// the failed ones, usually through the single account entry point.
#[derive(Debug, Default)]
pub struct ProductionReport {
    pub total_accounts: usize,
    /// Accounts of every batch that was collected and rolled.
    pub processed_accounts: Vec<String>,
    pub failed_batches: Vec<FailedBatch>,
    /// Accounts dropped from otherwise successful batches.
    pub account_failures: Vec<AccountFailure>,
    pub snapshots_written: usize,
    pub cancelled: bool,
}

impl ProductionReport {
    pub fn all_batches_failed(&self) -> bool {
        !self.failed_batches.is_empty() && self.processed_accounts.is_empty()
    }

    pub fn failed_accounts(&self) -> impl Iterator<Item = &str> {
        self.failed_batches
            .iter()
            .flat_map(|batch| batch.accounts.iter())
            .chain(self.account_failures.iter().map(|failure| &failure.account))
            .map(String::as_str)
    }
}

/// This is the entry point of a tally run.
///
/// Accounts are processed in fixed-size batches, one after another, to
/// bound memory. Each batch is collected under the caller's retry policy
/// and then handed to every roller, daily first. A batch that cannot be
/// collected or persisted is recorded and skipped; the run moves on to the
/// next one. The clock is read once per run, so a run that crosses
/// midnight still rolls every batch into the buckets it started in.
pub struct SnapshotProducer<'a> {
    collector: UsageCollector<'a>,
    account_list: Box<dyn AccountListSource + 'a>,
    store: Box<dyn SnapshotStore + 'a>,
    batch_size: usize,
    clock: ApplicationClock,
    summaries: Option<SummaryEmitter<'a>>,
    stop: Option<Arc<AtomicBool>>,
}

impl<'a> SnapshotProducer<'a> {
    pub fn new(
        collector: UsageCollector<'a>,
        account_list: Box<dyn AccountListSource + 'a>,
        store: Box<dyn SnapshotStore + 'a>,
        batch_size: usize,
    ) -> Result<SnapshotProducer<'a>, TallyError> {
        if batch_size == 0 {
            return Err(TallyError::InvalidConfig(
                "account batch size must be greater than zero".to_string(),
            ));
        }
        if collector.applicable_products().is_empty() {
            return Err(TallyError::InvalidConfig("no applicable products to tally".to_string()));
        }
        Ok(SnapshotProducer {
            collector,
            account_list,
            store,
            batch_size,
            clock: ApplicationClock::system(),
            summaries: None,
            stop: None,
        })
    }

    /// A producer tallying the configured products in batches of the
    /// configured size. The run's retry policy stays `config.retry`, passed
    /// to each run.
    pub fn from_config(
        config: &TallyConfig,
        facts: Box<dyn FactSource + 'a>,
        account_list: Box<dyn AccountListSource + 'a>,
        store: Box<dyn SnapshotStore + 'a>,
    ) -> Result<SnapshotProducer<'a>, TallyError> {
        config.validate()?;
        let collector = UsageCollector::new(facts, config.applicable_products.clone());
        SnapshotProducer::new(collector, account_list, store, config.account_batch_size)
    }

    pub fn with_secondary_collector(
        mut self,
        collector: Box<dyn SecondaryUsageCollector + 'a>,
    ) -> Self {
        self.collector = self.collector.with_secondary(collector);
        self
    }

    pub fn with_clock(mut self, clock: ApplicationClock) -> Self {
        self.clock = clock;
        self
    }

    /// Publishes every snapshot written from now on.
    pub fn with_summary_emitter(mut self, emitter: SummaryEmitter<'a>) -> Self {
        event!(Level::INFO, topic = emitter.topic(), "Publishing tally summaries.");
        self.summaries = Some(emitter);
        self
    }

    /// Stops the run before the next batch once `flag` is set.
    pub fn with_stop_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.stop = Some(flag);
        self
    }

    /// Tallies every listed account. Only a failure to list the accounts
    /// fails the run.
    pub fn produce_snapshots(
        &mut self,
        retry: &RetryPolicy,
    ) -> Result<ProductionReport, TallyError> {
        let accounts = self.account_list.list_accounts()?;
        Ok(self.produce_snapshots_for_accounts(&accounts, retry))
    }

    /// On-demand run for a single account.
    pub fn produce_snapshots_for_account(
        &mut self,
        account: &str,
        retry: &RetryPolicy,
    ) -> ProductionReport {
        self.produce_snapshots_for_accounts(&[account.to_string()], retry)
    }

    pub fn produce_snapshots_for_accounts(
        &mut self,
        accounts: &[String],
        retry: &RetryPolicy,
    ) -> ProductionReport {
        let clock = self.clock.freeze();
        event!(
            Level::INFO,
            products = ?self.collector.applicable_products(),
            now = %clock.now(),
            "Producing snapshots for {} accounts in batches of {}.",
            accounts.len(),
            self.batch_size
        );

        let mut report = ProductionReport {
            total_accounts: accounts.len(),
            ..Default::default()
        };
        for batch in accounts.chunks(self.batch_size) {
            if self.should_stop() {
                event!(
                    Level::WARN,
                    remaining = accounts.len() - report.processed_accounts.len(),
                    "Snapshot production cancelled."
                );
                report.cancelled = true;
                break;
            }

            let collected = match retry.execute("collect usage", || self.collector.collect(batch)) {
                Ok(collected) => collected,
                Err(error) => {
                    event!(
                        Level::ERROR,
                        error = %error,
                        "Could not collect for accounts {:?}",
                        batch
                    );
                    report.failed_batches.push(FailedBatch {
                        accounts: batch.to_vec(),
                        error,
                    });
                    continue;
                }
            };

            match self.roll_batch(&collected, &clock) {
                Ok(written) => {
                    report.snapshots_written += written;
                    report.processed_accounts.extend_from_slice(batch);
                }
                Err(error) => {
                    event!(
                        Level::ERROR,
                        error = %error,
                        "Could not roll snapshots for accounts {:?}",
                        batch
                    );
                    report.failed_batches.push(FailedBatch {
                        accounts: batch.to_vec(),
                        error,
                    });
                    continue;
                }
            }
            report.account_failures.extend(collected.failures);

            event!(
                Level::INFO,
                "{}/{} accounts processed.",
                report.processed_accounts.len(),
                accounts.len()
            );
        }

        event!(
            Level::INFO,
            failed_batches = report.failed_batches.len(),
            "Finished producing snapshots for all accounts."
        );
        report
    }

    fn roll_batch(
        &mut self,
        collected: &CollectedUsage,
        clock: &ApplicationClock,
    ) -> Result<usize, TallyError> {
        let mut written = 0;
        for roller in ROLLERS.iter() {
            let rolled =
                roller.roll_snapshots(self.store.as_mut(), clock, collected.calculations.values())?;
            if let Some(emitter) = self.summaries.as_mut() {
                emitter.emit(&rolled)?;
            }
            written += rolled.len();
        }
        Ok(written)
    }

    fn should_stop(&self) -> bool {
        self.stop
            .as_ref()
            .map_or(false, |flag| flag.load(Ordering::SeqCst))
    }
}
