extern crate tally_engine;

use clap::Parser;
use std::collections::{BTreeSet, HashMap};
use tally_engine::error::TallyError;
use tally_engine::facts::FactStream;
use tally_engine::summary::DEFAULT_SUMMARY_TOPIC;
use tally_engine::{
    FactSource, HostFact, InMemorySnapshotStore, SnapshotProducer, SummaryConfig, SummaryEmitter,
    TallyConfig,
};

/// Settings come from `tally.toml` and `TALLY__*` variables; flags override them.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON file holding an array of host facts
    #[arg(short, long)]
    facts: String,

    /// Products to tally, replacing the configured ones
    #[arg(short, long)]
    product: Vec<String>,

    /// Accounts collected together
    #[arg(long)]
    batch_size: Option<usize>,

    /// Kafka broker in the host:port form
    #[arg(short, long)]
    bootstrap_server: Option<String>,

    /// Kafka topic to publish summaries onto
    #[arg(short, long)]
    topic: Option<String>,
}

struct FileFacts {
    facts: Vec<HostFact>,
}

impl FactSource for FileFacts {
    fn stream_facts(&self, accounts: &BTreeSet<String>) -> Result<FactStream<'_>, TallyError> {
        let accounts = accounts.clone();
        Ok(Box::new(
            self.facts
                .iter()
                .filter(move |fact| accounts.contains(&fact.account))
                .cloned()
                .map(Ok),
        ))
    }
}

fn apply_args(config: &mut TallyConfig, args: Args) {
    if !args.product.is_empty() {
        config.applicable_products = args.product.into_iter().collect();
    }
    if let Some(batch_size) = args.batch_size {
        config.account_batch_size = batch_size;
    }
    if let Some(bootstrap_servers) = args.bootstrap_server {
        config.summary = Some(SummaryConfig {
            bootstrap_servers,
            topic: DEFAULT_SUMMARY_TOPIC.to_string(),
            producer_overrides: HashMap::new(),
        });
    }
    if let (Some(topic), Some(summary)) = (args.topic, config.summary.as_mut()) {
        summary.topic = topic;
    }
}

fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt::init();

    let raw = std::fs::read_to_string(&args.facts).unwrap();
    let facts: Vec<HostFact> = serde_json::from_str(&raw).unwrap();
    let accounts: Vec<String> = facts
        .iter()
        .map(|fact| fact.account.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let mut config = TallyConfig::load().unwrap();
    apply_args(&mut config, args);

    let mut store = InMemorySnapshotStore::new();
    {
        let mut producer = SnapshotProducer::from_config(
            &config,
            Box::new(FileFacts { facts }),
            Box::new(accounts),
            Box::new(&mut store),
        )
        .unwrap();
        if let Some(summary) = &config.summary {
            producer = producer.with_summary_emitter(SummaryEmitter::from_config(summary).unwrap());
        }

        let report = producer.produce_snapshots(&config.retry).unwrap();
        for account in report.failed_accounts() {
            eprintln!("not tallied: {}", account);
        }
    }

    for snapshot in store.snapshots() {
        println!("{}", serde_json::to_string(snapshot).unwrap());
    }
}
