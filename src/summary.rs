//! Publication of tally summaries.
//!
//! Every snapshot a roller writes can be announced on a Kafka topic so
//! downstream consumers (billing, capacity reporting) do not need to poll
//! the snapshot store. Records are keyed by account and product, so the
//! summaries of one bucket series land on one partition in write order.

use crate::config::SummaryConfig;
use crate::roller::RolledSnapshot;
use crate::snapshot::SnapshotKey;
use rdkafka::config::ClientConfig as RdKafkaConfig;
use rdkafka::producer::{BaseRecord, DeliveryResult, ProducerContext, ThreadedProducer};
use rdkafka::ClientContext;
use serde_json::json;
#[cfg(test)]
use std::cell::RefCell;
use std::collections::HashMap;
#[cfg(test)]
use std::rc::Rc;
use thiserror::Error;
use tracing::{event, Level};

pub static DEFAULT_SUMMARY_TOPIC: &str = "tally-summary";

/// Client settings of the summary publisher, without exposing rdkafka.
#[derive(Debug, Clone)]
pub struct KafkaConfig {
    params: HashMap<String, String>,
}

impl KafkaConfig {
    /// Idempotent delivery keeps retried sends from reordering the summaries
    /// of a partition.
    pub fn new(bootstrap_servers: &str) -> Self {
        let params = HashMap::from([
            ("bootstrap.servers".to_string(), bootstrap_servers.to_string()),
            ("client.id".to_string(), "tally-engine".to_string()),
            ("enable.idempotence".to_string(), "true".to_string()),
        ]);
        Self { params }
    }

    /// Raw librdkafka settings, applied on top of the defaults.
    pub fn with_overrides<I, K, V>(mut self, overrides: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.params
            .extend(overrides.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub(crate) fn client_config(&self) -> RdKafkaConfig {
        let mut client_config = RdKafkaConfig::new();
        for (key, value) in &self.params {
            client_config.set(key, value);
        }
        client_config
    }
}

/// Logs failed deliveries with the bucket they announced.
struct SummaryDeliveryContext;

impl ClientContext for SummaryDeliveryContext {}

impl ProducerContext for SummaryDeliveryContext {
    type DeliveryOpaque = Box<SnapshotKey>;

    fn delivery(&self, result: &DeliveryResult, bucket: Self::DeliveryOpaque) {
        match result {
            Ok(_) => event!(
                Level::DEBUG,
                account = %bucket.account,
                granularity = %bucket.granularity,
                "Tally summary delivered."
            ),
            Err((kafka_err, _)) => event!(
                Level::ERROR,
                account = %bucket.account,
                product = %bucket.product_id,
                granularity = %bucket.granularity,
                bucket_start = %bucket.bucket_start,
                error = %kafka_err,
                "Tally summary delivery failed."
            ),
        }
    }
}

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("failed to enqueue tally summary on {topic}")]
    SendFailed {
        topic: String,
        #[source]
        source: rdkafka::error::KafkaError,
    },

    #[error("failed to create summary publisher: invalid kafka config")]
    InvalidConfig(#[source] rdkafka::error::KafkaError),
}

/// One serialized summary.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SummaryRecord {
    /// `account/product`, the partitioning key.
    pub key: String,
    pub payload: Vec<u8>,
    pub bucket: SnapshotKey,
}

/// Where summary records go.
pub trait SummaryPublisher {
    fn publish(&mut self, topic: &str, record: SummaryRecord) -> Result<(), PublishError>;
}

pub struct KafkaPublisher {
    producer: ThreadedProducer<SummaryDeliveryContext>,
}

impl KafkaPublisher {
    pub fn new(config: &KafkaConfig) -> Result<KafkaPublisher, PublishError> {
        let producer = config
            .client_config()
            .create_with_context(SummaryDeliveryContext)
            .map_err(PublishError::InvalidConfig)?;
        Ok(KafkaPublisher { producer })
    }
}

impl SummaryPublisher for KafkaPublisher {
    fn publish(&mut self, topic: &str, record: SummaryRecord) -> Result<(), PublishError> {
        let kafka_record = BaseRecord::with_opaque_to(topic, Box::new(record.bucket))
            .key(record.key.as_str())
            .payload(record.payload.as_slice());
        self.producer
            .send(kafka_record)
            .map_err(|(source, _record)| PublishError::SendFailed {
                topic: topic.to_string(),
                source,
            })
    }
}

/// Serializes rolled snapshots and publishes one record per snapshot.
pub struct SummaryEmitter<'a> {
    publisher: Box<dyn SummaryPublisher + 'a>,
    topic: String,
}

impl<'a> SummaryEmitter<'a> {
    pub fn new(
        publisher: Box<dyn SummaryPublisher + 'a>,
        topic: Option<&str>,
    ) -> SummaryEmitter<'a> {
        SummaryEmitter {
            publisher,
            topic: topic.unwrap_or(DEFAULT_SUMMARY_TOPIC).to_string(),
        }
    }

    /// A Kafka backed emitter for the configured brokers and topic.
    pub fn from_config(config: &SummaryConfig) -> Result<SummaryEmitter<'static>, PublishError> {
        let publisher = KafkaPublisher::new(&config.kafka_config())?;
        Ok(SummaryEmitter::new(Box::new(publisher), Some(config.topic.as_str())))
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn emit(&mut self, rolled: &[RolledSnapshot]) -> Result<(), PublishError> {
        for RolledSnapshot { snapshot, .. } in rolled {
            let measurements: Vec<_> = snapshot
                .totals
                .iter()
                .map(|(measurement, totals)| {
                    json!({
                        "measurement_type": measurement.to_string(),
                        "cores": totals.cores,
                        "sockets": totals.sockets,
                        "instances": totals.instances,
                    })
                })
                .collect();
            let message = json!({
                "account_number": snapshot.account,
                "owner_id": snapshot.owner_id,
                "product_id": snapshot.product_id,
                "granularity": snapshot.granularity.to_string(),
                "snapshot_date": snapshot.bucket_start.timestamp(),
                "tally_measurements": measurements,
            });

            self.publisher.publish(
                &self.topic,
                SummaryRecord {
                    key: format!("{}/{}", snapshot.account, snapshot.product_id),
                    payload: message.to_string().into_bytes(),
                    bucket: snapshot.key(),
                },
            )?;
        }
        Ok(())
    }
}

/// Keeps every published record, with its topic.
#[cfg(test)]
pub(crate) struct RecordingPublisher {
    pub records: Rc<RefCell<Vec<(String, SummaryRecord)>>>,
}

#[cfg(test)]
impl SummaryPublisher for RecordingPublisher {
    fn publish(&mut self, topic: &str, record: SummaryRecord) -> Result<(), PublishError> {
        self.records.borrow_mut().push((topic.to_string(), record));
        Ok(())
    }
}
