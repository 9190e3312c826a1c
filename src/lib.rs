pub mod accumulator;
pub mod classifier;
pub mod clock;
pub mod collector;
pub mod config;
pub mod date_range;
pub mod error;
pub mod facts;
pub mod producer;
pub mod retry;
pub mod roller;
pub mod snapshot;
pub mod summary;

pub use self::config::{SummaryConfig, TallyConfig};
pub use accumulator::{AccountUsageCalculation, MeasurementType, UsageTotals};
pub use classifier::HostClassification;
pub use clock::ApplicationClock;
pub use collector::{CloudInstanceCollector, UsageCollector};
pub use date_range::DateRange;
pub use error::TallyError;
pub use facts::{FactSource, HostFact};
pub use producer::{AccountListSource, ProductionReport, SnapshotProducer};
pub use retry::RetryPolicy;
pub use snapshot::{Granularity, InMemorySnapshotStore, SnapshotStore, TallySnapshot};
pub use summary::{KafkaConfig, KafkaPublisher, SummaryEmitter, SummaryPublisher};
