use crate::summary::PublishError;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors raised by external collaborators (inventory, cloud data, storage).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Everything that can go wrong while producing tally snapshots.
#[derive(Error, Debug)]
pub enum TallyError {
    /// Two facts for the same account disagree on the owning organization.
    /// Fatal for the account only.
    #[error("Attempt to set a different owner for an account: {existing}:{conflicting}")]
    OwnerConflict {
        account: String,
        existing: String,
        conflicting: String,
    },

    #[error("Start date must be before end date: {start} > {end}")]
    InvalidDateRange {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    #[error("cannot build a date range from an empty set of dates")]
    EmptyDateRange,

    #[error("invalid calendar date {year}-{month:02}-{day:02}")]
    InvalidDate { year: i32, month: u32, day: u32 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to load configuration")]
    Config(#[from] ::config::ConfigError),

    /// The account listing could not be read; no batch can start.
    #[error("unable to read account listing")]
    AccountList(#[source] BoxError),

    #[error("failed to retrieve host facts")]
    FactRetrieval(#[source] BoxError),

    #[error("secondary usage collection failed")]
    SecondaryCollection(#[source] BoxError),

    #[error("failed to persist tally snapshot")]
    Persistence(#[source] BoxError),

    #[error("failed to publish tally summary")]
    Publish(#[from] PublishError),
}

impl TallyError {
    /// Only failures of the data sources are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TallyError::FactRetrieval(_) | TallyError::SecondaryCollection(_)
        )
    }
}
