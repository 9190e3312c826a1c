//! Persisted tally snapshots and the storage boundary.

use crate::accumulator::{MeasurementType, UsageTotals};
use crate::date_range::DateRange;
use crate::error::TallyError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Bucket size of a snapshot.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Granularity {
    Daily,
    Weekly,
    Monthly,
    Quarterly,
    Yearly,
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Granularity::Daily => write!(f, "DAILY"),
            Granularity::Weekly => write!(f, "WEEKLY"),
            Granularity::Monthly => write!(f, "MONTHLY"),
            Granularity::Quarterly => write!(f, "QUARTERLY"),
            Granularity::Yearly => write!(f, "YEARLY"),
        }
    }
}

/// Identity of a snapshot row.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SnapshotKey {
    pub account: String,
    pub product_id: String,
    pub granularity: Granularity,
    pub bucket_start: DateTime<Utc>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TallySnapshot {
    pub account: String,
    pub owner_id: Option<String>,
    pub product_id: String,
    pub granularity: Granularity,
    pub bucket_start: DateTime<Utc>,
    pub bucket_end: DateTime<Utc>,
    pub totals: BTreeMap<MeasurementType, UsageTotals>,
}

impl TallySnapshot {
    pub fn key(&self) -> SnapshotKey {
        SnapshotKey {
            account: self.account.clone(),
            product_id: self.product_id.clone(),
            granularity: self.granularity,
            bucket_start: self.bucket_start,
        }
    }

    pub fn totals(&self, measurement: MeasurementType) -> Option<&UsageTotals> {
        self.totals.get(&measurement)
    }
}

/// Whether an upsert created the bucket's row or replaced an existing one.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UpsertOutcome {
    Created,
    Updated,
}

/// Durable snapshot storage. `upsert_snapshot` must be atomic per key;
/// the last writer wins.
pub trait SnapshotStore {
    /// Snapshots of the given key prefix whose bucket starts inside `window`,
    /// ordered by bucket start.
    fn find_snapshots(
        &self,
        account: &str,
        product_id: &str,
        granularity: Granularity,
        window: &DateRange,
    ) -> Result<Vec<TallySnapshot>, TallyError>;

    fn upsert_snapshot(&mut self, snapshot: TallySnapshot) -> Result<UpsertOutcome, TallyError>;
}

impl<S: SnapshotStore + ?Sized> SnapshotStore for &mut S {
    fn find_snapshots(
        &self,
        account: &str,
        product_id: &str,
        granularity: Granularity,
        window: &DateRange,
    ) -> Result<Vec<TallySnapshot>, TallyError> {
        (**self).find_snapshots(account, product_id, granularity, window)
    }

    fn upsert_snapshot(&mut self, snapshot: TallySnapshot) -> Result<UpsertOutcome, TallyError> {
        (**self).upsert_snapshot(snapshot)
    }
}

/// Keeps snapshots in memory, ordered by key.
#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    snapshots: BTreeMap<SnapshotKey, TallySnapshot>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &SnapshotKey) -> Option<&TallySnapshot> {
        self.snapshots.get(key)
    }

    pub fn snapshots(&self) -> impl Iterator<Item = &TallySnapshot> {
        self.snapshots.values()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

impl SnapshotStore for InMemorySnapshotStore {
    fn find_snapshots(
        &self,
        account: &str,
        product_id: &str,
        granularity: Granularity,
        window: &DateRange,
    ) -> Result<Vec<TallySnapshot>, TallyError> {
        Ok(self
            .snapshots
            .values()
            .filter(|s| {
                s.account == account
                    && s.product_id == product_id
                    && s.granularity == granularity
                    && window.contains(s.bucket_start)
            })
            .cloned()
            .collect())
    }

    fn upsert_snapshot(&mut self, snapshot: TallySnapshot) -> Result<UpsertOutcome, TallyError> {
        match self.snapshots.insert(snapshot.key(), snapshot) {
            Some(_) => Ok(UpsertOutcome::Updated),
            None => Ok(UpsertOutcome::Created),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Granularity, InMemorySnapshotStore, SnapshotStore, TallySnapshot, UpsertOutcome};
    use crate::accumulator::{MeasurementType, UsageTotals};
    use crate::date_range::DateRange;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;

    fn daily(day: u32, cores: u64) -> TallySnapshot {
        let start = Utc.with_ymd_and_hms(2019, 5, day, 0, 0, 0).unwrap();
        TallySnapshot {
            account: "A1".to_string(),
            owner_id: Some("O1".to_string()),
            product_id: "RHEL".to_string(),
            granularity: Granularity::Daily,
            bucket_start: start,
            bucket_end: start + chrono::Duration::days(1) - chrono::Duration::nanoseconds(1),
            totals: BTreeMap::from([(MeasurementType::Physical, UsageTotals::new(cores, 2, 1))]),
        }
    }

    #[test]
    fn test_upsert_creates_then_updates() {
        let mut store = InMemorySnapshotStore::new();
        assert_eq!(store.upsert_snapshot(daily(1, 4)).unwrap(), UpsertOutcome::Created);
        assert_eq!(store.upsert_snapshot(daily(1, 8)).unwrap(), UpsertOutcome::Updated);
        assert_eq!(store.len(), 1);

        let stored = store.get(&daily(1, 0).key()).unwrap();
        assert_eq!(
            stored.totals(MeasurementType::Physical),
            Some(&UsageTotals::new(8, 2, 1))
        );
    }

    #[test]
    fn test_find_snapshots_in_window() {
        let mut store = InMemorySnapshotStore::new();
        for day in [1, 10, 20] {
            store.upsert_snapshot(daily(day, 4)).unwrap();
        }
        let mut other_product = daily(10, 4);
        other_product.product_id = "OTHER".to_string();
        store.upsert_snapshot(other_product).unwrap();

        let window = DateRange::new(
            Utc.with_ymd_and_hms(2019, 5, 5, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2019, 5, 20, 0, 0, 0).unwrap(),
        )
        .unwrap();
        let found = store
            .find_snapshots("A1", "RHEL", Granularity::Daily, &window)
            .unwrap();
        let days: Vec<_> = found.iter().map(|s| s.bucket_start).collect();
        assert_eq!(
            days,
            vec![
                Utc.with_ymd_and_hms(2019, 5, 10, 0, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2019, 5, 20, 0, 0, 0).unwrap(),
            ]
        );
        assert!(store
            .find_snapshots("A1", "RHEL", Granularity::Monthly, &window)
            .unwrap()
            .is_empty());
    }
}
