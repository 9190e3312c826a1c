//! Rolls account usage into time-bucketed snapshots.
//!
//! The daily roller writes the freshly computed usage for today. Every
//! coarser roller derives its bucket from the daily snapshots already stored
//! for the current window, keeping the maximum of each field: usage is
//! concurrent capacity, so a longer period reports its peak. Rolling the same
//! window over the same daily data always writes the same snapshot.

use crate::accumulator::{AccountUsageCalculation, MeasurementType, UsageTotals};
use crate::clock::ApplicationClock;
use crate::date_range::DateRange;
use crate::error::TallyError;
use crate::snapshot::{Granularity, SnapshotStore, TallySnapshot, UpsertOutcome};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{event, Level};

/// Derives the current bucket of a roller from the clock.
pub type WindowFn = fn(&ApplicationClock) -> Result<DateRange, TallyError>;

#[derive(Clone, Copy)]
pub struct SnapshotRoller {
    granularity: Granularity,
    window: WindowFn,
}

impl fmt::Debug for SnapshotRoller {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SnapshotRoller")
            .field("granularity", &self.granularity)
            .finish_non_exhaustive()
    }
}

/// Every roller, in the order they run. Daily comes first because the others
/// read what it writes.
pub const ROLLERS: [SnapshotRoller; 5] = [
    SnapshotRoller::new(Granularity::Daily, ApplicationClock::current_day),
    SnapshotRoller::new(Granularity::Weekly, ApplicationClock::current_week),
    SnapshotRoller::new(Granularity::Monthly, ApplicationClock::current_month),
    SnapshotRoller::new(Granularity::Quarterly, ApplicationClock::current_quarter),
    SnapshotRoller::new(Granularity::Yearly, ApplicationClock::current_year),
];

/// A snapshot a roller wrote, and whether its bucket already existed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RolledSnapshot {
    pub snapshot: TallySnapshot,
    pub outcome: UpsertOutcome,
}

impl SnapshotRoller {
    pub const fn new(granularity: Granularity, window: WindowFn) -> Self {
        Self {
            granularity,
            window,
        }
    }

    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    pub fn window(&self, clock: &ApplicationClock) -> Result<DateRange, TallyError> {
        (self.window)(clock)
    }

    /// Writes this roller's current bucket for every account and product in
    /// `calculations`.
    pub fn roll_snapshots<'c, I>(
        &self,
        store: &mut dyn SnapshotStore,
        clock: &ApplicationClock,
        calculations: I,
    ) -> Result<Vec<RolledSnapshot>, TallyError>
    where
        I: IntoIterator<Item = &'c AccountUsageCalculation>,
    {
        let window = self.window(clock)?;
        let mut rolled = Vec::new();

        for calculation in calculations {
            for product_id in calculation.product_ids() {
                let snapshot = match self.granularity {
                    Granularity::Daily => Some(daily_snapshot(calculation, product_id, &window)),
                    coarse => {
                        let dailies = store.find_snapshots(
                            calculation.account(),
                            product_id,
                            Granularity::Daily,
                            &window,
                        )?;
                        rollup_snapshot(coarse, &window, &dailies)
                    }
                };
                let Some(snapshot) = snapshot else {
                    continue;
                };

                let outcome = store.upsert_snapshot(snapshot.clone())?;
                event!(
                    Level::DEBUG,
                    account = %snapshot.account,
                    product = %snapshot.product_id,
                    granularity = %snapshot.granularity,
                    ?outcome,
                    "Snapshot written."
                );
                rolled.push(RolledSnapshot { snapshot, outcome });
            }
        }

        event!(
            Level::DEBUG,
            granularity = %self.granularity,
            count = rolled.len(),
            "Rolled snapshots."
        );
        Ok(rolled)
    }
}

/// Today's bucket, copied from the calculation with a derived TOTAL.
fn daily_snapshot(
    calculation: &AccountUsageCalculation,
    product_id: &str,
    window: &DateRange,
) -> TallySnapshot {
    let mut totals = BTreeMap::new();
    if let Some(product) = calculation.product(product_id) {
        totals.extend(
            product
                .measurements()
                .iter()
                .filter(|(measurement, _)| **measurement != MeasurementType::Total)
                .map(|(measurement, amount)| (*measurement, *amount)),
        );
        if let Some(combined) = product.combined() {
            totals.insert(MeasurementType::Total, combined);
        }
    }

    TallySnapshot {
        account: calculation.account().to_string(),
        owner_id: calculation.owner_id().map(str::to_string),
        product_id: product_id.to_string(),
        granularity: Granularity::Daily,
        bucket_start: window.start(),
        bucket_end: window.end(),
        totals,
    }
}

/// The high-water mark of `dailies` as a `granularity` snapshot for `window`.
/// Returns `None` when there is nothing to roll up.
pub fn rollup_snapshot(
    granularity: Granularity,
    window: &DateRange,
    dailies: &[TallySnapshot],
) -> Option<TallySnapshot> {
    let latest = dailies.iter().max_by_key(|s| s.bucket_start)?;

    let mut totals: BTreeMap<MeasurementType, UsageTotals> = BTreeMap::new();
    for daily in dailies {
        for (measurement, amount) in &daily.totals {
            let peak = totals.entry(*measurement).or_default();
            *peak = UsageTotals::max(*peak, *amount);
        }
    }

    Some(TallySnapshot {
        account: latest.account.clone(),
        owner_id: latest.owner_id.clone(),
        product_id: latest.product_id.clone(),
        granularity,
        bucket_start: window.start(),
        bucket_end: window.end(),
        totals,
    })
}

#[cfg(test)]
mod tests {
    use super::{rollup_snapshot, SnapshotRoller, ROLLERS};
    use crate::accumulator::{AccountUsageCalculation, MeasurementType, UsageTotals};
    use crate::clock::ApplicationClock;
    use crate::snapshot::{
        Granularity, InMemorySnapshotStore, SnapshotStore, TallySnapshot, UpsertOutcome,
    };
    use chrono::{Duration, TimeZone, Utc};
    use std::collections::BTreeMap;

    fn clock_on(day: u32) -> ApplicationClock {
        ApplicationClock::fixed(Utc.with_ymd_and_hms(2019, 5, day, 12, 0, 0).unwrap())
    }

    fn roller(granularity: Granularity) -> SnapshotRoller {
        *ROLLERS
            .iter()
            .find(|r| r.granularity() == granularity)
            .unwrap()
    }

    fn calculation(physical_cores: u64) -> AccountUsageCalculation {
        let mut calc = AccountUsageCalculation::new("A1");
        calc.set_owner("O1").unwrap();
        calc.product_mut("RHEL").add(
            MeasurementType::Physical,
            UsageTotals::new(physical_cores, 2, 1),
        );
        calc
    }

    fn daily(day: u32, physical_cores: u64) -> TallySnapshot {
        let start = Utc.with_ymd_and_hms(2019, 5, day, 0, 0, 0).unwrap();
        TallySnapshot {
            account: "A1".to_string(),
            owner_id: Some("O1".to_string()),
            product_id: "RHEL".to_string(),
            granularity: Granularity::Daily,
            bucket_start: start,
            bucket_end: start + Duration::days(1) - Duration::nanoseconds(1),
            totals: BTreeMap::from([(
                MeasurementType::Physical,
                UsageTotals::new(physical_cores, 2, 1),
            )]),
        }
    }

    fn monthly(store: &InMemorySnapshotStore) -> Vec<TallySnapshot> {
        store
            .snapshots()
            .filter(|s| s.granularity == Granularity::Monthly)
            .cloned()
            .collect()
    }

    #[test]
    fn test_rollers_run_daily_first() {
        let order: Vec<_> = ROLLERS.iter().map(|r| r.granularity()).collect();
        assert_eq!(
            order,
            vec![
                Granularity::Daily,
                Granularity::Weekly,
                Granularity::Monthly,
                Granularity::Quarterly,
                Granularity::Yearly,
            ]
        );
    }

    #[test]
    fn test_daily_roller_writes_calculation_with_total() {
        let mut store = InMemorySnapshotStore::new();
        let mut calc = calculation(4);
        calc.product_mut("RHEL")
            .add(MeasurementType::Hypervisor, UsageTotals::new(8, 4, 1));

        let rolled = roller(Granularity::Daily)
            .roll_snapshots(&mut store, &clock_on(15), [&calc])
            .unwrap();
        assert_eq!(rolled.len(), 1);
        assert_eq!(rolled[0].outcome, UpsertOutcome::Created);

        let snapshot = &rolled[0].snapshot;
        assert_eq!(snapshot.bucket_start, Utc.with_ymd_and_hms(2019, 5, 15, 0, 0, 0).unwrap());
        assert_eq!(snapshot.owner_id.as_deref(), Some("O1"));
        assert_eq!(
            snapshot.totals(MeasurementType::Physical),
            Some(&UsageTotals::new(4, 2, 1))
        );
        assert_eq!(
            snapshot.totals(MeasurementType::Total),
            Some(&UsageTotals::new(12, 6, 2))
        );

        let rerun = roller(Granularity::Daily)
            .roll_snapshots(&mut store, &clock_on(15), [&calculation(6)])
            .unwrap();
        assert_eq!(rerun[0].outcome, UpsertOutcome::Updated);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_monthly_is_the_maximum_not_the_sum() {
        let mut store = InMemorySnapshotStore::new();
        for (day, cores) in [(1, 4), (2, 8), (3, 2)] {
            store.upsert_snapshot(daily(day, cores)).unwrap();
        }

        roller(Granularity::Monthly)
            .roll_snapshots(&mut store, &clock_on(3), [&calculation(2)])
            .unwrap();

        let monthly = monthly(&store);
        assert_eq!(monthly.len(), 1);
        assert_eq!(monthly[0].bucket_start, Utc.with_ymd_and_hms(2019, 5, 1, 0, 0, 0).unwrap());
        assert_eq!(
            monthly[0].totals(MeasurementType::Physical),
            Some(&UsageTotals::new(8, 2, 1))
        );
    }

    #[test]
    fn test_monthly_rollup_is_idempotent() {
        let mut store = InMemorySnapshotStore::new();
        for (day, cores) in [(1, 4), (2, 8), (3, 2)] {
            store.upsert_snapshot(daily(day, cores)).unwrap();
        }
        let monthly_roller = roller(Granularity::Monthly);

        let first = monthly_roller
            .roll_snapshots(&mut store, &clock_on(3), [&calculation(2)])
            .unwrap();
        let second = monthly_roller
            .roll_snapshots(&mut store, &clock_on(3), [&calculation(2)])
            .unwrap();

        assert_eq!(first[0].outcome, UpsertOutcome::Created);
        assert_eq!(second[0].outcome, UpsertOutcome::Updated);
        assert_eq!(first[0].snapshot, second[0].snapshot);
        assert_eq!(
            serde_json::to_string(&first[0].snapshot).unwrap(),
            serde_json::to_string(&second[0].snapshot).unwrap()
        );
    }

    #[test]
    fn test_rollup_heals_with_new_daily_data() {
        let mut store = InMemorySnapshotStore::new();
        store.upsert_snapshot(daily(1, 4)).unwrap();
        let monthly_roller = roller(Granularity::Monthly);
        monthly_roller
            .roll_snapshots(&mut store, &clock_on(1), [&calculation(4)])
            .unwrap();

        store.upsert_snapshot(daily(2, 16)).unwrap();
        monthly_roller
            .roll_snapshots(&mut store, &clock_on(2), [&calculation(16)])
            .unwrap();

        assert_eq!(
            monthly(&store)[0].totals(MeasurementType::Physical),
            Some(&UsageTotals::new(16, 2, 1))
        );
    }

    #[test]
    fn test_no_dailies_means_no_coarse_snapshot() {
        let mut store = InMemorySnapshotStore::new();
        let rolled = roller(Granularity::Weekly)
            .roll_snapshots(&mut store, &clock_on(15), [&calculation(4)])
            .unwrap();
        assert!(rolled.is_empty());
        assert!(store.is_empty());
    }

    #[test]
    fn test_dailies_outside_the_window_are_ignored() {
        let mut store = InMemorySnapshotStore::new();
        // 2019-05-12 is a Sunday; the 11th belongs to the previous week.
        store.upsert_snapshot(daily(11, 32)).unwrap();
        store.upsert_snapshot(daily(13, 4)).unwrap();

        let rolled = roller(Granularity::Weekly)
            .roll_snapshots(&mut store, &clock_on(15), [&calculation(4)])
            .unwrap();
        assert_eq!(rolled.len(), 1);
        assert_eq!(
            rolled[0].snapshot.totals(MeasurementType::Physical),
            Some(&UsageTotals::new(4, 2, 1))
        );
        assert_eq!(
            rolled[0].snapshot.bucket_start,
            Utc.with_ymd_and_hms(2019, 5, 12, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_rollup_takes_owner_from_latest_daily() {
        let mut older = daily(1, 4);
        older.owner_id = Some("Old".to_string());
        let newer = daily(2, 2);
        let window = clock_on(2).current_month().unwrap();

        let snapshot = rollup_snapshot(Granularity::Monthly, &window, &[newer, older]).unwrap();
        assert_eq!(snapshot.owner_id.as_deref(), Some("O1"));
        assert_eq!(rollup_snapshot(Granularity::Monthly, &window, &[]), None);
    }
}
