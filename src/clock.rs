//! Time source for snapshot production.
//!
//! Every bucket boundary is derived from a single "now" so a run (and its
//! tests) sees consistent windows. Days start at midnight UTC, weeks on
//! Sunday, quarters in January, April, July and October. A window ends one
//! nanosecond before the next period starts.

use crate::date_range::DateRange;
use crate::error::TallyError;
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc};

#[derive(Clone, Copy, Debug)]
pub struct ApplicationClock {
    fixed: Option<DateTime<Utc>>,
    source: fn() -> DateTime<Utc>,
}

impl Default for ApplicationClock {
    fn default() -> Self {
        Self::system()
    }
}

impl ApplicationClock {
    /// A clock reading the system time.
    pub fn system() -> Self {
        Self {
            fixed: None,
            source: Utc::now,
        }
    }

    /// A clock frozen at `now`.
    pub fn fixed(now: DateTime<Utc>) -> Self {
        Self {
            fixed: Some(now),
            ..Self::system()
        }
    }

    /// A live clock reading `source` instead of the system time.
    #[cfg(test)]
    pub(crate) fn with_source(source: fn() -> DateTime<Utc>) -> Self {
        Self {
            fixed: None,
            source,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.fixed.unwrap_or_else(self.source)
    }

    /// This clock stopped at its current reading. A run derives all of its
    /// windows from one frozen clock.
    pub fn freeze(&self) -> ApplicationClock {
        Self::fixed(self.now())
    }

    pub fn current_day(&self) -> Result<DateRange, TallyError> {
        let today = self.now().date_naive();
        period(today, today + Duration::days(1))
    }

    pub fn current_week(&self) -> Result<DateRange, TallyError> {
        let today = self.now().date_naive();
        let sunday = today - Duration::days(i64::from(today.weekday().num_days_from_sunday()));
        period(sunday, sunday + Duration::days(7))
    }

    pub fn current_month(&self) -> Result<DateRange, TallyError> {
        let today = self.now().date_naive();
        months(today.year(), today.month(), 1)
    }

    pub fn current_quarter(&self) -> Result<DateRange, TallyError> {
        let today = self.now().date_naive();
        let first_month = (today.month0() / 3) * 3 + 1;
        months(today.year(), first_month, 3)
    }

    pub fn current_year(&self) -> Result<DateRange, TallyError> {
        months(self.now().year(), 1, 12)
    }
}

/// `count` whole months starting at the first day of `year`-`month`.
fn months(year: i32, month: u32, count: u32) -> Result<DateRange, TallyError> {
    let start = first_day(year, month)?;
    let month0 = month - 1 + count;
    let next = first_day(year + (month0 / 12) as i32, month0 % 12 + 1)?;
    period(start, next)
}

fn first_day(year: i32, month: u32) -> Result<NaiveDate, TallyError> {
    NaiveDate::from_ymd_opt(year, month, 1).ok_or(TallyError::InvalidDate {
        year,
        month,
        day: 1,
    })
}

fn period(start: NaiveDate, next: NaiveDate) -> Result<DateRange, TallyError> {
    DateRange::new(midnight(start), midnight(next) - Duration::nanoseconds(1))
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN))
}

#[cfg(test)]
mod tests {
    use super::ApplicationClock;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use std::cell::Cell;

    fn clock() -> ApplicationClock {
        // A Wednesday.
        ApplicationClock::fixed(Utc.with_ymd_and_hms(2019, 5, 15, 14, 30, 0).unwrap())
    }

    fn last_nano_of(year: i32, month: u32, day: u32) -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(year, month, day, 0, 0, 0).unwrap() + Duration::days(1)
            - Duration::nanoseconds(1)
    }

    #[test]
    fn test_current_day() {
        let day = clock().current_day().unwrap();
        assert_eq!(day.start(), Utc.with_ymd_and_hms(2019, 5, 15, 0, 0, 0).unwrap());
        assert_eq!(day.end(), last_nano_of(2019, 5, 15));
    }

    #[test]
    fn test_week_starts_on_sunday() {
        let week = clock().current_week().unwrap();
        assert_eq!(week.start(), Utc.with_ymd_and_hms(2019, 5, 12, 0, 0, 0).unwrap());
        assert_eq!(week.end(), last_nano_of(2019, 5, 18));
    }

    #[test]
    fn test_month_quarter_and_year() {
        let month = clock().current_month().unwrap();
        assert_eq!(month.start(), Utc.with_ymd_and_hms(2019, 5, 1, 0, 0, 0).unwrap());
        assert_eq!(month.end(), last_nano_of(2019, 5, 31));

        let quarter = clock().current_quarter().unwrap();
        assert_eq!(quarter.start(), Utc.with_ymd_and_hms(2019, 4, 1, 0, 0, 0).unwrap());
        assert_eq!(quarter.end(), last_nano_of(2019, 6, 30));

        let year = clock().current_year().unwrap();
        assert_eq!(year.start(), Utc.with_ymd_and_hms(2019, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(year.end(), last_nano_of(2019, 12, 31));
    }

    #[test]
    fn test_windows_at_year_end() {
        let new_years_eve = Utc.with_ymd_and_hms(2020, 12, 31, 23, 59, 59).unwrap();
        let clock = ApplicationClock::fixed(new_years_eve);
        let month = clock.current_month().unwrap();
        assert_eq!(month.end(), last_nano_of(2020, 12, 31));
        let quarter = clock.current_quarter().unwrap();
        assert_eq!(quarter.start(), Utc.with_ymd_and_hms(2020, 10, 1, 0, 0, 0).unwrap());
        assert_eq!(quarter.end(), last_nano_of(2020, 12, 31));
    }

    #[test]
    fn test_leap_february() {
        let clock = ApplicationClock::fixed(Utc.with_ymd_and_hms(2020, 2, 10, 0, 0, 0).unwrap());
        assert_eq!(clock.current_month().unwrap().end(), last_nano_of(2020, 2, 29));
    }

    thread_local! {
        static READS: Cell<i64> = Cell::new(0);
    }

    fn one_day_per_read() -> DateTime<Utc> {
        let reads = READS.with(|reads| {
            reads.set(reads.get() + 1);
            reads.get()
        });
        Utc.with_ymd_and_hms(2019, 5, 31, 12, 0, 0).unwrap() + Duration::days(reads - 1)
    }

    #[test]
    fn test_frozen_clock_reads_its_source_once() {
        let live = ApplicationClock::with_source(one_day_per_read);
        let frozen = live.freeze();

        let may_31 = Utc.with_ymd_and_hms(2019, 5, 31, 0, 0, 0).unwrap();
        assert_eq!(frozen.current_day().unwrap().start(), may_31);
        assert_eq!(frozen.current_day().unwrap().start(), may_31);
        assert_eq!(
            frozen.current_month().unwrap().start(),
            Utc.with_ymd_and_hms(2019, 5, 1, 0, 0, 0).unwrap()
        );
        // The live clock has moved on to June.
        assert_eq!(
            live.current_month().unwrap().start(),
            Utc.with_ymd_and_hms(2019, 6, 1, 0, 0, 0).unwrap()
        );
    }
}
