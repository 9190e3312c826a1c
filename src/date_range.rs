use crate::error::TallyError;
use chrono::{DateTime, Utc};

/// An inclusive range of timestamps. The start never comes after the end.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DateRange {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl DateRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, TallyError> {
        if start > end {
            return Err(TallyError::InvalidDateRange { start, end });
        }
        Ok(Self { start, end })
    }

    /// Builds the smallest range covering every given timestamp.
    pub fn from_dates<I>(dates: I) -> Result<Self, TallyError>
    where
        I: IntoIterator<Item = DateTime<Utc>>,
    {
        let mut bounds: Option<(DateTime<Utc>, DateTime<Utc>)> = None;
        for date in dates {
            bounds = Some(match bounds {
                None => (date, date),
                Some((min, max)) => (min.min(date), max.max(date)),
            });
        }
        let (start, end) = bounds.ok_or(TallyError::EmptyDateRange)?;
        Self::new(start, end)
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        self.start <= timestamp && timestamp <= self.end
    }
}
