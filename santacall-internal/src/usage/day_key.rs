use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Days, NaiveDate, Utc};

use crate::error::{Error, ErrorDetails};

const DAY_FORMAT: &str = "%Y-%m-%d";

/// Source of wall-clock time for day bucketing
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to. Used to exercise day rollover.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        if let Ok(mut guard) = self.now.lock() {
            *guard = now;
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        if let Ok(mut guard) = self.now.lock() {
            *guard += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// Storage key scoping a usage record to one identifier on one UTC calendar day.
///
/// Rendered as `identifier:YYYY-MM-DD`. The day is taken from the text after the
/// *last* `:`, so identifiers that contain colons (IPv6 addresses) survive a round trip.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DayKey {
    pub identifier: String,
    pub day: NaiveDate,
}

impl DayKey {
    pub fn new(identifier: impl Into<String>, day: NaiveDate) -> Self {
        Self {
            identifier: identifier.into(),
            day,
        }
    }

    pub fn today(identifier: impl Into<String>, clock: &dyn Clock) -> Self {
        Self::new(identifier, clock.today())
    }

    /// Inverse of the `Display` rendering
    #[cfg(test)]
    pub fn parse(key: &str) -> Result<Self, Error> {
        let (identifier, day) = key.rsplit_once(':').ok_or_else(|| {
            Error::new_without_logging(ErrorDetails::InvalidArgument {
                message: format!("Usage key `{key}` has no day suffix"),
            })
        })?;
        let day = parse_day(day)?;
        Ok(Self::new(identifier, day))
    }

    /// Whether this key falls before the first day that is still retained
    pub fn is_expired(&self, cutoff: NaiveDate) -> bool {
        self.day < cutoff
    }
}

impl fmt::Display for DayKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.identifier, self.day.format(DAY_FORMAT))
    }
}

pub fn parse_day(day: &str) -> Result<NaiveDate, Error> {
    NaiveDate::parse_from_str(day, DAY_FORMAT).map_err(|e| {
        Error::new_without_logging(ErrorDetails::InvalidArgument {
            message: format!("Invalid day `{day}` (expected YYYY-MM-DD): {e}"),
        })
    })
}

/// Oldest day that survives the retention sweep.
pub fn retention_cutoff(today: NaiveDate, retention_days: u32) -> NaiveDate {
    today
        .checked_sub_days(Days::new(u64::from(retention_days)))
        .unwrap_or(NaiveDate::MIN)
}
