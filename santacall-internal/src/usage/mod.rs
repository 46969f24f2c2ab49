pub mod backend;
pub mod day_key;
pub mod ledger;
pub mod redis_store;
pub mod store;
pub mod sweep;

#[cfg(test)]
mod tests;

pub use backend::{BackendState, DurableBackend, DurableConnector};
pub use day_key::{Clock, DayKey, ManualClock, SystemClock};
pub use ledger::{LedgerConfig, UsageLedger};
pub use redis_store::{RedisConnector, RedisUsageStore};
pub use store::{MemoryUsageStore, UsageStore};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Default cap on call time per identifier per day (3 minutes)
pub const MAX_DAILY_SECONDS: f64 = 180.0;

/// Days of history the volatile store keeps before the sweep removes them
pub const DEFAULT_RETENTION_DAYS: u32 = 2;

/// One recorded call, after clamping to the remaining allowance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEntry {
    pub duration: f64,
    pub timestamp: DateTime<Utc>,
}

/// Usage for one identifier on one day
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub used_seconds: f64,
    #[serde(default)]
    pub sessions: Vec<SessionEntry>,
}

impl UsageRecord {
    pub fn remaining_seconds(&self, cap: f64) -> f64 {
        (cap - self.used_seconds).max(0.0)
    }

    /// Append a session, truncated so `used_seconds` never passes `cap`.
    /// Returns the duration actually recorded.
    pub fn apply_session(&mut self, duration: f64, cap: f64, at: DateTime<Utc>) -> f64 {
        let actual = duration.min(self.remaining_seconds(cap));
        self.used_seconds += actual;
        self.sessions.push(SessionEntry {
            duration: actual,
            timestamp: at,
        });
        actual
    }
}

/// Answer to a usage query
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSnapshot {
    pub used_seconds: f64,
    pub remaining_seconds: f64,
    pub sessions: Vec<SessionEntry>,
    /// Set when the backend could not be read and the zero-usage default was returned
    pub degraded: bool,
}

impl UsageSnapshot {
    pub fn from_record(record: UsageRecord, cap: f64) -> Self {
        Self {
            used_seconds: record.used_seconds,
            remaining_seconds: record.remaining_seconds(cap),
            sessions: record.sessions,
            degraded: false,
        }
    }

    /// Whether a new call may start. A degraded read never allows one.
    pub fn can_start(&self) -> bool {
        !self.degraded && self.remaining_seconds > 0.0
    }

    pub fn degraded(cap: f64) -> Self {
        Self {
            degraded: true,
            ..Self::from_record(UsageRecord::default(), cap)
        }
    }
}

/// Operator view of one identifier's usage today
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageStatus {
    pub identifier: String,
    pub day: NaiveDate,
    pub max_daily_seconds: f64,
    #[serde(flatten)]
    pub usage: UsageSnapshot,
}

/// Totals after a `record_session` call
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordOutcome {
    pub used_seconds: f64,
    pub remaining_seconds: f64,
    /// Seconds actually added after clamping
    #[serde(skip)]
    pub recorded_seconds: f64,
}

/// Advisory answer to "how much of this could I use right now"
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reservation {
    pub reserved_seconds: f64,
    pub remaining_seconds: f64,
}
