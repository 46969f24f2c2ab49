use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use std::sync::Arc;

use crate::error::Error;
use crate::usage::day_key::DayKey;
use crate::usage::UsageRecord;

/// Key-value storage for usage records
#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Short name used in logs and metrics labels
    fn name(&self) -> &'static str;

    async fn get(&self, key: &DayKey) -> Result<Option<UsageRecord>, Error>;

    async fn set(&self, key: &DayKey, record: &UsageRecord) -> Result<(), Error>;

    /// Returns `true` if a record was removed
    async fn delete(&self, key: &DayKey) -> Result<bool, Error>;

    /// Append a clamped session to the record under `key` and persist it.
    ///
    /// The default is a plain get-modify-set and is not atomic. Stores that can do better override it.
    /// Returns the updated record and the duration actually recorded.
    async fn record_session(
        &self,
        key: &DayKey,
        duration: f64,
        cap: f64,
        at: DateTime<Utc>,
    ) -> Result<(UsageRecord, f64), Error> {
        let mut record = self.get(key).await?.unwrap_or_default();
        let recorded = record.apply_session(duration, cap, at);
        self.set(key, &record).await?;
        Ok((record, recorded))
    }
}

/// Volatile in-process store. Contents are lost on restart.
#[derive(Clone, Default)]
pub struct MemoryUsageStore {
    records: Arc<DashMap<DayKey, UsageRecord>>,
}

impl MemoryUsageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn keys(&self) -> Vec<DayKey> {
        self.records.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Drop every record whose day is before `cutoff`. Returns how many were removed.
    pub fn sweep_expired(&self, cutoff: NaiveDate) -> usize {
        let before = self.records.len();
        self.records.retain(|key, _| !key.is_expired(cutoff));
        before.saturating_sub(self.records.len())
    }
}

#[async_trait]
impl UsageStore for MemoryUsageStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &DayKey) -> Result<Option<UsageRecord>, Error> {
        Ok(self.records.get(key).map(|entry| entry.value().clone()))
    }

    async fn set(&self, key: &DayKey, record: &UsageRecord) -> Result<(), Error> {
        self.records.insert(key.clone(), record.clone());
        Ok(())
    }

    async fn delete(&self, key: &DayKey) -> Result<bool, Error> {
        Ok(self.records.remove(key).is_some())
    }

    async fn record_session(
        &self,
        key: &DayKey,
        duration: f64,
        cap: f64,
        at: DateTime<Utc>,
    ) -> Result<(UsageRecord, f64), Error> {
        // The entry guard holds the shard lock for the whole read-modify-write
        let mut entry = self.records.entry(key.clone()).or_default();
        let recorded = entry.apply_session(duration, cap, at);
        Ok((entry.value().clone(), recorded))
    }
}
