use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use tracing::{debug, info, instrument};

use crate::error::{Error, ErrorDetails};
use crate::usage::backend::{BackendState, DurableBackend};
use crate::usage::day_key::{retention_cutoff, Clock, DayKey, SystemClock};
use crate::usage::store::{MemoryUsageStore, UsageStore};
use crate::usage::{
    RecordOutcome, Reservation, UsageSnapshot, UsageStatus, DEFAULT_RETENTION_DAYS,
    MAX_DAILY_SECONDS,
};

/// Configuration for the usage ledger
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Cap on cumulative call seconds per identifier per day
    pub max_daily_seconds: f64,
    /// Days of history kept in the volatile store
    pub retention_days: u32,
    /// How often the retention sweep runs
    pub sweep_interval: Duration,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_daily_seconds: MAX_DAILY_SECONDS,
            retention_days: DEFAULT_RETENTION_DAYS,
            sweep_interval: Duration::from_secs(60 * 60),
        }
    }
}

/// Daily call-time bookkeeping per identifier.
///
/// Reads and writes go to the durable backend when it is configured and reachable,
/// otherwise to the volatile in-process store. The ledger is the only writer of usage records.
pub struct UsageLedger {
    config: LedgerConfig,
    volatile: Arc<MemoryUsageStore>,
    durable: DurableBackend,
    clock: Arc<dyn Clock>,
}

impl UsageLedger {
    pub fn new(
        config: LedgerConfig,
        volatile: Arc<MemoryUsageStore>,
        durable: DurableBackend,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            volatile,
            durable,
            clock,
        }
    }

    /// A ledger with no durable backend, using the system clock
    pub fn in_memory(config: LedgerConfig) -> Self {
        Self::new(
            config,
            Arc::new(MemoryUsageStore::new()),
            DurableBackend::disabled(),
            Arc::new(SystemClock),
        )
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn max_daily_seconds(&self) -> f64 {
        self.config.max_daily_seconds
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn volatile_store(&self) -> &MemoryUsageStore {
        &self.volatile
    }

    pub fn durable_configured(&self) -> bool {
        self.durable.is_configured()
    }

    pub fn backend_state(&self) -> BackendState {
        self.durable.state()
    }

    pub fn today_key(&self, identifier: &str) -> DayKey {
        DayKey::today(identifier, self.clock.as_ref())
    }

    async fn active_store(&self) -> Arc<dyn UsageStore> {
        match self.durable.store().await {
            Some(store) => store,
            None => self.volatile.clone() as Arc<dyn UsageStore>,
        }
    }

    /// Today's usage for `identifier`.
    ///
    /// Never fails. If the store cannot be read, the zero-usage default is returned
    /// with `degraded` set and the failure is logged at WARN.
    #[instrument(skip(self), level = "debug")]
    pub async fn get_usage(&self, identifier: &str) -> UsageSnapshot {
        let key = self.today_key(identifier);
        let store = self.active_store().await;
        match store.get(&key).await {
            Ok(record) => {
                UsageSnapshot::from_record(record.unwrap_or_default(), self.max_daily_seconds())
            }
            Err(e) => {
                e.log();
                record_backend_failure(store.name(), "get");
                UsageSnapshot::degraded(self.max_daily_seconds())
            }
        }
    }

    /// Whether a new call may start right now.
    ///
    /// Fails closed: a degraded read answers `false` so the client checks again later.
    pub async fn can_start_session(&self, identifier: &str) -> bool {
        self.get_usage(identifier).await.can_start()
    }

    /// Record `duration_seconds` of call time, truncated to what is left today.
    #[instrument(skip(self), level = "debug")]
    pub async fn record_session(
        &self,
        identifier: &str,
        duration_seconds: f64,
    ) -> Result<RecordOutcome, Error> {
        let duration_seconds = validate_seconds("durationSeconds", duration_seconds)?;
        let key = self.today_key(identifier);
        let cap = self.max_daily_seconds();
        let store = self.active_store().await;

        let (record, recorded_seconds) = store
            .record_session(&key, duration_seconds, cap, self.clock.now())
            .await
            .inspect_err(|e| {
                e.log();
                record_backend_failure(store.name(), "record_session");
            })?;

        metrics::counter!("santacall_sessions_recorded_total", "store" => store.name())
            .increment(1);
        metrics::histogram!("santacall_session_recorded_seconds").record(recorded_seconds);

        if recorded_seconds < duration_seconds {
            debug!(
                "Clamped session for {key} from {duration_seconds}s to {recorded_seconds}s (cap {cap}s)"
            );
        }

        Ok(RecordOutcome {
            used_seconds: record.used_seconds,
            remaining_seconds: record.remaining_seconds(cap),
            recorded_seconds,
        })
    }

    /// How much of `requested_seconds` could be granted right now. Does not hold anything.
    ///
    /// Fails closed: a store failure is returned instead of guessing at the allowance.
    pub async fn reserve_time(
        &self,
        identifier: &str,
        requested_seconds: f64,
    ) -> Result<Reservation, Error> {
        let requested_seconds = validate_seconds("requestedSeconds", requested_seconds)?;
        let key = self.today_key(identifier);
        let store = self.active_store().await;
        let record = store
            .get(&key)
            .await
            .inspect_err(|e| {
                e.log();
                record_backend_failure(store.name(), "get");
            })?
            .unwrap_or_default();

        let remaining = record.remaining_seconds(self.max_daily_seconds());
        let reserved_seconds = requested_seconds.min(remaining);
        Ok(Reservation {
            reserved_seconds,
            remaining_seconds: remaining - reserved_seconds,
        })
    }

    /// Today's usage for `identifier` along with the identifier and cap, for operators
    pub async fn status(&self, identifier: &str) -> UsageStatus {
        UsageStatus {
            identifier: identifier.to_string(),
            day: self.clock.today(),
            max_daily_seconds: self.max_daily_seconds(),
            usage: self.get_usage(identifier).await,
        }
    }

    /// Delete the record for `identifier` on `day`, restoring the full allowance.
    /// Returns whether anything was removed.
    pub async fn clear(&self, identifier: &str, day: NaiveDate) -> Result<bool, Error> {
        let key = DayKey::new(identifier, day);
        let mut removed = self.volatile.delete(&key).await?;
        if let Some(store) = self.durable.store().await {
            removed |= store.delete(&key).await.inspect_err(|e| {
                e.log();
                record_backend_failure(store.name(), "delete");
            })?;
        }
        info!("Cleared usage for {key} (removed: {removed})");
        Ok(removed)
    }

    /// Remove volatile records older than the retention window. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let cutoff = retention_cutoff(self.clock.today(), self.config.retention_days);
        let removed = self.volatile.sweep_expired(cutoff);
        if removed > 0 {
            info!("Retention sweep removed {removed} usage record(s) older than {cutoff}");
            metrics::counter!("santacall_retention_swept_total").increment(removed as u64);
        }
        removed
    }
}

fn record_backend_failure(store: &'static str, op: &'static str) {
    metrics::counter!("santacall_backend_failures_total", "store" => store, "op" => op)
        .increment(1);
}

fn validate_seconds(field: &str, value: f64) -> Result<f64, Error> {
    if value.is_finite() && value >= 0.0 {
        Ok(value)
    } else {
        Err(Error::new(ErrorDetails::InvalidArgument {
            message: format!("`{field}` must be a finite number >= 0 (got {value})"),
        }))
    }
}
