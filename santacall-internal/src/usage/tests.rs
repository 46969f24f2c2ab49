use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use tracing_test::traced_test;

use super::*;
use crate::error::{Error, ErrorDetails};

fn christmas_eve() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 12, 24, 9, 30, 0).unwrap()
}

fn ledger_with_clock(clock: Arc<ManualClock>) -> UsageLedger {
    UsageLedger::new(
        LedgerConfig::default(),
        Arc::new(MemoryUsageStore::new()),
        DurableBackend::disabled(),
        clock,
    )
}

fn ledger() -> (UsageLedger, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(christmas_eve()));
    (ledger_with_clock(clock.clone()), clock)
}

/// A durable store whose reads and writes can be switched to fail
#[derive(Default)]
struct FlakyStore {
    inner: MemoryUsageStore,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

fn transient(op: &str) -> Error {
    Error::new_without_logging(ErrorDetails::TransientBackendFailure {
        message: format!("{op} timed out"),
    })
}

#[async_trait]
impl UsageStore for FlakyStore {
    fn name(&self) -> &'static str {
        "flaky"
    }

    async fn get(&self, key: &DayKey) -> Result<Option<UsageRecord>, Error> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(transient("GET"));
        }
        self.inner.get(key).await
    }

    async fn set(&self, key: &DayKey, record: &UsageRecord) -> Result<(), Error> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(transient("SET"));
        }
        self.inner.set(key, record).await
    }

    async fn delete(&self, key: &DayKey) -> Result<bool, Error> {
        self.inner.delete(key).await
    }
}

struct FixedConnector(Arc<FlakyStore>);

#[async_trait]
impl DurableConnector for FixedConnector {
    async fn connect(&self) -> Result<Arc<dyn UsageStore>, Error> {
        Ok(self.0.clone())
    }
}

struct RefusingConnector;

#[async_trait]
impl DurableConnector for RefusingConnector {
    async fn connect(&self) -> Result<Arc<dyn UsageStore>, Error> {
        Err(Error::new_without_logging(ErrorDetails::BackendUnavailable {
            message: "connection refused".to_string(),
        }))
    }
}

fn ledger_with_durable(store: Arc<FlakyStore>) -> UsageLedger {
    UsageLedger::new(
        LedgerConfig::default(),
        Arc::new(MemoryUsageStore::new()),
        DurableBackend::new(Box::new(FixedConnector(store))),
        Arc::new(ManualClock::new(christmas_eve())),
    )
}

#[tokio::test]
async fn test_alice_scenario() {
    let (ledger, _) = ledger();

    let first = ledger.record_session("alice", 100.0).await.unwrap();
    assert_eq!(first.used_seconds, 100.0);
    assert_eq!(first.remaining_seconds, 80.0);

    let second = ledger.record_session("alice", 100.0).await.unwrap();
    assert_eq!(second.used_seconds, 180.0);
    assert_eq!(second.remaining_seconds, 0.0);
    assert_eq!(second.recorded_seconds, 80.0);

    assert!(!ledger.can_start_session("alice").await);

    let usage = ledger.get_usage("alice").await;
    let durations: Vec<f64> = usage.sessions.iter().map(|s| s.duration).collect();
    assert_eq!(durations, vec![100.0, 80.0]);
    assert!(usage.sessions.iter().all(|s| s.timestamp == christmas_eve()));
}

#[tokio::test]
async fn test_used_is_min_of_sum_and_cap() {
    let sequences: [&[f64]; 4] = [
        &[],
        &[0.0, 0.0],
        &[10.0, 20.5, 30.0],
        &[60.0, 60.0, 60.0, 60.0, 1.0],
    ];
    for (i, durations) in sequences.iter().enumerate() {
        let (ledger, _) = ledger();
        let id = format!("user-{i}");
        for d in durations.iter() {
            ledger.record_session(&id, *d).await.unwrap();
        }
        let usage = ledger.get_usage(&id).await;
        let expected = durations.iter().sum::<f64>().min(MAX_DAILY_SECONDS);
        assert_eq!(usage.used_seconds, expected, "sequence {durations:?}");

        let logged: f64 = usage.sessions.iter().map(|s| s.duration).sum();
        assert_eq!(logged, usage.used_seconds);
        assert_eq!(usage.used_seconds + usage.remaining_seconds, MAX_DAILY_SECONDS);
        assert_eq!(
            ledger.can_start_session(&id).await,
            usage.remaining_seconds > 0.0
        );
    }
}

#[tokio::test]
async fn test_reads_are_idempotent() {
    let (ledger, _) = ledger();
    ledger.record_session("dasher", 42.0).await.unwrap();

    let first = ledger.get_usage("dasher").await;
    let second = ledger.get_usage("dasher").await;
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_unknown_identifier_has_full_allowance() {
    let (ledger, _) = ledger();
    let usage = ledger.get_usage("nobody").await;
    assert_eq!(usage.used_seconds, 0.0);
    assert_eq!(usage.remaining_seconds, MAX_DAILY_SECONDS);
    assert!(usage.sessions.is_empty());
    assert!(!usage.degraded);
    // Reads do not create records
    assert!(ledger.volatile_store().is_empty());
}

#[tokio::test]
async fn test_negative_duration_is_rejected_without_side_effects() {
    let (ledger, _) = ledger();
    ledger.record_session("bob", 10.0).await.unwrap();

    for bad in [-5.0, f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
        let err = ledger.record_session("bob", bad).await.unwrap_err();
        assert!(matches!(
            err.get_details(),
            ErrorDetails::InvalidArgument { .. }
        ));
    }

    let usage = ledger.get_usage("bob").await;
    assert_eq!(usage.used_seconds, 10.0);
    assert_eq!(usage.sessions.len(), 1);
}

#[tokio::test]
async fn test_day_rollover_gives_fresh_allowance() {
    let (ledger, clock) = ledger();
    ledger.record_session("comet", 180.0).await.unwrap();
    assert!(!ledger.can_start_session("comet").await);

    clock.advance(chrono::Duration::days(1));
    let usage = ledger.get_usage("comet").await;
    assert_eq!(usage.used_seconds, 0.0);
    assert_eq!(usage.remaining_seconds, MAX_DAILY_SECONDS);
    assert!(ledger.can_start_session("comet").await);
}

#[tokio::test]
async fn test_day_window_isolation() {
    let (ledger, clock) = ledger();
    ledger.record_session("cupid", 50.0).await.unwrap();

    clock.advance(chrono::Duration::days(1));
    ledger.record_session("cupid", 20.0).await.unwrap();
    assert_eq!(ledger.get_usage("cupid").await.used_seconds, 20.0);

    clock.set(christmas_eve());
    assert_eq!(ledger.get_usage("cupid").await.used_seconds, 50.0);
}

#[tokio::test]
async fn test_reserve_time_is_advisory() {
    let (ledger, _) = ledger();
    ledger.record_session("vixen", 150.0).await.unwrap();

    let reservation = ledger.reserve_time("vixen", 60.0).await.unwrap();
    assert_eq!(reservation.reserved_seconds, 30.0);
    assert_eq!(reservation.remaining_seconds, 0.0);

    let reservation = ledger.reserve_time("vixen", 10.0).await.unwrap();
    assert_eq!(reservation.reserved_seconds, 10.0);
    assert_eq!(reservation.remaining_seconds, 20.0);

    // Nothing was held or consumed
    assert_eq!(ledger.get_usage("vixen").await.used_seconds, 150.0);
    assert!(ledger.reserve_time("vixen", -1.0).await.is_err());
}

#[tokio::test]
async fn test_admin_clear_restores_allowance() {
    let (ledger, clock) = ledger();
    ledger.record_session("prancer", 180.0).await.unwrap();

    let today = clock.today();
    assert!(ledger.clear("prancer", today).await.unwrap());
    assert!(!ledger.clear("prancer", today).await.unwrap());

    let usage = ledger.get_usage("prancer").await;
    assert_eq!(usage.used_seconds, 0.0);
    assert_eq!(usage.remaining_seconds, 180.0);
    assert!(usage.sessions.is_empty());
}

#[tokio::test]
async fn test_clear_only_touches_the_given_day() {
    let (ledger, clock) = ledger();
    ledger.record_session("blitzen", 30.0).await.unwrap();
    let yesterday = NaiveDate::from_ymd_opt(2025, 12, 23).unwrap();

    assert!(!ledger.clear("blitzen", yesterday).await.unwrap());
    assert_eq!(ledger.get_usage("blitzen").await.used_seconds, 30.0);
    assert_eq!(clock.today(), NaiveDate::from_ymd_opt(2025, 12, 24).unwrap());
}

#[tokio::test]
async fn test_sweep_keeps_retention_window() {
    let (ledger, clock) = ledger();
    for _ in 0..4 {
        ledger.record_session("rudolph", 1.0).await.unwrap();
        clock.advance(chrono::Duration::days(1));
    }
    // Records exist for Dec 24..=27 and today is Dec 28, so Dec 26 is the oldest kept day
    assert_eq!(ledger.volatile_store().len(), 4);

    let removed = ledger.sweep_expired();
    assert_eq!(removed, 2);
    let mut days: Vec<_> = ledger
        .volatile_store()
        .keys()
        .into_iter()
        .map(|k| k.day.to_string())
        .collect();
    days.sort();
    assert_eq!(days, vec!["2025-12-26", "2025-12-27"]);
}

#[tokio::test]
async fn test_durable_backend_is_preferred() {
    let durable = Arc::new(FlakyStore::default());
    let ledger = ledger_with_durable(durable.clone());

    ledger.record_session("elf", 25.0).await.unwrap();

    assert!(matches!(ledger.backend_state(), BackendState::Ready(_)));
    assert!(ledger.volatile_store().is_empty());
    let key = ledger.today_key("elf");
    assert_eq!(durable.inner.get(&key).await.unwrap().unwrap().used_seconds, 25.0);
}

#[tokio::test]
#[traced_test]
async fn test_unreachable_durable_backend_falls_back_to_memory() {
    let ledger = UsageLedger::new(
        LedgerConfig::default(),
        Arc::new(MemoryUsageStore::new()),
        DurableBackend::new(Box::new(RefusingConnector)),
        Arc::new(ManualClock::new(christmas_eve())),
    );

    ledger.record_session("frosty", 30.0).await.unwrap();
    ledger.record_session("frosty", 30.0).await.unwrap();

    assert!(matches!(ledger.backend_state(), BackendState::Unavailable));
    assert_eq!(ledger.get_usage("frosty").await.used_seconds, 60.0);
    assert_eq!(ledger.volatile_store().len(), 1);
    assert!(logs_contain("falling back to in-memory storage"));
}

#[tokio::test]
#[traced_test]
async fn test_read_fault_degrades_and_fails_closed() {
    let durable = Arc::new(FlakyStore::default());
    let ledger = ledger_with_durable(durable.clone());
    ledger.record_session("grinch", 170.0).await.unwrap();

    durable.fail_reads.store(true, Ordering::SeqCst);

    let usage = ledger.get_usage("grinch").await;
    assert!(usage.degraded);
    assert_eq!(usage.used_seconds, 0.0);
    assert!(usage.sessions.is_empty());
    assert!(logs_contain("GET timed out"));

    assert!(!ledger.can_start_session("grinch").await);

    let err = ledger.reserve_time("grinch", 10.0).await.unwrap_err();
    assert!(err.is_transient());

    durable.fail_reads.store(false, Ordering::SeqCst);
    let usage = ledger.get_usage("grinch").await;
    assert!(!usage.degraded);
    assert_eq!(usage.used_seconds, 170.0);
}

#[tokio::test]
async fn test_write_fault_is_reported() {
    let durable = Arc::new(FlakyStore::default());
    let ledger = ledger_with_durable(durable.clone());
    ledger.record_session("krampus", 10.0).await.unwrap();

    durable.fail_writes.store(true, Ordering::SeqCst);
    let err = ledger.record_session("krampus", 10.0).await.unwrap_err();
    assert!(matches!(
        err.get_details(),
        ErrorDetails::TransientBackendFailure { .. }
    ));

    durable.fail_writes.store(false, Ordering::SeqCst);
    assert_eq!(ledger.get_usage("krampus").await.used_seconds, 10.0);
}
