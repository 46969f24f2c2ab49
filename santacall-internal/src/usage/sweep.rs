use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::debug;

use crate::usage::ledger::UsageLedger;

/// Start the background task that expires old records from the volatile store.
///
/// The durable backend is left alone since Redis expires its own keys.
/// Abort the returned handle to stop the sweep.
pub fn spawn_retention_sweep(ledger: Arc<UsageLedger>) -> JoinHandle<()> {
    let period = ledger.config().sweep_interval;
    tokio::spawn(async move {
        let mut timer = interval(period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately
        timer.tick().await;

        loop {
            timer.tick().await;
            let removed = ledger.sweep_expired();
            debug!(
                "Retention sweep finished: removed {removed}, {} record(s) remain",
                ledger.volatile_store().len()
            );
        }
    })
}
