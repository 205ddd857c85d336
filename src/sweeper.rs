use crate::settlement::SettlementService;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Runs `sweep_stale_payments` every `every` until the handle is aborted.
pub fn spawn_sweeper(service: Arc<SettlementService>, every: Duration) -> JoinHandle<()> {
    info!(interval_secs = every.as_secs(), "payment sweeper started");
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let report = service.sweep_stale_payments().await;
            debug!(
                expired = report.expired.len(),
                settled = report.settled.len(),
                reconciled = report.reconciled.len(),
                "sweep finished"
            );
        }
    })
}
