//! Background upkeep: ledger eviction, usage flushes and expired-lock sweeps.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::MaintenanceSchedule;
use crate::service::SyncService;

/// Handle to the running maintenance task.
pub struct Maintenance {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Maintenance {
    /// Spawns the loop on the current runtime using the service's schedule.
    pub fn spawn(service: Arc<SyncService>) -> Self {
        let schedule = service.schedule();
        let (shutdown, signal) = watch::channel(false);
        let task = tokio::spawn(run(service, schedule, signal));
        Self { shutdown, task }
    }

    /// Stops the loop and waits for its final flush.
    pub async fn stop(self) {
        self.shutdown.send_replace(true);
        if let Err(error) = self.task.await {
            warn!(%error, "maintenance task ended abnormally");
        }
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut ticker = interval(period.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn run(service: Arc<SyncService>, schedule: MaintenanceSchedule, mut shutdown: watch::Receiver<bool>) {
    let mut eviction = ticker(schedule.eviction_interval);
    let mut flush = ticker(schedule.flush_interval);
    let mut sweep = ticker(schedule.lock_sweep_interval);
    info!(?schedule, "maintenance started");

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = eviction.tick() => {
                let removed = service.usage().run_maintenance();
                debug!(removed, "usage eviction pass");
            }
            _ = flush.tick() => {
                if let Err(error) = service.flush().await {
                    warn!(%error, "periodic usage flush failed");
                }
            }
            _ = sweep.tick() => {
                match service.locks().sweep_expired().await {
                    Ok(0) => {}
                    Ok(removed) => info!(removed, "expired sync locks swept"),
                    Err(error) => warn!(%error, "lock sweep failed"),
                }
            }
        }
    }

    service.shutdown().await;
    info!("maintenance stopped");
}
