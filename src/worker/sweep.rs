//! Periodic eviction of silent connections

use crate::config::ServiceConfig;
use crate::storage::{KeyedStore, StorageError};
use crate::tracker::{ConnectionTracker, SweepReport};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

#[derive(Clone)]
pub struct SweepTask {
    store: Arc<dyn KeyedStore>,
    tracker: ConnectionTracker,
    interval: Duration,
    stale_after: Duration,
}

impl SweepTask {
    pub fn new(store: Arc<dyn KeyedStore>, tracker: ConnectionTracker, config: &ServiceConfig) -> Self {
        Self {
            store,
            tracker,
            interval: config.sweep_interval,
            stale_after: config.stale_after,
        }
    }

    /// One pass: evict stale connections, then purge expired store entries.
    /// The purge runs even when eviction fails; the first error is returned.
    pub async fn run_once(&self) -> Result<SweepReport, StorageError> {
        let swept = self.tracker.sweep_stale(Utc::now(), self.stale_after).await;
        if let Err(e) = &swept {
            error!(error = %e, "Stale connection sweep failed");
        }

        let purged = self.store.purge_expired().await;
        match &purged {
            Ok(0) => {}
            Ok(purged) => debug!(purged, "Purged expired entries"),
            Err(e) => error!(error = %e, "Purge of expired entries failed"),
        }

        let report = swept?;
        purged?;
        Ok(report)
    }

    /// Tick until `shutdown` flips; failed passes are logged and skipped
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?self.interval, stale_after = ?self.stale_after, "Connection sweep started");

        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    // Failures are logged inside run_once
                    let _ = self.run_once().await;
                }
            }
        }

        info!("Connection sweep stopped");
    }
}
