//! Background tasks: the kick consumer and the connection sweep

mod kick;
mod sweep;

pub use kick::{KickReport, KickWorker};
pub use sweep::SweepTask;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

/// Running background tasks and the switch that stops them
pub struct Background {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Background {
    pub fn spawn(kick: KickWorker, sweep: SweepTask) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let handles = vec![
            tokio::spawn(kick.run(rx.clone())),
            tokio::spawn(sweep.run(rx)),
        ];
        Self { shutdown, handles }
    }

    /// Signal every task and wait for in-flight work to finish
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
    }
}
