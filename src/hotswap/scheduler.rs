//! Background polling loop for scheduled promotions.
//!
//! Runs as a tokio task next to request handling. Each tick asks the registry
//! for the newest staged version and promotes it if it validates. Failures are
//! logged and the same candidate is retried on the next tick; the loop itself
//! never stops on an error.

use super::HotSwapManager;
use crate::error::HotSwapError;
use log::{debug, error, info};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Handle to a running polling loop.
pub struct HotSwapTask {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl HotSwapTask {
    /// Stop polling and wait for the loop to exit. An in-progress promotion completes first.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            error!("hot swap loop ended abnormally: {}", e);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

impl HotSwapManager {
    /// Spawn the polling loop. Returns immediately.
    ///
    /// If hot swap is disabled in config, the task exits right away.
    pub fn spawn(self: Arc<Self>) -> HotSwapTask {
        let (tx, rx) = watch::channel(false);
        let join = tokio::spawn(async move { self.run(rx).await });
        HotSwapTask { shutdown: tx, join }
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if !self.config().enabled {
            info!("Scheduled hot swap is disabled, skipping");
            return;
        }

        info!(
            "Starting hot swap polling with {}-second interval",
            self.config().poll_interval().as_secs()
        );

        let mut ticker = interval(self.config().poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.do_poll().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Hot swap polling stopped");
                        return;
                    }
                }
            }
        }
    }

    async fn do_poll(&self) {
        match self.poll_once().await {
            Ok(Some(report)) => debug!(
                "poll cycle promoted {} in {}ms",
                report.new_version, report.duration_ms
            ),
            Ok(None) => debug!("poll cycle found no staged versions"),
            Err(e @ HotSwapError::Registry(_)) => error!("hot swap poll failed: {}", e),
            // Already logged by the promotion path; the candidate is retried next tick.
            Err(_) => {}
        }
    }
}
