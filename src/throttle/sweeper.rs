//! Periodic garbage collection of throttling state.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Something holding state that goes stale.
pub trait Sweep: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Drop stale entries, returning how many were removed.
    fn sweep(&self) -> usize;
}

/// Runs [`Sweep::sweep`] on a fixed interval in a background task.
pub struct Sweeper;

impl Sweeper {
    /// Spawn the sweep loop on the current tokio runtime.
    ///
    /// The first sweep happens one full interval after spawning.
    pub fn spawn(targets: Vec<Arc<dyn Sweep>>, interval: Duration) -> SweeperHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(interval = ?interval, targets = targets.len(), "Sweeper started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = sweep_all(&targets);
                        debug!(removed, "Sweep pass finished");
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("Sweeper stopped");
        });

        SweeperHandle {
            stop_tx,
            task: Some(task),
        }
    }
}

/// Sweep every target once, returning the total removed.
pub fn sweep_all(targets: &[Arc<dyn Sweep>]) -> usize {
    targets
        .iter()
        .map(|target| {
            let removed = target.sweep();
            if removed > 0 {
                debug!(sweep_target = target.name(), removed, "Swept target");
            }
            removed
        })
        .sum()
}

/// Handle to a running sweep loop.
pub struct SweeperHandle {
    stop_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    /// Stop the loop and wait for it to exit.
    pub async fn stop(mut self) {
        let _ = self.stop_tx.send(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Sweeper task ended abnormally");
            }
        }
    }

    /// Whether the loop has exited.
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |t| t.is_finished())
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
