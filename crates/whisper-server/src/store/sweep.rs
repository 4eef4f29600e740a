use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, warn};

use super::SecretStore;

/// Handle to a running expiry sweep. Dropping it also stops the task.
pub struct SweepHandle {
    shutdown: watch::Sender<()>,
    task: JoinHandle<()>,
}

impl SweepHandle {
    /// Signal the sweep to stop and wait for it to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.task.await;
    }
}

/// Spawn a background task that calls `purge_expired()` every `interval`.
pub fn spawn_sweep(store: Arc<dyn SecretStore>, interval: Duration) -> SweepHandle {
    let (shutdown, mut shutdown_rx) = watch::channel(());

    let task = tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.tick().await; // skip first immediate tick
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match store.purge_expired().await {
                        Ok(0) => {}
                        Ok(removed) => debug!(removed, backend = store.backend(), "sweep removed expired secrets"),
                        Err(e) => warn!(error = %e, "background sweep error"),
                    }
                }
                _ = shutdown_rx.changed() => break,
            }
        }
        debug!("expiry sweep stopped");
    });

    SweepHandle { shutdown, task }
}
