// Auto-release sweeper - background task releasing delivered escrows

use crate::escrow::EscrowService;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub struct AutoReleaseSweeper {
    shutdown_tx: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl AutoReleaseSweeper {
    /// Spawn the sweep loop. The first pass runs immediately.
    pub fn start(escrow: Arc<EscrowService>, interval: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            run_sweep_loop(escrow, interval, shutdown_rx).await;
        });

        tracing::info!(interval_ms = interval.as_millis() as u64, "auto-release sweeper started");
        Self {
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop the loop and wait for an in-flight pass to finish
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        if let Some(task) = self.task.take() {
            let _ = tokio::time::timeout(Duration::from_secs(10), task).await;
        }
        tracing::info!("auto-release sweeper stopped");
    }
}

async fn run_sweep_loop(
    escrow: Arc<EscrowService>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match escrow.sweep_auto_release().await {
                    Ok(released) if !released.is_empty() => {
                        tracing::info!(count = released.len(), "auto-release sweep released escrows");
                    }
                    Ok(_) => tracing::debug!("auto-release sweep found nothing due"),
                    Err(e) => tracing::warn!(error = %e, "auto-release sweep failed"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
