//! Background health scanner.
//!
//! A single periodic task demotes nodes whose heartbeats have aged past
//! the configured thresholds (healthy → stale → dead). Promotions back to
//! healthy happen on heartbeat reception, never here, so a dead node with
//! no intervening heartbeat stays dead.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::manager::NodeManager;

/// Heartbeat-age thresholds and the scan cadence.
///
/// `stale_threshold` must be strictly below `dead_threshold`; the manager
/// rejects a config that is not.
#[derive(Debug, Clone, Copy)]
pub struct HealthConfig {
    pub stale_threshold: Duration,
    pub dead_threshold: Duration,
    pub scan_interval: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            stale_threshold: Duration::from_secs(90),
            dead_threshold: Duration::from_secs(600),
            scan_interval: Duration::from_secs(60),
        }
    }
}

/// Handle to the spawned scanner task.
///
/// Pausing is a test hook: while paused the task keeps ticking but skips
/// the sweep, counting each skipped tick.
pub struct HealthScannerHandle {
    task: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
    paused: Arc<AtomicBool>,
    skipped_checks: Arc<AtomicU64>,
}

impl HealthScannerHandle {
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn skipped_checks(&self) -> u64 {
        self.skipped_checks.load(Ordering::SeqCst)
    }

    /// Signal shutdown and wait for the task to finish.
    pub async fn stop(self) -> anyhow::Result<()> {
        let _ = self.shutdown.send(true);
        match tokio::time::timeout(Duration::from_secs(5), self.task).await {
            Ok(result) => {
                result.map_err(|err| anyhow::anyhow!("health scanner task join failed: {err}"))
            }
            Err(_) => anyhow::bail!("timed out waiting for the health scanner to stop"),
        }
    }
}

pub(crate) fn spawn(manager: Arc<NodeManager>) -> HealthScannerHandle {
    let interval = manager.config().health.scan_interval;
    let paused = Arc::new(AtomicBool::new(false));
    let skipped_checks = Arc::new(AtomicU64::new(0));
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let task_paused = Arc::clone(&paused);
    let task_skipped = Arc::clone(&skipped_checks);
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
            if task_paused.load(Ordering::SeqCst) {
                task_skipped.fetch_add(1, Ordering::SeqCst);
                continue;
            }
            manager.run_health_check();
        }
        tracing::info!("health scanner stopped");
    });

    HealthScannerHandle {
        task,
        shutdown: shutdown_tx,
        paused,
        skipped_checks,
    }
}
