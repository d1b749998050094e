//! Supervisor reconciling the devices that should be monitored with the
//! loops that are actually alive.

use anyhow::Result;
use std::any::Any;
use std::collections::HashSet;
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{MonitorRegistry, shutdown_loop};

/// Lower bound of the staleness threshold
const MIN_STALE_AFTER: Duration = Duration::from_secs(30);

/// How long a loop may go without activity before it is presumed stuck
pub fn stale_threshold(interval_seconds: f64) -> Duration {
    let scaled = Duration::try_from_secs_f64(interval_seconds * 10.0).unwrap_or(Duration::MAX);
    scaled.max(MIN_STALE_AFTER)
}

/// What one watchdog cycle changed
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Enabled devices that had no loop
    pub started: Vec<i64>,
    /// Loops that had crashed or exited and were started again
    pub restarted: Vec<i64>,
    /// Stuck loops that were cancelled and replaced
    pub replaced: Vec<i64>,
    /// Loops of devices that are gone or disabled
    pub retired: Vec<i64>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.started.is_empty() && self.restarted.is_empty() && self.replaced.is_empty() && self.retired.is_empty()
    }
}

impl MonitorRegistry {
    /// Run one watchdog cycle
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let enabled = self.inner.database.get_enabled_devices().await?;
        let enabled_ids: HashSet<i64> = enabled.iter().map(|d| d.id).collect();
        let grace = self.grace();
        let mut report = ReconcileReport::default();

        let mut loops = self.inner.loops.lock().await;

        let retired: Vec<i64> = loops.keys().filter(|id| !enabled_ids.contains(*id)).copied().collect();
        for device_id in retired {
            if let Some(handle) = loops.remove(&device_id) {
                shutdown_loop(handle, grace).await;
                info!("Watchdog: device {} is no longer monitored, loop retired", device_id);
                report.retired.push(device_id);
            }
        }

        for device in enabled {
            let Some(current) = loops.get(&device.id) else {
                self.spawn_loop(&mut loops, device.id);
                info!("Watchdog: started missing loop for device {}", device.id);
                report.started.push(device.id);
                continue;
            };

            if !current.is_alive() {
                if let Some(dead) = loops.remove(&device.id) {
                    log_termination(device.id, dead.handle.await);
                }
                self.spawn_loop(&mut loops, device.id);
                report.restarted.push(device.id);
                continue;
            }

            // A loop sleeping out an error backoff is not stuck
            let threshold = stale_threshold(device.interval_seconds).saturating_add(current.state.backoff());
            let idle = current.state.idle_for();
            if idle > threshold {
                warn!(
                    "Watchdog: loop for device {} idle for {}s (limit {}s), replacing it",
                    device.id,
                    idle.as_secs(),
                    threshold.as_secs()
                );
                if let Some(stuck) = loops.remove(&device.id) {
                    shutdown_loop(stuck, grace).await;
                }
                self.spawn_loop(&mut loops, device.id);
                report.replaced.push(device.id);
            }
        }

        if !report.is_empty() {
            debug!("Watchdog cycle: {:?}", report);
        }
        Ok(report)
    }
}

fn log_termination(device_id: i64, outcome: Result<(), JoinError>) {
    match outcome {
        Ok(()) => info!("Watchdog: loop for device {} had exited, restarting it", device_id),
        Err(e) if e.is_panic() => error!(
            "Watchdog: loop for device {} crashed: {}; restarting it",
            device_id,
            panic_message(e.into_panic())
        ),
        Err(_) => debug!("Watchdog: loop for device {} was cancelled, restarting it", device_id),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(message) => (*message).to_string(),
            Err(_) => "unknown panic".to_string(),
        },
    }
}

/// Spawn the periodic watchdog; its first cycle runs one period after start
pub(super) fn spawn(registry: MonitorRegistry, token: CancellationToken) -> JoinHandle<()> {
    let period = Duration::from_secs(registry.inner.settings.watchdog_interval_seconds.clamp(1, 86_400));

    tokio::spawn(async move {
        let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = timer.tick() => {}
            }

            if let Err(e) = registry.reconcile().await {
                warn!("Watchdog cycle failed: {:#}", e);
            }
        }

        debug!("Watchdog stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_threshold() {
        assert_eq!(stale_threshold(1.0), Duration::from_secs(30));
        assert_eq!(stale_threshold(3.0), Duration::from_secs(30));
        assert_eq!(stale_threshold(10.0), Duration::from_secs(100));
    }

    #[test]
    fn test_panic_message_payloads() {
        assert_eq!(panic_message(Box::new("static")), "static");
        assert_eq!(panic_message(Box::new(String::from("owned"))), "owned");
        assert_eq!(panic_message(Box::new(42)), "unknown panic");
    }
}
