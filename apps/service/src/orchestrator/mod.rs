/// Orchestrator module - owns the lifecycle of the monitoring engine
///
/// The [`MonitorRegistry`] is the single owner of:
/// - One polling loop per monitored device, with its runtime state
/// - The shared write buffer and the task that flushes it
/// - The watchdog that restarts crashed or stuck loops
/// - The retention cleanup task
///
/// It is constructed explicitly and handed to whatever exposes the control
/// surface; cloning it yields another handle to the same registry.
pub mod retention;
pub mod watchdog;

#[cfg(test)]
mod tests;

pub use retention::RetentionCleanup;
pub use watchdog::ReconcileReport;

use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, MonitorSettings, RetentionSettings};
use crate::database::Database;
use crate::monitoring::scheduler::bounded_duration;
use crate::monitoring::{LoopSnapshot, LoopState, MonitoringScheduler, PingProvider, ProbeExecutor, WriteBuffer};

/// Bounds of the flush task period
const MIN_FLUSH_SECONDS: f64 = 0.01;
const MAX_FLUSH_SECONDS: f64 = 3600.0;

/// A running device loop
pub(crate) struct LoopHandle {
    token: CancellationToken,
    handle: JoinHandle<()>,
    state: Arc<LoopState>,
}

impl LoopHandle {
    fn is_alive(&self) -> bool {
        !self.handle.is_finished()
    }
}

/// Watchdog, flush and retention tasks of a started registry
struct Background {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

struct Inner {
    database: Arc<dyn Database>,
    scheduler: Arc<MonitoringScheduler>,
    buffer: Arc<WriteBuffer>,
    settings: MonitorSettings,
    retention: RetentionSettings,
    /// Held across loop shutdowns so a device never has two loops at once
    loops: Mutex<HashMap<i64, LoopHandle>>,
    background: Mutex<Option<Background>>,
}

/// Process-wide owner of every monitor loop and background task
#[derive(Clone)]
pub struct MonitorRegistry {
    inner: Arc<Inner>,
}

impl MonitorRegistry {
    /// Create a registry; nothing runs until [`MonitorRegistry::start`]
    pub fn new(database: Arc<dyn Database>, provider: Arc<dyn PingProvider>, config: &Config) -> Self {
        let buffer = Arc::new(WriteBuffer::new());
        let scheduler = Arc::new(MonitoringScheduler::new(
            database.clone(),
            ProbeExecutor::new(provider),
            buffer.clone(),
            &config.monitoring,
        ));

        Self {
            inner: Arc::new(Inner {
                database,
                scheduler,
                buffer,
                settings: config.monitoring.clone(),
                retention: config.retention.clone(),
                loops: Mutex::new(HashMap::new()),
                background: Mutex::new(None),
            }),
        }
    }

    /// Start loops for every enabled device plus the watchdog, flush and
    /// retention tasks. Calling it on a started registry does nothing.
    pub async fn start(&self) -> Result<()> {
        let mut background = self.inner.background.lock().await;
        if background.is_some() {
            debug!("Monitor registry already started");
            return Ok(());
        }

        info!("Loading monitored devices from database...");
        let devices = self.inner.database.get_enabled_devices().await?;
        info!("Found {} monitored devices", devices.len());

        {
            let mut loops = self.inner.loops.lock().await;
            for device in &devices {
                self.spawn_loop(&mut loops, device.id);
            }
        }

        let token = CancellationToken::new();
        let handles = vec![
            self.spawn_flush_task(token.child_token()),
            watchdog::spawn(self.clone(), token.child_token()),
            RetentionCleanup::new(self.inner.database.clone(), &self.inner.retention)
                .start_periodic_cleanup(token.child_token()),
        ];
        *background = Some(Background { token, handles });

        info!("Monitor registry started");
        Ok(())
    }

    /// Stop the watchdog, the flush task and every loop, then flush the
    /// buffer one last time. Results buffered before this call are persisted
    /// when it returns `Ok`.
    pub async fn stop(&self) -> Result<()> {
        info!("Stopping monitor registry...");

        if let Some(background) = self.inner.background.lock().await.take() {
            background.token.cancel();
            for handle in background.handles {
                if let Err(e) = handle.await {
                    warn!("Background task ended abnormally: {}", e);
                }
            }
        }

        {
            let mut loops = self.inner.loops.lock().await;
            let handles: Vec<LoopHandle> = loops.drain().map(|(_, handle)| handle).collect();
            for handle in &handles {
                handle.token.cancel();
            }
            let grace = self.grace();
            futures::future::join_all(handles.into_iter().map(|h| shutdown_loop(h, grace))).await;
        }

        let flushed = self.inner.buffer.flush(self.inner.database.as_ref()).await?;
        info!("Monitor registry stopped, {} buffered results flushed", flushed);
        Ok(())
    }

    /// Start monitoring one device. Returns `false` when a live loop already
    /// exists for it.
    pub async fn start_device(&self, device_id: i64) -> bool {
        let mut loops = self.inner.loops.lock().await;
        if loops.get(&device_id).is_some_and(LoopHandle::is_alive) {
            return false;
        }
        self.spawn_loop(&mut loops, device_id);
        true
    }

    /// Stop monitoring one device, waiting for its loop to finish before the
    /// runtime state is dropped. Returns `false` when it was not monitored.
    pub async fn stop_device(&self, device_id: i64) -> bool {
        let mut loops = self.inner.loops.lock().await;
        match loops.remove(&device_id) {
            Some(handle) => {
                shutdown_loop(handle, self.grace()).await;
                info!("Stopped monitoring device {}", device_id);
                true
            }
            None => false,
        }
    }

    /// Stop then start a device's loop, resetting its runtime state
    pub async fn restart_device(&self, device_id: i64) {
        let mut loops = self.inner.loops.lock().await;
        if let Some(handle) = loops.remove(&device_id) {
            shutdown_loop(handle, self.grace()).await;
        }
        self.spawn_loop(&mut loops, device_id);
        info!("Restarted monitoring of device {}", device_id);
    }

    pub async fn is_monitoring(&self, device_id: i64) -> bool {
        self.inner.loops.lock().await.get(&device_id).is_some_and(LoopHandle::is_alive)
    }

    /// Runtime counters of a device's loop, if it has one
    pub async fn loop_snapshot(&self, device_id: i64) -> Option<LoopSnapshot> {
        self.inner.loops.lock().await.get(&device_id).map(|h| h.state.snapshot())
    }

    /// Number of probe results waiting for the next flush
    pub fn pending_results(&self) -> usize {
        self.inner.buffer.len()
    }

    fn grace(&self) -> Duration {
        Duration::from_secs(self.inner.settings.stop_grace_seconds)
    }

    fn spawn_loop(&self, loops: &mut HashMap<i64, LoopHandle>, device_id: i64) {
        let token = CancellationToken::new();
        let state = Arc::new(LoopState::new());
        let handle = self.inner.scheduler.schedule_device(device_id, state.clone(), token.clone());
        debug!("Spawned monitor loop for device {}", device_id);
        loops.insert(device_id, LoopHandle { token, handle, state });
    }

    fn spawn_flush_task(&self, token: CancellationToken) -> JoinHandle<()> {
        let database = self.inner.database.clone();
        let buffer = self.inner.buffer.clone();
        let period = bounded_duration(self.inner.settings.batch_write_interval, MIN_FLUSH_SECONDS, MAX_FLUSH_SECONDS);

        tokio::spawn(async move {
            let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = timer.tick() => {}
                }

                // Errors are logged by the buffer, which keeps the batch for the next round
                let _ = buffer.flush(database.as_ref()).await;
            }

            debug!("Flush task stopped");
        })
    }
}

/// Cancel a loop and wait for it to end, aborting it once `grace` runs out
async fn shutdown_loop(loop_handle: LoopHandle, grace: Duration) {
    let LoopHandle { token, mut handle, .. } = loop_handle;
    token.cancel();

    match timeout(grace, &mut handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) if e.is_panic() => error!("Monitor loop panicked while stopping: {}", e),
        Ok(Err(_)) => {}
        Err(_) => {
            warn!("Monitor loop ignored cancellation for {:?}, aborting it", grace);
            handle.abort();
            let _ = handle.await;
        }
    }
}
