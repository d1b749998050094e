use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::buffer::WriteBuffer;
use super::executor::ProbeExecutor;
use super::status::{Evaluation, Streak, Thresholds, evaluate, needs_window_loss};
use super::types::ProbeResult;
use crate::config::MonitorSettings;
use crate::database::Database;
use crate::database::models::{Device, NewNotification, StatusChange};

/// Retry delay added per consecutive error
const BACKOFF_STEP: Duration = Duration::from_secs(5);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Shortest and longest cadence a loop will poll at, whatever the device row says
const MIN_INTERVAL_SECONDS: f64 = 0.1;
const MAX_INTERVAL_SECONDS: f64 = 86_400.0;

pub fn backoff_for(error_count: u32) -> Duration {
    BACKOFF_STEP.saturating_mul(error_count).min(MAX_BACKOFF)
}

/// Clamp a configured number of seconds into `[min, max]`; NaN maps to `min`
pub fn bounded_seconds(seconds: f64, min: f64, max: f64) -> f64 {
    if seconds.is_nan() {
        return min;
    }
    seconds.clamp(min, max)
}

/// [`bounded_seconds`] as a `Duration`, for timers fed from config or storage
pub fn bounded_duration(seconds: f64, min: f64, max: f64) -> Duration {
    Duration::try_from_secs_f64(bounded_seconds(seconds, min, max)).unwrap_or_default()
}

#[derive(Debug)]
struct Runtime {
    streak: Streak,
    last_ping: Option<DateTime<Utc>>,
    last_activity: Instant,
    error_count: u32,
    backoff: Duration,
}

/// In-memory runtime state of one device loop.
///
/// Created with the loop and dropped with it; nothing here is persisted.
#[derive(Debug)]
pub struct LoopState {
    inner: Mutex<Runtime>,
}

/// Point-in-time copy of a [`LoopState`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopSnapshot {
    pub streak: Streak,
    pub last_ping: Option<DateTime<Utc>>,
    pub last_activity: Instant,
    pub error_count: u32,
    pub backoff: Duration,
}

impl Default for LoopState {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopState {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Runtime {
                streak: Streak::default(),
                last_ping: None,
                last_activity: Instant::now(),
                error_count: 0,
                backoff: Duration::ZERO,
            }),
        }
    }

    pub fn snapshot(&self) -> LoopSnapshot {
        let inner = self.inner.lock();
        LoopSnapshot {
            streak: inner.streak,
            last_ping: inner.last_ping,
            last_activity: inner.last_activity,
            error_count: inner.error_count,
            backoff: inner.backoff,
        }
    }

    /// How long ago the loop last showed progress
    pub fn idle_for(&self) -> Duration {
        self.inner.lock().last_activity.elapsed()
    }

    /// Backoff the loop is currently sleeping out, zero when healthy
    pub fn backoff(&self) -> Duration {
        self.inner.lock().backoff
    }

    fn touch(&self, pinged_at: DateTime<Utc>) {
        let mut inner = self.inner.lock();
        inner.last_ping = Some(pinged_at);
        inner.last_activity = Instant::now();
    }

    fn record(&self, any_success: bool) -> Streak {
        let mut inner = self.inner.lock();
        inner.streak.record(any_success);
        inner.streak
    }

    fn record_error(&self) -> Duration {
        let mut inner = self.inner.lock();
        inner.error_count = inner.error_count.saturating_add(1);
        inner.backoff = backoff_for(inner.error_count);
        inner.last_activity = Instant::now();
        inner.backoff
    }

    /// A tick is starting: any backoff is over and the loop is active again
    fn begin_tick(&self) {
        let mut inner = self.inner.lock();
        inner.last_activity = Instant::now();
        inner.backoff = Duration::ZERO;
    }

    fn reset_errors(&self) {
        let mut inner = self.inner.lock();
        inner.error_count = 0;
        inner.backoff = Duration::ZERO;
    }
}

/// What the loop does after a tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TickOutcome {
    /// Sleep for the device's interval, then tick again
    Continue(Duration),
    /// The device is gone or no longer monitored
    Finished,
}

/// Monitoring scheduler - runs the per-device polling loops
pub struct MonitoringScheduler {
    database: Arc<dyn Database>,
    executor: ProbeExecutor,
    buffer: Arc<WriteBuffer>,
    thresholds: Thresholds,
    degraded_window: chrono::Duration,
}

impl MonitoringScheduler {
    /// Create a new monitoring scheduler
    pub fn new(
        database: Arc<dyn Database>,
        executor: ProbeExecutor,
        buffer: Arc<WriteBuffer>,
        settings: &MonitorSettings,
    ) -> Self {
        let window_seconds = i64::try_from(settings.degraded_window_seconds).unwrap_or(i64::MAX);
        Self {
            database,
            executor,
            buffer,
            thresholds: Thresholds::from(settings),
            degraded_window: chrono::Duration::seconds(window_seconds),
        }
    }

    /// Spawn the polling loop of one device
    pub fn schedule_device(
        self: &Arc<Self>,
        device_id: i64,
        state: Arc<LoopState>,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move { scheduler.run(device_id, state, token).await })
    }

    /// Poll `device_id` until cancelled or until the device is removed or
    /// disabled. Errors never end the loop; they back it off instead.
    pub async fn run(&self, device_id: i64, state: Arc<LoopState>, token: CancellationToken) {
        debug!("Monitor loop for device {} started", device_id);

        loop {
            state.begin_tick();
            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                outcome = self.tick(device_id, &state) => outcome,
            };

            let pause = match outcome {
                Ok(TickOutcome::Continue(interval)) => {
                    state.reset_errors();
                    interval
                }
                Ok(TickOutcome::Finished) => {
                    info!("Device {} was removed or disabled, monitor loop exiting", device_id);
                    return;
                }
                Err(e) => {
                    let backoff = state.record_error();
                    warn!(
                        "Monitor loop for device {} failed: {:#}; retrying in {}s",
                        device_id,
                        e,
                        backoff.as_secs()
                    );
                    backoff
                }
            };

            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = sleep(pause) => {}
            }
        }

        debug!("Monitor loop for device {} cancelled", device_id);
    }

    /// One poll of one device: reload it, probe it, buffer the results and
    /// update its status.
    pub async fn tick(&self, device_id: i64, state: &LoopState) -> Result<TickOutcome> {
        let device = match self.database.get_device(device_id).await? {
            Some(device) if device.monitoring_enabled => device,
            _ => return Ok(TickOutcome::Finished),
        };
        let interval_seconds = bounded_seconds(device.interval_seconds, MIN_INTERVAL_SECONDS, MAX_INTERVAL_SECONDS);
        let interval = bounded_duration(interval_seconds, MIN_INTERVAL_SECONDS, MAX_INTERVAL_SECONDS);

        let results = match device.ip_address.as_deref() {
            Some(ip) => {
                self.executor.execute(device.id, ip, device.ping_type, device.packet_size).await
            }
            None => {
                debug!("Device {} has no IP address, nothing to probe", device.id);
                Vec::new()
            }
        };

        let now = Utc::now();
        let produced = !results.is_empty();
        let any_success = results.iter().any(ProbeResult::succeeded);
        self.buffer.extend(results);
        state.touch(now);

        if produced {
            self.update_status(&device, interval_seconds, any_success, now, state).await?;
        }

        Ok(TickOutcome::Continue(interval))
    }

    async fn update_status(
        &self,
        device: &Device,
        interval_seconds: f64,
        any_success: bool,
        now: DateTime<Utc>,
        state: &LoopState,
    ) -> Result<()> {
        let streak = state.record(any_success);

        let window_loss_pct = if needs_window_loss(device.status, any_success) {
            let window = self.database.loss_since(device.id, now - self.degraded_window).await?;
            Some(window.loss_pct())
        } else {
            None
        };

        let eval = Evaluation {
            current: device.status,
            any_success,
            streak,
            interval_seconds,
            window_loss_pct,
        };
        let transition = evaluate(&eval, &self.thresholds);

        if let Some(transition) = transition {
            info!(
                device_id = device.id,
                from = %device.status,
                to = %transition.to,
                "Device {} changed status",
                device.label()
            );
        }

        let change = StatusChange {
            device_id: device.id,
            status: transition.map(|t| t.to),
            last_seen_at: any_success.then_some(now),
            notification: transition.and_then(|t| t.notification).map(|intent| NewNotification {
                device_id: device.id,
                kind: intent.kind(),
                message: intent.message(&device.label()),
            }),
        };

        if !change.is_empty() {
            self.database.commit_status(&change).await?;
        }
        Ok(())
    }
}
