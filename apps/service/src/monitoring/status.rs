//! Hysteresis state machine turning per-tick probe outcomes into device status.
//!
//! Evaluation is pure: the caller owns the [`Streak`] counters, updates them
//! with [`Streak::record`] and then asks [`evaluate`] for a transition. The only
//! storage-backed input, the trailing-window loss used to leave `degraded`, is
//! fetched by the caller when [`needs_window_loss`] says so.

use crate::config::MonitorSettings;
use crate::database::models::NotificationKind;

use super::types::DeviceStatus;

/// Consecutive success/fail counters of one device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Streak {
    pub successes: u32,
    pub failures: u32,
}

impl Streak {
    /// Count a tick; any success zeroes the fail counter and vice versa
    pub fn record(&mut self, any_success: bool) {
        if any_success {
            self.successes = self.successes.saturating_add(1);
            self.failures = 0;
        } else {
            self.failures = self.failures.saturating_add(1);
            self.successes = 0;
        }
    }

    /// Estimated continuous downtime in seconds
    pub fn fail_duration(&self, interval_seconds: f64) -> f64 {
        f64::from(self.failures) * interval_seconds
    }

    /// Loss percentage of the current streak
    pub fn loss_pct(&self) -> f64 {
        let total = self.failures + self.successes;
        f64::from(self.failures) / f64::from(total.max(1)) * 100.0
    }
}

/// Thresholds the state machine compares against
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub offline_loss_seconds: f64,
    pub recovery_count: u32,
    pub degraded_loss_pct: f64,
}

impl From<&MonitorSettings> for Thresholds {
    fn from(settings: &MonitorSettings) -> Self {
        Self {
            offline_loss_seconds: settings.offline_loss_seconds as f64,
            recovery_count: settings.recovery_count,
            degraded_loss_pct: settings.degraded_loss_pct,
        }
    }
}

/// Notification to raise alongside a transition
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NotificationIntent {
    DeviceDown,
    DeviceRecovered,
    HighPacketLoss { loss_pct: f64 },
}

impl NotificationIntent {
    pub fn kind(&self) -> NotificationKind {
        match self {
            NotificationIntent::DeviceDown => NotificationKind::DeviceDown,
            NotificationIntent::DeviceRecovered => NotificationKind::DeviceRecovered,
            NotificationIntent::HighPacketLoss { .. } => NotificationKind::HighPacketLoss,
        }
    }

    /// Message text for a device labelled `label`
    pub fn message(&self, label: &str) -> String {
        match self {
            NotificationIntent::DeviceDown => format!("{label} is offline"),
            NotificationIntent::DeviceRecovered => format!("{label} is back online"),
            NotificationIntent::HighPacketLoss { loss_pct } => {
                format!("{label} has {loss_pct:.1}% packet loss")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transition {
    pub to: DeviceStatus,
    pub notification: Option<NotificationIntent>,
}

/// Inputs of one evaluation, taken after the streak has been updated
#[derive(Debug, Clone, Copy)]
pub struct Evaluation {
    pub current: DeviceStatus,
    pub any_success: bool,
    pub streak: Streak,
    pub interval_seconds: f64,
    /// Persisted loss % over the degraded window, when [`needs_window_loss`]
    pub window_loss_pct: Option<f64>,
}

/// Whether evaluating this tick requires the trailing-window loss aggregate
pub fn needs_window_loss(current: DeviceStatus, any_success: bool) -> bool {
    current == DeviceStatus::Degraded && any_success
}

/// Decide the next status. Rules are checked in order and the first match
/// wins; `None` means the status stays as it is.
pub fn evaluate(eval: &Evaluation, thresholds: &Thresholds) -> Option<Transition> {
    use DeviceStatus::{Degraded, Offline, Online, Unknown};

    let fail_duration = eval.streak.fail_duration(eval.interval_seconds);
    let offline_reached = !eval.any_success && fail_duration >= thresholds.offline_loss_seconds;

    let transition = |to, notification| Some(Transition { to, notification });

    match eval.current {
        Unknown if eval.any_success => transition(Online, None),
        Unknown if offline_reached => transition(Offline, Some(NotificationIntent::DeviceDown)),
        Offline if eval.streak.successes >= thresholds.recovery_count => {
            transition(Online, Some(NotificationIntent::DeviceRecovered))
        }
        Online if !eval.any_success && !offline_reached => transition(
            Degraded,
            Some(NotificationIntent::HighPacketLoss { loss_pct: eval.streak.loss_pct() }),
        ),
        Online | Degraded if offline_reached => {
            transition(Offline, Some(NotificationIntent::DeviceDown))
        }
        Degraded if eval.any_success => match eval.window_loss_pct {
            Some(loss) if loss < thresholds.degraded_loss_pct => transition(Online, None),
            _ => None,
        },
        _ => None,
    }
}
