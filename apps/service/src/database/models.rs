use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::DeviceDefaults;
use crate::monitoring::types::{DeviceStatus, PingType};

/// Device model - a network-attached host to probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: i64,
    pub name: String,
    pub ip_address: Option<String>,
    pub ping_type: PingType,
    pub interval_seconds: f64,
    pub packet_size: u16,
    pub retention_days: u32,
    pub monitoring_enabled: bool,
    pub status: DeviceStatus,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Device {
    /// Label used in notification messages, e.g. `router (10.0.0.1)`
    pub fn label(&self) -> String {
        format!("{} ({})", self.name, self.ip_address.as_deref().unwrap_or("no address"))
    }
}

/// Fields supplied when creating a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewDevice {
    pub name: String,
    pub ip_address: Option<String>,
    pub ping_type: PingType,
    pub interval_seconds: f64,
    pub packet_size: u16,
    pub retention_days: u32,
    pub monitoring_enabled: bool,
}

impl NewDevice {
    /// Create a new device description using the configured defaults
    pub fn new(name: impl Into<String>, ip_address: impl Into<String>, defaults: &DeviceDefaults) -> Self {
        Self {
            name: name.into(),
            ip_address: Some(ip_address.into()),
            ping_type: PingType::Icmp,
            interval_seconds: defaults.interval_seconds,
            packet_size: defaults.packet_size,
            retention_days: defaults.retention_days,
            monitoring_enabled: true,
        }
    }
}

/// The minimal view of an enabled device the watchdog reconciles against
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnabledDevice {
    pub id: i64,
    pub interval_seconds: f64,
}

/// Kinds of notification raised on status transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    DeviceDown,
    DeviceRecovered,
    HighPacketLoss,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationKind::DeviceDown => "device_down",
            NotificationKind::DeviceRecovered => "device_recovered",
            NotificationKind::HighPacketLoss => "high_packet_loss",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "device_down" => Ok(NotificationKind::DeviceDown),
            "device_recovered" => Ok(NotificationKind::DeviceRecovered),
            "high_packet_loss" => Ok(NotificationKind::HighPacketLoss),
            other => Err(anyhow!("unknown notification type: {other}")),
        }
    }
}

/// A notification about to be written
#[derive(Debug, Clone, PartialEq)]
pub struct NewNotification {
    pub device_id: i64,
    pub kind: NotificationKind,
    pub message: String,
}

/// Notification model - a persisted status-change event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: i64,
    pub device_id: i64,
    pub kind: NotificationKind,
    pub message: String,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

/// Everything one status evaluation wants persisted, written in one transaction
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    pub device_id: i64,
    pub status: Option<DeviceStatus>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub notification: Option<NewNotification>,
}

impl StatusChange {
    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.last_seen_at.is_none() && self.notification.is_none()
    }
}

/// `(count, count_lost)` over a trailing window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LossWindow {
    pub total: u64,
    pub lost: u64,
}

impl LossWindow {
    /// Percentage of lost probes; an empty window counts as no loss
    pub fn loss_pct(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.lost as f64 / self.total as f64 * 100.0
    }
}

/// Convert a timestamp to the unix-millisecond form stored in the database
pub fn to_millis(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

/// Convert stored unix milliseconds back to a timestamp
pub fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}
