use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Health status of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    #[default]
    Unknown,
    Online,
    Degraded,
    Offline,
}

impl DeviceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceStatus::Unknown => "unknown",
            DeviceStatus::Online => "online",
            DeviceStatus::Degraded => "degraded",
            DeviceStatus::Offline => "offline",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(DeviceStatus::Unknown),
            "online" => Ok(DeviceStatus::Online),
            "degraded" => Ok(DeviceStatus::Degraded),
            "offline" => Ok(DeviceStatus::Offline),
            other => Err(anyhow!("unknown device status: {other}")),
        }
    }
}

/// Which probes a device is checked with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PingType {
    #[default]
    Icmp,
    Arp,
    Both,
}

impl PingType {
    pub fn as_str(self) -> &'static str {
        match self {
            PingType::Icmp => "icmp",
            PingType::Arp => "arp",
            PingType::Both => "both",
        }
    }

    pub fn uses_icmp(self) -> bool {
        matches!(self, PingType::Icmp | PingType::Both)
    }

    pub fn uses_arp(self) -> bool {
        matches!(self, PingType::Arp | PingType::Both)
    }
}

impl fmt::Display for PingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PingType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "icmp" => Ok(PingType::Icmp),
            "arp" => Ok(PingType::Arp),
            "both" => Ok(PingType::Both),
            other => Err(anyhow!("unknown ping type: {other}")),
        }
    }
}

/// Kind of a single probe. A device of type `both` produces one of each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    Icmp,
    Arp,
}

impl ProbeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProbeKind::Icmp => "icmp",
            ProbeKind::Arp => "arp",
        }
    }
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProbeKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "icmp" => Ok(ProbeKind::Icmp),
            "arp" => Ok(ProbeKind::Arp),
            other => Err(anyhow!("unknown probe kind: {other}")),
        }
    }
}

/// Outcome of one probe as reported by a ping provider
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Probe {
    /// Round-trip time; `None` when the packet was lost
    pub latency_ms: Option<f64>,
}

impl Probe {
    pub fn reply(latency_ms: f64) -> Self {
        Self { latency_ms: Some(latency_ms) }
    }

    pub fn lost() -> Self {
        Self { latency_ms: None }
    }

    pub fn is_lost(&self) -> bool {
        self.latency_ms.is_none()
    }
}

/// Result of an ARP probe. `Unavailable` means the host lacks the capability
/// to send ARP requests at all, which is different from "probed and lost".
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ArpOutcome {
    Unavailable,
    Probed(Probe),
}

/// Result of a probe, tagged for storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    /// Device that was probed
    pub device_id: i64,

    /// When the probe completed
    pub timestamp: DateTime<Utc>,

    pub ping_type: ProbeKind,

    /// Round-trip time in milliseconds, absent when lost
    pub latency_ms: Option<f64>,

    pub packet_lost: bool,
}

impl ProbeResult {
    /// Tag a provider outcome with its device and completion time
    pub fn new(device_id: i64, ping_type: ProbeKind, probe: Probe, timestamp: DateTime<Utc>) -> Self {
        Self {
            device_id,
            timestamp,
            ping_type,
            latency_ms: probe.latency_ms,
            packet_lost: probe.is_lost(),
        }
    }

    pub fn succeeded(&self) -> bool {
        !self.packet_lost
    }
}
