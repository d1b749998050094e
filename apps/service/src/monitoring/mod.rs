/// Monitoring engine module - probes devices and tracks their status
///
/// This module is responsible for:
/// - Sending ICMP and ARP probes
/// - Running one polling loop per device
/// - Buffering probe results for batched writes
/// - Turning probe outcomes into device status changes
pub mod buffer;
pub mod checker;
pub mod executor;
pub mod scheduler;
pub mod status;
pub mod types;

pub use buffer::WriteBuffer;
pub use checker::{NetworkPingProvider, PingProvider};
pub use executor::ProbeExecutor;
pub use scheduler::{LoopSnapshot, LoopState, MonitoringScheduler};
pub use types::{DeviceStatus, PingType, ProbeResult};
