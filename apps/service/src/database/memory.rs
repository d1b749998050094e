//! In-memory `Database` used by engine tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::models::{Device, EnabledDevice, LossWindow, NewDevice, Notification, StatusChange};
use super::repository::Database;
use crate::monitoring::types::{DeviceStatus, ProbeResult};

#[derive(Default)]
pub(crate) struct MemoryDatabase {
    devices: Mutex<BTreeMap<i64, Device>>,
    results: Mutex<Vec<ProbeResult>>,
    notifications: Mutex<Vec<Notification>>,
    /// When set, `loss_since` reports this instead of aggregating stored results.
    window_override: Mutex<Option<LossWindow>>,
    next_id: AtomicUsize,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    device_reads: AtomicUsize,
}

impl MemoryDatabase {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_device(&self, name: &str, ip: &str, interval_seconds: f64) -> i64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) as i64 + 1;
        let now = Utc::now();
        self.devices.lock().insert(
            id,
            Device {
                id,
                name: name.into(),
                ip_address: Some(ip.into()),
                ping_type: Default::default(),
                interval_seconds,
                packet_size: 64,
                retention_days: 14,
                monitoring_enabled: true,
                status: DeviceStatus::Unknown,
                last_seen_at: None,
                created_at: now,
                updated_at: now,
            },
        );
        id
    }

    pub(crate) fn update_device(&self, id: i64, update: impl FnOnce(&mut Device)) {
        if let Some(device) = self.devices.lock().get_mut(&id) {
            update(device);
        }
    }

    pub(crate) fn remove_device(&self, id: i64) {
        self.devices.lock().remove(&id);
    }

    pub(crate) fn device(&self, id: i64) -> Option<Device> {
        self.devices.lock().get(&id).cloned()
    }

    pub(crate) fn status(&self, id: i64) -> DeviceStatus {
        self.device(id).map(|d| d.status).unwrap_or_default()
    }

    pub(crate) fn stored_results(&self) -> Vec<ProbeResult> {
        self.results.lock().clone()
    }

    pub(crate) fn notifications(&self) -> Vec<Notification> {
        self.notifications.lock().clone()
    }

    pub(crate) fn set_window(&self, window: Option<LossWindow>) {
        *self.window_override.lock() = window;
    }

    pub(crate) fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn device_reads(&self) -> usize {
        self.device_reads.load(Ordering::SeqCst)
    }

    fn check_reads(&self) -> Result<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            bail!("database is unavailable");
        }
        Ok(())
    }

    fn check_writes(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("database is read-only");
        }
        Ok(())
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn get_device(&self, id: i64) -> Result<Option<Device>> {
        self.device_reads.fetch_add(1, Ordering::SeqCst);
        self.check_reads()?;
        Ok(self.device(id))
    }

    async fn get_enabled_devices(&self) -> Result<Vec<EnabledDevice>> {
        self.check_reads()?;
        Ok(self
            .devices
            .lock()
            .values()
            .filter(|d| d.monitoring_enabled)
            .map(|d| EnabledDevice { id: d.id, interval_seconds: d.interval_seconds })
            .collect())
    }

    async fn commit_status(&self, change: &StatusChange) -> Result<()> {
        self.check_writes()?;
        if let Some(device) = self.devices.lock().get_mut(&change.device_id) {
            if let Some(status) = change.status {
                device.status = status;
            }
            if let Some(seen) = change.last_seen_at {
                device.last_seen_at = Some(seen);
            }
        }
        if let Some(notification) = &change.notification {
            let mut notifications = self.notifications.lock();
            let id = notifications.len() as i64 + 1;
            notifications.push(Notification {
                id,
                device_id: notification.device_id,
                kind: notification.kind,
                message: notification.message.clone(),
                is_read: false,
                created_at: Utc::now(),
            });
        }
        Ok(())
    }

    async fn insert_probe_results(&self, results: &[ProbeResult]) -> Result<usize> {
        self.check_writes()?;
        self.results.lock().extend_from_slice(results);
        Ok(results.len())
    }

    async fn loss_since(&self, device_id: i64, since: DateTime<Utc>) -> Result<LossWindow> {
        self.check_reads()?;
        if let Some(window) = *self.window_override.lock() {
            return Ok(window);
        }
        let results = self.results.lock();
        let recent = results.iter().filter(|r| r.device_id == device_id && r.timestamp >= since);
        let (total, lost) =
            recent.fold((0, 0), |(total, lost), r| (total + 1, lost + u64::from(r.packet_lost)));
        Ok(LossWindow { total, lost })
    }

    async fn delete_expired_results(&self, now: DateTime<Utc>) -> Result<u64> {
        self.check_writes()?;
        let devices = self.devices.lock();
        let mut results = self.results.lock();
        let before = results.len();
        results.retain(|r| match devices.get(&r.device_id) {
            Some(d) => r.timestamp >= now - chrono::Duration::days(i64::from(d.retention_days)),
            None => true,
        });
        Ok((before - results.len()) as u64)
    }

    async fn insert_device(&self, device: &NewDevice) -> Result<i64> {
        self.check_writes()?;
        let ip = device.ip_address.clone().unwrap_or_default();
        let id = self.add_device(&device.name, &ip, device.interval_seconds);
        self.update_device(id, |d| {
            d.ip_address = device.ip_address.clone();
            d.ping_type = device.ping_type;
            d.packet_size = device.packet_size;
            d.retention_days = device.retention_days;
            d.monitoring_enabled = device.monitoring_enabled;
        });
        Ok(id)
    }

    async fn delete_device(&self, id: i64) -> Result<()> {
        self.check_writes()?;
        self.remove_device(id);
        Ok(())
    }

    async fn set_monitoring_enabled(&self, id: i64, enabled: bool) -> Result<()> {
        self.check_writes()?;
        self.update_device(id, |d| d.monitoring_enabled = enabled);
        Ok(())
    }

    async fn recent_notifications(&self, device_id: Option<i64>, limit: usize) -> Result<Vec<Notification>> {
        self.check_reads()?;
        Ok(self
            .notifications
            .lock()
            .iter()
            .rev()
            .filter(|n| device_id.is_none_or(|id| n.device_id == id))
            .take(limit)
            .cloned()
            .collect())
    }
}
