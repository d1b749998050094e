use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Row, params};

use super::models::{
    Device, EnabledDevice, LossWindow, NewDevice, Notification, StatusChange, from_millis, to_millis,
};
use crate::monitoring::types::ProbeResult;
use crate::pool::{LibsqlManager, LibsqlPool};

const DEVICE_COLUMNS: &str = "id, name, ip_address, ping_type, interval_seconds, packet_size, retention_days, monitoring_enabled, status, last_seen_at, created_at, updated_at";

/// Database trait for abstracting database operations
///
/// Covers the device store, the probe-result store and the notification sink
/// the monitoring engine depends on, plus the calls a host API needs to
/// manage devices and read notifications.
#[async_trait]
pub trait Database: Send + Sync {
    /// Get a device by id, `None` once it has been deleted
    async fn get_device(&self, id: i64) -> Result<Option<Device>>;

    /// Get id and interval of every device with monitoring enabled
    async fn get_enabled_devices(&self) -> Result<Vec<EnabledDevice>>;

    /// Persist a status evaluation (status, last seen, notification) atomically
    async fn commit_status(&self, change: &StatusChange) -> Result<()>;

    /// Insert a batch of probe results in one transaction
    async fn insert_probe_results(&self, results: &[ProbeResult]) -> Result<usize>;

    /// Count total and lost probes for a device since `since`
    async fn loss_since(&self, device_id: i64, since: DateTime<Utc>) -> Result<LossWindow>;

    /// Delete probe results older than each device's retention period
    async fn delete_expired_results(&self, now: DateTime<Utc>) -> Result<u64>;

    /// Create a device
    async fn insert_device(&self, device: &NewDevice) -> Result<i64>;

    /// Delete a device; results and notifications go with it
    async fn delete_device(&self, id: i64) -> Result<()>;

    /// Enable or disable monitoring for a device
    async fn set_monitoring_enabled(&self, id: i64, enabled: bool) -> Result<()>;

    /// Most recent notifications, optionally for a single device
    async fn recent_notifications(&self, device_id: Option<i64>, limit: usize) -> Result<Vec<Notification>>;
}

/// LibSQL database implementation
pub struct DatabaseImpl {
    pool: LibsqlPool,
}

impl DatabaseImpl {
    /// Create a new database instance from a pool
    pub fn new_from_pool(pool: LibsqlPool) -> Self {
        Self { pool }
    }

    /// Get a connection from the pool
    async fn get_conn(&self) -> Result<deadpool::managed::Object<LibsqlManager>> {
        Ok(self.pool.get().await?)
    }

    fn device_from_row(row: &Row) -> Result<Device> {
        let ping_type: String = row.get(3)?;
        let status: String = row.get(8)?;

        Ok(Device {
            id: row.get(0)?,
            name: row.get(1)?,
            ip_address: row.get(2)?,
            ping_type: ping_type.parse()?,
            interval_seconds: row.get(4)?,
            packet_size: row.get::<i64>(5)?.clamp(0, i64::from(u16::MAX)) as u16,
            retention_days: row.get::<i64>(6)?.max(0) as u32,
            monitoring_enabled: row.get::<i64>(7)? != 0,
            status: status.parse()?,
            last_seen_at: row.get::<Option<i64>>(9)?.map(from_millis),
            created_at: from_millis(row.get(10)?),
            updated_at: from_millis(row.get(11)?),
        })
    }

    fn notification_from_row(row: &Row) -> Result<Notification> {
        let kind: String = row.get(2)?;

        Ok(Notification {
            id: row.get(0)?,
            device_id: row.get(1)?,
            kind: kind.parse()?,
            message: row.get(3)?,
            is_read: row.get::<i64>(4)? != 0,
            created_at: from_millis(row.get(5)?),
        })
    }
}

#[async_trait]
impl Database for DatabaseImpl {
    async fn get_device(&self, id: i64) -> Result<Option<Device>> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(&format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE id = ?"), params![id])
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(Self::device_from_row(&row)?)),
            None => Ok(None),
        }
    }

    async fn get_enabled_devices(&self) -> Result<Vec<EnabledDevice>> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query("SELECT id, interval_seconds FROM devices WHERE monitoring_enabled = 1", ())
            .await?;

        let mut devices = Vec::new();
        while let Some(row) = rows.next().await? {
            devices.push(EnabledDevice { id: row.get(0)?, interval_seconds: row.get(1)? });
        }

        Ok(devices)
    }

    async fn commit_status(&self, change: &StatusChange) -> Result<()> {
        if change.is_empty() {
            return Ok(());
        }

        let conn = self.get_conn().await?;
        let now = to_millis(Utc::now());
        let tx = conn.transaction().await?;

        if let Some(status) = change.status {
            tx.execute(
                "UPDATE devices SET status = ?, updated_at = ? WHERE id = ?",
                params![status.as_str(), now, change.device_id],
            )
            .await?;
        }

        if let Some(last_seen) = change.last_seen_at {
            tx.execute(
                "UPDATE devices SET last_seen_at = ? WHERE id = ?",
                params![to_millis(last_seen), change.device_id],
            )
            .await?;
        }

        if let Some(notification) = &change.notification {
            tx.execute(
                "INSERT INTO notifications (device_id, type, message, is_read, created_at) VALUES (?, ?, ?, 0, ?)",
                params![
                    notification.device_id,
                    notification.kind.as_str(),
                    notification.message.clone(),
                    now
                ],
            )
            .await?;
        }

        tx.commit().await.context("committing status change")?;
        Ok(())
    }

    async fn insert_probe_results(&self, results: &[ProbeResult]) -> Result<usize> {
        if results.is_empty() {
            return Ok(0);
        }

        let conn = self.get_conn().await?;
        let tx = conn.transaction().await?;

        // Results for devices deleted since the probe are dropped by the
        // foreign-key check, so insert only rows whose device still exists.
        for result in results {
            tx.execute(
                "INSERT INTO ping_results (device_id, timestamp, ping_type, latency_ms, packet_lost)
                 SELECT ?1, ?2, ?3, ?4, ?5 WHERE EXISTS (SELECT 1 FROM devices WHERE id = ?1)",
                params![
                    result.device_id,
                    to_millis(result.timestamp),
                    result.ping_type.as_str(),
                    result.latency_ms,
                    if result.packet_lost { 1 } else { 0 }
                ],
            )
            .await?;
        }

        tx.commit().await.context("committing probe results")?;
        Ok(results.len())
    }

    async fn loss_since(&self, device_id: i64, since: DateTime<Utc>) -> Result<LossWindow> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(
                "SELECT COUNT(*), COALESCE(SUM(packet_lost), 0) FROM ping_results WHERE device_id = ? AND timestamp >= ?",
                params![device_id, to_millis(since)],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(LossWindow {
                total: row.get::<i64>(0)?.max(0) as u64,
                lost: row.get::<i64>(1)?.max(0) as u64,
            }),
            None => Ok(LossWindow::default()),
        }
    }

    async fn delete_expired_results(&self, now: DateTime<Utc>) -> Result<u64> {
        let conn = self.get_conn().await?;
        let deleted = conn
            .execute(
                "DELETE FROM ping_results WHERE timestamp < (
                    SELECT ?1 - devices.retention_days * 86400000 FROM devices WHERE devices.id = ping_results.device_id
                 )",
                params![to_millis(now)],
            )
            .await?;

        Ok(deleted)
    }

    async fn insert_device(&self, device: &NewDevice) -> Result<i64> {
        let conn = self.get_conn().await?;
        let now = to_millis(Utc::now());

        conn.execute(
            "INSERT INTO devices (name, ip_address, ping_type, interval_seconds, packet_size, retention_days, monitoring_enabled, status, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, 'unknown', ?, ?)",
            params![
                device.name.clone(),
                device.ip_address.clone(),
                device.ping_type.as_str(),
                device.interval_seconds,
                i64::from(device.packet_size),
                i64::from(device.retention_days),
                if device.monitoring_enabled { 1 } else { 0 },
                now,
                now
            ],
        )
        .await?;

        Ok(conn.last_insert_rowid())
    }

    async fn delete_device(&self, id: i64) -> Result<()> {
        let conn = self.get_conn().await?;

        // Related rows are removed via ON DELETE CASCADE
        conn.execute("DELETE FROM devices WHERE id = ?", params![id]).await?;
        Ok(())
    }

    async fn set_monitoring_enabled(&self, id: i64, enabled: bool) -> Result<()> {
        let conn = self.get_conn().await?;
        conn.execute(
            "UPDATE devices SET monitoring_enabled = ?, updated_at = ? WHERE id = ?",
            params![if enabled { 1 } else { 0 }, to_millis(Utc::now()), id],
        )
        .await?;
        Ok(())
    }

    async fn recent_notifications(&self, device_id: Option<i64>, limit: usize) -> Result<Vec<Notification>> {
        let conn = self.get_conn().await?;
        let limit = limit as i64;
        let mut rows = match device_id {
            Some(id) => {
                conn.query(
                    "SELECT id, device_id, type, message, is_read, created_at FROM notifications WHERE device_id = ? ORDER BY id DESC LIMIT ?",
                    params![id, limit],
                )
                .await?
            }
            None => {
                conn.query(
                    "SELECT id, device_id, type, message, is_read, created_at FROM notifications ORDER BY id DESC LIMIT ?",
                    params![limit],
                )
                .await?
            }
        };

        let mut notifications = Vec::new();
        while let Some(row) = rows.next().await? {
            notifications.push(Self::notification_from_row(&row)?);
        }

        Ok(notifications)
    }
}
