//! Automatic retention and cleanup of probe results.
//!
//! Every device keeps its results for its own `retention_days`. Cleanup runs
//! once at startup and then periodically as a background task.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RetentionSettings;
use crate::database::Database;

/// Cleanup manager for expired results
pub struct RetentionCleanup {
    database: Arc<dyn Database>,
    cleanup_interval: Duration,
}

impl RetentionCleanup {
    /// Create a new retention cleanup manager
    pub fn new(database: Arc<dyn Database>, settings: &RetentionSettings) -> Self {
        Self {
            database,
            cleanup_interval: Duration::from_secs(settings.cleanup_interval_seconds.clamp(1, 7 * 86_400)),
        }
    }

    /// Delete every probe result older than its device's retention period
    pub async fn cleanup_expired_results(&self) -> Result<u64> {
        debug!("Starting retention cleanup");

        let deleted = self.database.delete_expired_results(chrono::Utc::now()).await?;
        if deleted > 0 {
            info!("Retention cleanup completed: {} probe results deleted", deleted);
        }

        Ok(deleted)
    }

    /// Start background cleanup task, running immediately and then on every interval
    pub fn start_periodic_cleanup(self, token: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.cleanup_interval);

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {}
                }

                if let Err(e) = self.cleanup_expired_results().await {
                    warn!("Periodic retention cleanup failed: {:#}", e);
                }
            }

            debug!("Retention cleanup task stopped");
        })
    }
}
