/// Database abstraction layer
///
/// This module provides the storage the monitoring engine runs against:
/// devices, batched probe results and status-change notifications.
pub mod migrations;
pub mod models;
pub mod repository;

#[cfg(test)]
pub(crate) mod memory;

pub use repository::{Database, DatabaseImpl};

use anyhow::Result;

/// Initialize database with schema
pub async fn initialize_database(conn: &libsql::Connection) -> Result<()> {
    migrations::run_migrations(conn).await
}
