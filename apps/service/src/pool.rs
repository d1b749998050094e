use std::path::Path;

use anyhow::{Context, Result};
use deadpool::managed::{self, Pool, RecycleResult};
use libsql::{Connection, Database, Error as LibsqlError};

pub struct LibsqlManager {
    database: Database,
}

impl LibsqlManager {
    pub fn new(database: Database) -> Self {
        Self { database }
    }
}

impl managed::Manager for LibsqlManager {
    type Type = Connection;
    type Error = LibsqlError;

    async fn create(&self) -> Result<Self::Type, Self::Error> {
        let conn = self.database.connect()?;
        // Per-connection settings; the journal mode pragma answers with a row.
        conn.execute("PRAGMA foreign_keys = ON", ()).await?;
        conn.query("PRAGMA busy_timeout = 5000", ()).await?;
        conn.query("PRAGMA journal_mode = WAL", ()).await?;
        Ok(conn)
    }

    async fn recycle(
        &self,
        conn: &mut Self::Type,
        _: &managed::Metrics,
    ) -> RecycleResult<Self::Error> {
        conn.query("SELECT 1", ())
            .await?
            .next()
            .await?
            .ok_or(LibsqlError::QueryReturnedNoRows)?;
        Ok(())
    }
}

pub type LibsqlPool = Pool<LibsqlManager>;

/// Open (or create) the local database file and wrap it in a pool
pub async fn open(path: impl AsRef<Path>, max_size: usize) -> Result<LibsqlPool> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating database directory {}", parent.display()))?;
    }

    let database = libsql::Builder::new_local(path)
        .build()
        .await
        .with_context(|| format!("opening database {}", path.display()))?;

    let pool = Pool::builder(LibsqlManager::new(database))
        .max_size(max_size.max(1))
        .build()
        .context("building connection pool")?;

    Ok(pool)
}
