/// Database layer for Campus Gate
///
/// Manages the SQLite connection pool and migrations, and holds the typed
/// row models for device trust and QR scanning.

pub mod device;
pub mod scan;

use crate::{
    config::StorageConfig,
    error::{GateError, GateResult},
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::{path::Path, str::FromStr, time::Duration};

/// Pool sizing for the on-disk database
///
/// WAL is always on: scans from many devices write concurrently.
#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    pub max_connections: u32,
    pub busy_timeout: Duration,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            max_connections: 10,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&StorageConfig> for DatabaseOptions {
    fn from(storage: &StorageConfig) -> Self {
        Self {
            max_connections: storage.max_connections.max(1),
            busy_timeout: Duration::from_secs(storage.busy_timeout_secs),
        }
    }
}

/// Open (creating if needed) the SQLite database at `path`
pub async fn create_pool(path: &Path, options: DatabaseOptions) -> GateResult<SqlitePool> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    let connect = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(options.busy_timeout);

    let pool = SqlitePoolOptions::new()
        .max_connections(options.max_connections)
        .connect_with(connect)
        .await?;

    tracing::debug!(
        "Opened database {} with up to {} connections",
        path.display(),
        options.max_connections
    );
    Ok(pool)
}

/// Create a migrated in-memory pool
///
/// Uses a single connection so every query sees the same in-memory database.
pub async fn create_memory_pool() -> GateResult<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

/// Apply the embedded `./migrations`
pub async fn run_migrations(pool: &SqlitePool) -> GateResult<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| GateError::Internal(format!("Migration failed: {}", e)))?;

    Ok(())
}

pub async fn test_connection(pool: &SqlitePool) -> GateResult<()> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}
