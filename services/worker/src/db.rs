//! Postgres connection pool shared by the record store and the bus medium.

use std::path::PathBuf;
use std::time::Duration;

use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;
use tracing::info;
use wgfleet_bus::PgMedium;

use crate::store::PgDeviceStore;

/// Errors raised while setting up the database.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("failed to connect to database: {0}")]
    Connect(#[source] sqlx::Error),

    #[error("database ping failed: {0}")]
    Ping(#[source] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// None of the known migration directories exists.
    #[error("no migrations directory found (looked in {0})")]
    MigrationsNotFound(String),
}

/// Pool settings, read from `DATABASE_URL`, `DB_MAX_CONNECTIONS` and
/// `DB_MIN_CONNECTIONS`.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/wgfleet".to_string(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

impl DbConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database_url = url;
        }
        if let Some(max) = env_u32("DB_MAX_CONNECTIONS") {
            config.max_connections = max;
        }
        if let Some(min) = env_u32("DB_MIN_CONNECTIONS") {
            config.min_connections = min.min(config.max_connections);
        }

        config
    }
}

fn env_u32(name: &str) -> Option<u32> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

/// Where migrations may live, depending on the working directory.
fn migration_dirs() -> [PathBuf; 3] {
    [
        PathBuf::from("migrations"),
        PathBuf::from("services/worker/migrations"),
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations"),
    ]
}

/// Handle to the worker database.
#[derive(Debug, Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn connect(config: &DbConfig) -> Result<Self, DbError> {
        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Connecting to database"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.database_url)
            .await
            .map_err(DbError::Connect)?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn ping(&self) -> Result<(), DbError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(DbError::Ping)?;
        Ok(())
    }

    /// Apply the `devices` and bus table migrations.
    pub async fn migrate(&self) -> Result<(), DbError> {
        let dirs = migration_dirs();
        let Some(dir) = dirs.iter().find(|d| d.is_dir()) else {
            let looked = dirs
                .iter()
                .map(|d| d.display().to_string())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(DbError::MigrationsNotFound(looked));
        };

        let migrator = Migrator::new(dir.as_path()).await?;
        migrator.run(&self.pool).await?;
        info!(dir = %dir.display(), "Database migrations applied");
        Ok(())
    }

    pub fn device_store(&self) -> PgDeviceStore {
        PgDeviceStore::new(self.pool.clone())
    }

    pub fn bus_medium(&self) -> PgMedium {
        PgMedium::new(self.pool.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_config_defaults() {
        let config = DbConfig::default();
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.min_connections, 1);
        assert!(config.database_url.ends_with("/wgfleet"));
    }

    #[test]
    fn test_manifest_migrations_dir_exists() {
        assert!(migration_dirs().iter().any(|d| d.is_dir()));
    }
}
