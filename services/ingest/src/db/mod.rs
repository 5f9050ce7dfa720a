//! Database layer for the ingest service.
//!
//! This module provides:
//! - Connection pool management
//! - Runtime migrations
//! - The Postgres [`EventStore`](crate::store::EventStore)
//!
//! The database layer uses SQLx with Postgres.

mod error;
mod pg_store;

pub use error::DbError;
pub use pg_store::PgStore;

use std::path::PathBuf;
use std::time::Duration;

use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

/// Postgres pool settings.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub database_url: String,
    pub max_connections: u32,
    /// Idle connections kept open; never above `max_connections`.
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/quorum".to_string(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
        }
    }
}

impl DbConfig {
    /// Reads `DATABASE_URL`, `DB_MAX_CONNECTIONS` and `DB_MIN_CONNECTIONS`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`DbConfig::from_env`] but resolving variables through `lookup`.
    /// Unparseable counts fall back to the defaults.
    pub(crate) fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let count = |key: &str, fallback: u32| {
            lookup(key)
                .and_then(|v| v.trim().parse::<u32>().ok())
                .filter(|n| *n > 0)
                .unwrap_or(fallback)
        };

        let max_connections = count("DB_MAX_CONNECTIONS", defaults.max_connections);
        let min_connections =
            count("DB_MIN_CONNECTIONS", defaults.min_connections).min(max_connections);

        Self {
            database_url: lookup("DATABASE_URL").unwrap_or_else(|| defaults.database_url.clone()),
            max_connections,
            min_connections,
            ..defaults
        }
    }
}

/// Directories searched for migrations, in order: the working directory,
/// the workspace root layout, then the crate's own directory.
fn migration_dirs() -> [PathBuf; 3] {
    [
        PathBuf::from("./migrations"),
        PathBuf::from("services/ingest/migrations"),
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations"),
    ]
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
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
            .idle_timeout(Some(config.idle_timeout))
            .max_lifetime(Some(config.max_lifetime))
            .connect(&config.database_url)
            .await
            .map_err(DbError::Connect)?;

        info!("Database connection pool established");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check if the database is reachable.
    pub async fn health_check(&self) -> Result<(), DbError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(())
    }

    /// Applies pending migrations from the first migration directory found.
    pub async fn run_migrations(&self) -> Result<(), DbError> {
        let mut last_error = None;

        for dir in migration_dirs() {
            let migrator = match Migrator::new(dir.clone()).await {
                Ok(migrator) => migrator,
                Err(e) => {
                    last_error = Some(e);
                    continue;
                }
            };

            info!(
                migrations_dir = %dir.display(),
                migrations = migrator.iter().count(),
                "Applying migrations"
            );
            migrator.run(&self.pool).await.map_err(DbError::Migration)?;
            info!("Database migrations complete");
            return Ok(());
        }

        Err(DbError::MigrationDirNotFound {
            tried: migration_dirs()
                .iter()
                .map(|dir| dir.display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
            last_error: last_error.map_or_else(|| "none".to_string(), |e| e.to_string()),
        })
    }

    /// Get a store handle sharing this pool.
    pub fn store(&self) -> PgStore {
        PgStore::new(self.pool.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_db_config_defaults() {
        let config = DbConfig::from_lookup(|_| None);
        assert_eq!(config.database_url, "postgres://localhost/quorum");
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.min_connections, 1);
    }

    #[test]
    fn test_min_connections_capped_by_max() {
        let env: HashMap<&str, &str> =
            HashMap::from([("DB_MAX_CONNECTIONS", "4"), ("DB_MIN_CONNECTIONS", "8")]);
        let config = DbConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.max_connections, 4);
        assert_eq!(config.min_connections, 4);
    }

    #[test]
    fn test_crate_migrations_dir_is_searched() {
        let dirs = migration_dirs();
        assert!(dirs[2].ends_with("migrations"));
        assert!(dirs[2].join("0001_event_receivers.sql").exists());
    }

    #[test]
    fn test_db_config_lookup_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("DATABASE_URL", "postgres://db.internal/quorum"),
            ("DB_MAX_CONNECTIONS", "25"),
            ("DB_MIN_CONNECTIONS", "not-a-number"),
        ]);
        let config = DbConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.database_url, "postgres://db.internal/quorum");
        assert_eq!(config.max_connections, 25);
        assert_eq!(config.min_connections, 1);
        assert_eq!(config.acquire_timeout, Duration::from_secs(5));
    }
}
