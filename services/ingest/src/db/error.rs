//! Database error types.

use thiserror::Error;

/// SQLSTATE for a foreign key violation.
const FOREIGN_KEY_VIOLATION: &str = "23503";

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database connection failed: {0}")]
    Connect(#[source] sqlx::Error),

    #[error("database query failed: {0}")]
    Query(#[source] sqlx::Error),

    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),

    /// None of the migration directories could be loaded.
    #[error("no migrations found (tried {tried}; last error: {last_error})")]
    MigrationDirNotFound { tried: String, last_error: String },
}

impl DbError {
    /// Postgres SQLSTATE of a failed query.
    pub fn code(&self) -> Option<String> {
        match self {
            DbError::Query(sqlx::Error::Database(db_err)) => db_err.code().map(|c| c.into_owned()),
            _ => None,
        }
    }

    pub fn is_foreign_key_violation(&self) -> bool {
        self.code().as_deref() == Some(FOREIGN_KEY_VIOLATION)
    }
}
