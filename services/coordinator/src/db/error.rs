use thiserror::Error;

/// Durable store operation errors.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("failed to connect to database: {0}")]
    Connect(#[source] sqlx::Error),

    #[error("query failed: {0}")]
    Query(#[source] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),

    /// A record with the same key already exists.
    #[error("duplicate {kind} record: {id}")]
    Duplicate { kind: &'static str, id: String },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DbError {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, DbError::Duplicate { .. })
    }
}

/// Result type for durable store operations.
pub type DbResult<T> = Result<T, DbError>;
