//! Durable agent store.
//!
//! This module provides:
//! - Agent documents with document-level optimistic concurrency
//! - Session and lease history for audit
//! - Connection pool management and migrations for the Postgres backend
//!
//! Services consume the store through the [`AgentStore`],
//! [`SessionHistoryStore`] and [`LeaseHistoryStore`] traits. The in-memory
//! backend is used in tests and dev mode.

mod error;
mod memory;
pub mod model;
mod postgres;

pub use error::{DbError, DbResult};
pub use memory::{MemoryAgentStore, MemoryLeaseHistory, MemorySessionHistory};
pub use model::{
    AgentDocument, AgentQuery, AgentWorkspace, LeaseOutcome, LeaseRecord, SessionRecord,
    CURRENT_SCHEMA_VERSION,
};
pub use postgres::{PgAgentStore, PgLeaseHistory, PgSessionHistory};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_id::{AgentId, LeaseId, SessionId};
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

/// Agent documents.
#[async_trait]
pub trait AgentStore: Send + Sync {
    async fn find(&self, id: &AgentId) -> DbResult<Option<AgentDocument>>;

    async fn find_many(&self, query: &AgentQuery) -> DbResult<Vec<AgentDocument>>;

    /// Insert a new document. Returns `false` if one already exists.
    async fn insert(&self, doc: &AgentDocument) -> DbResult<bool>;

    /// Replace `current` with `replacement` if the stored document still has
    /// `current.update_index`.
    ///
    /// On success returns the stored document, whose `update_index` is one
    /// greater than `current`'s. Returns `None` if another writer got there
    /// first or the document is gone.
    async fn find_and_update(
        &self,
        current: &AgentDocument,
        replacement: AgentDocument,
    ) -> DbResult<Option<AgentDocument>>;

    async fn delete(&self, id: &AgentId) -> DbResult<bool>;
}

/// History of agent sessions.
#[async_trait]
pub trait SessionHistoryStore: Send + Sync {
    async fn insert(&self, record: &SessionRecord) -> DbResult<()>;

    /// Stamp the finish time. Finishing an already finished session is a no-op
    /// that returns `false`.
    async fn finish(&self, session_id: &SessionId, finished_at: DateTime<Utc>) -> DbResult<bool>;

    /// Most recent sessions first.
    async fn find_by_agent(&self, agent_id: &AgentId, limit: usize) -> DbResult<Vec<SessionRecord>>;

    async fn delete_by_agent(&self, agent_id: &AgentId) -> DbResult<u64>;
}

/// Append-only lease audit log.
#[async_trait]
pub trait LeaseHistoryStore: Send + Sync {
    /// Record a new lease. Fails with [`DbError::Duplicate`] if the id exists.
    async fn insert(&self, record: &LeaseRecord) -> DbResult<()>;

    async fn get(&self, id: &LeaseId) -> DbResult<Option<LeaseRecord>>;

    /// Stamp finish time and outcome on an unfinished lease.
    async fn finish(
        &self,
        id: &LeaseId,
        finished_at: DateTime<Utc>,
        outcome: LeaseOutcome,
    ) -> DbResult<bool>;
}

/// Handles to every durable collection.
#[derive(Clone)]
pub struct DurableStore {
    pub agents: Arc<dyn AgentStore>,
    pub sessions: Arc<dyn SessionHistoryStore>,
    pub leases: Arc<dyn LeaseHistoryStore>,
}

impl DurableStore {
    /// In-memory backend.
    pub fn memory() -> Self {
        Self {
            agents: Arc::new(MemoryAgentStore::new()),
            sessions: Arc::new(MemorySessionHistory::new()),
            leases: Arc::new(MemoryLeaseHistory::new()),
        }
    }

    /// Postgres backend sharing one pool.
    pub fn postgres(db: &Database) -> Self {
        let pool = db.pool().clone();
        Self {
            agents: Arc::new(PgAgentStore::new(pool.clone())),
            sessions: Arc::new(PgSessionHistory::new(pool.clone())),
            leases: Arc::new(PgLeaseHistory::new(pool)),
        }
    }
}

/// Postgres pool settings.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    /// Overrides the migrations shipped with the crate.
    pub migrations_dir: Option<PathBuf>,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/fleet".to_string(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(600),
            migrations_dir: None,
        }
    }
}

impl DbConfig {
    /// `DATABASE_URL`, `DB_MAX_CONNECTIONS`, `DB_MIN_CONNECTIONS` and
    /// `FLEET_MIGRATIONS_DIR`. Unset or unparsable values keep the default.
    pub fn from_env() -> Self {
        fn var<T: std::str::FromStr>(name: &str) -> Option<T> {
            std::env::var(name).ok()?.parse().ok()
        }

        let defaults = Self::default();
        Self {
            database_url: var("DATABASE_URL").unwrap_or(defaults.database_url),
            max_connections: var("DB_MAX_CONNECTIONS").unwrap_or(defaults.max_connections),
            min_connections: var("DB_MIN_CONNECTIONS").unwrap_or(defaults.min_connections),
            migrations_dir: var("FLEET_MIGRATIONS_DIR"),
            ..defaults
        }
    }

    fn migrations_dir(&self) -> PathBuf {
        self.migrations_dir
            .clone()
            .unwrap_or_else(|| Path::new(env!("CARGO_MANIFEST_DIR")).join("migrations"))
    }
}

/// Shared Postgres pool.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
    migrations_dir: PathBuf,
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
            .idle_timeout(Some(config.idle_timeout))
            .connect(&config.database_url)
            .await
            .map_err(DbError::Connect)?;

        Ok(Self {
            pool,
            migrations_dir: config.migrations_dir(),
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<(), DbError> {
        let migrator = Migrator::new(self.migrations_dir.as_path())
            .await
            .map_err(DbError::Migration)?;
        migrator.run(&self.pool).await.map_err(DbError::Migration)?;
        info!(
            migrations_dir = %self.migrations_dir.display(),
            applied = migrator.iter().count(),
            "Database migrations complete"
        );
        Ok(())
    }
}
