//! Postgres durable store backends.
//!
//! Agent documents are stored as JSONB alongside the handful of columns
//! queries filter on. `update_index` is the CAS version.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_id::{AgentId, LeaseId, SessionId};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};

use super::{
    AgentDocument, AgentQuery, AgentStore, DbError, DbResult, LeaseHistoryStore, LeaseOutcome,
    LeaseRecord, SessionHistoryStore, SessionRecord,
};

fn column_error(
    column: &str,
    source: impl std::error::Error + Send + Sync + 'static,
) -> sqlx::Error {
    sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(source),
    }
}

fn decode_document(value: serde_json::Value) -> DbResult<AgentDocument> {
    Ok(serde_json::from_value(value)?)
}

// ---------------------------------------------------------------------------
// Agents
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct PgAgentStore {
    pool: PgPool,
}

impl PgAgentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AgentStore for PgAgentStore {
    async fn find(&self, id: &AgentId) -> DbResult<Option<AgentDocument>> {
        let document: Option<serde_json::Value> =
            sqlx::query_scalar("SELECT document FROM agents WHERE id = $1")
                .bind(id.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(DbError::Query)?;
        document.map(decode_document).transpose()
    }

    async fn find_many(&self, query: &AgentQuery) -> DbResult<Vec<AgentDocument>> {
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("SELECT document FROM agents WHERE TRUE");
        if let Some(ephemeral) = query.ephemeral {
            builder.push(" AND ephemeral = ").push_bind(ephemeral);
        }
        if let Some(deleted) = query.deleted {
            builder.push(" AND deleted = ").push_bind(deleted);
        }
        if let Some(before) = query.last_online_before {
            builder
                .push(" AND COALESCE(last_online_time, created_at) < ")
                .push_bind(before);
        }
        if let Some(pool) = &query.pool {
            builder
                .push(" AND (document->'explicit_pools' ? ")
                .push_bind(pool.clone())
                .push(" OR document->'dynamic_pools' ? ")
                .push_bind(pool.clone())
                .push(")");
        }
        if let Some(session_id) = query.session_id {
            builder.push(" AND session_id = ").push_bind(session_id.to_string());
        }
        builder.push(" ORDER BY id");
        if let Some(limit) = query.limit {
            builder
                .push(" LIMIT ")
                .push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
        }

        let documents: Vec<serde_json::Value> = builder
            .build_query_scalar()
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::Query)?;
        documents.into_iter().map(decode_document).collect()
    }

    async fn insert(&self, doc: &AgentDocument) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO agents (
                id,
                update_index,
                ephemeral,
                deleted,
                last_online_time,
                session_id,
                document,
                created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(doc.id.as_str())
        .bind(doc.update_index)
        .bind(doc.ephemeral)
        .bind(doc.deleted)
        .bind(doc.last_online_time)
        .bind(doc.session_id.map(|s| s.to_string()))
        .bind(serde_json::to_value(doc)?)
        .bind(doc.created_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::Query)?;

        Ok(result.rows_affected() == 1)
    }

    async fn find_and_update(
        &self,
        current: &AgentDocument,
        mut replacement: AgentDocument,
    ) -> DbResult<Option<AgentDocument>> {
        replacement.id = current.id.clone();
        replacement.update_index = current.update_index + 1;

        let document: Option<serde_json::Value> = sqlx::query_scalar(
            r#"
            UPDATE agents
            SET update_index = $3,
                ephemeral = $4,
                deleted = $5,
                last_online_time = $6,
                session_id = $7,
                document = $8
            WHERE id = $1 AND update_index = $2
            RETURNING document
            "#,
        )
        .bind(current.id.as_str())
        .bind(current.update_index)
        .bind(replacement.update_index)
        .bind(replacement.ephemeral)
        .bind(replacement.deleted)
        .bind(replacement.last_online_time)
        .bind(replacement.session_id.map(|s| s.to_string()))
        .bind(serde_json::to_value(&replacement)?)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Query)?;

        document.map(decode_document).transpose()
    }

    async fn delete(&self, id: &AgentId) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM agents WHERE id = $1")
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(result.rows_affected() > 0)
    }
}

// ---------------------------------------------------------------------------
// Session history
// ---------------------------------------------------------------------------

impl<'r> sqlx::FromRow<'r, PgRow> for SessionRecord {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let session_id: String = row.try_get("session_id")?;
        let agent_id: String = row.try_get("agent_id")?;
        Ok(Self {
            session_id: SessionId::parse(&session_id).map_err(|e| column_error("session_id", e))?,
            agent_id: AgentId::parse(&agent_id).map_err(|e| column_error("agent_id", e))?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            version: row.try_get("version")?,
        })
    }
}

#[derive(Clone)]
pub struct PgSessionHistory {
    pool: PgPool,
}

impl PgSessionHistory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionHistoryStore for PgSessionHistory {
    async fn insert(&self, record: &SessionRecord) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO session_history (session_id, agent_id, started_at, finished_at, version)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (session_id) DO NOTHING
            "#,
        )
        .bind(record.session_id.to_string())
        .bind(record.agent_id.as_str())
        .bind(record.started_at)
        .bind(record.finished_at)
        .bind(record.version.as_deref())
        .execute(&self.pool)
        .await
        .map_err(DbError::Query)?;

        if result.rows_affected() == 0 {
            return Err(DbError::Duplicate {
                kind: "session",
                id: record.session_id.to_string(),
            });
        }
        Ok(())
    }

    async fn finish(&self, session_id: &SessionId, finished_at: DateTime<Utc>) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE session_history
            SET finished_at = $2
            WHERE session_id = $1 AND finished_at IS NULL
            "#,
        )
        .bind(session_id.to_string())
        .bind(finished_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::Query)?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_by_agent(&self, agent_id: &AgentId, limit: usize) -> DbResult<Vec<SessionRecord>> {
        sqlx::query_as::<_, SessionRecord>(
            r#"
            SELECT session_id, agent_id, started_at, finished_at, version
            FROM session_history
            WHERE agent_id = $1
            ORDER BY started_at DESC
            LIMIT $2
            "#,
        )
        .bind(agent_id.as_str())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)
    }

    async fn delete_by_agent(&self, agent_id: &AgentId) -> DbResult<u64> {
        let result = sqlx::query("DELETE FROM session_history WHERE agent_id = $1")
            .bind(agent_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(result.rows_affected())
    }
}

// ---------------------------------------------------------------------------
// Lease history
// ---------------------------------------------------------------------------

impl<'r> sqlx::FromRow<'r, PgRow> for LeaseRecord {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let id: String = row.try_get("id")?;
        let parent_id: Option<String> = row.try_get("parent_id")?;
        let agent_id: String = row.try_get("agent_id")?;
        let session_id: String = row.try_get("session_id")?;
        let resources: serde_json::Value = row.try_get("resources")?;
        let outcome: Option<String> = row.try_get("outcome")?;

        let resources: BTreeMap<String, u32> =
            serde_json::from_value(resources).map_err(|e| column_error("resources", e))?;
        let outcome = match outcome {
            Some(s) => Some(LeaseOutcome::parse(&s).ok_or_else(|| sqlx::Error::ColumnDecode {
                index: "outcome".to_string(),
                source: format!("unknown outcome {s:?}").into(),
            })?),
            None => None,
        };

        Ok(Self {
            id: LeaseId::parse(&id).map_err(|e| column_error("id", e))?,
            parent_id: parent_id
                .map(|p| LeaseId::parse(&p))
                .transpose()
                .map_err(|e| column_error("parent_id", e))?,
            agent_id: AgentId::parse(&agent_id).map_err(|e| column_error("agent_id", e))?,
            session_id: SessionId::parse(&session_id).map_err(|e| column_error("session_id", e))?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            resources,
            payload: row.try_get("payload")?,
            outcome,
        })
    }
}

#[derive(Clone)]
pub struct PgLeaseHistory {
    pool: PgPool,
}

impl PgLeaseHistory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LeaseHistoryStore for PgLeaseHistory {
    async fn insert(&self, record: &LeaseRecord) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO lease_history (
                id,
                parent_id,
                agent_id,
                session_id,
                started_at,
                finished_at,
                resources,
                payload,
                outcome
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(record.id.to_string())
        .bind(record.parent_id.map(|p| p.to_string()))
        .bind(record.agent_id.as_str())
        .bind(record.session_id.to_string())
        .bind(record.started_at)
        .bind(record.finished_at)
        .bind(serde_json::to_value(&record.resources)?)
        .bind(&record.payload)
        .bind(record.outcome.map(|o| o.as_str()))
        .execute(&self.pool)
        .await
        .map_err(DbError::Query)?;

        if result.rows_affected() == 0 {
            return Err(DbError::Duplicate {
                kind: "lease",
                id: record.id.to_string(),
            });
        }
        Ok(())
    }

    async fn get(&self, id: &LeaseId) -> DbResult<Option<LeaseRecord>> {
        sqlx::query_as::<_, LeaseRecord>(
            r#"
            SELECT id, parent_id, agent_id, session_id, started_at, finished_at,
                   resources, payload, outcome
            FROM lease_history
            WHERE id = $1
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Query)
    }

    async fn finish(
        &self,
        id: &LeaseId,
        finished_at: DateTime<Utc>,
        outcome: LeaseOutcome,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE lease_history
            SET finished_at = $2, outcome = $3
            WHERE id = $1 AND finished_at IS NULL
            "#,
        )
        .bind(id.to_string())
        .bind(finished_at)
        .bind(outcome.as_str())
        .execute(&self.pool)
        .await
        .map_err(DbError::Query)?;
        Ok(result.rows_affected() > 0)
    }
}
