//! PostgreSQL-backed per-owner knowledge store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use memoflow_core::provider::KnowledgeStore;
use memoflow_core::{AnalysisResult, OwnerContext, OwnerId, ProcessingError};
use sqlx::PgPool;
use sqlx::types::Json;

use crate::{DbError, DbResult};

#[derive(Debug, sqlx::FromRow)]
struct OwnerContextRecord {
    summary: String,
    recent_topics: Json<Vec<String>>,
    updated_at: Option<DateTime<Utc>>,
}

impl OwnerContextRecord {
    fn into_context(self, owner_id: OwnerId) -> OwnerContext {
        OwnerContext {
            owner_id,
            summary: self.summary,
            recent_topics: self.recent_topics.0,
            updated_at: self.updated_at,
        }
    }
}

pub struct PgKnowledgeStore {
    pool: PgPool,
}

impl PgKnowledgeStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn load(&self, owner_id: OwnerId) -> DbResult<OwnerContext> {
        let record = sqlx::query_as::<_, OwnerContextRecord>(
            "SELECT summary, recent_topics, updated_at FROM owner_contexts WHERE owner_id = $1",
        )
        .bind(owner_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        Ok(record
            .map(|r| r.into_context(owner_id))
            .unwrap_or_else(|| OwnerContext::empty(owner_id)))
    }

    /// Read-modify-write under a row lock so concurrent jobs for the same
    /// owner don't drop each other's topics.
    async fn absorb(&self, owner_id: OwnerId, analysis: &AnalysisResult) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT INTO owner_contexts (owner_id) VALUES ($1) ON CONFLICT DO NOTHING")
            .bind(owner_id.as_uuid())
            .execute(&mut *tx)
            .await?;

        let record = sqlx::query_as::<_, OwnerContextRecord>(
            r#"
            SELECT summary, recent_topics, updated_at FROM owner_contexts
            WHERE owner_id = $1
            FOR UPDATE
            "#,
        )
        .bind(owner_id.as_uuid())
        .fetch_one(&mut *tx)
        .await?;

        let mut context = record.into_context(owner_id);
        context.absorb(analysis, Utc::now());

        sqlx::query(
            r#"
            UPDATE owner_contexts
            SET summary = $2, recent_topics = $3, updated_at = $4
            WHERE owner_id = $1
            "#,
        )
        .bind(owner_id.as_uuid())
        .bind(&context.summary)
        .bind(Json(&context.recent_topics))
        .bind(context.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl KnowledgeStore for PgKnowledgeStore {
    async fn context_for(&self, owner_id: OwnerId) -> memoflow_core::Result<OwnerContext> {
        self.load(owner_id).await.map_err(ProcessingError::from)
    }

    async fn record_analysis(
        &self,
        owner_id: OwnerId,
        analysis: &AnalysisResult,
    ) -> memoflow_core::Result<()> {
        self.absorb(owner_id, analysis)
            .await
            .map_err(|e: DbError| e.into())
    }
}
