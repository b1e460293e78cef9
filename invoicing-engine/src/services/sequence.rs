//! Business-scoped document number sequencer.
//!
//! Issuing a number is a single atomic increment: never read-then-write,
//! so two concurrent creation calls for the same business cannot draw the
//! same value.

use async_trait::async_trait;
use dashmap::DashMap;
use service_core::error::AppError;
use sqlx::postgres::PgPool;
use tracing::instrument;
use uuid::Uuid;

use crate::engine::sequence::{checked_value, format_number, DocumentType};
use crate::engine::EngineError;

/// Issues the next unique, prefix-qualified document number for a
/// (business, document type) pair.
#[async_trait]
pub trait Sequencer: Send + Sync {
    async fn next_number(
        &self,
        business_id: Uuid,
        doc_type: DocumentType,
    ) -> Result<String, AppError>;
}

/// Postgres-backed sequencer. The upsert-increment runs as one statement, so
/// the row lock serializes contending callers inside the database.
#[derive(Clone)]
pub struct PgSequencer {
    pool: PgPool,
}

impl PgSequencer {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Sequencer for PgSequencer {
    #[instrument(skip(self), fields(business_id = %business_id, doc_type = %doc_type))]
    async fn next_number(
        &self,
        business_id: Uuid,
        doc_type: DocumentType,
    ) -> Result<String, AppError> {
        let value: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO number_sequences (business_id, doc_type, next_value)
            VALUES ($1, $2, 1)
            ON CONFLICT (business_id, doc_type)
            DO UPDATE SET next_value = number_sequences.next_value + 1
            RETURNING next_value
            "#,
        )
        .bind(business_id)
        .bind(doc_type.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to advance number sequence: {}", e))
        })?;

        let value = checked_value(business_id, value)?;
        Ok(format_number(doc_type, value))
    }
}

/// In-memory sequencer for tests and ephemeral setups. Counter access goes
/// through the map entry's shard lock, which gives the same
/// increment-then-read discipline as the Postgres upsert.
#[derive(Default)]
pub struct InMemorySequencer {
    counters: DashMap<(Uuid, DocumentType), i64>,
}

impl InMemorySequencer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Sequencer for InMemorySequencer {
    async fn next_number(
        &self,
        business_id: Uuid,
        doc_type: DocumentType,
    ) -> Result<String, AppError> {
        let mut entry = self.counters.entry((business_id, doc_type)).or_insert(0);
        *entry = entry
            .checked_add(1)
            .ok_or(EngineError::SequenceExhausted(business_id))?;
        let value = checked_value(business_id, *entry)?;
        Ok(format_number(doc_type, value))
    }
}
