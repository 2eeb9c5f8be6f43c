use std::str::FromStr;

use carelink_core::{EntityKind, OutboxAction, OutboxItem, DEFAULT_MAX_RETRIES};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use crate::errors::{ClientError, ClientResult};
use crate::queries::Queries;

/// Durable FIFO queue of local mutations awaiting delivery to the server.
/// Shares the entity store's pool so an entity write and its queue entry can
/// commit in one transaction.
pub struct Outbox {
    pool: SqlitePool,
}

impl Outbox {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn enqueue(
        &self,
        kind: EntityKind,
        entity_id: &str,
        action: OutboxAction,
        payload: &serde_json::Value,
    ) -> ClientResult<i64> {
        let payload_json = serde_json::to_string(payload)?;
        let result = sqlx::query(Queries::INSERT_SYNC_QUEUE)
            .bind(kind.to_string())
            .bind(entity_id)
            .bind(action.to_string())
            .bind(payload_json)
            .bind(DEFAULT_MAX_RETRIES)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }

    /// Transaction-scoped enqueue, paired with the entity write it mirrors.
    pub async fn enqueue_in(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        kind: EntityKind,
        entity_id: &str,
        action: OutboxAction,
        payload: &serde_json::Value,
    ) -> ClientResult<i64> {
        let payload_json = serde_json::to_string(payload)?;
        let result = sqlx::query(Queries::INSERT_SYNC_QUEUE)
            .bind(kind.to_string())
            .bind(entity_id)
            .bind(action.to_string())
            .bind(payload_json)
            .bind(DEFAULT_MAX_RETRIES)
            .bind(Utc::now().to_rfc3339())
            .execute(&mut **tx)
            .await?;
        Ok(result.last_insert_rowid())
    }

    /// All queued items in enqueue order.
    pub async fn pending(&self) -> ClientResult<Vec<OutboxItem>> {
        let rows = sqlx::query(Queries::GET_SYNC_QUEUE)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::parse_item).collect()
    }

    pub async fn remove(&self, id: i64) -> ClientResult<()> {
        sqlx::query(Queries::DELETE_FROM_QUEUE)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn increment_retry(&self, id: i64) -> ClientResult<()> {
        sqlx::query(Queries::INCREMENT_RETRY_COUNT)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn len(&self) -> ClientResult<u64> {
        let row = sqlx::query(Queries::COUNT_QUEUE).fetch_one(&self.pool).await?;
        let count: i64 = row.try_get("count")?;
        Ok(count.max(0) as u64)
    }

    pub async fn is_empty(&self) -> ClientResult<bool> {
        Ok(self.len().await? == 0)
    }

    fn parse_item(row: &SqliteRow) -> ClientResult<OutboxItem> {
        let kind: String = row.try_get("entity_kind")?;
        let action: String = row.try_get("action")?;
        let payload: String = row.try_get("payload")?;
        let enqueued_at: String = row.try_get("enqueued_at")?;

        Ok(OutboxItem {
            id: row.try_get("id")?,
            kind: EntityKind::from_str(&kind)
                .map_err(|_| ClientError::InvalidState(format!("unknown entity kind '{kind}'")))?,
            entity_id: row.try_get("entity_id")?,
            action: OutboxAction::from_str(&action).map_err(|_| {
                ClientError::InvalidState(format!("unknown outbox action '{action}'"))
            })?,
            payload: serde_json::from_str(&payload)?,
            retry_count: row.try_get("retry_count")?,
            max_retries: row.try_get("max_retries")?,
            enqueued_at: DateTime::parse_from_rfc3339(&enqueued_at)?.with_timezone(&Utc),
        })
    }
}
