use std::str::FromStr;

use carelink_core::{EntityKind, StorageUsage, StoredEntity};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use crate::errors::{ClientError, ClientResult};
use crate::queries::Queries;

#[derive(Debug, Clone, Copy)]
pub struct StoreConfig {
    /// Soft quota reported by `storage_usage`. SQLite itself does not
    /// enforce it.
    pub quota_bytes: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            quota_bytes: 50 * 1024 * 1024,
        }
    }
}

/// Secondary lookups supported by `get_all`. These match the expression
/// indexes declared in the schema.
#[derive(Debug, Clone, Copy)]
pub enum IndexKey<'a> {
    Synced(bool),
    ConversationId(&'a str),
    RecordType(&'a str),
    RecordDate(&'a str),
    LastMessageAt(&'a str),
}

impl IndexKey<'_> {
    fn json_path(&self) -> Option<(&'static str, &str)> {
        match self {
            IndexKey::Synced(_) => None,
            IndexKey::ConversationId(v) => Some(("$.conversation_id", v)),
            IndexKey::RecordType(v) => Some(("$.record_type", v)),
            IndexKey::RecordDate(v) => Some(("$.date", v)),
            IndexKey::LastMessageAt(v) => Some(("$.last_message_at", v)),
        }
    }
}

/// Transactional, indexed local persistence for domain records. Purely
/// local: no network awareness.
pub struct EntityStore {
    pool: SqlitePool,
    config: StoreConfig,
}

impl EntityStore {
    pub async fn new(database_url: &str) -> ClientResult<Self> {
        Self::with_config(database_url, StoreConfig::default()).await
    }

    pub async fn with_config(database_url: &str, config: StoreConfig) -> ClientResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        sqlx::raw_sql(Queries::SCHEMA).execute(&pool).await?;

        Ok(Self { pool, config })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn begin(&self) -> ClientResult<Transaction<'_, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    /// Insert or overwrite by id. Stamps `updated_at = now` and resets
    /// `synced` to false; overwriting an existing row is not an error.
    pub async fn put(
        &self,
        kind: EntityKind,
        id: &str,
        payload: &serde_json::Value,
    ) -> ClientResult<()> {
        self.put_row(&self.pool, kind, id, payload, false).await
    }

    /// Like `put`, but marks the row as already confirmed by the server.
    /// Used for server-originated writes.
    pub async fn put_synced(
        &self,
        kind: EntityKind,
        id: &str,
        payload: &serde_json::Value,
    ) -> ClientResult<()> {
        self.put_row(&self.pool, kind, id, payload, true).await
    }

    /// Transaction-scoped `put`, for local writes that must commit together
    /// with their outbox entry.
    pub async fn put_in(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        kind: EntityKind,
        id: &str,
        payload: &serde_json::Value,
        synced: bool,
    ) -> ClientResult<()> {
        let payload_json = serde_json::to_string(payload)?;
        sqlx::query(Queries::UPSERT_ENTITY)
            .bind(kind.to_string())
            .bind(id)
            .bind(payload_json)
            .bind(Utc::now().to_rfc3339())
            .bind(synced as i64)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn put_row(
        &self,
        pool: &SqlitePool,
        kind: EntityKind,
        id: &str,
        payload: &serde_json::Value,
        synced: bool,
    ) -> ClientResult<()> {
        let payload_json = serde_json::to_string(payload)?;
        sqlx::query(Queries::UPSERT_ENTITY)
            .bind(kind.to_string())
            .bind(id)
            .bind(payload_json)
            .bind(Utc::now().to_rfc3339())
            .bind(synced as i64)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn get(&self, kind: EntityKind, id: &str) -> ClientResult<Option<StoredEntity>> {
        let row = sqlx::query(Queries::GET_ENTITY)
            .bind(kind.to_string())
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| Self::parse_entity(&r)).transpose()
    }

    /// Read every record of a kind, optionally narrowed by a secondary
    /// index. Returns an empty vec, never an error, when nothing matches.
    pub async fn get_all(
        &self,
        kind: EntityKind,
        index: Option<IndexKey<'_>>,
    ) -> ClientResult<Vec<StoredEntity>> {
        let rows = match index {
            None => {
                sqlx::query(Queries::GET_ALL)
                    .bind(kind.to_string())
                    .fetch_all(&self.pool)
                    .await?
            }
            Some(IndexKey::Synced(synced)) => {
                sqlx::query(Queries::GET_ALL_BY_SYNCED)
                    .bind(kind.to_string())
                    .bind(synced as i64)
                    .fetch_all(&self.pool)
                    .await?
            }
            Some(key) => {
                // json_path is always Some for non-Synced keys
                let (path, value) = key.json_path().ok_or_else(|| {
                    ClientError::InvalidState("index key has no JSON path".to_string())
                })?;
                sqlx::query(Queries::GET_ALL_BY_JSON_FIELD)
                    .bind(kind.to_string())
                    .bind(path)
                    .bind(value)
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.iter().map(Self::parse_entity).collect()
    }

    /// Records of a kind still awaiting server confirmation.
    pub async fn unsynced(&self, kind: EntityKind) -> ClientResult<Vec<StoredEntity>> {
        self.get_all(kind, Some(IndexKey::Synced(false))).await
    }

    /// Idempotent: a no-op when the row is already synced or was deleted
    /// concurrently.
    pub async fn mark_synced(&self, kind: EntityKind, id: &str) -> ClientResult<()> {
        sqlx::query(Queries::MARK_SYNCED)
            .bind(kind.to_string())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Idempotent delete.
    pub async fn remove(&self, kind: EntityKind, id: &str) -> ClientResult<()> {
        sqlx::query(Queries::DELETE_ENTITY)
            .bind(kind.to_string())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn remove_in(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        kind: EntityKind,
        id: &str,
    ) -> ClientResult<()> {
        sqlx::query(Queries::DELETE_ENTITY)
            .bind(kind.to_string())
            .bind(id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// Full-store snapshot for backup.
    pub async fn export_all(&self) -> ClientResult<Vec<StoredEntity>> {
        let rows = sqlx::query(Queries::EXPORT_ALL).fetch_all(&self.pool).await?;
        rows.iter().map(Self::parse_entity).collect()
    }

    /// Additive restore: existing rows not present in the snapshot are kept.
    /// Callers wanting a full replace must call `clear` first.
    pub async fn import_all(&self, entities: &[StoredEntity]) -> ClientResult<()> {
        let mut tx = self.pool.begin().await?;
        for entity in entities {
            let payload_json = serde_json::to_string(&entity.payload)?;
            sqlx::query(Queries::UPSERT_ENTITY)
                .bind(entity.kind.to_string())
                .bind(&entity.id)
                .bind(payload_json)
                .bind(entity.updated_at.to_rfc3339())
                .bind(entity.synced as i64)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn clear(&self) -> ClientResult<()> {
        sqlx::query(Queries::CLEAR_ENTITIES).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn storage_usage(&self) -> ClientResult<StorageUsage> {
        let row = sqlx::query(Queries::STORAGE_USED)
            .fetch_one(&self.pool)
            .await?;
        let used: i64 = row.try_get("used")?;

        Ok(StorageUsage {
            used_bytes: used.max(0) as u64,
            quota_bytes: self.config.quota_bytes,
        })
    }

    fn parse_entity(row: &SqliteRow) -> ClientResult<StoredEntity> {
        let kind: String = row.try_get("kind")?;
        let id: String = row.try_get("id")?;
        let payload: String = row.try_get("payload")?;
        let updated_at: String = row.try_get("updated_at")?;
        let synced: i64 = row.try_get("synced")?;

        Ok(StoredEntity {
            kind: EntityKind::from_str(&kind)
                .map_err(|_| ClientError::InvalidState(format!("unknown entity kind '{kind}'")))?,
            id,
            payload: serde_json::from_str(&payload)?,
            updated_at: DateTime::parse_from_rfc3339(&updated_at)?.with_timezone(&Utc),
            synced: synced != 0,
        })
    }
}
