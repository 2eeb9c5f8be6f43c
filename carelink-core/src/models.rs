use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Retries granted to an outbox item before it is dropped from the queue.
pub const DEFAULT_MAX_RETRIES: i64 = 3;

/// Logical collection an entity belongs to. Each kind maps to one of the
/// local persistence collections and to one sync endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EntityKind {
    Message,
    MedicalRecord,
    Conversation,
}

/// A locally persisted domain record. `synced == false` means the local copy
/// carries mutations the server has not confirmed yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEntity {
    pub kind: EntityKind,
    pub id: String,
    pub payload: serde_json::Value,
    pub updated_at: DateTime<Utc>,
    pub synced: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OutboxAction {
    Create,
    Update,
    Delete,
}

/// A pending local mutation awaiting confirmation from the server.
///
/// Invariant: `0 <= retry_count <= max_retries`. An item sitting at
/// `retry_count == max_retries` that fails once more is dropped, not retried.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxItem {
    pub id: i64,
    pub kind: EntityKind,
    pub entity_id: String,
    pub action: OutboxAction,
    pub payload: serde_json::Value,
    pub retry_count: i64,
    pub max_retries: i64,
    pub enqueued_at: DateTime<Utc>,
}

impl OutboxItem {
    /// Whether another failure should drop this item instead of retrying it.
    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Local database footprint, reported for diagnostics.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StorageUsage {
    pub used_bytes: u64,
    pub quota_bytes: u64,
}

impl StorageUsage {
    pub fn percent(&self) -> f64 {
        if self.quota_bytes == 0 {
            return 0.0;
        }
        (self.used_bytes as f64 / self.quota_bytes as f64) * 100.0
    }
}
