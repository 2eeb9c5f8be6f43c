use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use carelink_core::OutboxAction;

use crate::errors::{ClientError, ClientResult};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared handle for the bearer credential attached to outbound sync
/// requests. Cleared on logout; the engine itself never inspects it.
#[derive(Clone, Default)]
pub struct BearerToken(Arc<RwLock<Option<String>>>);

impl BearerToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Arc::new(RwLock::new(Some(token.into()))))
    }

    pub fn set(&self, token: impl Into<String>) {
        if let Ok(mut guard) = self.0.write() {
            *guard = Some(token.into());
        }
    }

    pub fn clear(&self) {
        if let Ok(mut guard) = self.0.write() {
            *guard = None;
        }
    }

    pub fn get(&self) -> Option<String> {
        self.0.read().ok().and_then(|guard| guard.clone())
    }
}

/// Per-entity-kind delivery of outbox items. Implementations must always
/// settle (enforce their own timeout); the reconciliation loop will not
/// impose one.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn deliver(
        &self,
        action: OutboxAction,
        entity_id: &str,
        payload: &serde_json::Value,
    ) -> ClientResult<()>;
}

/// HTTP delivery to a type-specific REST endpoint. Create posts the payload
/// to the collection, update puts it to the item, delete sends no body.
/// Any non-2xx status is a retryable failure.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    endpoint: String,
    token: BearerToken,
}

impl HttpTransport {
    pub fn new(
        base_url: impl Into<String>,
        endpoint: impl Into<String>,
        token: BearerToken,
    ) -> ClientResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into(),
            endpoint: endpoint.into(),
            token,
        })
    }

    fn collection_url(&self) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), self.endpoint)
    }

    fn item_url(&self, entity_id: &str) -> String {
        format!("{}/{}", self.collection_url(), entity_id)
    }
}

#[async_trait]
impl SyncTransport for HttpTransport {
    async fn deliver(
        &self,
        action: OutboxAction,
        entity_id: &str,
        payload: &serde_json::Value,
    ) -> ClientResult<()> {
        let request = match action {
            OutboxAction::Create => self.client.post(self.collection_url()).json(payload),
            OutboxAction::Update => self.client.put(self.item_url(entity_id)).json(payload),
            OutboxAction::Delete => self.client.delete(self.item_url(entity_id)),
        };

        let request = match self.token.get() {
            Some(token) => request.bearer_auth(token),
            None => request,
        };

        let response = request
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(ClientError::Transport(format!(
                "{} {} returned {}",
                action,
                entity_id,
                response.status()
            )))
        }
    }
}
