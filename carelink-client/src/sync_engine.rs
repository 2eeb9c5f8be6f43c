use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use carelink_core::{EntityKind, OutboxAction, OutboxItem};
use tokio::task::JoinHandle;

use crate::connectivity::ConnectivitySignal;
use crate::errors::{ClientError, ClientResult};
use crate::events::{ClientEvent, EventBus};
use crate::outbox::Outbox;
use crate::store::EntityStore;
use crate::transport::SyncTransport;

#[derive(Debug, Clone, Copy)]
pub struct SyncConfig {
    /// Period of the catch-up drain while online.
    pub tick_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(30),
        }
    }
}

/// Outcome of one `drain` call. `skipped` means no pass ran at all: offline,
/// sync disabled, or another drain already in flight.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub delivered: usize,
    pub retried: usize,
    pub dropped: usize,
    pub skipped: bool,
}

impl DrainReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}

/// Drains the outbox against per-entity-kind transports, applying the
/// retry/drop policy, and keeps entity sync flags up to date. Local writes
/// go through `submit_local` so the entity row and its outbox entry commit
/// atomically.
pub struct SyncEngine {
    store: Arc<EntityStore>,
    outbox: Outbox,
    connectivity: ConnectivitySignal,
    bus: Arc<EventBus>,
    transports: RwLock<HashMap<EntityKind, Arc<dyn SyncTransport>>>,
    drain_in_flight: AtomicBool,
    sync_enabled: AtomicBool,
    config: SyncConfig,
}

impl SyncEngine {
    pub fn new(store: Arc<EntityStore>, connectivity: ConnectivitySignal, bus: Arc<EventBus>) -> Self {
        Self::with_config(store, connectivity, bus, SyncConfig::default())
    }

    pub fn with_config(
        store: Arc<EntityStore>,
        connectivity: ConnectivitySignal,
        bus: Arc<EventBus>,
        config: SyncConfig,
    ) -> Self {
        let outbox = Outbox::new(store.pool().clone());
        Self {
            store,
            outbox,
            connectivity,
            bus,
            transports: RwLock::new(HashMap::new()),
            drain_in_flight: AtomicBool::new(false),
            sync_enabled: AtomicBool::new(true),
            config,
        }
    }

    pub fn register_transport(&self, kind: EntityKind, transport: Arc<dyn SyncTransport>) {
        if let Ok(mut transports) = self.transports.write() {
            transports.insert(kind, transport);
        }
    }

    /// Logged-out signal: disabling stops all draining until re-enabled.
    pub fn set_sync_enabled(&self, enabled: bool) {
        self.sync_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub async fn pending_count(&self) -> ClientResult<u64> {
        self.outbox.len().await
    }

    /// Apply a local mutation: the entity write and the matching outbox
    /// entry commit in one transaction, so a crash can never leave local
    /// state without its queue item. Returns the outbox item id.
    pub async fn submit_local(
        &self,
        kind: EntityKind,
        entity_id: &str,
        action: OutboxAction,
        payload: serde_json::Value,
    ) -> ClientResult<i64> {
        let mut tx = self.store.begin().await?;
        match action {
            OutboxAction::Create | OutboxAction::Update => {
                self.store
                    .put_in(&mut tx, kind, entity_id, &payload, false)
                    .await?;
            }
            OutboxAction::Delete => {
                self.store.remove_in(&mut tx, kind, entity_id).await?;
            }
        }
        let item_id = self
            .outbox
            .enqueue_in(&mut tx, kind, entity_id, action, &payload)
            .await?;
        tx.commit().await?;

        tracing::debug!(%kind, entity_id, %action, item_id, "queued local mutation");
        Ok(item_id)
    }

    /// Drain the outbox in enqueue order. A no-op while offline or logged
    /// out; concurrent calls coalesce into the one already running. Item
    /// failures are contained per item and never propagate out of here.
    pub async fn drain(&self) -> DrainReport {
        if !self.sync_enabled.load(Ordering::SeqCst) || !self.connectivity.is_online() {
            return DrainReport::skipped();
        }
        if self.drain_in_flight.swap(true, Ordering::SeqCst) {
            return DrainReport::skipped();
        }
        let report = self.drain_queue().await;
        self.drain_in_flight.store(false, Ordering::SeqCst);
        report
    }

    async fn drain_queue(&self) -> DrainReport {
        let mut report = DrainReport::default();
        let items = match self.outbox.pending().await {
            Ok(items) => items,
            Err(e) => {
                tracing::error!(error = %e, "failed to read sync queue");
                self.bus.emit(ClientEvent::SyncError {
                    message: e.to_string(),
                });
                return report;
            }
        };
        if items.is_empty() {
            return report;
        }

        self.bus.emit(ClientEvent::SyncStarted);
        for item in items {
            match self.deliver(&item).await {
                Ok(()) => {
                    self.confirm(&item).await;
                    report.delivered += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        item = item.id,
                        retry_count = item.retry_count,
                        error = %e,
                        "outbox delivery failed"
                    );
                    if item.retries_exhausted() {
                        self.drop_item(&item).await;
                        report.dropped += 1;
                    } else {
                        if let Err(e) = self.outbox.increment_retry(item.id).await {
                            tracing::error!(item = item.id, error = %e, "failed to bump retry count");
                        }
                        report.retried += 1;
                    }
                }
            }
        }
        self.bus.emit(ClientEvent::SyncCompleted {
            delivered: report.delivered,
        });
        report
    }

    async fn deliver(&self, item: &OutboxItem) -> ClientResult<()> {
        let transport = self
            .transports
            .read()
            .ok()
            .and_then(|transports| transports.get(&item.kind).cloned())
            .ok_or(ClientError::NoTransport(item.kind))?;
        transport
            .deliver(item.action, &item.entity_id, &item.payload)
            .await
    }

    async fn confirm(&self, item: &OutboxItem) {
        if let Err(e) = self.outbox.remove(item.id).await {
            // The item will be redelivered on the next drain; the server
            // treats replays as idempotent.
            tracing::error!(item = item.id, error = %e, "failed to dequeue delivered item");
            return;
        }
        if item.action != OutboxAction::Delete {
            // Tolerates the row having been deleted concurrently.
            if let Err(e) = self.store.mark_synced(item.kind, &item.entity_id).await {
                tracing::error!(
                    entity = %item.entity_id,
                    error = %e,
                    "failed to mark entity synced"
                );
                self.bus.emit(ClientEvent::SyncError {
                    message: e.to_string(),
                });
            }
        }
    }

    async fn drop_item(&self, item: &OutboxItem) {
        if let Err(e) = self.outbox.remove(item.id).await {
            tracing::error!(item = item.id, error = %e, "failed to drop exhausted item");
            return;
        }
        tracing::warn!(
            %item.kind,
            entity = %item.entity_id,
            "dropping outbox item after exhausting retries"
        );
        self.bus.emit(ClientEvent::SyncFailedPermanently {
            kind: item.kind,
            entity_id: item.entity_id.clone(),
            action: item.action,
        });
    }

    /// Background triggers: drain on every offline-to-online transition and
    /// on a periodic tick. Abort the returned handles on shutdown.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let engine = self.clone();
        let mut rx = self.connectivity.subscribe();
        // Baseline read before the task is spawned; a transition that lands
        // ahead of the task's first poll must still count as a change.
        let mut was_online = *rx.borrow_and_update();
        handles.push(tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let online = *rx.borrow_and_update();
                if online && !was_online {
                    engine.drain().await;
                }
                was_online = online;
            }
        }));

        let engine = self.clone();
        let tick = self.config.tick_interval;
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            ticker.tick().await; // the first tick fires immediately
            loop {
                ticker.tick().await;
                engine.drain().await;
            }
        }));

        handles
    }
}
