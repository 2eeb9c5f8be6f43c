use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use carelink_client::{
    ClientError, ClientEvent, ClientResult, ConnectivitySignal, EventBus, EventKind, SyncEngine,
    SyncTransport,
};
use carelink_core::{EntityKind, OutboxAction};
use serde_json::json;
use uuid::Uuid;

/// Records every delivery and answers them from a pre-seeded script of
/// outcomes. Calls beyond the script succeed.
struct ScriptedTransport {
    calls: Mutex<Vec<(OutboxAction, String)>>,
    script: Mutex<VecDeque<bool>>,
}

impl ScriptedTransport {
    fn new(script: impl IntoIterator<Item = bool>) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            script: Mutex::new(script.into_iter().collect()),
        })
    }

    fn calls(&self) -> Vec<(OutboxAction, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SyncTransport for ScriptedTransport {
    async fn deliver(
        &self,
        action: OutboxAction,
        entity_id: &str,
        _payload: &serde_json::Value,
    ) -> ClientResult<()> {
        self.calls
            .lock()
            .unwrap()
            .push((action, entity_id.to_string()));
        let ok = self.script.lock().unwrap().pop_front().unwrap_or(true);
        if ok {
            Ok(())
        } else {
            Err(ClientError::Transport("scripted failure".to_string()))
        }
    }
}

/// Succeeds after holding the delivery open long enough to observe overlap.
struct SlowTransport {
    hold: Duration,
}

#[async_trait]
impl SyncTransport for SlowTransport {
    async fn deliver(
        &self,
        _action: OutboxAction,
        _entity_id: &str,
        _payload: &serde_json::Value,
    ) -> ClientResult<()> {
        tokio::time::sleep(self.hold).await;
        Ok(())
    }
}

struct Harness {
    engine: Arc<SyncEngine>,
    store: Arc<carelink_client::EntityStore>,
    connectivity: ConnectivitySignal,
    events: Arc<Mutex<Vec<ClientEvent>>>,
}

async fn setup(online: bool) -> Harness {
    let url = format!("file:{}?mode=memory&cache=shared", Uuid::new_v4());
    let store = Arc::new(carelink_client::EntityStore::new(&url).await.unwrap());
    let connectivity = ConnectivitySignal::new(online);
    let bus = Arc::new(EventBus::new());

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    bus.on(None, move |event| sink.lock().unwrap().push(event.clone()));

    let engine = Arc::new(SyncEngine::new(
        store.clone(),
        connectivity.clone(),
        bus.clone(),
    ));
    Harness {
        engine,
        store,
        connectivity,
        events,
    }
}

impl Harness {
    fn event_count(&self, kind: EventKind) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| event.kind() == kind)
            .count()
    }
}

#[tokio::test]
async fn test_drain_delivers_in_enqueue_order() {
    let h = setup(true).await;
    let transport = ScriptedTransport::new([]);
    h.engine
        .register_transport(EntityKind::Message, transport.clone());

    for id in ["m-1", "m-2", "m-3"] {
        h.engine
            .submit_local(EntityKind::Message, id, OutboxAction::Create, json!({"text": id}))
            .await
            .unwrap();
    }

    let report = h.engine.drain().await;
    assert_eq!(report.delivered, 3);
    assert!(!report.skipped);

    let ids: Vec<_> = transport.calls().into_iter().map(|(_, id)| id).collect();
    assert_eq!(ids, vec!["m-1", "m-2", "m-3"]);
    assert_eq!(h.engine.pending_count().await.unwrap(), 0);
    for id in ["m-1", "m-2", "m-3"] {
        assert!(h.store.get(EntityKind::Message, id).await.unwrap().unwrap().synced);
    }
}

#[tokio::test]
async fn test_drain_while_offline_is_a_noop() {
    let h = setup(false).await;
    h.engine
        .register_transport(EntityKind::Message, ScriptedTransport::new([]));
    h.engine
        .submit_local(EntityKind::Message, "m-1", OutboxAction::Create, json!({}))
        .await
        .unwrap();

    let report = h.engine.drain().await;
    assert!(report.skipped);
    assert_eq!(h.engine.pending_count().await.unwrap(), 1);
    assert_eq!(h.event_count(EventKind::SyncStarted), 0);
}

#[tokio::test]
async fn test_drain_while_sync_disabled_is_a_noop() {
    let h = setup(true).await;
    h.engine
        .register_transport(EntityKind::Message, ScriptedTransport::new([]));
    h.engine
        .submit_local(EntityKind::Message, "m-1", OutboxAction::Create, json!({}))
        .await
        .unwrap();

    h.engine.set_sync_enabled(false);
    assert!(h.engine.drain().await.skipped);
    assert_eq!(h.engine.pending_count().await.unwrap(), 1);

    h.engine.set_sync_enabled(true);
    assert_eq!(h.engine.drain().await.delivered, 1);
}

#[tokio::test]
async fn test_item_retries_then_succeeds() {
    let h = setup(true).await;
    let transport = ScriptedTransport::new([false, false, false, true]);
    h.engine
        .register_transport(EntityKind::Message, transport.clone());
    h.engine
        .submit_local(EntityKind::Message, "m-42", OutboxAction::Create, json!({"text": "hi"}))
        .await
        .unwrap();

    for expected_retry_count in [1, 2, 3] {
        let report = h.engine.drain().await;
        assert_eq!(report.retried, 1);
        assert_eq!(report.dropped, 0);
        let pending = h.engine.outbox().pending().await.unwrap();
        assert_eq!(pending[0].retry_count, expected_retry_count);
    }

    let report = h.engine.drain().await;
    assert_eq!(report.delivered, 1);
    assert_eq!(h.engine.pending_count().await.unwrap(), 0);
    assert!(h.store.get(EntityKind::Message, "m-42").await.unwrap().unwrap().synced);
    assert_eq!(h.event_count(EventKind::SyncFailedPermanently), 0);
}

#[tokio::test]
async fn test_exhausted_item_is_dropped_with_one_event() {
    let h = setup(true).await;
    let transport = ScriptedTransport::new([false, false, false, false, false]);
    h.engine
        .register_transport(EntityKind::Message, transport.clone());
    h.engine
        .submit_local(EntityKind::Message, "m-1", OutboxAction::Create, json!({"text": "hi"}))
        .await
        .unwrap();

    let mut dropped = 0;
    for _ in 0..5 {
        dropped += h.engine.drain().await.dropped;
    }

    assert_eq!(dropped, 1);
    assert_eq!(h.engine.pending_count().await.unwrap(), 0);
    assert_eq!(h.event_count(EventKind::SyncFailedPermanently), 1);
    // The local row survives the drop, still flagged unsynced.
    let entity = h.store.get(EntityKind::Message, "m-1").await.unwrap().unwrap();
    assert!(!entity.synced);
    // Three retries plus the final failed delivery.
    assert_eq!(transport.calls().len(), 4);
}

#[tokio::test]
async fn test_missing_transport_counts_as_failure() {
    let h = setup(true).await;
    h.engine
        .submit_local(EntityKind::MedicalRecord, "r-1", OutboxAction::Create, json!({}))
        .await
        .unwrap();

    let report = h.engine.drain().await;
    assert_eq!(report.retried, 1);
    let pending = h.engine.outbox().pending().await.unwrap();
    assert_eq!(pending[0].retry_count, 1);
}

#[tokio::test]
async fn test_failing_item_does_not_block_the_rest() {
    let h = setup(true).await;
    // First delivery fails, the second one goes through.
    let transport = ScriptedTransport::new([false, true]);
    h.engine
        .register_transport(EntityKind::Message, transport.clone());
    h.engine
        .submit_local(EntityKind::Message, "m-1", OutboxAction::Create, json!({}))
        .await
        .unwrap();
    h.engine
        .submit_local(EntityKind::Message, "m-2", OutboxAction::Create, json!({}))
        .await
        .unwrap();

    let report = h.engine.drain().await;
    assert_eq!(report.delivered, 1);
    assert_eq!(report.retried, 1);

    let pending = h.engine.outbox().pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].entity_id, "m-1");
    assert!(h.store.get(EntityKind::Message, "m-2").await.unwrap().unwrap().synced);
}

#[tokio::test]
async fn test_concurrent_drains_coalesce() {
    let h = setup(true).await;
    h.engine.register_transport(
        EntityKind::Message,
        Arc::new(SlowTransport {
            hold: Duration::from_millis(200),
        }),
    );
    h.engine
        .submit_local(EntityKind::Message, "m-1", OutboxAction::Create, json!({}))
        .await
        .unwrap();

    let engine = h.engine.clone();
    let first = tokio::spawn(async move { engine.drain().await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let second = h.engine.drain().await;
    assert!(second.skipped);

    let first = first.await.unwrap();
    assert_eq!(first.delivered, 1);
    assert_eq!(h.event_count(EventKind::SyncStarted), 1);
}

#[tokio::test]
async fn test_going_online_triggers_a_drain() {
    let h = setup(false).await;
    let transport = ScriptedTransport::new([]);
    h.engine
        .register_transport(EntityKind::Message, transport.clone());
    h.engine
        .submit_local(EntityKind::Message, "m-1", OutboxAction::Create, json!({}))
        .await
        .unwrap();

    let handles = h.engine.start();
    h.connectivity.set_online(true);

    let mut drained = false;
    for _ in 0..40 {
        tokio::time::sleep(Duration::from_millis(25)).await;
        if h.engine.pending_count().await.unwrap() == 0 {
            drained = true;
            break;
        }
    }
    assert!(drained, "queue was not drained after going online");
    assert_eq!(transport.calls().len(), 1);

    for handle in handles {
        handle.abort();
    }
}

#[tokio::test]
async fn test_drain_emits_lifecycle_events() {
    let h = setup(true).await;
    h.engine
        .register_transport(EntityKind::Message, ScriptedTransport::new([]));
    h.engine
        .submit_local(EntityKind::Message, "m-1", OutboxAction::Create, json!({}))
        .await
        .unwrap();

    h.engine.drain().await;

    assert_eq!(h.event_count(EventKind::SyncStarted), 1);
    let events = h.events.lock().unwrap();
    assert!(events.iter().any(|event| matches!(
        event,
        ClientEvent::SyncCompleted { delivered: 1 }
    )));
}

#[tokio::test]
async fn test_empty_queue_drain_emits_nothing() {
    let h = setup(true).await;
    let report = h.engine.drain().await;
    assert_eq!(report, carelink_client::DrainReport::default());
    assert_eq!(h.event_count(EventKind::SyncStarted), 0);
}
