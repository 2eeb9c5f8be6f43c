use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use carelink_core::{ClientFrame, ConnectionStatus, ServerFrame, NORMAL_CLOSURE};
use futures_util::future::BoxFuture;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use crate::errors::ClientResult;
use crate::events::{ClientEvent, EventBus};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub server_url: String,
    pub base_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub heartbeat_interval: Duration,
    pub typing_quiet_period: Duration,
}

impl ChannelConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            base_delay: Duration::from_secs(1),
            max_reconnect_attempts: 5,
            heartbeat_interval: Duration::from_secs(30),
            typing_quiet_period: Duration::from_secs(3),
        }
    }
}

/// Reconnect backoff: `base * 2^(attempt - 1)` for attempt >= 1.
pub fn reconnect_delay(base: Duration, attempt: u32) -> Duration {
    base * 2u32.saturating_pow(attempt.saturating_sub(1))
}

enum Outbound {
    Frame(ClientFrame),
    Close,
}

struct ChannelState {
    user_id: Option<Uuid>,
    status: ConnectionStatus,
    reconnect_attempts: u32,
    subscriptions: BTreeSet<String>,
    writer: Option<mpsc::Sender<Outbound>>,
    reader_task: Option<JoinHandle<()>>,
    heartbeat_task: Option<JoinHandle<()>>,
    reconnect_task: Option<JoinHandle<()>>,
    typing_timers: HashMap<String, JoinHandle<()>>,
    // Bumped on every connection change; tasks from an older connection
    // compare it before touching state so late callbacks cannot clobber a
    // newer connection.
    epoch: u64,
}

struct Inner {
    config: ChannelConfig,
    bus: Arc<EventBus>,
    state: Mutex<ChannelState>,
}

/// Persistent bidirectional connection for server-pushed events: connect,
/// exponential-backoff reconnect, heartbeat, per-conversation subscription
/// bookkeeping, typing debounce, inbound dispatch onto the event bus.
///
/// Failures are contained inside the state machine; none of the methods
/// surface transport errors to the caller.
#[derive(Clone)]
pub struct RealtimeChannel {
    inner: Arc<Inner>,
}

impl RealtimeChannel {
    pub fn new(config: ChannelConfig, bus: Arc<EventBus>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                bus,
                state: Mutex::new(ChannelState {
                    user_id: None,
                    status: ConnectionStatus::Disconnected,
                    reconnect_attempts: 0,
                    subscriptions: BTreeSet::new(),
                    writer: None,
                    reader_task: None,
                    heartbeat_task: None,
                    reconnect_task: None,
                    typing_timers: HashMap::new(),
                    epoch: 0,
                }),
            }),
        }
    }

    pub async fn status(&self) -> ConnectionStatus {
        self.inner.state.lock().await.status
    }

    pub async fn reconnect_attempts(&self) -> u32 {
        self.inner.state.lock().await.reconnect_attempts
    }

    pub async fn active_subscriptions(&self) -> Vec<String> {
        let state = self.inner.state.lock().await;
        state.subscriptions.iter().cloned().collect()
    }

    /// Open the channel for a user session. A no-op when already connected
    /// for the same user. A failed attempt schedules a reconnect instead of
    /// returning an error.
    pub async fn connect(&self, user_id: Uuid) -> ClientResult<()> {
        {
            let mut state = self.inner.state.lock().await;
            if state.status == ConnectionStatus::Connected && state.user_id == Some(user_id) {
                return Ok(());
            }
            if let Some(task) = state.reconnect_task.take() {
                task.abort();
            }
            state.user_id = Some(user_id);
            state.reconnect_attempts = 0;
        }

        if !Inner::try_connect(&self.inner).await {
            Inner::schedule_reconnect(self.inner.clone()).await;
        }
        Ok(())
    }

    /// Explicit disconnect with a normal closure code. Cancels the pending
    /// reconnect, heartbeat and typing timers.
    pub async fn disconnect(&self) {
        let writer = {
            let mut state = self.inner.state.lock().await;
            state.epoch += 1;
            state.status = ConnectionStatus::Disconnected;
            state.reconnect_attempts = 0;
            if let Some(task) = state.reconnect_task.take() {
                task.abort();
            }
            if let Some(task) = state.heartbeat_task.take() {
                task.abort();
            }
            if let Some(task) = state.reader_task.take() {
                task.abort();
            }
            for (_, task) in state.typing_timers.drain() {
                task.abort();
            }
            state.writer.take()
        };

        if let Some(tx) = writer {
            let _ = tx.send(Outbound::Close).await;
        }
        self.inner.bus.emit(ClientEvent::Disconnected {
            code: Some(NORMAL_CLOSURE),
        });
    }

    /// Idempotent set membership. Membership is tracked regardless of
    /// connection state so a reconnect can replay it; the control frame is
    /// only sent while connected.
    pub async fn subscribe(&self, conversation_id: &str) {
        let writer = {
            let mut state = self.inner.state.lock().await;
            if !state.subscriptions.insert(conversation_id.to_string()) {
                return;
            }
            connected_writer(&state)
        };
        if let Some(tx) = writer {
            let _ = tx
                .send(Outbound::Frame(ClientFrame::SubscribeConversation {
                    conversation_id: conversation_id.to_string(),
                }))
                .await;
        }
    }

    pub async fn unsubscribe(&self, conversation_id: &str) {
        let writer = {
            let mut state = self.inner.state.lock().await;
            if !state.subscriptions.remove(conversation_id) {
                return;
            }
            connected_writer(&state)
        };
        if let Some(tx) = writer {
            let _ = tx
                .send(Outbound::Frame(ClientFrame::UnsubscribeConversation {
                    conversation_id: conversation_id.to_string(),
                }))
                .await;
        }
    }

    /// Typing start (re)arms a quiet-period timer that auto-sends a typing
    /// stop; typing stop cancels it.
    pub async fn set_typing(&self, conversation_id: &str, is_typing: bool) {
        let writer = {
            let mut state = self.inner.state.lock().await;
            if let Some(timer) = state.typing_timers.remove(conversation_id) {
                timer.abort();
            }
            if is_typing {
                let inner = self.inner.clone();
                let conversation = conversation_id.to_string();
                let quiet = self.inner.config.typing_quiet_period;
                state.typing_timers.insert(
                    conversation_id.to_string(),
                    tokio::spawn(async move {
                        tokio::time::sleep(quiet).await;
                        let writer = {
                            let mut state = inner.state.lock().await;
                            state.typing_timers.remove(&conversation);
                            connected_writer(&state)
                        };
                        if let Some(tx) = writer {
                            let _ = tx
                                .send(Outbound::Frame(ClientFrame::TypingStop {
                                    conversation_id: conversation,
                                }))
                                .await;
                        }
                    }),
                );
            }
            connected_writer(&state)
        };

        if let Some(tx) = writer {
            let frame = if is_typing {
                ClientFrame::TypingStart {
                    conversation_id: conversation_id.to_string(),
                }
            } else {
                ClientFrame::TypingStop {
                    conversation_id: conversation_id.to_string(),
                }
            };
            let _ = tx.send(Outbound::Frame(frame)).await;
        }
    }

    /// Send a read receipt for a message. Dropped silently while offline.
    pub async fn mark_message_read(&self, message_id: &str) {
        let writer = {
            let state = self.inner.state.lock().await;
            connected_writer(&state)
        };
        if let Some(tx) = writer {
            let _ = tx
                .send(Outbound::Frame(ClientFrame::MessageRead {
                    message_id: message_id.to_string(),
                }))
                .await;
        }
    }
}

fn connected_writer(state: &ChannelState) -> Option<mpsc::Sender<Outbound>> {
    if state.status == ConnectionStatus::Connected {
        state.writer.clone()
    } else {
        None
    }
}

impl Inner {
    /// One connection attempt for the stored user id. Returns true when the
    /// channel is connected (or the attempt was superseded by a concurrent
    /// disconnect).
    ///
    /// Boxed so the compiler can prove the recursive
    /// `try_connect` -> `read_loop` -> `schedule_reconnect` -> `try_connect`
    /// cycle of spawned futures is `Send`.
    fn try_connect(inner: &Arc<Inner>) -> BoxFuture<'_, bool> {
        Box::pin(Self::try_connect_impl(inner))
    }

    async fn try_connect_impl(inner: &Arc<Inner>) -> bool {
        let (url, pre_epoch) = {
            let mut state = inner.state.lock().await;
            let Some(user_id) = state.user_id else {
                return false;
            };
            state.status = ConnectionStatus::Connecting;
            (
                format!("{}/ws/{}", inner.config.server_url, user_id),
                state.epoch,
            )
        };

        match connect_async(&url).await {
            Ok((ws_stream, _)) => {
                let mut state = inner.state.lock().await;
                if state.epoch != pre_epoch {
                    // Superseded by an explicit disconnect while the
                    // handshake was in flight.
                    return true;
                }

                // Tear down any live connection this one supersedes, e.g.
                // connect with a different user id. The old reader must not
                // keep republishing frames on the bus.
                if let Some(task) = state.reader_task.take() {
                    task.abort();
                }
                if let Some(task) = state.heartbeat_task.take() {
                    task.abort();
                }
                if let Some(old) = state.writer.take() {
                    let _ = old.try_send(Outbound::Close);
                }

                let (write, read) = ws_stream.split();
                let (tx, rx) = mpsc::channel::<Outbound>(100);

                state.epoch += 1;
                let epoch = state.epoch;
                state.status = ConnectionStatus::Connected;
                state.reconnect_attempts = 0;
                state.writer = Some(tx.clone());

                tokio::spawn(Self::write_loop(write, rx));

                let reader_inner = inner.clone();
                state.reader_task = Some(tokio::spawn(async move {
                    Self::read_loop(reader_inner, read, epoch).await;
                }));

                let hb_tx = tx.clone();
                let interval = inner.config.heartbeat_interval;
                state.heartbeat_task = Some(tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(interval);
                    ticker.tick().await; // the first tick fires immediately
                    loop {
                        ticker.tick().await;
                        if hb_tx.send(Outbound::Frame(ClientFrame::Ping)).await.is_err() {
                            break;
                        }
                    }
                }));

                // Replay every subscription the UI still cares about.
                for conversation_id in state.subscriptions.iter() {
                    let _ = tx
                        .send(Outbound::Frame(ClientFrame::SubscribeConversation {
                            conversation_id: conversation_id.clone(),
                        }))
                        .await;
                }
                drop(state);

                tracing::info!(url = %url, "channel connected");
                inner.bus.emit(ClientEvent::Connected);
                true
            }
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "channel connect failed");
                {
                    let mut state = inner.state.lock().await;
                    if state.epoch != pre_epoch {
                        return true;
                    }
                    state.status = ConnectionStatus::Disconnected;
                }
                inner.bus.emit(ClientEvent::Disconnected { code: None });
                false
            }
        }
    }

    async fn write_loop(mut write: SplitSink<WsStream, Message>, mut rx: mpsc::Receiver<Outbound>) {
        while let Some(outbound) = rx.recv().await {
            match outbound {
                Outbound::Frame(frame) => {
                    let json = match serde_json::to_string(&frame) {
                        Ok(json) => json,
                        Err(e) => {
                            tracing::error!(error = %e, "failed to encode outbound frame");
                            continue;
                        }
                    };
                    if write.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = write
                        .send(Message::Close(Some(CloseFrame {
                            code: CloseCode::Normal,
                            reason: "client disconnect".into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    }

    async fn read_loop(inner: Arc<Inner>, mut read: SplitStream<WsStream>, epoch: u64) {
        let mut close_code: Option<u16> = None;
        while let Some(msg) = read.next().await {
            match msg {
                Ok(Message::Text(text)) => match serde_json::from_str::<ServerFrame>(&text) {
                    Ok(frame) => inner.bus.emit(frame.into()),
                    Err(e) => {
                        tracing::warn!(error = %e, "dropping unrecognized channel frame");
                    }
                },
                Ok(Message::Close(frame)) => {
                    close_code = frame.as_ref().map(|f| u16::from(f.code));
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "channel read error");
                    break;
                }
            }
        }
        let normal = close_code == Some(NORMAL_CLOSURE);
        Self::handle_connection_lost(inner, epoch, close_code, normal).await;
    }

    async fn handle_connection_lost(
        inner: Arc<Inner>,
        epoch: u64,
        code: Option<u16>,
        normal: bool,
    ) {
        {
            let mut state = inner.state.lock().await;
            if state.epoch != epoch {
                // An explicit disconnect or a newer connection already
                // owns the state.
                return;
            }
            state.status = ConnectionStatus::Disconnected;
            state.writer = None;
            if let Some(task) = state.heartbeat_task.take() {
                task.abort();
            }
            for (_, task) in state.typing_timers.drain() {
                task.abort();
            }
        }
        tracing::warn!(?code, "channel connection lost");
        inner.bus.emit(ClientEvent::Disconnected { code });
        if !normal {
            Self::schedule_reconnect(inner).await;
        }
    }

    /// Spawn the retry loop: sleep, reattempt, repeat until connected or the
    /// attempt cap is hit. A no-op when a loop is already running.
    async fn schedule_reconnect(inner: Arc<Inner>) {
        let mut state = inner.state.lock().await;
        if state.reconnect_task.is_some() {
            return;
        }
        let task_inner = inner.clone();
        state.reconnect_task = Some(tokio::spawn(async move {
            loop {
                let delay = {
                    let mut state = task_inner.state.lock().await;
                    state.reconnect_attempts += 1;
                    if state.reconnect_attempts > task_inner.config.max_reconnect_attempts {
                        state.reconnect_task = None;
                        drop(state);
                        tracing::warn!("reconnect attempts exhausted, waiting for explicit connect");
                        task_inner.bus.emit(ClientEvent::ReconnectFailed);
                        return;
                    }
                    let delay =
                        reconnect_delay(task_inner.config.base_delay, state.reconnect_attempts);
                    tracing::info!(
                        attempt = state.reconnect_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "scheduling reconnect"
                    );
                    delay
                };
                tokio::time::sleep(delay).await;
                if Self::try_connect(&task_inner).await {
                    task_inner.state.lock().await.reconnect_task.take();
                    return;
                }
            }
        }));
    }
}
