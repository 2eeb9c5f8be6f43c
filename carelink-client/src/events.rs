//! In-process typed publish/subscribe used by the real-time channel and the
//! reconciliation loop. Handlers run synchronously in registration order; a
//! panicking handler is isolated and logged, the rest still run.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use carelink_core::{EntityKind, OutboxAction, ServerFrame};
use chrono::{DateTime, Utc};

/// Everything observable by the host application, as one tagged union.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    // Channel lifecycle
    Connected,
    Disconnected { code: Option<u16> },
    ReconnectFailed,

    // Inbound server frames, republished under their wire tag
    ConnectionEstablished,
    SubscriptionConfirmed { conversation_id: String },
    NewMessage { conversation_id: String, message: serde_json::Value },
    ConversationUpdate { conversation: serde_json::Value },
    TypingIndicator { conversation_id: String, user_id: String, is_typing: bool },
    MessageReaction { message_id: String, reaction: String, user_id: String, timestamp: DateTime<Utc> },
    MessageRating { message_id: String, rating: i32, feedback: Option<String>, user_id: String, timestamp: DateTime<Utc> },
    MessageStatusUpdate { message_id: Option<String>, status: Option<String> },
    Pong,
    ServerError { message: String },

    // Reconciliation loop
    SyncStarted,
    SyncCompleted { delivered: usize },
    SyncFailedPermanently { kind: EntityKind, entity_id: String, action: OutboxAction },
    SyncError { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Connected,
    Disconnected,
    ReconnectFailed,
    ConnectionEstablished,
    SubscriptionConfirmed,
    NewMessage,
    ConversationUpdate,
    TypingIndicator,
    MessageReaction,
    MessageRating,
    MessageStatusUpdate,
    Pong,
    ServerError,
    SyncStarted,
    SyncCompleted,
    SyncFailedPermanently,
    SyncError,
}

impl ClientEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ClientEvent::Connected => EventKind::Connected,
            ClientEvent::Disconnected { .. } => EventKind::Disconnected,
            ClientEvent::ReconnectFailed => EventKind::ReconnectFailed,
            ClientEvent::ConnectionEstablished => EventKind::ConnectionEstablished,
            ClientEvent::SubscriptionConfirmed { .. } => EventKind::SubscriptionConfirmed,
            ClientEvent::NewMessage { .. } => EventKind::NewMessage,
            ClientEvent::ConversationUpdate { .. } => EventKind::ConversationUpdate,
            ClientEvent::TypingIndicator { .. } => EventKind::TypingIndicator,
            ClientEvent::MessageReaction { .. } => EventKind::MessageReaction,
            ClientEvent::MessageRating { .. } => EventKind::MessageRating,
            ClientEvent::MessageStatusUpdate { .. } => EventKind::MessageStatusUpdate,
            ClientEvent::Pong => EventKind::Pong,
            ClientEvent::ServerError { .. } => EventKind::ServerError,
            ClientEvent::SyncStarted => EventKind::SyncStarted,
            ClientEvent::SyncCompleted { .. } => EventKind::SyncCompleted,
            ClientEvent::SyncFailedPermanently { .. } => EventKind::SyncFailedPermanently,
            ClientEvent::SyncError { .. } => EventKind::SyncError,
        }
    }
}

impl From<ServerFrame> for ClientEvent {
    fn from(frame: ServerFrame) -> Self {
        match frame {
            ServerFrame::ConnectionEstablished => ClientEvent::ConnectionEstablished,
            ServerFrame::SubscriptionConfirmed { conversation_id } => {
                ClientEvent::SubscriptionConfirmed { conversation_id }
            }
            ServerFrame::NewMessage {
                conversation_id,
                message,
            } => ClientEvent::NewMessage {
                conversation_id,
                message,
            },
            ServerFrame::ConversationUpdate { conversation } => {
                ClientEvent::ConversationUpdate { conversation }
            }
            ServerFrame::TypingIndicator {
                conversation_id,
                user_id,
                is_typing,
            } => ClientEvent::TypingIndicator {
                conversation_id,
                user_id,
                is_typing,
            },
            ServerFrame::MessageReaction {
                message_id,
                reaction,
                user_id,
                timestamp,
            } => ClientEvent::MessageReaction {
                message_id,
                reaction,
                user_id,
                timestamp,
            },
            ServerFrame::MessageRating {
                message_id,
                rating,
                feedback,
                user_id,
                timestamp,
            } => ClientEvent::MessageRating {
                message_id,
                rating,
                feedback,
                user_id,
                timestamp,
            },
            ServerFrame::MessageStatusUpdate { message_id, status } => {
                ClientEvent::MessageStatusUpdate { message_id, status }
            }
            ServerFrame::Pong => ClientEvent::Pong,
            ServerFrame::Error { message } => ClientEvent::ServerError { message },
        }
    }
}

pub type HandlerId = u64;

type Handler = Arc<dyn Fn(&ClientEvent) + Send + Sync>;

struct HandlerEntry {
    id: HandlerId,
    filter: Option<EventKind>,
    handler: Handler,
}

pub struct EventBus {
    handlers: Mutex<Vec<HandlerEntry>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a handler, optionally narrowed to a single event kind.
    pub fn on<F>(&self, filter: Option<EventKind>, handler: F) -> HandlerId
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut handlers) = self.handlers.lock() {
            handlers.push(HandlerEntry {
                id,
                filter,
                handler: Arc::new(handler),
            });
        }
        id
    }

    /// Remove a handler. Returns false when the id is unknown.
    pub fn off(&self, id: HandlerId) -> bool {
        match self.handlers.lock() {
            Ok(mut handlers) => {
                let before = handlers.len();
                handlers.retain(|entry| entry.id != id);
                handlers.len() != before
            }
            Err(_) => false,
        }
    }

    /// Dispatch runs on a snapshot of the handler list taken under the lock,
    /// so a handler may call `on`, `off` or `emit` without deadlocking. A
    /// handler removed mid-dispatch still sees the event being dispatched.
    pub fn emit(&self, event: ClientEvent) {
        let snapshot: Vec<Handler> = {
            let handlers = match self.handlers.lock() {
                Ok(handlers) => handlers,
                Err(_) => {
                    tracing::error!("event bus handler list poisoned, dropping event");
                    return;
                }
            };
            handlers
                .iter()
                .filter(|entry| entry.filter.is_none() || entry.filter == Some(event.kind()))
                .map(|entry| entry.handler.clone())
                .collect()
        };

        for handler in snapshot {
            if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                tracing::error!(event = ?event.kind(), "event handler panicked");
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
