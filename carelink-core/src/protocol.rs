use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Close code sent on an explicit client disconnect. Any other close code is
/// abnormal and triggers the reconnect policy.
pub const NORMAL_CLOSURE: u16 = 1000;

/// Control messages sent by the client over the real-time channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    SubscribeConversation {
        conversation_id: String,
    },
    UnsubscribeConversation {
        conversation_id: String,
    },
    TypingStart {
        conversation_id: String,
    },
    TypingStop {
        conversation_id: String,
    },
    MessageRead {
        message_id: String,
    },

    // Heartbeat
    Ping,
}

/// Server-pushed messages arriving on the real-time channel. Frames with an
/// unrecognized tag fail to parse and are dropped by the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    ConnectionEstablished,
    SubscriptionConfirmed {
        conversation_id: String,
    },
    NewMessage {
        conversation_id: String,
        message: serde_json::Value,
    },
    ConversationUpdate {
        conversation: serde_json::Value,
    },
    TypingIndicator {
        conversation_id: String,
        user_id: String,
        is_typing: bool,
    },
    MessageReaction {
        message_id: String,
        reaction: String,
        user_id: String,
        timestamp: DateTime<Utc>,
    },
    MessageRating {
        message_id: String,
        rating: i32,
        #[serde(default)]
        feedback: Option<String>,
        user_id: String,
        timestamp: DateTime<Utc>,
    },
    MessageStatusUpdate {
        #[serde(default)]
        message_id: Option<String>,
        #[serde(default)]
        status: Option<String>,
    },

    // Heartbeat
    Pong,

    // Errors
    Error {
        message: String,
    },
}
