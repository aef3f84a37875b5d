use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{
    AttachmentRef, ClientMessageId, ConversationId, CorrelationId, MessageId, MessageKind,
    MessageStatus, UserId,
};

/// Commands the client sends to the messaging server.
///
/// Serialized as `{"type": "...", "payload": {...}}` to match the server's
/// socket event contract; field names are camelCase on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
#[serde(rename_all_fields = "camelCase")]
pub enum ClientCommand {
    /// Auth handshake, first frame after transport establishment.
    Auth { token: String },
    /// Heartbeat probe; the server answers with [`ServerEvent::Pong`].
    Ping,
    SendMessage {
        conversation_id: ConversationId,
        client_id: ClientMessageId,
        kind: MessageKind,
        content: String,
        attachment: Option<AttachmentRef>,
        created_at: DateTime<Utc>,
    },
    EditMessage {
        conversation_id: ConversationId,
        message_id: MessageId,
        content: String,
    },
    DeleteMessage {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    AddReaction {
        conversation_id: ConversationId,
        message_id: MessageId,
        emoji: String,
    },
    RemoveReaction {
        conversation_id: ConversationId,
        message_id: MessageId,
        emoji: String,
    },
    Typing {
        conversation_id: ConversationId,
        typing: bool,
    },
    MarkRead {
        conversation_id: ConversationId,
    },
    LoadHistory {
        conversation_id: ConversationId,
        before: Option<DateTime<Utc>>,
        limit: u32,
    },
}

/// Outcome of the auth handshake, reported by the server as the first
/// event on a fresh transport.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeStatus {
    Connected,
    Rejected,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReactionAction {
    Add,
    Remove,
}

/// A server-confirmed message as it appears on the wire (remote delivery
/// and history pages).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub kind: MessageKind,
    pub content: String,
    pub attachment: Option<AttachmentRef>,
    pub server_timestamp: DateTime<Utc>,
    #[serde(default)]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reactions: Vec<(UserId, String)>,
}

/// Payload of a successful command acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerAck {
    pub correlation_id: CorrelationId,
    /// Present when the acked command was a send.
    pub client_id: Option<ClientMessageId>,
    pub message_id: Option<MessageId>,
    pub server_timestamp: Option<DateTime<Utc>>,
}

/// Events the server pushes to the client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
#[serde(rename_all_fields = "camelCase")]
pub enum ServerEvent {
    ConnectionStatus {
        status: HandshakeStatus,
        message: Option<String>,
    },
    Pong,
    Ack(ServerAck),
    AckFailed {
        correlation_id: CorrelationId,
        client_id: Option<ClientMessageId>,
        reason: String,
    },
    NewMessage {
        message: WireMessage,
    },
    MessageStatus {
        conversation_id: ConversationId,
        message_id: MessageId,
        status: MessageStatus,
    },
    MessageRead {
        conversation_id: ConversationId,
        message_ids: Vec<MessageId>,
    },
    MessageEdited {
        conversation_id: ConversationId,
        message_id: MessageId,
        sender_id: UserId,
        content: String,
        edited_at: DateTime<Utc>,
    },
    MessageDeleted {
        conversation_id: ConversationId,
        message_id: MessageId,
        sender_id: UserId,
        deleted_at: DateTime<Utc>,
    },
    Reaction {
        conversation_id: ConversationId,
        message_id: MessageId,
        user_id: UserId,
        emoji: String,
        action: ReactionAction,
    },
    Typing {
        conversation_id: ConversationId,
        user_id: UserId,
        typing: bool,
    },
    UserStatus {
        user_id: UserId,
        online: bool,
    },
    HistoryPage {
        conversation_id: ConversationId,
        messages: Vec<WireMessage>,
    },
    Error {
        correlation_id: Option<CorrelationId>,
        message: String,
    },
}

/// A correlation-tagged command as transmitted on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommandFrame {
    pub correlation_id: CorrelationId,
    #[serde(flatten)]
    pub command: ClientCommand,
}

impl CommandFrame {
    /// Wrap a command with a freshly generated correlation id.
    pub fn tag(command: ClientCommand) -> Self {
        Self {
            correlation_id: CorrelationId::new(),
            command,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }
}

impl ServerEvent {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }
}
