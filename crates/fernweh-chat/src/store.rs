//! Per-conversation message log with a deterministic reducer.
//!
//! Every mutation, local optimistic intent or remote server event,
//! goes through [`ConversationState::apply`]. The reducer never
//! suspends and never talks to the network, which makes replay, dedup, and
//! ordering decisions testable without a runtime.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use tracing::debug;

use fernweh_shared::error::SessionError;
use fernweh_shared::protocol::WireMessage;
use fernweh_shared::types::{
    AttachmentRef, ClientMessageId, ConversationId, MessageId, MessageKind, MessageStatus, UserId,
};

/// A message as held by the store. Before the server acks a local send,
/// only `client_id` identifies it; the ack supplies the durable `id` and
/// the authoritative timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: Option<MessageId>,
    pub client_id: Option<ClientMessageId>,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub kind: MessageKind,
    pub content: String,
    pub attachment: Option<AttachmentRef>,
    /// Client wall clock at authoring time; ordering falls back to this
    /// until the server timestamp arrives.
    pub created_at: DateTime<Utc>,
    pub server_timestamp: Option<DateTime<Utc>>,
    pub status: MessageStatus,
    /// Set semantics: at most one entry per (user, emoji).
    pub reactions: BTreeSet<(UserId, String)>,
    pub edited_at: Option<DateTime<Utc>>,
    /// Soft-delete marker; the entry stays in the log as a tombstone.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Message {
    fn order_timestamp(&self) -> DateTime<Utc> {
        self.server_timestamp.unwrap_or(self.created_at)
    }
}

/// Sort key: `(server_timestamp ?? created_at, local_seq)`. The sequence
/// counter is assigned at insertion and breaks same-millisecond ties, so
/// arrival order is stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct OrderKey {
    timestamp: DateTime<Utc>,
    seq: u64,
}

/// Events applied to the conversation state.
#[derive(Debug, Clone)]
pub enum MessageEvent {
    /// Optimistic local send; inserts a `pending` entry immediately.
    LocalSendRequested {
        client_id: ClientMessageId,
        kind: MessageKind,
        content: String,
        attachment: Option<AttachmentRef>,
        created_at: DateTime<Utc>,
    },
    /// The server accepted a send: assign canonical identity.
    ServerAck {
        client_id: ClientMessageId,
        id: MessageId,
        server_timestamp: DateTime<Utc>,
    },
    /// The send was refused or timed out; entry stays visible for retry.
    ServerAckFailed {
        client_id: ClientMessageId,
        reason: String,
    },
    /// Re-issue a failed send under the same client id.
    SendRetried { client_id: ClientMessageId },
    /// Drop a failed entry the user chose not to retry.
    Discarded { client_id: ClientMessageId },
    /// A message authored elsewhere (or an own-message echo).
    RemoteMessageReceived { message: WireMessage },
    DeliveryUpdated {
        id: MessageId,
        status: MessageStatus,
    },
    ReadUpdated { id: MessageId },
    Edited {
        id: MessageId,
        actor: UserId,
        content: String,
        edited_at: DateTime<Utc>,
    },
    Deleted {
        id: MessageId,
        actor: UserId,
        deleted_at: DateTime<Utc>,
    },
    ReactionAdded {
        id: MessageId,
        user_id: UserId,
        emoji: String,
    },
    ReactionRemoved {
        id: MessageId,
        user_id: UserId,
        emoji: String,
    },
    /// An older page of history fetched via `loadMore`.
    HistoryMerged {
        messages: Vec<WireMessage>,
        requested: u32,
    },
}

/// Ordered per-conversation message state.
#[derive(Debug)]
pub struct ConversationState {
    conversation_id: ConversationId,
    local_user: UserId,
    messages: BTreeMap<OrderKey, Message>,
    by_client: HashMap<ClientMessageId, OrderKey>,
    by_id: HashMap<MessageId, OrderKey>,
    next_seq: u64,
    has_more_history: bool,
}

impl ConversationState {
    pub fn new(conversation_id: ConversationId, local_user: UserId) -> Self {
        Self {
            conversation_id,
            local_user,
            messages: BTreeMap::new(),
            by_client: HashMap::new(),
            by_id: HashMap::new(),
            next_seq: 0,
            has_more_history: true,
        }
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id.clone()
    }

    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    pub fn has_more_history(&self) -> bool {
        self.has_more_history
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Messages in display order (oldest first).
    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.messages.values()
    }

    pub fn message_by_client(&self, client_id: ClientMessageId) -> Option<&Message> {
        self.by_client
            .get(&client_id)
            .and_then(|key| self.messages.get(key))
    }

    pub fn message_by_id(&self, id: &MessageId) -> Option<&Message> {
        self.by_id.get(id).and_then(|key| self.messages.get(key))
    }

    /// Oldest server-confirmed timestamp, the cursor for the next older
    /// history page.
    pub fn oldest_server_timestamp(&self) -> Option<DateTime<Utc>> {
        self.messages
            .values()
            .filter_map(|m| m.server_timestamp)
            .next()
    }

    /// Client ids of entries still awaiting an acknowledgement.
    pub fn pending_client_ids(&self) -> Vec<ClientMessageId> {
        self.messages
            .values()
            .filter(|m| m.status == MessageStatus::Pending)
            .filter_map(|m| m.client_id)
            .collect()
    }

    /// Apply one event. Structural violations (permission, unknown target
    /// for a local command) come back as `Err`; remote no-ops are `Ok`.
    pub fn apply(&mut self, event: MessageEvent) -> Result<(), SessionError> {
        match event {
            MessageEvent::LocalSendRequested {
                client_id,
                kind,
                content,
                attachment,
                created_at,
            } => {
                if self.by_client.contains_key(&client_id) {
                    // Same client id never produces a second entry.
                    return Ok(());
                }
                let message = Message {
                    id: None,
                    client_id: Some(client_id),
                    conversation_id: self.conversation_id.clone(),
                    sender_id: self.local_user.clone(),
                    kind,
                    content,
                    attachment,
                    created_at,
                    server_timestamp: None,
                    status: MessageStatus::Pending,
                    reactions: BTreeSet::new(),
                    edited_at: None,
                    deleted_at: None,
                };
                self.insert(message);
                Ok(())
            }

            MessageEvent::ServerAck {
                client_id,
                id,
                server_timestamp,
            } => {
                let Some(key) = self.by_client.get(&client_id).copied() else {
                    debug!(client = %client_id, "Ack for unknown client id");
                    return Ok(());
                };
                let Some(mut message) = self.messages.remove(&key) else {
                    self.by_client.remove(&client_id);
                    return Ok(());
                };

                message.status = match message.status {
                    MessageStatus::Pending | MessageStatus::Failed => MessageStatus::Sent,
                    // A delivery receipt may have raced ahead of the ack.
                    advanced => advanced,
                };
                message.id = Some(id.clone());
                message.server_timestamp = Some(self.clamped_timestamp(server_timestamp, key.seq));

                let new_key = OrderKey {
                    timestamp: message.order_timestamp(),
                    seq: key.seq,
                };
                self.by_client.insert(client_id, new_key);
                self.by_id.insert(id, new_key);
                self.messages.insert(new_key, message);
                Ok(())
            }

            MessageEvent::ServerAckFailed { client_id, reason } => {
                if let Some(message) = self.message_by_client_mut(client_id) {
                    if message.status == MessageStatus::Pending {
                        debug!(client = %client_id, reason = %reason, "Send failed");
                        message.status = MessageStatus::Failed;
                    }
                }
                Ok(())
            }

            MessageEvent::SendRetried { client_id } => {
                match self.message_by_client_mut(client_id) {
                    Some(message) if message.status == MessageStatus::Failed => {
                        message.status = MessageStatus::Pending;
                        Ok(())
                    }
                    Some(_) => Ok(()),
                    None => Err(SessionError::UnknownMessage),
                }
            }

            MessageEvent::Discarded { client_id } => {
                let Some(key) = self.by_client.get(&client_id).copied() else {
                    return Err(SessionError::UnknownMessage);
                };
                // Only failed entries may be discarded; anything else is
                // already on its way to the server.
                if self.messages[&key].status != MessageStatus::Failed {
                    return Ok(());
                }
                self.messages.remove(&key);
                self.by_client.remove(&client_id);
                Ok(())
            }

            MessageEvent::RemoteMessageReceived { message } => {
                if self.by_id.contains_key(&message.id) {
                    // Redelivery after reconnect; replay-safe no-op.
                    return Ok(());
                }
                self.insert_wire(message);
                Ok(())
            }

            MessageEvent::DeliveryUpdated { id, status } => {
                if let Some(message) = self.message_by_id_mut(&id) {
                    if message.status.advances_to(status) {
                        message.status = status;
                    }
                }
                Ok(())
            }

            MessageEvent::ReadUpdated { id } => {
                if let Some(message) = self.message_by_id_mut(&id) {
                    if message.status.advances_to(MessageStatus::Read) {
                        message.status = MessageStatus::Read;
                    }
                }
                Ok(())
            }

            MessageEvent::Edited {
                id,
                actor,
                content,
                edited_at,
            } => {
                let Some(message) = self.message_by_id_mut(&id) else {
                    return Err(SessionError::UnknownMessage);
                };
                if message.sender_id != actor {
                    return Err(SessionError::PermissionDenied);
                }
                message.content = content;
                message.edited_at = Some(edited_at);
                Ok(())
            }

            MessageEvent::Deleted {
                id,
                actor,
                deleted_at,
            } => {
                let Some(message) = self.message_by_id_mut(&id) else {
                    return Err(SessionError::UnknownMessage);
                };
                if message.sender_id != actor {
                    return Err(SessionError::PermissionDenied);
                }
                message.deleted_at = Some(deleted_at);
                Ok(())
            }

            MessageEvent::ReactionAdded { id, user_id, emoji } => {
                let Some(message) = self.message_by_id_mut(&id) else {
                    return Err(SessionError::UnknownMessage);
                };
                // Set semantics: double-add by the same user is idempotent.
                message.reactions.insert((user_id, emoji));
                Ok(())
            }

            MessageEvent::ReactionRemoved { id, user_id, emoji } => {
                let Some(message) = self.message_by_id_mut(&id) else {
                    return Err(SessionError::UnknownMessage);
                };
                // Removing a reaction that is not there is a no-op.
                message.reactions.remove(&(user_id, emoji));
                Ok(())
            }

            MessageEvent::HistoryMerged {
                messages,
                requested,
            } => {
                let received = messages.len();
                for wire in messages {
                    if !self.by_id.contains_key(&wire.id) {
                        self.insert_wire(wire);
                    }
                }
                if (received as u32) < requested {
                    self.has_more_history = false;
                }
                Ok(())
            }
        }
    }

    fn insert(&mut self, message: Message) {
        let key = OrderKey {
            timestamp: message.order_timestamp(),
            seq: self.next_seq,
        };
        self.next_seq += 1;

        if let Some(client_id) = message.client_id {
            self.by_client.insert(client_id, key);
        }
        if let Some(id) = message.id.clone() {
            self.by_id.insert(id, key);
        }
        self.messages.insert(key, message);
    }

    fn insert_wire(&mut self, wire: WireMessage) {
        let message = Message {
            id: Some(wire.id),
            client_id: None,
            conversation_id: wire.conversation_id,
            sender_id: wire.sender_id,
            kind: wire.kind,
            content: wire.content,
            attachment: wire.attachment,
            created_at: wire.server_timestamp,
            server_timestamp: Some(wire.server_timestamp),
            status: MessageStatus::Sent,
            reactions: wire.reactions.into_iter().collect(),
            edited_at: wire.edited_at,
            deleted_at: wire.deleted_at,
        };
        self.insert(message);
    }

    /// The acked timestamp may lag behind messages this user already
    /// authored afterwards (server clock skew). Clamp it so the entry
    /// never re-sorts past an earlier own message; the sequence counter
    /// keeps the authored order within the same timestamp.
    fn clamped_timestamp(&self, server_timestamp: DateTime<Utc>, seq: u64) -> DateTime<Utc> {
        let floor = self
            .messages
            .iter()
            .filter(|(key, m)| key.seq < seq && m.sender_id == self.local_user)
            .map(|(key, _)| key.timestamp)
            .max();
        match floor {
            Some(floor) if server_timestamp < floor => floor,
            _ => server_timestamp,
        }
    }

    fn message_by_client_mut(&mut self, client_id: ClientMessageId) -> Option<&mut Message> {
        let key = self.by_client.get(&client_id)?;
        self.messages.get_mut(key)
    }

    fn message_by_id_mut(&mut self, id: &MessageId) -> Option<&mut Message> {
        let key = self.by_id.get(id)?;
        self.messages.get_mut(key)
    }
}
