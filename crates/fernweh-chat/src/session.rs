//! The per-conversation orchestrator.
//!
//! One `ChatSession` binds one conversation's state to one connection
//! subscription. UI intents, server notifications, and acknowledgement
//! resolutions all funnel through a single event loop, so every store
//! mutation happens at one serialization point; the loop never suspends
//! while holding intermediate state.
//!
//! The loop stays alive while any in-flight send is unresolved, even
//! after every view handle is gone; a user returning to the conversation
//! sees the final status.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{interval, Instant};
use tracing::{debug, info, warn};

use fernweh_net::{AckHandle, ConnectionManager, ConnectionState, Notification};
use fernweh_shared::constants::{ACK_TIMEOUT, HISTORY_PAGE_SIZE};
use fernweh_shared::error::{CaptureError, SendError, SessionError};
use fernweh_shared::protocol::{ClientCommand, ReactionAction, ServerAck, ServerEvent};
use fernweh_shared::types::{
    AttachmentRef, ClientMessageId, ConversationId, MessageId, MessageKind, UserId,
};

use crate::capture::AudioCaptureSession;
use crate::events::{ConversationSnapshot, SessionEvent, SessionOp};
use crate::reactions::{PendingReaction, ReactionEngine};
use crate::store::{ConversationState, MessageEvent};
use crate::typing::{TypingCoordinator, TypingSignal};

const SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

/// Handle to one live conversation. Cheap to clone via `Arc`; the view
/// layer only ever talks to this surface.
pub struct ChatSession {
    conversation_id: ConversationId,
    intent_tx: mpsc::Sender<Intent>,
    snapshot_rx: watch::Receiver<ConversationSnapshot>,
    event_tx: broadcast::Sender<SessionEvent>,
}

impl ChatSession {
    /// Spawn the session loop for `conversation_id` with `peer` as the
    /// conversation partner.
    pub fn open(
        conversation_id: ConversationId,
        peer: UserId,
        local_user: UserId,
        connection: ConnectionManager,
    ) -> Arc<Self> {
        let (intent_tx, intent_rx) = mpsc::channel(256);
        let (resolved_tx, resolved_rx) = mpsc::channel(256);
        let (snapshot_tx, snapshot_rx) =
            watch::channel(ConversationSnapshot::empty(conversation_id.clone()));
        let (event_tx, _) = broadcast::channel(64);

        let actor = SessionActor {
            state: ConversationState::new(conversation_id.clone(), local_user.clone()),
            typing: TypingCoordinator::new(),
            reactions: ReactionEngine::new(local_user.clone()),
            local_user,
            peer,
            peer_online: false,
            conn_state: connection.state(),
            notif_rx: connection.subscribe(),
            connection,
            intent_rx,
            resolved_rx,
            resolved_tx,
            snapshot_tx,
            event_tx: event_tx.clone(),
            pending_since: HashMap::new(),
            outstanding: 0,
        };
        tokio::spawn(actor.run());
        info!(conversation = %conversation_id, "Chat session opened");

        Arc::new(Self {
            conversation_id,
            intent_tx,
            snapshot_rx,
            event_tx,
        })
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id.clone()
    }

    /// Current immutable view.
    pub fn snapshot(&self) -> ConversationSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Watch channel of snapshots; every publication is a complete view.
    pub fn watch(&self) -> watch::Receiver<ConversationSnapshot> {
        self.snapshot_rx.clone()
    }

    /// One-shot error and failure events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    /// Optimistically append a text message and dispatch it. Returns the
    /// client id identifying the entry until the server ack resolves it.
    pub async fn send_text(&self, text: impl Into<String>) -> ClientMessageId {
        let client_id = ClientMessageId::new();
        self.intent(Intent::Send {
            client_id,
            kind: MessageKind::Text,
            content: text.into(),
            attachment: None,
        })
        .await;
        client_id
    }

    /// Finalize an audio capture into an attachment and send it.
    pub async fn send_audio(
        &self,
        capture: AudioCaptureSession,
    ) -> Result<ClientMessageId, CaptureError> {
        let (attachment, duration) = capture.finalize()?;
        let client_id = ClientMessageId::new();
        self.intent(Intent::Send {
            client_id,
            kind: MessageKind::Audio,
            content: duration.as_secs().to_string(),
            attachment: Some(attachment),
        })
        .await;
        Ok(client_id)
    }

    /// Re-issue a failed send under the same client id.
    pub async fn retry_message(&self, client_id: ClientMessageId) {
        self.intent(Intent::Retry { client_id }).await;
    }

    /// Drop a failed entry the user chose not to retry.
    pub async fn discard_message(&self, client_id: ClientMessageId) {
        self.intent(Intent::Discard { client_id }).await;
    }

    pub async fn edit_message(&self, id: MessageId, text: impl Into<String>) {
        self.intent(Intent::Edit {
            id,
            content: text.into(),
        })
        .await;
    }

    pub async fn delete_message(&self, id: MessageId) {
        self.intent(Intent::Delete { id }).await;
    }

    pub async fn react(&self, id: MessageId, emoji: impl Into<String>) {
        self.intent(Intent::React {
            id,
            emoji: emoji.into(),
            action: ReactionAction::Add,
        })
        .await;
    }

    pub async fn unreact(&self, id: MessageId, emoji: impl Into<String>) {
        self.intent(Intent::React {
            id,
            emoji: emoji.into(),
            action: ReactionAction::Remove,
        })
        .await;
    }

    /// Called on every keystroke; the coordinator debounces broadcasts.
    pub async fn set_typing(&self) {
        self.intent(Intent::Typing).await;
    }

    pub async fn mark_read(&self) {
        self.intent(Intent::MarkRead).await;
    }

    /// Request the next older page of history.
    pub async fn load_more_history(&self) {
        self.intent(Intent::LoadHistory).await;
    }

    async fn intent(&self, intent: Intent) {
        // Failure only means the loop is gone (session torn down).
        let _ = self.intent_tx.send(intent).await;
    }
}

enum Intent {
    Send {
        client_id: ClientMessageId,
        kind: MessageKind,
        content: String,
        attachment: Option<AttachmentRef>,
    },
    Retry { client_id: ClientMessageId },
    Discard { client_id: ClientMessageId },
    Edit { id: MessageId, content: String },
    Delete { id: MessageId },
    React {
        id: MessageId,
        emoji: String,
        action: ReactionAction,
    },
    Typing,
    MarkRead,
    LoadHistory,
}

/// Acknowledgement outcomes funneled back into the loop by waiter tasks,
/// so resolution mutates state at the same serialization point as
/// everything else.
enum Resolution {
    Ack {
        client_id: ClientMessageId,
        result: Result<ServerAck, SendError>,
    },
    Op {
        op: SessionOp,
        pending_reaction: Option<PendingReaction>,
        result: Result<(), SendError>,
    },
}

struct SessionActor {
    state: ConversationState,
    typing: TypingCoordinator,
    reactions: ReactionEngine,
    local_user: UserId,
    peer: UserId,
    peer_online: bool,
    conn_state: ConnectionState,
    connection: ConnectionManager,
    notif_rx: broadcast::Receiver<Notification>,
    intent_rx: mpsc::Receiver<Intent>,
    resolved_rx: mpsc::Receiver<Resolution>,
    resolved_tx: mpsc::Sender<Resolution>,
    snapshot_tx: watch::Sender<ConversationSnapshot>,
    event_tx: broadcast::Sender<SessionEvent>,
    /// Send dispatch times for the ack-timeout sweep.
    pending_since: HashMap<ClientMessageId, Instant>,
    /// In-flight waiter tasks keeping the loop alive past handle drop.
    outstanding: usize,
}

impl SessionActor {
    async fn run(mut self) {
        let mut sweep = interval(SWEEP_INTERVAL);
        let mut intents_open = true;

        loop {
            tokio::select! {
                intent = self.intent_rx.recv(), if intents_open => match intent {
                    Some(intent) => self.handle_intent(intent).await,
                    None => {
                        intents_open = false;
                        if self.outstanding == 0 {
                            break;
                        }
                    }
                },

                resolution = self.resolved_rx.recv() => {
                    if let Some(resolution) = resolution {
                        self.outstanding -= 1;
                        self.handle_resolution(resolution);
                        if !intents_open && self.outstanding == 0 {
                            break;
                        }
                    }
                },

                notification = self.notif_rx.recv() => match notification {
                    Ok(notification) => self.handle_notification(notification),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Session lagged behind connection events");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        // Connection manager gone; keep serving snapshots.
                        self.conn_state = ConnectionState::Closed;
                        self.publish();
                        if !intents_open && self.outstanding == 0 {
                            break;
                        }
                    }
                },

                _ = sweep.tick() => self.sweep(),
            }
        }

        debug!(conversation = %self.state.conversation_id(), "Chat session loop ended");
    }

    async fn handle_intent(&mut self, intent: Intent) {
        match intent {
            Intent::Send {
                client_id,
                kind,
                content,
                attachment,
            } => {
                let _ = self.state.apply(MessageEvent::LocalSendRequested {
                    client_id,
                    kind,
                    content,
                    attachment,
                    created_at: Utc::now(),
                });
                // Sending ends the typing indicator on the remote side.
                if self.typing.stop_now() == Some(TypingSignal::Stopped) {
                    self.send_typing(false).await;
                }
                self.publish();
                self.dispatch_send(client_id).await;
            }

            Intent::Retry { client_id } => {
                match self.state.apply(MessageEvent::SendRetried { client_id }) {
                    Ok(()) => {
                        self.publish();
                        self.dispatch_send(client_id).await;
                    }
                    Err(error) => self.reject(SessionOp::Retry, error),
                }
            }

            Intent::Discard { client_id } => {
                match self.state.apply(MessageEvent::Discarded { client_id }) {
                    Ok(()) => {
                        self.pending_since.remove(&client_id);
                        self.publish();
                    }
                    Err(error) => self.reject(SessionOp::Discard, error),
                }
            }

            Intent::Edit { id, content } => {
                let event = MessageEvent::Edited {
                    id: id.clone(),
                    actor: self.local_user.clone(),
                    content: content.clone(),
                    edited_at: Utc::now(),
                };
                match self.state.apply(event) {
                    Ok(()) => {
                        self.publish();
                        let command = ClientCommand::EditMessage {
                            conversation_id: self.state.conversation_id(),
                            message_id: id,
                            content,
                        };
                        self.dispatch_op(SessionOp::Edit, command, None).await;
                    }
                    Err(error) => self.reject(SessionOp::Edit, error),
                }
            }

            Intent::Delete { id } => {
                let event = MessageEvent::Deleted {
                    id: id.clone(),
                    actor: self.local_user.clone(),
                    deleted_at: Utc::now(),
                };
                match self.state.apply(event) {
                    Ok(()) => {
                        self.publish();
                        let command = ClientCommand::DeleteMessage {
                            conversation_id: self.state.conversation_id(),
                            message_id: id,
                        };
                        self.dispatch_op(SessionOp::Delete, command, None).await;
                    }
                    Err(error) => self.reject(SessionOp::Delete, error),
                }
            }

            Intent::React { id, emoji, action } => {
                match self.reactions.apply_optimistic(
                    &mut self.state,
                    id.clone(),
                    emoji.clone(),
                    action,
                ) {
                    Ok(pending) => {
                        self.publish();
                        let conversation_id = self.state.conversation_id();
                        let command = match action {
                            ReactionAction::Add => ClientCommand::AddReaction {
                                conversation_id,
                                message_id: id,
                                emoji,
                            },
                            ReactionAction::Remove => ClientCommand::RemoveReaction {
                                conversation_id,
                                message_id: id,
                                emoji,
                            },
                        };
                        self.dispatch_op(SessionOp::React, command, Some(pending)).await;
                    }
                    Err(error) => self.reject(SessionOp::React, error),
                }
            }

            Intent::Typing => {
                if self.typing.note_keystroke(Instant::now()) == Some(TypingSignal::Started) {
                    self.send_typing(true).await;
                }
            }

            Intent::MarkRead => {
                // Optimistic local read state for the peer's messages.
                let unread: Vec<MessageId> = self
                    .state
                    .messages()
                    .filter(|m| m.sender_id != self.local_user)
                    .filter_map(|m| m.id.clone())
                    .collect();
                for id in unread {
                    let _ = self.state.apply(MessageEvent::ReadUpdated { id });
                }
                self.publish();

                let command = ClientCommand::MarkRead {
                    conversation_id: self.state.conversation_id(),
                };
                self.dispatch_op(SessionOp::MarkRead, command, None).await;
            }

            Intent::LoadHistory => {
                let command = ClientCommand::LoadHistory {
                    conversation_id: self.state.conversation_id(),
                    before: self.state.oldest_server_timestamp(),
                    limit: HISTORY_PAGE_SIZE,
                };
                // The page itself arrives as a HistoryPage event.
                self.dispatch_op(SessionOp::History, command, None).await;
            }
        }
    }

    fn handle_resolution(&mut self, resolution: Resolution) {
        match resolution {
            Resolution::Ack { client_id, result } => match result {
                Ok(ack) => {
                    self.pending_since.remove(&client_id);
                    match (ack.message_id, ack.server_timestamp) {
                        (Some(id), Some(server_timestamp)) => {
                            let _ = self.state.apply(MessageEvent::ServerAck {
                                client_id,
                                id,
                                server_timestamp,
                            });
                        }
                        _ => {
                            let _ = self.state.apply(MessageEvent::ServerAckFailed {
                                client_id,
                                reason: "malformed acknowledgement".into(),
                            });
                            self.emit(SessionEvent::MessageFailed { client_id });
                        }
                    }
                    self.publish();
                }
                Err(SendError::ServerRejected(reason)) => {
                    self.pending_since.remove(&client_id);
                    let _ = self
                        .state
                        .apply(MessageEvent::ServerAckFailed { client_id, reason });
                    self.emit(SessionEvent::MessageFailed { client_id });
                    self.publish();
                }
                // Transport lost before the ack: the entry stays pending
                // and the sweep decides once the timeout elapses.
                Err(SendError::AckTimeout) => {}
            },

            Resolution::Op {
                op,
                pending_reaction,
                result,
            } => {
                if let Some(pending) = pending_reaction {
                    self.reactions.resolve(&mut self.state, pending, &result);
                    self.publish();
                }
                if let Err(error) = result {
                    // Timeouts on these low-stakes ops are not surfaced;
                    // explicit rejections are.
                    if matches!(error, SendError::ServerRejected(_)) {
                        self.reject(op, SessionError::Send(error));
                    }
                }
            }
        }
    }

    fn handle_notification(&mut self, notification: Notification) {
        match notification {
            Notification::StateChanged(state) => {
                let reconnected = state == ConnectionState::Connected
                    && self.conn_state != ConnectionState::Connected;
                self.conn_state = state;
                if reconnected {
                    // A reconnect never replays commands, so acks for
                    // sends dispatched on the old transport can never
                    // arrive. Fail them now; the user decides what to
                    // retry.
                    for client_id in self.state.pending_client_ids() {
                        self.pending_since.remove(&client_id);
                        let _ = self.state.apply(MessageEvent::ServerAckFailed {
                            client_id,
                            reason: "connection was lost before acknowledgement".into(),
                        });
                        self.emit(SessionEvent::MessageFailed { client_id });
                    }
                }
                self.publish();
            }

            Notification::Event(event) => self.handle_server_event(event),

            Notification::Error { message } => {
                self.emit(SessionEvent::ConnectionError { message });
            }
        }
    }

    fn handle_server_event(&mut self, event: ServerEvent) {
        let ours = self.state.conversation_id();
        match event {
            ServerEvent::NewMessage { message } if message.conversation_id == ours => {
                // Own echoes resolve through the ack path, never here.
                if message.sender_id == self.local_user {
                    return;
                }
                let _ = self
                    .state
                    .apply(MessageEvent::RemoteMessageReceived { message });
                self.publish();
            }

            ServerEvent::MessageStatus {
                conversation_id,
                message_id,
                status,
            } if conversation_id == ours => {
                let _ = self.state.apply(MessageEvent::DeliveryUpdated {
                    id: message_id,
                    status,
                });
                self.publish();
            }

            ServerEvent::MessageRead {
                conversation_id,
                message_ids,
            } if conversation_id == ours => {
                for id in message_ids {
                    let _ = self.state.apply(MessageEvent::ReadUpdated { id });
                }
                self.publish();
            }

            ServerEvent::MessageEdited {
                conversation_id,
                message_id,
                sender_id,
                content,
                edited_at,
            } if conversation_id == ours => {
                if let Err(error) = self.state.apply(MessageEvent::Edited {
                    id: message_id,
                    actor: sender_id,
                    content,
                    edited_at,
                }) {
                    debug!(error = %error, "Remote edit ignored");
                    return;
                }
                self.publish();
            }

            ServerEvent::MessageDeleted {
                conversation_id,
                message_id,
                sender_id,
                deleted_at,
            } if conversation_id == ours => {
                if let Err(error) = self.state.apply(MessageEvent::Deleted {
                    id: message_id,
                    actor: sender_id,
                    deleted_at,
                }) {
                    debug!(error = %error, "Remote delete ignored");
                    return;
                }
                self.publish();
            }

            ServerEvent::Reaction {
                conversation_id,
                message_id,
                user_id,
                emoji,
                action,
            } if conversation_id == ours => {
                // Our own reaction echoes were applied optimistically.
                if user_id == self.local_user {
                    return;
                }
                let event = match action {
                    ReactionAction::Add => MessageEvent::ReactionAdded {
                        id: message_id,
                        user_id,
                        emoji,
                    },
                    ReactionAction::Remove => MessageEvent::ReactionRemoved {
                        id: message_id,
                        user_id,
                        emoji,
                    },
                };
                if self.state.apply(event).is_ok() {
                    self.publish();
                }
            }

            ServerEvent::Typing {
                conversation_id,
                user_id,
                typing,
            } if conversation_id == ours && user_id != self.local_user => {
                self.typing.note_remote(typing, Instant::now());
                self.publish();
            }

            ServerEvent::UserStatus { user_id, online } if user_id == self.peer => {
                self.peer_online = online;
                self.publish();
            }

            ServerEvent::HistoryPage {
                conversation_id,
                messages,
            } if conversation_id == ours => {
                let _ = self.state.apply(MessageEvent::HistoryMerged {
                    messages,
                    requested: HISTORY_PAGE_SIZE,
                });
                self.publish();
            }

            // Another conversation's traffic, or an event this session
            // has no use for.
            _ => {}
        }
    }

    /// Mark pending sends failed once the bounded wait elapses without a
    /// connection. While connected, resolution comes from explicit acks
    /// or the connection's own heartbeat-loss detection.
    fn sweep(&mut self) {
        let now = Instant::now();

        if self.conn_state != ConnectionState::Connected {
            let expired: Vec<ClientMessageId> = self
                .pending_since
                .iter()
                .filter(|(_, since)| now.duration_since(**since) >= ACK_TIMEOUT)
                .map(|(client_id, _)| *client_id)
                .collect();
            for client_id in expired {
                self.pending_since.remove(&client_id);
                let _ = self.state.apply(MessageEvent::ServerAckFailed {
                    client_id,
                    reason: "no acknowledgement".into(),
                });
                self.emit(SessionEvent::MessageFailed { client_id });
                self.publish();
            }
        }

        if self.typing.poll_stop(now) == Some(TypingSignal::Stopped) {
            // Fire and forget; the remote TTL self-heals a lost stop.
            let command = ClientCommand::Typing {
                conversation_id: self.state.conversation_id(),
                typing: false,
            };
            let connection = self.connection.clone();
            tokio::spawn(async move {
                let _ = connection.send(command).await;
            });
        }
    }

    /// Dispatch a pending message and register its ack waiter.
    async fn dispatch_send(&mut self, client_id: ClientMessageId) {
        let Some(message) = self.state.message_by_client(client_id) else {
            return;
        };
        let command = ClientCommand::SendMessage {
            conversation_id: message.conversation_id.clone(),
            client_id,
            kind: message.kind,
            content: message.content.clone(),
            attachment: message.attachment.clone(),
            created_at: message.created_at,
        };
        self.pending_since.insert(client_id, Instant::now());

        match self.connection.send(command).await {
            Ok(handle) => self.spawn_ack_waiter(client_id, handle),
            Err(error) => {
                // Not connected: the entry stays pending until the sweep
                // times it out or the user retries after reconnect.
                debug!(client = %client_id, error = %error, "Send deferred to retry/sweep");
            }
        }
    }

    /// Dispatch a non-send command whose outcome only produces events
    /// (and, for reactions, a possible rollback).
    async fn dispatch_op(
        &mut self,
        op: SessionOp,
        command: ClientCommand,
        pending_reaction: Option<PendingReaction>,
    ) {
        match self.connection.send(command).await {
            Ok(handle) => {
                let resolved_tx = self.resolved_tx.clone();
                self.outstanding += 1;
                tokio::spawn(async move {
                    let result = handle.wait().await.map(|_| ());
                    let _ = resolved_tx
                        .send(Resolution::Op {
                            op,
                            pending_reaction,
                            result,
                        })
                        .await;
                });
            }
            Err(error) => {
                // Optimistic reaction state stays (timeout policy); the
                // caller still learns the command did not go out.
                self.reject(op, SessionError::Connect(error));
            }
        }
    }

    fn spawn_ack_waiter(&mut self, client_id: ClientMessageId, handle: AckHandle) {
        let resolved_tx = self.resolved_tx.clone();
        self.outstanding += 1;
        tokio::spawn(async move {
            let result = handle.wait().await;
            let _ = resolved_tx
                .send(Resolution::Ack { client_id, result })
                .await;
        });
    }

    async fn send_typing(&self, typing: bool) {
        let command = ClientCommand::Typing {
            conversation_id: self.state.conversation_id(),
            typing,
        };
        // Best effort; the remote TTL covers a lost frame.
        let _ = self.connection.send(command).await;
    }

    fn reject(&self, op: SessionOp, error: SessionError) {
        self.emit(SessionEvent::CommandRejected { op, error });
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.event_tx.send(event);
    }

    fn publish(&self) {
        let snapshot = ConversationSnapshot {
            conversation_id: self.state.conversation_id(),
            messages: self.state.messages().cloned().collect(),
            has_more_history: self.state.has_more_history(),
            peer_online: self.peer_online,
            connection: self.conn_state,
            remote_typing_until: self.typing.remote_until(),
        };
        self.snapshot_tx.send_replace(snapshot);
    }
}
