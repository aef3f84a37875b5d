//! The session's outward-facing event and snapshot types.

use tokio::time::Instant;

use fernweh_net::ConnectionState;
use fernweh_shared::error::SessionError;
use fernweh_shared::types::{ClientMessageId, ConversationId};

use crate::store::Message;

/// Immutable view of one conversation, published on a watch channel.
/// Each publication replaces the previous snapshot wholesale; subscribers
/// never see a partially applied update.
#[derive(Debug, Clone)]
pub struct ConversationSnapshot {
    pub conversation_id: ConversationId,
    /// Oldest first.
    pub messages: Vec<Message>,
    pub has_more_history: bool,
    pub peer_online: bool,
    pub connection: ConnectionState,
    /// Deadline until which the remote typing indicator should show.
    pub remote_typing_until: Option<Instant>,
}

impl ConversationSnapshot {
    pub fn empty(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id,
            messages: Vec::new(),
            has_more_history: true,
            peer_online: false,
            connection: ConnectionState::Idle,
            remote_typing_until: None,
        }
    }

    /// Pure function of the clock; a dropped "stopped typing" event cannot
    /// leave the indicator stuck.
    pub fn is_remote_typing(&self, now: Instant) -> bool {
        self.remote_typing_until.is_some_and(|until| now < until)
    }
}

/// Which command an error event refers to. Send failures are not listed
/// here: they surface as [`SessionEvent::MessageFailed`] with the entry
/// kept in the snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOp {
    Retry,
    Discard,
    Edit,
    Delete,
    React,
    History,
    MarkRead,
}

/// One-shot events that do not belong in the snapshot: command rejections
/// and terminal per-message failures.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A specific command was refused; state was not corrupted.
    CommandRejected {
        op: SessionOp,
        error: SessionError,
    },
    /// A send reached its terminal failed state; the entry remains in the
    /// snapshot with a retry affordance.
    MessageFailed { client_id: ClientMessageId },
    /// Connection-level error surfaced by the server.
    ConnectionError { message: String },
}
