//! Optimistic reaction handling.
//!
//! Reactions apply locally first, then the command goes out. Only an
//! explicit server rejection rolls the optimistic state back; a silent
//! timeout leaves the optimistic state in place.

use fernweh_shared::error::{SendError, SessionError};
use fernweh_shared::protocol::ReactionAction;
use fernweh_shared::types::{MessageId, UserId};

use crate::store::{ConversationState, MessageEvent};

/// An optimistically applied reaction awaiting its acknowledgement.
#[derive(Debug, Clone)]
pub struct PendingReaction {
    pub message_id: MessageId,
    pub user_id: UserId,
    pub emoji: String,
    pub action: ReactionAction,
}

#[derive(Debug)]
pub struct ReactionEngine {
    local_user: UserId,
}

impl ReactionEngine {
    pub fn new(local_user: UserId) -> Self {
        Self { local_user }
    }

    /// Apply the reaction locally. Fails only for unknown messages; the
    /// caller then skips sending the command.
    pub fn apply_optimistic(
        &self,
        state: &mut ConversationState,
        message_id: MessageId,
        emoji: String,
        action: ReactionAction,
    ) -> Result<PendingReaction, SessionError> {
        state.apply(self.event(&message_id, &emoji, action))?;
        Ok(PendingReaction {
            message_id,
            user_id: self.local_user.clone(),
            emoji,
            action,
        })
    }

    /// Reconcile the server's verdict. Explicit rejection re-applies the
    /// inverse event; anything else keeps the optimistic state.
    pub fn resolve(
        &self,
        state: &mut ConversationState,
        pending: PendingReaction,
        result: &Result<(), SendError>,
    ) {
        if matches!(result, Err(SendError::ServerRejected(_))) {
            let inverse = match pending.action {
                ReactionAction::Add => ReactionAction::Remove,
                ReactionAction::Remove => ReactionAction::Add,
            };
            let _ = state.apply(self.event(&pending.message_id, &pending.emoji, inverse));
        }
    }

    fn event(&self, message_id: &MessageId, emoji: &str, action: ReactionAction) -> MessageEvent {
        match action {
            ReactionAction::Add => MessageEvent::ReactionAdded {
                id: message_id.clone(),
                user_id: self.local_user.clone(),
                emoji: emoji.to_string(),
            },
            ReactionAction::Remove => MessageEvent::ReactionRemoved {
                id: message_id.clone(),
                user_id: self.local_user.clone(),
                emoji: emoji.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fernweh_shared::protocol::WireMessage;
    use fernweh_shared::types::{ConversationId, MessageKind};

    fn seeded_state() -> (ConversationState, MessageId) {
        let mut state = ConversationState::new(ConversationId::new(), UserId::new("me"));
        let id = MessageId::new("m1");
        state
            .apply(MessageEvent::RemoteMessageReceived {
                message: WireMessage {
                    id: id.clone(),
                    conversation_id: state.conversation_id(),
                    sender_id: UserId::new("peer"),
                    kind: MessageKind::Text,
                    content: "rooftop at 8?".into(),
                    attachment: None,
                    server_timestamp: Utc::now(),
                    edited_at: None,
                    deleted_at: None,
                    reactions: Vec::new(),
                },
            })
            .unwrap();
        (state, id)
    }

    #[test]
    fn rejection_rolls_back_the_add() {
        let (mut state, id) = seeded_state();
        let engine = ReactionEngine::new(UserId::new("me"));

        let pending = engine
            .apply_optimistic(&mut state, id.clone(), "👍".into(), ReactionAction::Add)
            .unwrap();
        assert_eq!(state.message_by_id(&id).unwrap().reactions.len(), 1);

        engine.resolve(
            &mut state,
            pending,
            &Err(SendError::ServerRejected("not allowed".into())),
        );
        assert!(state.message_by_id(&id).unwrap().reactions.is_empty());
    }

    #[test]
    fn timeout_keeps_the_optimistic_state() {
        let (mut state, id) = seeded_state();
        let engine = ReactionEngine::new(UserId::new("me"));

        let pending = engine
            .apply_optimistic(&mut state, id.clone(), "👍".into(), ReactionAction::Add)
            .unwrap();
        engine.resolve(&mut state, pending, &Err(SendError::AckTimeout));
        assert_eq!(state.message_by_id(&id).unwrap().reactions.len(), 1);
    }

    #[test]
    fn rejected_remove_restores_the_reaction() {
        let (mut state, id) = seeded_state();
        let engine = ReactionEngine::new(UserId::new("me"));

        let added = engine
            .apply_optimistic(&mut state, id.clone(), "👍".into(), ReactionAction::Add)
            .unwrap();
        engine.resolve(&mut state, added, &Ok(()));

        let removed = engine
            .apply_optimistic(&mut state, id.clone(), "👍".into(), ReactionAction::Remove)
            .unwrap();
        assert!(state.message_by_id(&id).unwrap().reactions.is_empty());

        engine.resolve(
            &mut state,
            removed,
            &Err(SendError::ServerRejected("stale".into())),
        );
        assert_eq!(state.message_by_id(&id).unwrap().reactions.len(), 1);
    }
}
