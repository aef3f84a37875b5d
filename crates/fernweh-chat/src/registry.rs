//! Session registry: one live `ChatSession` per conversation.
//!
//! Opening the same conversation twice hands back the same session, so
//! two screens can never race optimistic state. Entries are held weakly;
//! a session whose handles are all gone is re-created on the next open.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tracing::debug;

use fernweh_net::ConnectionManager;
use fernweh_shared::error::CaptureError;
use fernweh_shared::types::{ConversationId, UserId};

use crate::capture::{AudioCaptureSession, CaptureDevice, CaptureSlot};
use crate::session::ChatSession;

pub struct SessionRegistry {
    connection: ConnectionManager,
    local_user: UserId,
    sessions: Mutex<HashMap<ConversationId, Weak<ChatSession>>>,
    capture_slot: CaptureSlot,
}

impl SessionRegistry {
    pub fn new(connection: ConnectionManager, local_user: UserId) -> Self {
        Self {
            connection,
            local_user,
            sessions: Mutex::new(HashMap::new()),
            capture_slot: CaptureSlot::new(),
        }
    }

    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    /// Get or create the session for `conversation_id` with `peer`.
    pub fn open(&self, conversation_id: ConversationId, peer: UserId) -> Arc<ChatSession> {
        let mut sessions = match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(existing) = sessions.get(&conversation_id).and_then(Weak::upgrade) {
            return existing;
        }

        debug!(conversation = %conversation_id, "Creating chat session");
        let session = ChatSession::open(
            conversation_id.clone(),
            peer,
            self.local_user.clone(),
            self.connection.clone(),
        );
        sessions.retain(|_, weak| weak.strong_count() > 0);
        sessions.insert(conversation_id, Arc::downgrade(&session));
        session
    }

    /// Start a voice recording on the app-wide capture slot. At most one
    /// recording is live at a time regardless of which conversation it
    /// belongs to.
    pub fn begin_capture(
        &self,
        device: Arc<dyn CaptureDevice>,
    ) -> Result<AudioCaptureSession, CaptureError> {
        AudioCaptureSession::start(&self.capture_slot, device)
    }
}
