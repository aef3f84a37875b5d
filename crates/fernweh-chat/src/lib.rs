//! # fernweh-chat
//!
//! The real-time chat core: per-conversation message state with optimistic
//! reconciliation, typing coordination, reactions, audio capture lifecycle,
//! and the `ChatSession` orchestrator the view layer talks to.
//!
//! All conversation state flows through a single reducer entry point inside
//! the session's event loop, so concurrent local intents and remote events
//! are serialized by arrival order and subscribers never observe a partial
//! update.

pub mod capture;
pub mod events;
pub mod reactions;
pub mod registry;
pub mod session;
pub mod store;
pub mod typing;

pub use capture::{AudioCaptureSession, CaptureDevice, CaptureSlot, CaptureState, InMemoryCaptureDevice};
pub use events::{ConversationSnapshot, SessionEvent, SessionOp};
pub use reactions::{PendingReaction, ReactionEngine};
pub use registry::SessionRegistry;
pub use session::ChatSession;
pub use store::{ConversationState, Message, MessageEvent};
pub use typing::{TypingCoordinator, TypingSignal};
