//! # fernweh-shared
//!
//! Wire protocol types, domain identifiers, tuning constants and the error
//! taxonomy shared between the networking layer and the chat core.
//!
//! This crate is deliberately free of async code so the protocol surface
//! can be reasoned about (and tested) without a runtime.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::{CaptureError, ConnectError, SendError, SessionError};
pub use protocol::{ClientCommand, CommandFrame, ReactionAction, ServerAck, ServerEvent, WireMessage};
pub use types::{
    AttachmentRef, ClientMessageId, ConversationId, CorrelationId, MessageId, MessageKind,
    MessageStatus, UserId,
};
