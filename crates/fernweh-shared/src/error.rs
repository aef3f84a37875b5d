use thiserror::Error;

/// Errors establishing or using the server connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// The transport or handshake did not complete within the bounded window.
    #[error("Connection attempt timed out")]
    Timeout,

    /// The server rejected the auth credential. Terminal: the caller must
    /// obtain a fresh credential before reconnecting.
    #[error("Authentication rejected: {0}")]
    AuthRejected(String),

    /// A command was issued while no transport is connected.
    #[error("Not connected")]
    NotConnected,

    /// The connection manager has been shut down.
    #[error("Connection closed")]
    Closed,
}

/// Errors resolving an outbound command acknowledgement.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// No acknowledgement arrived before the connection was lost or the
    /// bounded wait elapsed.
    #[error("Acknowledgement timed out")]
    AckTimeout,

    /// The server explicitly refused the command.
    #[error("Server rejected command: {0}")]
    ServerRejected(String),
}

/// Errors in the audio capture lifecycle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    /// Another capture session already holds the device.
    #[error("An audio capture is already active")]
    AlreadyActive,

    /// The recording device could not be acquired.
    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),
}

/// Structural violations surfaced to the caller of a specific command as a
/// one-shot event, never as state corruption.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Edit or delete attempted on a message authored by someone else.
    #[error("Permission denied: not the message author")]
    PermissionDenied,

    /// The referenced message does not exist in the store.
    #[error("Unknown message")]
    UnknownMessage,

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Send(#[from] SendError),

    #[error(transparent)]
    Capture(#[from] CaptureError),
}
