use std::time::Duration;

/// Application name
pub const APP_NAME: &str = "Fernweh";

/// The auth handshake must complete within this window or the attempt
/// fails with a timeout.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between heartbeat pings while connected.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Consecutive unanswered heartbeats before the connection is declared lost.
pub const MAX_MISSED_HEARTBEATS: u32 = 3;

/// Reconnection backoff base delay.
pub const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Reconnection backoff cap.
pub const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// A pending send with no acknowledgement is marked failed after this long,
/// but only while the connection is not currently connected.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Minimum gap between outgoing "started typing" broadcasts.
pub const TYPING_DEBOUNCE: Duration = Duration::from_secs(2);

/// Idle window after the last keystroke before the trailing "stopped
/// typing" signal is emitted.
pub const TYPING_IDLE: Duration = Duration::from_secs(4);

/// How long a received typing event keeps the remote indicator alive.
pub const TYPING_REMOTE_TTL: Duration = Duration::from_secs(5);

/// Number of messages requested per history page.
pub const HISTORY_PAGE_SIZE: u32 = 50;
