// Connection layer: one live transport per authenticated session, with
// auth handshake, heartbeat, and jittered reconnection backoff.

pub mod backoff;
pub mod connection;
pub mod transport;

pub use backoff::Backoff;
pub use connection::{AckHandle, ConnectionManager, ConnectionState, Notification};
pub use transport::{duplex_pair, ChannelConnector, Connector, ServerEnd, Transport};
