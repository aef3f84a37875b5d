//! Connection manager with tokio mpsc command / broadcast notification
//! pattern.
//!
//! The connection event loop runs in a dedicated tokio task. External code
//! talks to it through a command channel and subscribes to a notification
//! channel; the current connection state is additionally published on a
//! watch channel so callers can fail fast without a round trip.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{interval_at, sleep, Instant};
use tracing::{debug, info, warn};

use fernweh_shared::constants::{
    BACKOFF_BASE, BACKOFF_CAP, HANDSHAKE_TIMEOUT, HEARTBEAT_INTERVAL, MAX_MISSED_HEARTBEATS,
};
use fernweh_shared::error::{ConnectError, SendError};
use fernweh_shared::protocol::{
    ClientCommand, CommandFrame, HandshakeStatus, ServerAck, ServerEvent,
};
use fernweh_shared::types::CorrelationId;

use crate::backoff::Backoff;
use crate::transport::{Connector, Transport};

/// Lifecycle of the single transport owned by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

/// Notifications fanned out to subscribers.
#[derive(Debug, Clone)]
pub enum Notification {
    StateChanged(ConnectionState),
    /// A remote-originated server event (message, typing, delivery, ...).
    /// Acks are not forwarded here; they resolve their [`AckHandle`].
    Event(ServerEvent),
    /// A server error not tied to any outstanding command.
    Error { message: String },
}

/// Pending acknowledgement of one dispatched command.
///
/// Resolves when the server acks or rejects the command; if the transport
/// is lost first, the handle resolves with [`SendError::AckTimeout`]. The
/// caller decides what to retry; a reconnect never replays commands.
#[derive(Debug)]
pub struct AckHandle {
    correlation_id: CorrelationId,
    rx: oneshot::Receiver<Result<ServerAck, SendError>>,
}

impl AckHandle {
    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    pub async fn wait(self) -> Result<ServerAck, SendError> {
        match self.rx.await {
            Ok(result) => result,
            // Ack table dropped on transport loss.
            Err(_) => Err(SendError::AckTimeout),
        }
    }
}

enum ManagerCommand {
    Connect {
        token: String,
        reply: oneshot::Sender<Result<(), ConnectError>>,
    },
    Send {
        command: ClientCommand,
        reply: oneshot::Sender<Result<AckHandle, ConnectError>>,
    },
    SetForeground(bool),
    Disconnect,
}

/// Handle to the connection task. Cheap to clone; all clones drive the
/// same single transport.
#[derive(Clone)]
pub struct ConnectionManager {
    cmd_tx: mpsc::Sender<ManagerCommand>,
    notif_tx: broadcast::Sender<Notification>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl ConnectionManager {
    /// Spawn the connection task in `Idle` state. Nothing dials until
    /// [`connect`](Self::connect) supplies a credential.
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (notif_tx, _) = broadcast::channel(256);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);

        let actor = ConnectionActor {
            connector,
            cmd_rx,
            notif_tx: notif_tx.clone(),
            state_tx,
            foreground: true,
            backoff: Backoff::new(BACKOFF_BASE, BACKOFF_CAP),
        };
        tokio::spawn(actor.run());

        Self {
            cmd_tx,
            notif_tx,
            state_rx,
        }
    }

    /// Establish the transport and perform the auth handshake. Resolves
    /// once the first attempt succeeds or fails; an auth rejection is
    /// terminal and moves the manager to `Closed`.
    pub async fn connect(&self, token: impl Into<String>) -> Result<(), ConnectError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(ManagerCommand::Connect {
                token: token.into(),
                reply,
            })
            .await
            .map_err(|_| ConnectError::Closed)?;
        rx.await.map_err(|_| ConnectError::Closed)?
    }

    /// Dispatch a correlation-tagged command. Fails fast with
    /// `NotConnected` when no transport is live; the core never buffers
    /// commands across disconnects.
    pub async fn send(&self, command: ClientCommand) -> Result<AckHandle, ConnectError> {
        match *self.state_rx.borrow() {
            ConnectionState::Connected => {}
            ConnectionState::Closed => return Err(ConnectError::Closed),
            _ => return Err(ConnectError::NotConnected),
        }

        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(ManagerCommand::Send { command, reply })
            .await
            .map_err(|_| ConnectError::Closed)?;
        rx.await.map_err(|_| ConnectError::Closed)?
    }

    /// Pause (background) or resume (foreground) the reconnection loop.
    /// Foregrounding during a backoff wait triggers an immediate attempt.
    pub async fn set_foreground(&self, foreground: bool) {
        let _ = self
            .cmd_tx
            .send(ManagerCommand::SetForeground(foreground))
            .await;
    }

    /// Release the transport and stop the task. Idempotent.
    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(ManagerCommand::Disconnect).await;
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notif_tx.subscribe()
    }
}

/// Why the connected phase ended.
enum Exit {
    /// Transport gone or heartbeats unanswered: go to `Reconnecting`.
    Lost,
    /// Server revoked the session mid-flight: terminal.
    AuthRevoked,
    /// Caller asked to disconnect (or dropped every handle): terminal.
    Disconnect,
}

struct ConnectionActor {
    connector: Arc<dyn Connector>,
    cmd_rx: mpsc::Receiver<ManagerCommand>,
    notif_tx: broadcast::Sender<Notification>,
    state_tx: watch::Sender<ConnectionState>,
    foreground: bool,
    backoff: Backoff,
}

impl ConnectionActor {
    async fn run(mut self) {
        'idle: loop {
            // Idle until a credential arrives.
            let (token, connect_reply) = loop {
                match self.cmd_rx.recv().await {
                    Some(ManagerCommand::Connect { token, reply }) => break (token, reply),
                    Some(ManagerCommand::Send { reply, .. }) => {
                        let _ = reply.send(Err(ConnectError::NotConnected));
                    }
                    Some(ManagerCommand::SetForeground(fg)) => self.foreground = fg,
                    Some(ManagerCommand::Disconnect) | None => {
                        self.set_state(ConnectionState::Closed);
                        return;
                    }
                }
            };

            self.set_state(ConnectionState::Connecting);
            self.backoff.reset();
            let mut first_reply = Some(connect_reply);

            loop {
                match self.establish(&token).await {
                    Ok(transport) => {
                        self.backoff.reset();
                        if let Some(reply) = first_reply.take() {
                            let _ = reply.send(Ok(()));
                        }
                        self.set_state(ConnectionState::Connected);
                        info!("Connected to messaging server");

                        match self.serve(transport).await {
                            Exit::Lost => {
                                warn!("Transport lost, entering reconnect loop");
                                self.set_state(ConnectionState::Reconnecting);
                            }
                            Exit::AuthRevoked => {
                                self.notify(Notification::Error {
                                    message: "session revoked by server".into(),
                                });
                                self.set_state(ConnectionState::Closed);
                                return;
                            }
                            Exit::Disconnect => {
                                self.set_state(ConnectionState::Closed);
                                return;
                            }
                        }
                    }
                    Err(ConnectError::AuthRejected(reason)) => {
                        warn!(reason = %reason, "Auth rejected, closing");
                        if let Some(reply) = first_reply.take() {
                            let _ = reply.send(Err(ConnectError::AuthRejected(reason.clone())));
                        } else {
                            self.notify(Notification::Error {
                                message: format!("auth rejected: {reason}"),
                            });
                        }
                        self.set_state(ConnectionState::Closed);
                        return;
                    }
                    Err(err) => {
                        // The very first attempt reports its failure to the
                        // caller and returns to idle; reconnect attempts
                        // after an established session are unlimited.
                        if let Some(reply) = first_reply.take() {
                            let _ = reply.send(Err(err));
                            self.set_state(ConnectionState::Idle);
                            continue 'idle;
                        }
                        debug!(error = %err, "Reconnect attempt failed");
                    }
                }

                if !self.backoff_wait().await {
                    self.set_state(ConnectionState::Closed);
                    return;
                }
            }
        }
    }

    /// Dial a transport and run the auth handshake, all within the
    /// handshake timeout.
    async fn establish(&self, token: &str) -> Result<Transport, ConnectError> {
        let attempt = async {
            let mut transport = self.connector.connect().await?;

            let auth = CommandFrame::tag(ClientCommand::Auth {
                token: token.to_string(),
            });
            transport
                .send(auth)
                .await
                .map_err(|_| ConnectError::Timeout)?;

            loop {
                match transport.recv().await {
                    Some(ServerEvent::ConnectionStatus { status, message }) => match status {
                        HandshakeStatus::Connected => return Ok(transport),
                        HandshakeStatus::Rejected => {
                            return Err(ConnectError::AuthRejected(message.unwrap_or_default()))
                        }
                    },
                    // Anything else before the handshake verdict is noise.
                    Some(_) => continue,
                    None => return Err(ConnectError::Timeout),
                }
            }
        };

        tokio::time::timeout(HANDSHAKE_TIMEOUT, attempt)
            .await
            .map_err(|_| ConnectError::Timeout)?
    }

    /// Connected phase. Owns the transport and the ack table; returning
    /// drops both, which resolves every outstanding `AckHandle` with
    /// `AckTimeout`.
    async fn serve(&mut self, mut transport: Transport) -> Exit {
        let mut acks: HashMap<CorrelationId, oneshot::Sender<Result<ServerAck, SendError>>> =
            HashMap::new();
        let mut heartbeat = interval_at(Instant::now() + HEARTBEAT_INTERVAL, HEARTBEAT_INTERVAL);
        let mut outstanding_pings: u32 = 0;

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(ManagerCommand::Send { command, reply }) => {
                        let frame = CommandFrame::tag(command);
                        let correlation_id = frame.correlation_id;
                        let (ack_tx, ack_rx) = oneshot::channel();
                        acks.insert(correlation_id, ack_tx);

                        if transport.send(frame).await.is_err() {
                            acks.remove(&correlation_id);
                            let _ = reply.send(Err(ConnectError::NotConnected));
                            return Exit::Lost;
                        }
                        debug!(correlation = %correlation_id, "Command dispatched");
                        let _ = reply.send(Ok(AckHandle { correlation_id, rx: ack_rx }));
                    }
                    Some(ManagerCommand::Connect { reply, .. }) => {
                        // Already connected.
                        let _ = reply.send(Ok(()));
                    }
                    Some(ManagerCommand::SetForeground(fg)) => self.foreground = fg,
                    Some(ManagerCommand::Disconnect) | None => return Exit::Disconnect,
                },

                event = transport.recv() => match event {
                    None => return Exit::Lost,
                    Some(ServerEvent::Pong) => {
                        outstanding_pings = 0;
                    }
                    Some(ServerEvent::Ack(ack)) => {
                        if let Some(tx) = acks.remove(&ack.correlation_id) {
                            let _ = tx.send(Ok(ack));
                        } else {
                            // Duplicate ack after reconnect; correlation id
                            // already resolved or abandoned.
                            debug!(correlation = %ack.correlation_id, "Unmatched ack ignored");
                        }
                    }
                    Some(ServerEvent::AckFailed { correlation_id, reason, .. }) => {
                        if let Some(tx) = acks.remove(&correlation_id) {
                            let _ = tx.send(Err(SendError::ServerRejected(reason)));
                        }
                    }
                    Some(ServerEvent::Error { correlation_id: Some(correlation_id), message }) => {
                        if let Some(tx) = acks.remove(&correlation_id) {
                            let _ = tx.send(Err(SendError::ServerRejected(message)));
                        } else {
                            self.notify(Notification::Error { message });
                        }
                    }
                    Some(ServerEvent::Error { correlation_id: None, message }) => {
                        self.notify(Notification::Error { message });
                    }
                    Some(ServerEvent::ConnectionStatus { status: HandshakeStatus::Rejected, .. }) => {
                        return Exit::AuthRevoked;
                    }
                    Some(ServerEvent::ConnectionStatus { .. }) => {}
                    Some(other) => {
                        self.notify(Notification::Event(other));
                    }
                },

                _ = heartbeat.tick() => {
                    if outstanding_pings >= MAX_MISSED_HEARTBEATS {
                        warn!(missed = outstanding_pings, "Heartbeats unanswered");
                        return Exit::Lost;
                    }
                    outstanding_pings += 1;
                    let ping = CommandFrame::tag(ClientCommand::Ping);
                    if transport.send(ping).await.is_err() {
                        return Exit::Lost;
                    }
                }
            }
        }
    }

    /// Sleep out the next backoff delay, paused while backgrounded.
    /// Returns `false` when the actor should shut down instead of retrying.
    async fn backoff_wait(&mut self) -> bool {
        // Parked while backgrounded: no timer churn, no dial attempts.
        while !self.foreground {
            match self.cmd_rx.recv().await {
                Some(ManagerCommand::SetForeground(fg)) => {
                    self.foreground = fg;
                    if fg {
                        // Immediate attempt on foregrounding.
                        return true;
                    }
                }
                Some(ManagerCommand::Send { reply, .. }) => {
                    let _ = reply.send(Err(ConnectError::NotConnected));
                }
                Some(ManagerCommand::Connect { reply, .. }) => {
                    let _ = reply.send(Ok(()));
                }
                Some(ManagerCommand::Disconnect) | None => return false,
            }
        }

        let delay = self.backoff.next_delay();
        debug!(attempt = self.backoff.attempt(), delay_ms = delay.as_millis() as u64, "Backoff");
        let deadline = sleep(delay);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => return true,
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(ManagerCommand::SetForeground(true)) => {
                        self.foreground = true;
                        // Immediate attempt on foregrounding.
                        return true;
                    }
                    Some(ManagerCommand::SetForeground(false)) => {
                        self.foreground = false;
                        // Abandon the timer until foregrounded again.
                        return Box::pin(self.backoff_wait()).await;
                    }
                    Some(ManagerCommand::Send { reply, .. }) => {
                        let _ = reply.send(Err(ConnectError::NotConnected));
                    }
                    Some(ManagerCommand::Connect { reply, .. }) => {
                        let _ = reply.send(Ok(()));
                    }
                    Some(ManagerCommand::Disconnect) | None => return false,
                }
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let _ = self.state_tx.send(state);
        self.notify(Notification::StateChanged(state));
    }

    fn notify(&self, notification: Notification) {
        // No subscribers is fine; send errors only mean that.
        let _ = self.notif_tx.send(notification);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ChannelConnector;
    use fernweh_shared::types::ConversationId;

    async fn accept_and_handshake(
        accept_rx: &mut mpsc::Receiver<crate::transport::ServerEnd>,
    ) -> crate::transport::ServerEnd {
        let mut server = accept_rx.recv().await.expect("connection attempt");
        let frame = server.recv_frame().await.expect("auth frame");
        assert!(matches!(frame.command, ClientCommand::Auth { .. }));
        server
            .emit(ServerEvent::ConnectionStatus {
                status: HandshakeStatus::Connected,
                message: None,
            })
            .await;
        server
    }

    /// Next frame that is not a heartbeat; the paused clock can slip a
    /// ping in between application frames.
    async fn next_app_frame(server: &mut crate::transport::ServerEnd) -> CommandFrame {
        loop {
            let frame = server.recv_frame().await.expect("frame");
            if !matches!(frame.command, ClientCommand::Ping) {
                return frame;
            }
            server.emit(ServerEvent::Pong).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn connect_then_send_resolves_ack() {
        let (connector, mut accept_rx) = ChannelConnector::new();
        let manager = ConnectionManager::new(Arc::new(connector));

        let connect = manager.connect("token-1");
        let (connected, mut server) =
            tokio::join!(connect, accept_and_handshake(&mut accept_rx));
        connected.unwrap();
        assert_eq!(manager.state(), ConnectionState::Connected);

        let handle = manager
            .send(ClientCommand::MarkRead {
                conversation_id: ConversationId::new(),
            })
            .await
            .unwrap();

        let frame = next_app_frame(&mut server).await;
        assert_eq!(frame.correlation_id, handle.correlation_id());
        server
            .emit(ServerEvent::Ack(ServerAck {
                correlation_id: frame.correlation_id,
                client_id: None,
                message_id: None,
                server_timestamp: None,
            }))
            .await;

        let ack = handle.wait().await.unwrap();
        assert_eq!(ack.correlation_id, frame.correlation_id);
    }

    #[tokio::test(start_paused = true)]
    async fn send_while_idle_fails_fast() {
        let (connector, _accept_rx) = ChannelConnector::new();
        let manager = ConnectionManager::new(Arc::new(connector));

        let err = manager.send(ClientCommand::Ping).await.unwrap_err();
        assert_eq!(err, ConnectError::NotConnected);
    }

    #[tokio::test(start_paused = true)]
    async fn auth_rejection_is_terminal() {
        let (connector, mut accept_rx) = ChannelConnector::new();
        let manager = ConnectionManager::new(Arc::new(connector));

        let connect = manager.connect("expired");
        let reject = async {
            let mut server = accept_rx.recv().await.expect("attempt");
            let _ = server.recv_frame().await;
            server
                .emit(ServerEvent::ConnectionStatus {
                    status: HandshakeStatus::Rejected,
                    message: Some("token expired".into()),
                })
                .await;
        };
        let (result, ()) = tokio::join!(connect, reject);

        assert!(matches!(result, Err(ConnectError::AuthRejected(_))));
        // Terminal: no further attempts are made.
        let mut state_rx = manager.watch_state();
        state_rx
            .wait_for(|s| *s == ConnectionState::Closed)
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn transport_loss_triggers_reconnect_with_fresh_handshake() {
        let (connector, mut accept_rx) = ChannelConnector::new();
        let manager = ConnectionManager::new(Arc::new(connector));

        let connect = manager.connect("token-1");
        let (connected, server) = tokio::join!(connect, accept_and_handshake(&mut accept_rx));
        connected.unwrap();

        // Kill the transport.
        drop(server);

        let mut state_rx = manager.watch_state();
        state_rx
            .wait_for(|s| *s == ConnectionState::Reconnecting)
            .await
            .unwrap();

        // Paused clock auto-advances through the backoff; the reconnect
        // attempt restarts the auth handshake.
        let _server = accept_and_handshake(&mut accept_rx).await;
        state_rx
            .wait_for(|s| *s == ConnectionState::Connected)
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn missed_heartbeats_force_reconnect() {
        let (connector, mut accept_rx) = ChannelConnector::new();
        let manager = ConnectionManager::new(Arc::new(connector));

        let connect = manager.connect("token-1");
        let (connected, mut server) = tokio::join!(connect, accept_and_handshake(&mut accept_rx));
        connected.unwrap();

        // Swallow pings, never answer.
        let mut state_rx = manager.watch_state();
        let starve = async {
            loop {
                if server.recv_frame().await.is_none() {
                    // Manager dropped the transport; park forever and let
                    // the state watcher finish the select.
                    std::future::pending::<()>().await;
                }
            }
        };
        tokio::select! {
            _ = starve => unreachable!(),
            result = state_rx.wait_for(|s| *s == ConnectionState::Reconnecting) => {
                result.unwrap();
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn backgrounding_parks_the_reconnect_loop() {
        use std::time::Duration;

        let (connector, mut accept_rx) = ChannelConnector::new();
        let manager = ConnectionManager::new(Arc::new(connector));

        let connect = manager.connect("token-1");
        let (connected, server) = tokio::join!(connect, accept_and_handshake(&mut accept_rx));
        connected.unwrap();

        drop(server);
        let mut state_rx = manager.watch_state();
        state_rx
            .wait_for(|s| *s == ConnectionState::Reconnecting)
            .await
            .unwrap();
        // Lands before the first backoff deadline can fire.
        manager.set_foreground(false).await;

        // Backgrounded: no dial attempts, no matter how long.
        tokio::select! {
            _ = accept_rx.recv() => panic!("dialed while backgrounded"),
            _ = sleep(Duration::from_secs(300)) => {}
        }

        // Foregrounding dials again immediately.
        manager.set_foreground(true).await;
        let _server = accept_and_handshake(&mut accept_rx).await;
        state_rx
            .wait_for(|s| *s == ConnectionState::Connected)
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn ack_handle_times_out_when_transport_lost() {
        let (connector, mut accept_rx) = ChannelConnector::new();
        let manager = ConnectionManager::new(Arc::new(connector));

        let connect = manager.connect("token-1");
        let (connected, mut server) = tokio::join!(connect, accept_and_handshake(&mut accept_rx));
        connected.unwrap();

        let handle = manager
            .send(ClientCommand::MarkRead {
                conversation_id: ConversationId::new(),
            })
            .await
            .unwrap();
        let _ = server.recv_frame().await;
        drop(server);

        assert_eq!(handle.wait().await.unwrap_err(), SendError::AckTimeout);
    }
}
