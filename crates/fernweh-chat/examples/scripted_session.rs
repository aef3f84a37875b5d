//! Drives a full chat session against an in-process scripted server:
//! connect, type, send a text, record and send a voice note, then print
//! the final conversation state.
//!
//! Run with `cargo run -p fernweh-chat --example scripted_session`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::info;

use fernweh_chat::{InMemoryCaptureDevice, SessionRegistry};
use fernweh_net::{ChannelConnector, ConnectionManager, ServerEnd};
use fernweh_shared::constants::APP_NAME;
use fernweh_shared::protocol::{
    ClientCommand, HandshakeStatus, ServerAck, ServerEvent, WireMessage,
};
use fernweh_shared::types::{ConversationId, MessageId, MessageStatus, UserId};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    info!(app = APP_NAME, "Starting scripted session demo");

    let (connector, accept_rx) = ChannelConnector::new();
    let manager = ConnectionManager::new(Arc::new(connector));
    let conversation = ConversationId::new();
    tokio::spawn(run_server(accept_rx, conversation.clone()));

    manager.connect("demo-token").await?;
    let registry = SessionRegistry::new(manager.clone(), UserId::new("traveler"));
    let session = registry.open(conversation, UserId::new("penpal"));
    let mut snapshots = session.watch();

    session.set_typing().await;
    let client_id = session.send_text("just landed in Lisbon!").await;
    snapshots
        .wait_for(|s| {
            s.messages
                .iter()
                .any(|m| m.client_id == Some(client_id) && m.status == MessageStatus::Sent)
        })
        .await?;

    let capture = registry.begin_capture(Arc::new(InMemoryCaptureDevice))?;
    tokio::time::sleep(Duration::from_millis(300)).await;
    session.send_audio(capture).await?;

    // Two sends plus the scripted reply.
    snapshots.wait_for(|s| s.messages.len() >= 3).await?;
    for message in &snapshots.borrow().messages {
        info!(
            sender = %message.sender_id,
            status = ?message.status,
            kind = ?message.kind,
            content = %message.content,
            "message"
        );
    }

    manager.disconnect().await;
    Ok(())
}

/// The remote side: acks every command and replies once to the first text.
async fn run_server(mut accept_rx: mpsc::Receiver<ServerEnd>, conversation: ConversationId) {
    let Some(mut server) = accept_rx.recv().await else {
        return;
    };
    let mut next_id = 0u32;
    let mut replied = false;

    while let Some(frame) = server.recv_frame().await {
        match frame.command {
            ClientCommand::Auth { .. } => {
                server
                    .emit(ServerEvent::ConnectionStatus {
                        status: HandshakeStatus::Connected,
                        message: None,
                    })
                    .await;
            }
            ClientCommand::Ping => server.emit(ServerEvent::Pong).await,
            ClientCommand::SendMessage { client_id, kind, .. } => {
                next_id += 1;
                server
                    .emit(ServerEvent::Ack(ServerAck {
                        correlation_id: frame.correlation_id,
                        client_id: Some(client_id),
                        message_id: Some(MessageId::new(format!("srv-{next_id}"))),
                        server_timestamp: Some(chrono::Utc::now()),
                    }))
                    .await;
                info!(?kind, "Server accepted message");

                if !replied {
                    replied = true;
                    next_id += 1;
                    server
                        .emit(ServerEvent::NewMessage {
                            message: WireMessage {
                                id: MessageId::new(format!("srv-{next_id}")),
                                conversation_id: conversation.clone(),
                                sender_id: UserId::new("penpal"),
                                kind: fernweh_shared::types::MessageKind::Text,
                                content: "welcome! meet at the miradouro?".into(),
                                attachment: None,
                                server_timestamp: chrono::Utc::now(),
                                edited_at: None,
                                deleted_at: None,
                                reactions: Vec::new(),
                            },
                        })
                        .await;
                }
            }
            ClientCommand::Typing { .. } => {}
            _ => {
                server
                    .emit(ServerEvent::Ack(ServerAck {
                        correlation_id: frame.correlation_id,
                        client_id: None,
                        message_id: None,
                        server_timestamp: None,
                    }))
                    .await;
            }
        }
    }
}
