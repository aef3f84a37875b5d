//! End-to-end session scenarios against a scripted in-memory server.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::sleep;

use fernweh_chat::{InMemoryCaptureDevice, SessionEvent, SessionRegistry};
use fernweh_net::{ChannelConnector, ConnectionManager, ConnectionState, ServerEnd};
use fernweh_shared::protocol::{
    ClientCommand, CommandFrame, HandshakeStatus, ReactionAction, ServerAck, ServerEvent,
    WireMessage,
};
use fernweh_shared::types::{ConversationId, MessageId, MessageKind, MessageStatus, UserId};

/// Accept the next live connection attempt and complete the auth
/// handshake. Attempts abandoned to the handshake timeout show up as
/// already-closed server ends and are skipped.
async fn accept_session(accept_rx: &mut mpsc::Receiver<ServerEnd>) -> ServerEnd {
    loop {
        let mut server = accept_rx.recv().await.expect("connection attempt");
        match server.recv_frame().await {
            Some(frame) => {
                assert!(matches!(frame.command, ClientCommand::Auth { .. }));
                server
                    .emit(ServerEvent::ConnectionStatus {
                        status: HandshakeStatus::Connected,
                        message: None,
                    })
                    .await;
                return server;
            }
            None => continue,
        }
    }
}

/// Next frame that is not a heartbeat.
async fn next_app_frame(server: &mut ServerEnd) -> CommandFrame {
    loop {
        let frame = server.recv_frame().await.expect("frame");
        match frame.command {
            ClientCommand::Ping => server.emit(ServerEvent::Pong).await,
            _ => return frame,
        }
    }
}

async fn connected() -> (SessionRegistry, mpsc::Receiver<ServerEnd>, ServerEnd) {
    let (connector, mut accept_rx) = ChannelConnector::new();
    let manager = ConnectionManager::new(Arc::new(connector));

    let connect = manager.connect("travel-token");
    let (result, server) = tokio::join!(connect, accept_session(&mut accept_rx));
    result.unwrap();

    let registry = SessionRegistry::new(manager, UserId::new("me"));
    (registry, accept_rx, server)
}

fn wire(id: &str, sender: &str, conversation: &ConversationId, content: &str) -> WireMessage {
    WireMessage {
        id: MessageId::new(id),
        conversation_id: conversation.clone(),
        sender_id: UserId::new(sender),
        kind: MessageKind::Text,
        content: content.into(),
        attachment: None,
        server_timestamp: Utc::now(),
        edited_at: None,
        deleted_at: None,
        reactions: Vec::new(),
    }
}

async fn ack_send(server: &ServerEnd, frame: &CommandFrame, id: &str) {
    let ClientCommand::SendMessage { client_id, .. } = &frame.command else {
        panic!("expected a send, got {:?}", frame.command);
    };
    server
        .emit(ServerEvent::Ack(ServerAck {
            correlation_id: frame.correlation_id,
            client_id: Some(*client_id),
            message_id: Some(MessageId::new(id)),
            server_timestamp: Some(Utc::now()),
        }))
        .await;
}

#[tokio::test(start_paused = true)]
async fn optimistic_send_resolves_to_sent() {
    let (registry, _accept_rx, mut server) = connected().await;
    let conversation = ConversationId::new();
    let session = registry.open(conversation, UserId::new("peer"));
    let mut snapshots = session.watch();

    let client_id = session.send_text("landed, where are you?").await;

    // Visible immediately as pending, before any server round trip.
    snapshots
        .wait_for(|s| {
            s.messages.len() == 1 && s.messages[0].status == MessageStatus::Pending
        })
        .await
        .unwrap();

    let frame = next_app_frame(&mut server).await;
    ack_send(&server, &frame, "m1").await;

    let snapshot = snapshots
        .wait_for(|s| s.messages[0].status == MessageStatus::Sent)
        .await
        .unwrap()
        .clone();
    assert_eq!(snapshot.messages[0].id, Some(MessageId::new("m1")));
    assert_eq!(snapshot.messages[0].client_id, Some(client_id));
    assert_eq!(snapshot.messages.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn offline_send_fails_then_retry_reuses_client_id() {
    let (registry, mut accept_rx, server) = connected().await;
    let conversation = ConversationId::new();
    let session = registry.open(conversation, UserId::new("peer"));
    let mut snapshots = session.watch();
    let mut events = session.subscribe();

    drop(server);
    snapshots
        .wait_for(|s| s.connection == ConnectionState::Reconnecting)
        .await
        .unwrap();

    // No transport: the entry stays visible and fails after the bounded
    // wait instead of silently vanishing.
    let client_id = session.send_text("are you at the hostel?").await;
    snapshots
        .wait_for(|s| {
            s.messages
                .iter()
                .any(|m| m.client_id == Some(client_id) && m.status == MessageStatus::Failed)
        })
        .await
        .unwrap();

    loop {
        if let SessionEvent::MessageFailed { client_id: failed } = events.recv().await.unwrap() {
            assert_eq!(failed, client_id);
            break;
        }
    }

    // Reconnect; nothing is replayed automatically.
    let mut server = accept_session(&mut accept_rx).await;
    snapshots
        .wait_for(|s| s.connection == ConnectionState::Connected)
        .await
        .unwrap();

    // Explicit retry goes out under the same client id.
    session.retry_message(client_id).await;
    let frame = next_app_frame(&mut server).await;
    let ClientCommand::SendMessage {
        client_id: sent, ..
    } = frame.command
    else {
        panic!("expected retry send, got {:?}", frame.command);
    };
    assert_eq!(sent, client_id);

    ack_send(&server, &frame, "m1").await;
    let snapshot = snapshots
        .wait_for(|s| s.messages[0].status == MessageStatus::Sent)
        .await
        .unwrap()
        .clone();
    assert_eq!(snapshot.messages.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn send_orphaned_by_quick_reconnect_fails_for_retry() {
    let (registry, mut accept_rx, mut server) = connected().await;
    let conversation = ConversationId::new();
    let session = registry.open(conversation, UserId::new("peer"));
    let mut snapshots = session.watch();
    let mut events = session.subscribe();

    // The server receives the send but the transport dies before any ack.
    let client_id = session.send_text("boarding, talk soon").await;
    let frame = next_app_frame(&mut server).await;
    assert!(matches!(frame.command, ClientCommand::SendMessage { .. }));
    drop(server);

    // Reconnect lands well inside the ack window. The ack can never
    // arrive on the new transport, so the entry must fail rather than
    // stay pending forever.
    let mut server = accept_session(&mut accept_rx).await;
    snapshots
        .wait_for(|s| s.connection == ConnectionState::Connected)
        .await
        .unwrap();
    snapshots
        .wait_for(|s| {
            s.messages
                .iter()
                .any(|m| m.client_id == Some(client_id) && m.status == MessageStatus::Failed)
        })
        .await
        .unwrap();
    loop {
        if let SessionEvent::MessageFailed { client_id: failed } = events.recv().await.unwrap() {
            assert_eq!(failed, client_id);
            break;
        }
    }

    // The retry affordance works on the fresh transport.
    session.retry_message(client_id).await;
    let frame = next_app_frame(&mut server).await;
    ack_send(&server, &frame, "m1").await;
    snapshots
        .wait_for(|s| s.messages[0].status == MessageStatus::Sent)
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn reconnect_never_replays_acked_sends() {
    let (registry, mut accept_rx, mut server) = connected().await;
    let conversation = ConversationId::new();
    let session = registry.open(conversation, UserId::new("peer"));
    let mut snapshots = session.watch();

    session.send_text("boarding now").await;
    let frame = next_app_frame(&mut server).await;
    ack_send(&server, &frame, "m1").await;
    snapshots
        .wait_for(|s| s.messages[0].status == MessageStatus::Sent)
        .await
        .unwrap();

    drop(server);
    let mut server = accept_session(&mut accept_rx).await;
    snapshots
        .wait_for(|s| s.connection == ConnectionState::Connected)
        .await
        .unwrap();

    // Only heartbeats may flow on the fresh transport.
    let quiet = async {
        loop {
            match server.recv_frame().await {
                Some(frame) if matches!(frame.command, ClientCommand::Ping) => {
                    server.emit(ServerEvent::Pong).await;
                }
                Some(frame) => panic!("unexpected replay: {:?}", frame.command),
                None => panic!("transport dropped"),
            }
        }
    };
    tokio::select! {
        _ = quiet => unreachable!(),
        _ = sleep(Duration::from_secs(60)) => {}
    }
}

#[tokio::test(start_paused = true)]
async fn duplicate_delivery_is_idempotent() {
    let (registry, _accept_rx, server) = connected().await;
    let conversation = ConversationId::new();
    let session = registry.open(conversation.clone(), UserId::new("peer"));
    let mut snapshots = session.watch();

    let message = wire("m1", "peer", &conversation, "train is delayed");
    server
        .emit(ServerEvent::NewMessage {
            message: message.clone(),
        })
        .await;
    // Redelivery after a simulated reconnect window.
    server.emit(ServerEvent::NewMessage { message }).await;

    snapshots.wait_for(|s| !s.messages.is_empty()).await.unwrap();
    // Paused clock: the sleep elapses only once every task has drained
    // its queues, so the redelivery has definitely been processed.
    sleep(Duration::from_millis(50)).await;
    let snapshot = session.snapshot();
    assert_eq!(snapshot.messages.len(), 1);
    assert_eq!(snapshot.messages[0].content, "train is delayed");
}

#[tokio::test(start_paused = true)]
async fn reactions_dedupe_across_echo_and_peers() {
    let (registry, _accept_rx, mut server) = connected().await;
    let conversation = ConversationId::new();
    let session = registry.open(conversation.clone(), UserId::new("peer"));
    let mut snapshots = session.watch();

    server
        .emit(ServerEvent::NewMessage {
            message: wire("m1", "peer", &conversation, "made it to the summit"),
        })
        .await;
    snapshots.wait_for(|s| !s.messages.is_empty()).await.unwrap();

    session.react(MessageId::new("m1"), "🔥").await;
    snapshots
        .wait_for(|s| s.messages[0].reactions.len() == 1)
        .await
        .unwrap();

    let frame = next_app_frame(&mut server).await;
    assert!(matches!(frame.command, ClientCommand::AddReaction { .. }));
    server
        .emit(ServerEvent::Ack(ServerAck {
            correlation_id: frame.correlation_id,
            client_id: None,
            message_id: None,
            server_timestamp: None,
        }))
        .await;

    // Our own reaction echoed back must not double up.
    server
        .emit(ServerEvent::Reaction {
            conversation_id: conversation.clone(),
            message_id: MessageId::new("m1"),
            user_id: UserId::new("me"),
            emoji: "🔥".into(),
            action: ReactionAction::Add,
        })
        .await;
    server
        .emit(ServerEvent::Reaction {
            conversation_id: conversation,
            message_id: MessageId::new("m1"),
            user_id: UserId::new("peer"),
            emoji: "🔥".into(),
            action: ReactionAction::Add,
        })
        .await;

    let snapshot = snapshots
        .wait_for(|s| s.messages[0].reactions.len() == 2)
        .await
        .unwrap()
        .clone();
    assert_eq!(snapshot.messages[0].reactions.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn rejected_reaction_rolls_back() {
    let (registry, _accept_rx, mut server) = connected().await;
    let conversation = ConversationId::new();
    let session = registry.open(conversation.clone(), UserId::new("peer"));
    let mut snapshots = session.watch();

    server
        .emit(ServerEvent::NewMessage {
            message: wire("m1", "peer", &conversation, "sunset pics incoming"),
        })
        .await;
    snapshots.wait_for(|s| !s.messages.is_empty()).await.unwrap();

    session.react(MessageId::new("m1"), "👍").await;
    snapshots
        .wait_for(|s| s.messages[0].reactions.len() == 1)
        .await
        .unwrap();

    let frame = next_app_frame(&mut server).await;
    server
        .emit(ServerEvent::AckFailed {
            correlation_id: frame.correlation_id,
            client_id: None,
            reason: "reactions disabled".into(),
        })
        .await;

    snapshots
        .wait_for(|s| s.messages[0].reactions.is_empty())
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn typing_debounces_to_one_start_and_one_trailing_stop() {
    let (registry, _accept_rx, mut server) = connected().await;
    let conversation = ConversationId::new();
    let session = registry.open(conversation, UserId::new("peer"));

    // A burst of keystrokes.
    for _ in 0..5 {
        session.set_typing().await;
    }

    let frame = next_app_frame(&mut server).await;
    assert!(
        matches!(frame.command, ClientCommand::Typing { typing: true, .. }),
        "expected one typing start, got {:?}",
        frame.command
    );

    // Idle: the next typing frame must be the stop, not another start.
    let frame = next_app_frame(&mut server).await;
    assert!(
        matches!(frame.command, ClientCommand::Typing { typing: false, .. }),
        "expected trailing stop, got {:?}",
        frame.command
    );
}

#[tokio::test(start_paused = true)]
async fn sending_a_message_stops_typing_first() {
    let (registry, _accept_rx, mut server) = connected().await;
    let conversation = ConversationId::new();
    let session = registry.open(conversation, UserId::new("peer"));

    session.set_typing().await;
    let frame = next_app_frame(&mut server).await;
    assert!(matches!(frame.command, ClientCommand::Typing { typing: true, .. }));

    session.send_text("here!").await;
    let frame = next_app_frame(&mut server).await;
    assert!(
        matches!(frame.command, ClientCommand::Typing { typing: false, .. }),
        "send must end the typing indicator eagerly, got {:?}",
        frame.command
    );
    let frame = next_app_frame(&mut server).await;
    assert!(matches!(frame.command, ClientCommand::SendMessage { .. }));
}

#[tokio::test(start_paused = true)]
async fn remote_typing_expires_without_a_stop_event() {
    let (registry, _accept_rx, server) = connected().await;
    let conversation = ConversationId::new();
    let session = registry.open(conversation.clone(), UserId::new("peer"));
    let mut snapshots = session.watch();

    server
        .emit(ServerEvent::Typing {
            conversation_id: conversation,
            user_id: UserId::new("peer"),
            typing: true,
        })
        .await;

    let snapshot = snapshots
        .wait_for(|s| s.remote_typing_until.is_some())
        .await
        .unwrap()
        .clone();
    let now = tokio::time::Instant::now();
    assert!(snapshot.is_remote_typing(now));
    // The stop event is lost; the TTL clears the indicator anyway.
    assert!(!snapshot.is_remote_typing(now + Duration::from_secs(5)));
}

#[tokio::test(start_paused = true)]
async fn voice_capture_sends_an_audio_message() {
    let (registry, _accept_rx, mut server) = connected().await;
    let conversation = ConversationId::new();
    let session = registry.open(conversation, UserId::new("peer"));
    let mut snapshots = session.watch();

    let capture = registry.begin_capture(Arc::new(InMemoryCaptureDevice)).unwrap();
    tokio::time::advance(Duration::from_secs(3)).await;
    assert_eq!(capture.elapsed_seconds(), 3);

    let client_id = session.send_audio(capture).await.unwrap();

    let frame = next_app_frame(&mut server).await;
    let ClientCommand::SendMessage {
        kind, attachment, ..
    } = &frame.command
    else {
        panic!("expected audio send, got {:?}", frame.command);
    };
    assert_eq!(*kind, MessageKind::Audio);
    assert!(attachment.is_some());

    ack_send(&server, &frame, "m1").await;
    snapshots
        .wait_for(|s| {
            s.messages
                .iter()
                .any(|m| m.client_id == Some(client_id) && m.status == MessageStatus::Sent)
        })
        .await
        .unwrap();

    // The device is free again once the capture was consumed.
    registry.begin_capture(Arc::new(InMemoryCaptureDevice)).unwrap();
}

#[tokio::test(start_paused = true)]
async fn read_receipts_are_monotonic() {
    let (registry, _accept_rx, mut server) = connected().await;
    let conversation = ConversationId::new();
    let session = registry.open(conversation.clone(), UserId::new("peer"));
    let mut snapshots = session.watch();

    session.send_text("did you see the itinerary?").await;
    let frame = next_app_frame(&mut server).await;
    ack_send(&server, &frame, "m1").await;
    snapshots
        .wait_for(|s| s.messages[0].status == MessageStatus::Sent)
        .await
        .unwrap();

    server
        .emit(ServerEvent::MessageRead {
            conversation_id: conversation.clone(),
            message_ids: vec![MessageId::new("m1")],
        })
        .await;
    snapshots
        .wait_for(|s| s.messages[0].status == MessageStatus::Read)
        .await
        .unwrap();

    // A delivery receipt arriving late must not regress the read state.
    server
        .emit(ServerEvent::MessageStatus {
            conversation_id: conversation,
            message_id: MessageId::new("m1"),
            status: MessageStatus::Delivered,
        })
        .await;
    sleep(Duration::from_millis(50)).await;
    assert_eq!(session.snapshot().messages[0].status, MessageStatus::Read);
}

#[tokio::test(start_paused = true)]
async fn mark_read_applies_locally_and_notifies_the_server() {
    let (registry, _accept_rx, mut server) = connected().await;
    let conversation = ConversationId::new();
    let session = registry.open(conversation.clone(), UserId::new("peer"));
    let mut snapshots = session.watch();

    server
        .emit(ServerEvent::NewMessage {
            message: wire("m1", "peer", &conversation, "call me when you land"),
        })
        .await;
    snapshots.wait_for(|s| !s.messages.is_empty()).await.unwrap();

    session.mark_read().await;
    snapshots
        .wait_for(|s| s.messages[0].status == MessageStatus::Read)
        .await
        .unwrap();

    let frame = next_app_frame(&mut server).await;
    assert!(matches!(frame.command, ClientCommand::MarkRead { .. }));
}

#[tokio::test(start_paused = true)]
async fn history_page_merges_and_flips_has_more() {
    let (registry, _accept_rx, mut server) = connected().await;
    let conversation = ConversationId::new();
    let session = registry.open(conversation.clone(), UserId::new("peer"));
    let mut snapshots = session.watch();

    session.load_more_history().await;
    let frame = next_app_frame(&mut server).await;
    let ClientCommand::LoadHistory { before, limit, .. } = frame.command else {
        panic!("expected history request, got {:?}", frame.command);
    };
    assert!(before.is_none());
    assert_eq!(limit, 50);

    // A short page: nothing older remains.
    server
        .emit(ServerEvent::HistoryPage {
            conversation_id: conversation.clone(),
            messages: vec![
                wire("m1", "peer", &conversation, "day one: old town"),
                wire("m2", "me", &conversation, "meet at the fountain"),
            ],
        })
        .await;

    let snapshot = snapshots
        .wait_for(|s| s.messages.len() == 2)
        .await
        .unwrap()
        .clone();
    assert!(!snapshot.has_more_history);
}

#[tokio::test(start_paused = true)]
async fn peer_presence_reaches_the_snapshot() {
    let (registry, _accept_rx, server) = connected().await;
    let conversation = ConversationId::new();
    let session = registry.open(conversation, UserId::new("peer"));
    let mut snapshots = session.watch();

    server
        .emit(ServerEvent::UserStatus {
            user_id: UserId::new("peer"),
            online: true,
        })
        .await;
    snapshots.wait_for(|s| s.peer_online).await.unwrap();

    // Another user's presence is not ours.
    server
        .emit(ServerEvent::UserStatus {
            user_id: UserId::new("someone-else"),
            online: false,
        })
        .await;
    sleep(Duration::from_millis(50)).await;
    assert!(session.snapshot().peer_online);
}

#[tokio::test(start_paused = true)]
async fn remote_edit_and_delete_apply_for_the_author_only() {
    let (registry, _accept_rx, server) = connected().await;
    let conversation = ConversationId::new();
    let session = registry.open(conversation.clone(), UserId::new("peer"));
    let mut snapshots = session.watch();

    server
        .emit(ServerEvent::NewMessage {
            message: wire("m1", "peer", &conversation, "wrnog gate"),
        })
        .await;
    snapshots.wait_for(|s| !s.messages.is_empty()).await.unwrap();

    server
        .emit(ServerEvent::MessageEdited {
            conversation_id: conversation.clone(),
            message_id: MessageId::new("m1"),
            sender_id: UserId::new("peer"),
            content: "wrong gate".into(),
            edited_at: Utc::now(),
        })
        .await;
    snapshots
        .wait_for(|s| s.messages[0].content == "wrong gate")
        .await
        .unwrap();

    server
        .emit(ServerEvent::MessageDeleted {
            conversation_id: conversation,
            message_id: MessageId::new("m1"),
            sender_id: UserId::new("peer"),
            deleted_at: Utc::now(),
        })
        .await;
    // Soft delete: the tombstone stays in the log.
    let snapshot = snapshots
        .wait_for(|s| s.messages[0].deleted_at.is_some())
        .await
        .unwrap()
        .clone();
    assert_eq!(snapshot.messages.len(), 1);
}
