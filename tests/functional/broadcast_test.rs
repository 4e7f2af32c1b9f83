//! Functional tests for the real-time broadcast hub

use serde_json::json;
use service_gateway::broadcast::{
    BroadcastHub, ClientHandle, ConnectionState, MessageOutcome, ServerMessage,
};
use service_gateway::config::BroadcastConfig;
use service_gateway::GatewayError;
use std::time::Duration;

fn hub(config: BroadcastConfig) -> BroadcastHub {
    BroadcastHub::new(config)
}

/// Pull every queued message without waiting
fn drain(client: &mut ClientHandle) -> Vec<ServerMessage> {
    let mut messages = Vec::new();
    while let Ok(message) = client.outbound.try_recv() {
        messages.push(message);
    }
    messages
}

fn join(hub: &BroadcastHub, client: &ClientHandle, room: &str) {
    let raw = json!({"type": "join_room", "room": room}).to_string();
    hub.handle_message(&client.id, &raw).unwrap();
}

fn broadcast(hub: &BroadcastHub, client: &ClientHandle, room: &str, data: serde_json::Value) -> Result<MessageOutcome, GatewayError> {
    let raw = json!({"type": "broadcast", "room": room, "data": data}).to_string();
    hub.handle_message(&client.id, &raw)
}

#[tokio::test]
async fn test_room_broadcast_reaches_other_members() {
    let hub = hub(BroadcastConfig::default());
    let mut clients: Vec<ClientHandle> = (0..4).map(|_| hub.connect()).collect();
    for client in &clients {
        join(&hub, client, "lobby");
    }
    for client in clients.iter_mut() {
        let messages = drain(client);
        assert!(matches!(messages[0], ServerMessage::Welcome { .. }));
    }

    let outcome = broadcast(&hub, &clients[0], "lobby", json!({"text": "hi"})).unwrap();
    assert_eq!(
        outcome,
        MessageOutcome::Broadcast {
            room: "lobby".into(),
            delivered: 3
        }
    );

    let sender = clients[0].id.clone();
    assert!(drain(&mut clients[0]).is_empty());
    for client in clients.iter_mut().skip(1) {
        let messages = drain(client);
        assert_eq!(messages.len(), 1);
        match &messages[0] {
            ServerMessage::Broadcast { room, from, data } => {
                assert_eq!(room, "lobby");
                assert_eq!(from, &sender);
                assert_eq!(data["text"], "hi");
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    let leave = json!({"type": "leave_room", "room": "lobby"}).to_string();
    hub.handle_message(&clients[3].id, &leave).unwrap();
    let outcome = broadcast(&hub, &clients[0], "lobby", json!(1)).unwrap();
    assert_eq!(
        outcome,
        MessageOutcome::Broadcast {
            room: "lobby".into(),
            delivered: 2
        }
    );
    let after_leave = drain(&mut clients[3]);
    assert!(after_leave
        .iter()
        .all(|m| !matches!(m, ServerMessage::Broadcast { .. })));
}

#[tokio::test]
async fn test_two_missed_heartbeats_close_connection() {
    let hub = hub(BroadcastConfig {
        max_missed_heartbeats: 2,
        ..BroadcastConfig::default()
    });
    let mut events = hub.subscribe();

    let mut silent = hub.connect();
    let responsive = hub.connect();
    join(&hub, &silent, "room-1");
    join(&hub, &silent, "room-2");
    join(&hub, &responsive, "room-1");

    // Round one pings everyone
    assert!(hub.heartbeat_tick().is_empty());
    assert!(drain(&mut silent)
        .iter()
        .any(|m| matches!(m, ServerMessage::Ping { .. })));
    hub.handle_message(&responsive.id, r#"{"type":"pong"}"#).unwrap();

    // First miss
    assert!(hub.heartbeat_tick().is_empty());
    hub.mark_alive(&responsive.id);

    // Second miss closes
    let closed = hub.heartbeat_tick();
    assert_eq!(closed, vec![silent.id.clone()]);

    assert_eq!(hub.connection_state(&silent.id), None);
    assert!(hub.connection_rooms(&silent.id).is_empty());
    assert_eq!(hub.room_members("room-1"), vec![responsive.id.clone()]);
    assert!(hub.room_members("room-2").is_empty());
    assert_eq!(hub.connection_state(&responsive.id), Some(ConnectionState::Open));

    let mut silent_states = Vec::new();
    while let Ok(event) = events.try_recv() {
        if event.connection_id == silent.id {
            silent_states.push(event.state);
        }
    }
    assert_eq!(
        silent_states,
        vec![
            ConnectionState::Connecting,
            ConnectionState::Open,
            ConnectionState::Closing,
            ConnectionState::Closed
        ]
    );

    // The client side observes the closed queue once drained
    drain(&mut silent);
    assert!(silent.outbound.recv().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_message_rate_limit_per_second() {
    let hub = hub(BroadcastConfig {
        max_messages_per_second: 5,
        ..BroadcastConfig::default()
    });
    let mut sender = hub.connect();
    let mut receiver = hub.connect();
    join(&hub, &sender, "chat");
    join(&hub, &receiver, "chat");

    // Let the join fall into an earlier window
    tokio::time::advance(Duration::from_millis(1100)).await;
    drain(&mut sender);
    drain(&mut receiver);

    let results: Vec<_> = (0..6)
        .map(|i| broadcast(&hub, &sender, "chat", json!(i)))
        .collect();
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 5);
    assert!(matches!(results[5], Err(GatewayError::RateLimited)));

    let delivered = drain(&mut receiver)
        .into_iter()
        .filter(|m| matches!(m, ServerMessage::Broadcast { .. }))
        .count();
    assert_eq!(delivered, 5);

    let errors: Vec<_> = drain(&mut sender)
        .into_iter()
        .filter_map(|m| match m {
            ServerMessage::Error { code, .. } => Some(code),
            _ => None,
        })
        .collect();
    assert_eq!(errors, vec!["rate_limited".to_string()]);

    // Still connected and allowed again in the next window
    tokio::time::advance(Duration::from_millis(1001)).await;
    assert!(broadcast(&hub, &sender, "chat", json!("again")).is_ok());
}

#[tokio::test]
async fn test_malformed_and_unknown_messages_keep_connection_open() {
    let hub = hub(BroadcastConfig::default());
    let mut client = hub.connect();
    drain(&mut client);

    assert!(matches!(
        hub.handle_message(&client.id, "{not json"),
        Err(GatewayError::Protocol(_))
    ));
    let outcome = hub
        .handle_message(&client.id, r#"{"type":"dance"}"#)
        .unwrap();
    assert_eq!(outcome, MessageOutcome::Ignored { kind: "dance".into() });

    let messages = drain(&mut client);
    assert!(matches!(&messages[..], [ServerMessage::Error { code, .. }] if code == "protocol_error"));
    assert_eq!(hub.connection_state(&client.id), Some(ConnectionState::Open));

    assert_eq!(hub.handle_message(&client.id, r#"{"type":"ping"}"#).unwrap(), MessageOutcome::Pong);
    assert!(matches!(drain(&mut client)[..], [ServerMessage::Pong { .. }]));
}

#[tokio::test]
async fn test_broadcast_requires_membership() {
    let hub = hub(BroadcastConfig::default());
    let outsider = hub.connect();
    let member = hub.connect();
    join(&hub, &member, "private");

    assert!(matches!(
        broadcast(&hub, &outsider, "private", json!("x")),
        Err(GatewayError::Protocol(_))
    ));
}
