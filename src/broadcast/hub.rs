//! Broadcast hub: rooms, rate limiting and heartbeat liveness

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broadcast::connection::{BroadcastConnection, ConnectionState, SendOutcome};
use crate::broadcast::message::{parse_client_message, ClientMessage, Inbound, ServerMessage};
use crate::config::BroadcastConfig;
use crate::error::{GatewayError, Result};

/// A lifecycle transition of one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubEvent {
    pub connection_id: String,
    pub state: ConnectionState,
}

/// What handling one inbound message did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    Joined { room: String, members: usize },
    Left { room: String },
    Broadcast { room: String, delivered: usize },
    Pong,
    HeartbeatAck,
    Ignored { kind: String },
}

/// The client side of a hub connection
#[derive(Debug)]
pub struct ClientHandle {
    pub id: String,
    pub outbound: mpsc::Receiver<ServerMessage>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoomInfo {
    pub name: String,
    pub members: usize,
}

/// Hub counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct HubStats {
    pub connections: usize,
    pub rooms: usize,
    pub total_connections: u64,
    pub messages_received: u64,
    pub messages_delivered: u64,
    pub rate_limited: u64,
    pub protocol_errors: u64,
    pub heartbeat_closes: u64,
}

#[derive(Default)]
struct HubState {
    connections: HashMap<String, BroadcastConnection>,
    rooms: HashMap<String, BTreeSet<String>>,
}

#[derive(Default)]
struct HubCounters {
    total_connections: AtomicU64,
    messages_received: AtomicU64,
    messages_delivered: AtomicU64,
    rate_limited: AtomicU64,
    protocol_errors: AtomicU64,
    heartbeat_closes: AtomicU64,
}

/// Real-time publish/subscribe hub.
///
/// Owns every connection record and room; transports feed it inbound lines
/// and drain each connection's outbound queue.
pub struct BroadcastHub {
    config: BroadcastConfig,
    state: Mutex<HubState>,
    events: broadcast::Sender<HubEvent>,
    counters: HubCounters,
    heartbeat_task: RwLock<Option<JoinHandle<()>>>,
}

impl BroadcastHub {
    pub fn new(config: BroadcastConfig) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            config,
            state: Mutex::new(HubState::default()),
            events,
            counters: HubCounters::default(),
            heartbeat_task: RwLock::new(None),
        }
    }

    /// Subscribe to lifecycle transitions
    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.events.subscribe()
    }

    fn emit(&self, connection_id: &str, state: ConnectionState) {
        // No subscribers is fine
        let _ = self.events.send(HubEvent {
            connection_id: connection_id.to_string(),
            state,
        });
    }

    fn transition(&self, connection: &mut BroadcastConnection, next: ConnectionState) {
        let previous = connection.state;
        if connection.transition(next) {
            debug!(connection_id = %connection.id, from = %previous, to = %next, "Connection state changed");
            self.emit(&connection.id, next);
        }
    }

    /// Register a new client, open it and send the welcome message
    pub fn connect(&self) -> ClientHandle {
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(self.config.outbound_buffer.max(1));
        let mut connection = BroadcastConnection::new(id.clone(), tx);
        self.emit(&id, ConnectionState::Connecting);

        self.transition(&mut connection, ConnectionState::Open);
        connection.send(ServerMessage::Welcome {
            connection_id: id.clone(),
        });

        self.state.lock().connections.insert(id.clone(), connection);
        self.counters.total_connections.fetch_add(1, Ordering::Relaxed);
        info!(connection_id = %id, "Real-time client connected");

        ClientHandle { id, outbound: rx }
    }

    /// Handle one inbound message from a connection.
    ///
    /// Errors are also reported to the offending connection as an `error`
    /// message; the connection stays open.
    pub fn handle_message(&self, connection_id: &str, raw: &str) -> Result<MessageOutcome> {
        let mut state = self.state.lock();
        let HubState { connections, rooms } = &mut *state;

        let connection = connections
            .get_mut(connection_id)
            .filter(|c| c.state == ConnectionState::Open)
            .ok_or_else(|| GatewayError::Protocol(format!("connection {} is not open", connection_id)))?;

        connection.messages_received += 1;
        self.counters.messages_received.fetch_add(1, Ordering::Relaxed);

        let inbound = match parse_client_message(raw) {
            Ok(inbound) => inbound,
            Err(e) => {
                self.counters.protocol_errors.fetch_add(1, Ordering::Relaxed);
                warn!(connection_id = %connection_id, error = %e, "Rejected real-time message");
                connection.send(ServerMessage::error(&e));
                return Err(e);
            }
        };

        // Heartbeat answers are never rate limited
        if inbound == Inbound::Message(ClientMessage::Pong) {
            connection.mark_alive();
            return Ok(MessageOutcome::HeartbeatAck);
        }

        if !connection.allow_message(self.config.max_messages_per_second) {
            self.counters.rate_limited.fetch_add(1, Ordering::Relaxed);
            debug!(connection_id = %connection_id, "Real-time client rate limited");
            let err = GatewayError::RateLimited;
            connection.send(ServerMessage::error(&err));
            return Err(err);
        }

        let message = match inbound {
            Inbound::Message(message) => message,
            Inbound::Unknown(kind) => {
                warn!(connection_id = %connection_id, kind = %kind, "Ignoring unknown message type");
                return Ok(MessageOutcome::Ignored { kind });
            }
        };

        match message {
            ClientMessage::JoinRoom { room } => {
                let members = rooms.entry(room.clone()).or_default();
                members.insert(connection_id.to_string());
                let count = members.len();
                connection.rooms.insert(room.clone());
                connection.send(ServerMessage::RoomJoined {
                    room: room.clone(),
                    members: count,
                });
                debug!(connection_id = %connection_id, room = %room, members = count, "Joined room");
                Ok(MessageOutcome::Joined { room, members: count })
            }
            ClientMessage::LeaveRoom { room } => {
                connection.rooms.remove(&room);
                leave_room(rooms, &room, connection_id);
                connection.send(ServerMessage::RoomLeft { room: room.clone() });
                debug!(connection_id = %connection_id, room = %room, "Left room");
                Ok(MessageOutcome::Left { room })
            }
            ClientMessage::Broadcast { room, data } => {
                if !connection.rooms.contains(&room) {
                    let err = GatewayError::Protocol(format!("not a member of room '{}'", room));
                    connection.send(ServerMessage::error(&err));
                    return Err(err);
                }

                let mut delivered = 0;
                if let Some(members) = rooms.get(&room) {
                    for member in members.iter().filter(|m| m.as_str() != connection_id) {
                        let Some(recipient) = connections.get(member) else {
                            continue;
                        };
                        let outcome = recipient.send(ServerMessage::Broadcast {
                            room: room.clone(),
                            from: connection_id.to_string(),
                            data: data.clone(),
                        });
                        if outcome == SendOutcome::Queued {
                            delivered += 1;
                        }
                    }
                }
                self.counters
                    .messages_delivered
                    .fetch_add(delivered as u64, Ordering::Relaxed);
                debug!(connection_id = %connection_id, room = %room, delivered = delivered, "Broadcast message");
                Ok(MessageOutcome::Broadcast { room, delivered })
            }
            ClientMessage::Ping => {
                connection.send(ServerMessage::Pong {
                    timestamp: chrono::Utc::now().timestamp_millis(),
                });
                Ok(MessageOutcome::Pong)
            }
            ClientMessage::Pong => {
                connection.mark_alive();
                Ok(MessageOutcome::HeartbeatAck)
            }
        }
    }

    /// Record a transport-level heartbeat answer
    pub fn mark_alive(&self, connection_id: &str) {
        if let Some(connection) = self.state.lock().connections.get_mut(connection_id) {
            connection.mark_alive();
        }
    }

    /// Close a connection and remove it from every room
    pub fn disconnect(&self, connection_id: &str) -> bool {
        let mut state = self.state.lock();
        let closed = self.close_locked(&mut state, connection_id);
        if closed {
            info!(connection_id = %connection_id, "Real-time client disconnected");
        }
        closed
    }

    fn close_locked(&self, state: &mut HubState, connection_id: &str) -> bool {
        let Some(mut connection) = state.connections.remove(connection_id) else {
            return false;
        };

        self.transition(&mut connection, ConnectionState::Closing);
        for room in std::mem::take(&mut connection.rooms) {
            leave_room(&mut state.rooms, &room, connection_id);
        }
        self.transition(&mut connection, ConnectionState::Closed);
        // Dropping the record closes its outbound queue
        true
    }

    /// One heartbeat round: close connections over the missed limit, ping the rest.
    ///
    /// Returns the ids closed this round.
    pub fn heartbeat_tick(&self) -> Vec<String> {
        let mut state = self.state.lock();
        let timestamp = chrono::Utc::now().timestamp_millis();
        let mut doomed = Vec::new();

        for connection in state.connections.values_mut() {
            if connection.state != ConnectionState::Open {
                continue;
            }
            if !connection.alive {
                connection.missed_heartbeats += 1;
            }
            if connection.missed_heartbeats >= self.config.max_missed_heartbeats {
                doomed.push(connection.id.clone());
                continue;
            }
            connection.alive = false;
            if connection.send(ServerMessage::Ping { timestamp }) == SendOutcome::Disconnected {
                doomed.push(connection.id.clone());
            }
        }

        for id in &doomed {
            self.close_locked(&mut state, id);
            self.counters.heartbeat_closes.fetch_add(1, Ordering::Relaxed);
            warn!(connection_id = %id, "Closed unresponsive real-time client");
        }
        doomed
    }

    /// Start the heartbeat background task
    pub async fn start(self: &Arc<Self>) {
        let hub = self.clone();
        let interval = self.config.heartbeat_interval();

        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                hub.heartbeat_tick();
            }
        });

        if let Some(previous) = self.heartbeat_task.write().await.replace(handle) {
            previous.abort();
        }
        info!(interval_secs = interval.as_secs(), "Started real-time heartbeat task");
    }

    /// Stop heartbeats and close every connection
    pub async fn shutdown(&self) {
        if let Some(handle) = self.heartbeat_task.write().await.take() {
            handle.abort();
        }
        let mut state = self.state.lock();
        let ids: Vec<String> = state.connections.keys().cloned().collect();
        for id in &ids {
            self.close_locked(&mut state, id);
        }
        info!(closed = ids.len(), "Broadcast hub shut down");
    }

    pub fn connection_state(&self, connection_id: &str) -> Option<ConnectionState> {
        self.state
            .lock()
            .connections
            .get(connection_id)
            .map(|c| c.state)
    }

    pub fn connection_rooms(&self, connection_id: &str) -> Vec<String> {
        self.state
            .lock()
            .connections
            .get(connection_id)
            .map(|c| c.rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn room_members(&self, room: &str) -> Vec<String> {
        self.state
            .lock()
            .rooms
            .get(room)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn rooms(&self) -> Vec<RoomInfo> {
        let state = self.state.lock();
        let mut rooms: Vec<RoomInfo> = state
            .rooms
            .iter()
            .map(|(name, members)| RoomInfo {
                name: name.clone(),
                members: members.len(),
            })
            .collect();
        rooms.sort_by(|a, b| a.name.cmp(&b.name));
        rooms
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    pub fn stats(&self) -> HubStats {
        let (connections, rooms) = {
            let state = self.state.lock();
            (state.connections.len(), state.rooms.len())
        };
        HubStats {
            connections,
            rooms,
            total_connections: self.counters.total_connections.load(Ordering::Relaxed),
            messages_received: self.counters.messages_received.load(Ordering::Relaxed),
            messages_delivered: self.counters.messages_delivered.load(Ordering::Relaxed),
            rate_limited: self.counters.rate_limited.load(Ordering::Relaxed),
            protocol_errors: self.counters.protocol_errors.load(Ordering::Relaxed),
            heartbeat_closes: self.counters.heartbeat_closes.load(Ordering::Relaxed),
        }
    }
}

/// Remove a member; an emptied room is deleted
fn leave_room(rooms: &mut HashMap<String, BTreeSet<String>>, room: &str, connection_id: &str) {
    if let Some(members) = rooms.get_mut(room) {
        members.remove(connection_id);
        if members.is_empty() {
            rooms.remove(room);
            debug!(room = %room, "Deleted empty room");
        }
    }
}
