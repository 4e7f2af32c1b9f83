//! Per-client state for the broadcast hub

use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;
use tracing::warn;

use crate::broadcast::message::ServerMessage;

const RATE_WINDOW: Duration = Duration::from_secs(1);

/// Lifecycle of a real-time connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ConnectionState {
    /// Whether `next` is a legal transition from this state
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        matches!(
            (self, next),
            (ConnectionState::Connecting, ConnectionState::Open)
                | (ConnectionState::Connecting, ConnectionState::Closing)
                | (ConnectionState::Open, ConnectionState::Closing)
                | (ConnectionState::Closing, ConnectionState::Closed)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Open => "OPEN",
            ConnectionState::Closing => "CLOSING",
            ConnectionState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// Outcome of queueing a message for a client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Queued,
    /// Queue full; the message was dropped
    Dropped,
    /// Client side is gone
    Disconnected,
}

/// A client connection as tracked by the hub
pub struct BroadcastConnection {
    pub id: String,
    pub state: ConnectionState,
    /// Cleared at each heartbeat, set again by the client's `pong`
    pub alive: bool,
    pub missed_heartbeats: u32,
    pub rooms: BTreeSet<String>,
    pub connected_at: Instant,
    pub messages_received: u64,
    window_start: Instant,
    window_count: u32,
    outbound: mpsc::Sender<ServerMessage>,
}

impl BroadcastConnection {
    pub fn new(id: String, outbound: mpsc::Sender<ServerMessage>) -> Self {
        let now = Instant::now();
        Self {
            id,
            state: ConnectionState::Connecting,
            alive: true,
            missed_heartbeats: 0,
            rooms: BTreeSet::new(),
            connected_at: now,
            messages_received: 0,
            window_start: now,
            window_count: 0,
            outbound,
        }
    }

    /// Move to `next`; illegal transitions are refused
    pub fn transition(&mut self, next: ConnectionState) -> bool {
        if self.state.can_transition_to(next) {
            self.state = next;
            true
        } else {
            false
        }
    }

    /// Count one inbound message against the per-second budget
    pub fn allow_message(&mut self, limit: u32) -> bool {
        let now = Instant::now();
        if now.saturating_duration_since(self.window_start) >= RATE_WINDOW {
            self.window_start = now;
            self.window_count = 0;
        }
        self.window_count += 1;
        self.window_count <= limit
    }

    pub fn mark_alive(&mut self) {
        self.alive = true;
        self.missed_heartbeats = 0;
    }

    /// Queue a message without waiting; order per connection is preserved
    pub fn send(&self, message: ServerMessage) -> SendOutcome {
        match self.outbound.try_send(message) {
            Ok(()) => SendOutcome::Queued,
            Err(TrySendError::Full(_)) => {
                warn!(connection_id = %self.id, "Outbound queue full, dropping message");
                SendOutcome::Dropped
            }
            Err(TrySendError::Closed(_)) => SendOutcome::Disconnected,
        }
    }
}

impl fmt::Debug for BroadcastConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BroadcastConnection")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("alive", &self.alive)
            .field("rooms", &self.rooms)
            .finish_non_exhaustive()
    }
}
