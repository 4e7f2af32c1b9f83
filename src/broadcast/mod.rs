//! Real-time publish/subscribe over persistent client connections

pub mod connection;
pub mod hub;
pub mod message;

pub use connection::{BroadcastConnection, ConnectionState};
pub use hub::{BroadcastHub, ClientHandle, HubEvent, HubStats, MessageOutcome, RoomInfo};
pub use message::{parse_client_message, ClientMessage, Inbound, ServerMessage};
