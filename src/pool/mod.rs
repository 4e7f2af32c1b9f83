//! Outbound connection pooling

pub mod connection;
pub mod connection_pool;
pub mod transport;

pub use connection::{Connection, ConnectionHealth, ConnectionInfo, ConnectionLease, MAX_CONNECTION_FAILURES};
pub use connection_pool::{ConnectionPool, PoolStats, TargetStats};
pub use transport::{Connector, HttpConnector, ProtocolKind, Transport, UpstreamRequest, UpstreamResponse};
