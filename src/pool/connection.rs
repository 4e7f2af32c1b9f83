//! Pooled connection records and the lease handed to callers

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::pool::transport::{ProtocolKind, Transport};

/// Consecutive failed health checks after which a connection is removed
pub const MAX_CONNECTION_FAILURES: u32 = 3;

/// Health of a single pooled connection
#[derive(Debug, Clone)]
pub struct ConnectionHealth {
    pub healthy: bool,
    pub response_time: Option<Duration>,
    pub last_check: Option<Instant>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    /// Set after an abandoned request; cleared by the next passing check
    pub needs_check: bool,
}

impl Default for ConnectionHealth {
    fn default() -> Self {
        Self {
            healthy: true,
            response_time: None,
            last_check: None,
            consecutive_failures: 0,
            last_error: None,
            needs_check: false,
        }
    }
}

impl ConnectionHealth {
    pub fn record_success(&mut self, response_time: Duration) {
        self.healthy = true;
        self.response_time = Some(response_time);
        self.last_check = Some(Instant::now());
        self.consecutive_failures = 0;
        self.last_error = None;
        self.needs_check = false;
    }

    pub fn record_failure(&mut self, error: String) {
        self.healthy = false;
        self.last_check = Some(Instant::now());
        self.consecutive_failures += 1;
        self.last_error = Some(error);
    }

    pub fn should_evict(&self) -> bool {
        self.consecutive_failures >= MAX_CONNECTION_FAILURES
    }
}

/// A pooled connection owned by the pool
pub struct Connection {
    pub id: String,
    pub target: String,
    pub protocol: ProtocolKind,
    pub(crate) transport: Arc<dyn Transport>,
    pub active: bool,
    pub last_used: Instant,
    pub created_at: Instant,
    pub usage_count: u64,
    pub health: ConnectionHealth,
}

impl Connection {
    pub(crate) fn new(target: &str, protocol: ProtocolKind, transport: Arc<dyn Transport>) -> Self {
        let now = Instant::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            target: target.to_string(),
            protocol,
            transport,
            active: false,
            last_used: now,
            created_at: now,
            usage_count: 0,
            health: ConnectionHealth::default(),
        }
    }

    /// Idle, healthy and not waiting on a post-timeout check
    pub fn is_available(&self) -> bool {
        !self.active && self.health.healthy && !self.health.needs_check
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_used)
    }

    pub(crate) fn check_out(&mut self) -> ConnectionLease {
        self.active = true;
        self.usage_count += 1;
        self.last_used = Instant::now();
        ConnectionLease {
            id: self.id.clone(),
            target: self.target.clone(),
            transport: self.transport.clone(),
        }
    }

    pub fn info(&self) -> ConnectionInfo {
        let now = Instant::now();
        ConnectionInfo {
            id: self.id.clone(),
            target: self.target.clone(),
            protocol: self.protocol,
            active: self.active,
            healthy: self.health.healthy,
            usage_count: self.usage_count,
            consecutive_failures: self.health.consecutive_failures,
            age_ms: now.saturating_duration_since(self.created_at).as_millis() as u64,
            idle_ms: if self.active { 0 } else { self.idle_for(now).as_millis() as u64 },
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("active", &self.active)
            .field("usage_count", &self.usage_count)
            .field("health", &self.health)
            .finish_non_exhaustive()
    }
}

/// Read-only view of a connection
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: String,
    pub target: String,
    pub protocol: ProtocolKind,
    pub active: bool,
    pub healthy: bool,
    pub usage_count: u64,
    pub consecutive_failures: u32,
    pub age_ms: u64,
    pub idle_ms: u64,
}

/// A checked-out connection.
///
/// The holder must hand it back with `release`, `release_for_check` or
/// `remove` on the pool.
pub struct ConnectionLease {
    id: String,
    target: String,
    transport: Arc<dyn Transport>,
}

impl ConnectionLease {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }
}

impl fmt::Debug for ConnectionLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionLease")
            .field("id", &self.id)
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}
