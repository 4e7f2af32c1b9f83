//! Connection pool: per-target reuse, caps, health checks and idle eviction

use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::error::{GatewayError, Result};
use crate::pool::connection::{Connection, ConnectionInfo, ConnectionLease};
use crate::pool::transport::Connector;

#[derive(Default)]
struct PoolState {
    connections: HashMap<String, Connection>,
    /// target -> connection ids, in creation order
    by_target: HashMap<String, Vec<String>>,
    /// creations in flight, counted against the global cap
    reserved: usize,
}

impl PoolState {
    fn take_available(&mut self, target: &str) -> Option<ConnectionLease> {
        let ids = self.by_target.get(target)?;
        let id = ids
            .iter()
            .find(|id| self.connections.get(*id).is_some_and(|c| c.is_available()))?
            .clone();
        self.connections.get_mut(&id).map(|c| c.check_out())
    }

    fn detach(&mut self, id: &str) -> Option<Connection> {
        let connection = self.connections.remove(id)?;
        if let Some(ids) = self.by_target.get_mut(&connection.target) {
            ids.retain(|other| other != id);
            if ids.is_empty() {
                self.by_target.remove(&connection.target);
            }
        }
        Some(connection)
    }
}

/// Per-target counts
#[derive(Debug, Clone, Default, Serialize)]
pub struct TargetStats {
    pub total: usize,
    pub active: usize,
    pub idle: usize,
}

/// Pool statistics
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub active: usize,
    pub idle: usize,
    pub pending: usize,
    pub max_per_target: usize,
    pub max_total: usize,
    pub created_total: u64,
    pub evicted_total: u64,
    pub targets: BTreeMap<String, TargetStats>,
}

/// Pool of reusable outbound connections, keyed by target.
///
/// Bookkeeping lives behind one synchronous lock that is never held across an
/// await; creation for a target is serialized by a per-target async lock.
pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    config: PoolConfig,
    state: Mutex<PoolState>,
    creation_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    created_total: AtomicU64,
    evicted_total: AtomicU64,
    tasks: RwLock<Vec<JoinHandle<()>>>,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn Connector>, config: PoolConfig) -> Self {
        Self {
            connector,
            config,
            state: Mutex::new(PoolState::default()),
            creation_locks: DashMap::new(),
            created_total: AtomicU64::new(0),
            evicted_total: AtomicU64::new(0),
            tasks: RwLock::new(Vec::new()),
        }
    }

    /// Check out a connection to `target`, creating one if allowed
    pub async fn acquire(&self, target: &str) -> Result<ConnectionLease> {
        let reused = self.state.lock().take_available(target);
        if let Some(lease) = reused {
            debug!(upstream = %target, connection_id = %lease.id(), "Reused pooled connection");
            return Ok(lease);
        }

        let creation_lock = self
            .creation_locks
            .entry(target.to_string())
            .or_default()
            .clone();
        let _creating = creation_lock.lock().await;

        // A connection may have been released while we waited
        {
            let mut state = self.state.lock();
            if let Some(lease) = state.take_available(target) {
                debug!(upstream = %target, connection_id = %lease.id(), "Reused pooled connection");
                return Ok(lease);
            }

            let per_target = state.by_target.get(target).map_or(0, |ids| ids.len());
            let total = state.connections.len() + state.reserved;
            if per_target >= self.config.max_per_target || total >= self.config.max_total {
                warn!(
                    upstream = %target,
                    per_target = per_target,
                    total = total,
                    "Connection pool limit reached"
                );
                return Err(GatewayError::PoolExhausted(target.to_string()));
            }
            state.reserved += 1;
        }

        let connected =
            match tokio::time::timeout(self.config.connect_timeout(), self.connector.connect(target)).await {
                Ok(result) => result,
                Err(_) => Err(GatewayError::UpstreamTimeout(format!(
                    "connecting to {} exceeded {:?}",
                    target,
                    self.config.connect_timeout()
                ))),
            };

        let mut state = self.state.lock();
        state.reserved -= 1;
        let transport = connected?;

        let mut connection = Connection::new(target, self.connector.protocol(), transport);
        let lease = connection.check_out();
        state
            .by_target
            .entry(target.to_string())
            .or_default()
            .push(connection.id.clone());
        state.connections.insert(connection.id.clone(), connection);
        self.created_total.fetch_add(1, Ordering::Relaxed);

        debug!(upstream = %target, connection_id = %lease.id(), "Created pooled connection");
        Ok(lease)
    }

    /// Return a connection to the idle set; the transport stays open
    pub fn release(&self, id: &str) -> bool {
        self.release_inner(id, false)
    }

    /// Return a connection that must pass a health check before reuse
    pub fn release_for_check(&self, id: &str) -> bool {
        self.release_inner(id, true)
    }

    fn release_inner(&self, id: &str, needs_check: bool) -> bool {
        let mut state = self.state.lock();
        match state.connections.get_mut(id) {
            Some(connection) => {
                connection.active = false;
                connection.last_used = Instant::now();
                if needs_check {
                    connection.health.needs_check = true;
                }
                true
            }
            None => {
                debug!(connection_id = %id, "Release of unknown connection ignored");
                false
            }
        }
    }

    /// Close a connection and drop all bookkeeping for it
    pub async fn remove(&self, id: &str) -> bool {
        let removed = self.state.lock().detach(id);
        match removed {
            Some(connection) => {
                self.close_detached(vec![connection]).await;
                true
            }
            None => false,
        }
    }

    /// Close connections already detached from the bookkeeping
    async fn close_detached(&self, detached: Vec<Connection>) {
        for connection in detached {
            connection.transport.close().await;
            self.evicted_total.fetch_add(1, Ordering::Relaxed);
            debug!(upstream = %connection.target, connection_id = %connection.id, "Removed pooled connection");
        }
    }

    /// Health-check every idle connection; returns how many were removed
    pub async fn check_idle_connections(&self) -> usize {
        let idle: Vec<_> = {
            let state = self.state.lock();
            state
                .connections
                .values()
                .filter(|c| !c.active)
                .map(|c| (c.id.clone(), c.transport.clone()))
                .collect()
        };

        let timeout = self.config.connect_timeout();
        let checks = idle.into_iter().map(|(id, transport)| async move {
            let outcome = match tokio::time::timeout(timeout, transport.check()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(GatewayError::UpstreamTimeout(format!("health check exceeded {:?}", timeout))),
            };
            (id, outcome)
        });
        let results = join_all(checks).await;

        // Detach under the same lock that saw the connection idle
        let doomed: Vec<Connection> = {
            let mut state = self.state.lock();
            let mut doomed_ids = Vec::new();
            for (id, outcome) in results {
                let Some(connection) = state.connections.get_mut(&id) else {
                    continue;
                };
                match outcome {
                    Ok(response_time) => connection.health.record_success(response_time),
                    Err(e) => {
                        connection.health.record_failure(e.to_string());
                        debug!(
                            upstream = %connection.target,
                            connection_id = %id,
                            failures = connection.health.consecutive_failures,
                            "Connection health check failed"
                        );
                        if connection.health.should_evict() && !connection.active {
                            doomed_ids.push(id);
                        }
                    }
                }
            }
            doomed_ids
                .iter()
                .filter_map(|id| state.detach(id))
                .collect()
        };

        let removed = doomed.len();
        for connection in &doomed {
            warn!(connection_id = %connection.id, "Removing connection after consecutive failed health checks");
        }
        self.close_detached(doomed).await;
        removed
    }

    /// Remove idle connections unused for longer than the idle timeout
    pub async fn evict_idle(&self) -> usize {
        let now = Instant::now();
        let idle_timeout = self.config.idle_timeout();
        let expired: Vec<Connection> = {
            let mut state = self.state.lock();
            let ids: Vec<String> = state
                .connections
                .values()
                .filter(|c| !c.active && c.idle_for(now) > idle_timeout)
                .map(|c| c.id.clone())
                .collect();
            ids.iter().filter_map(|id| state.detach(id)).collect()
        };

        let evicted = expired.len();
        self.close_detached(expired).await;
        if evicted > 0 {
            info!(evicted = evicted, "Evicted idle connections");
        }
        evicted
    }

    /// Eagerly create `per_target` idle connections for each target
    pub async fn warmup(&self, targets: &[String], per_target: usize) -> usize {
        let mut created = 0;
        for target in targets {
            let mut leases = Vec::with_capacity(per_target);
            for _ in 0..per_target {
                match self.acquire(target).await {
                    Ok(lease) => leases.push(lease),
                    Err(e) => {
                        warn!(upstream = %target, error = %e, "Warmup connection failed");
                        break;
                    }
                }
            }
            created += leases.len();
            for lease in leases {
                self.release(lease.id());
            }
        }
        info!(targets = targets.len(), created = created, "Connection pool warmed up");
        created
    }

    /// Start the health-check and idle-eviction background cycles
    pub async fn start(self: &Arc<Self>) {
        let health_interval = self.config.health_check_interval();
        let cleanup_interval = (self.config.idle_timeout() / 2).max(Duration::from_millis(1));

        let pool = self.clone();
        let health_task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(health_interval).await;
                pool.check_idle_connections().await;
            }
        });

        let pool = self.clone();
        let cleanup_task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(cleanup_interval).await;
                pool.evict_idle().await;
            }
        });

        let mut tasks = self.tasks.write().await;
        for previous in tasks.drain(..) {
            previous.abort();
        }
        tasks.push(health_task);
        tasks.push(cleanup_task);
        info!(
            health_interval_secs = health_interval.as_secs(),
            cleanup_interval_ms = cleanup_interval.as_millis() as u64,
            "Started connection pool maintenance"
        );
    }

    /// Stop background cycles and close every connection
    pub async fn shutdown(&self) {
        for task in self.tasks.write().await.drain(..) {
            task.abort();
        }

        let drained: Vec<Connection> = {
            let mut state = self.state.lock();
            state.by_target.clear();
            state.connections.drain().map(|(_, c)| c).collect()
        };
        let closed = drained.len();
        for connection in drained {
            connection.transport.close().await;
        }
        info!(closed = closed, "Connection pool shut down");
    }

    /// Checked-out connections to `target`
    pub fn active_count(&self, target: &str) -> usize {
        let state = self.state.lock();
        state.by_target.get(target).map_or(0, |ids| {
            ids.iter()
                .filter(|id| state.connections.get(*id).is_some_and(|c| c.active))
                .count()
        })
    }

    pub fn connection(&self, id: &str) -> Option<ConnectionInfo> {
        self.state.lock().connections.get(id).map(|c| c.info())
    }

    pub fn connections_for(&self, target: &str) -> Vec<ConnectionInfo> {
        let state = self.state.lock();
        state.by_target.get(target).map_or_else(Vec::new, |ids| {
            ids.iter()
                .filter_map(|id| state.connections.get(id).map(|c| c.info()))
                .collect()
        })
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        let mut targets: BTreeMap<String, TargetStats> = BTreeMap::new();
        for connection in state.connections.values() {
            let entry = targets.entry(connection.target.clone()).or_default();
            entry.total += 1;
            if connection.active {
                entry.active += 1;
            } else {
                entry.idle += 1;
            }
        }
        let active = targets.values().map(|t| t.active).sum();

        PoolStats {
            total: state.connections.len(),
            active,
            idle: state.connections.len() - active,
            pending: state.reserved,
            max_per_target: self.config.max_per_target,
            max_total: self.config.max_total,
            created_total: self.created_total.load(Ordering::Relaxed),
            evicted_total: self.evicted_total.load(Ordering::Relaxed),
            targets,
        }
    }
}
