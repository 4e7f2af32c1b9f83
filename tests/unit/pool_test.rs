//! Unit tests for the connection pool

use async_trait::async_trait;
use service_gateway::config::PoolConfig;
use service_gateway::pool::{
    ConnectionPool, Connector, ProtocolKind, Transport, UpstreamRequest, UpstreamResponse,
};
use service_gateway::{GatewayError, Result};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

/// Connector that counts creations and can fail checks or whole targets
#[derive(Default)]
struct StubConnector {
    connects: AtomicUsize,
    closes: Arc<AtomicUsize>,
    failing_checks: Arc<AtomicBool>,
    connect_delay: Duration,
    /// close() suspends before finishing, as a real transport teardown would
    close_yields: bool,
}

struct StubTransport {
    closes: Arc<AtomicUsize>,
    failing_checks: Arc<AtomicBool>,
    close_yields: bool,
}

#[async_trait]
impl Transport for StubTransport {
    async fn send(&self, _request: UpstreamRequest) -> Result<UpstreamResponse> {
        Err(GatewayError::UpstreamTransport("not used".into()))
    }

    async fn check(&self) -> Result<Duration> {
        if self.failing_checks.load(Ordering::SeqCst) {
            Err(GatewayError::UpstreamTransport("refused".into()))
        } else {
            Ok(Duration::from_millis(1))
        }
    }

    async fn close(&self) {
        if self.close_yields {
            tokio::task::yield_now().await;
        }
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for StubConnector {
    async fn connect(&self, target: &str) -> Result<Arc<dyn Transport>> {
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        if target.contains("unreachable") {
            return Err(GatewayError::UpstreamTransport(format!("cannot reach {}", target)));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(StubTransport {
            closes: self.closes.clone(),
            failing_checks: self.failing_checks.clone(),
            close_yields: self.close_yields,
        }))
    }

    fn protocol(&self) -> ProtocolKind {
        ProtocolKind::Http
    }
}

fn pool_with(connector: Arc<StubConnector>, config: PoolConfig) -> Arc<ConnectionPool> {
    Arc::new(ConnectionPool::new(connector, config))
}

fn config(max_per_target: usize, max_total: usize) -> PoolConfig {
    PoolConfig {
        max_per_target,
        max_total,
        ..PoolConfig::default()
    }
}

const TARGET: &str = "http://10.0.0.1:8080";

#[tokio::test]
async fn test_concurrent_acquires_respect_per_target_cap() {
    let connector = Arc::new(StubConnector {
        connect_delay: Duration::from_millis(20),
        ..Default::default()
    });
    let pool = pool_with(connector.clone(), config(2, 100));

    let (a, b, c) = tokio::join!(pool.acquire(TARGET), pool.acquire(TARGET), pool.acquire(TARGET));
    let results = [a, b, c];

    let successes = results.iter().filter(|r| r.is_ok()).count();
    let exhausted = results
        .iter()
        .filter(|r| matches!(r, Err(GatewayError::PoolExhausted(_))))
        .count();
    assert_eq!(successes, 2);
    assert_eq!(exhausted, 1);
    assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    assert_eq!(pool.active_count(TARGET), 2);
}

#[tokio::test]
async fn test_concurrent_creation_bounded_by_min_of_callers_and_cap() {
    for (callers, cap) in [(5usize, 3usize), (2, 5)] {
        let connector = Arc::new(StubConnector {
            connect_delay: Duration::from_millis(5),
            ..Default::default()
        });
        let pool = pool_with(connector.clone(), config(cap, 100));

        let acquires = (0..callers).map(|_| pool.acquire(TARGET));
        let results = futures::future::join_all(acquires).await;

        let created = connector.connects.load(Ordering::SeqCst);
        assert_eq!(created, callers.min(cap));
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), callers.min(cap));
        assert_eq!(pool.stats().total, callers.min(cap));
    }
}

#[tokio::test]
async fn test_global_cap_spans_targets() {
    let pool = pool_with(Arc::new(StubConnector::default()), config(10, 2));

    let _a = assert_ok!(pool.acquire("http://a:80").await);
    let _b = assert_ok!(pool.acquire("http://b:80").await);
    let err = assert_err!(pool.acquire("http://c:80").await);
    assert!(matches!(err, GatewayError::PoolExhausted(ref t) if t == "http://c:80"));
}

#[tokio::test]
async fn test_released_connection_is_reused() {
    let connector = Arc::new(StubConnector::default());
    let pool = pool_with(connector.clone(), config(2, 10));

    let first = pool.acquire(TARGET).await.unwrap();
    let id = first.id().to_string();
    assert!(pool.release(first.id()));

    let second = pool.acquire(TARGET).await.unwrap();
    assert_eq!(second.id(), id);
    assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    assert_eq!(pool.connection(&id).unwrap().usage_count, 2);
}

#[tokio::test]
async fn test_released_for_check_is_not_reused_until_checked() {
    let connector = Arc::new(StubConnector::default());
    let pool = pool_with(connector.clone(), config(2, 10));

    let first = pool.acquire(TARGET).await.unwrap();
    let suspect = first.id().to_string();
    pool.release_for_check(first.id());

    let second = pool.acquire(TARGET).await.unwrap();
    assert_ne!(second.id(), suspect);
    pool.release(second.id());

    assert_eq!(pool.check_idle_connections().await, 0);
    let third = pool.acquire(TARGET).await.unwrap();
    assert_eq!(third.id(), suspect);
}

#[tokio::test(start_paused = true)]
async fn test_idle_connections_are_evicted() {
    let connector = Arc::new(StubConnector::default());
    let pool = pool_with(
        connector.clone(),
        PoolConfig {
            idle_timeout_secs: 1,
            ..config(2, 10)
        },
    );

    let lease = pool.acquire(TARGET).await.unwrap();
    let stale = lease.id().to_string();
    pool.release(lease.id());
    let busy = pool.acquire("http://busy:80").await.unwrap();

    tokio::time::advance(Duration::from_millis(1500)).await;
    assert_eq!(pool.evict_idle().await, 1);

    assert!(pool.connection(&stale).is_none());
    assert!(pool.connections_for(TARGET).is_empty());
    assert!(pool.connection(busy.id()).is_some());
    assert_eq!(connector.closes.load(Ordering::SeqCst), 1);

    let fresh = pool.acquire(TARGET).await.unwrap();
    assert_ne!(fresh.id(), stale);
    assert_eq!(connector.connects.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_eviction_never_closes_a_connection_leased_mid_sweep() {
    let connector = Arc::new(StubConnector {
        close_yields: true,
        ..Default::default()
    });
    let pool = pool_with(
        connector.clone(),
        PoolConfig {
            idle_timeout_secs: 1,
            ..config(4, 10)
        },
    );

    let first = pool.acquire(TARGET).await.unwrap();
    let second = pool.acquire(TARGET).await.unwrap();
    pool.release(first.id());
    pool.release(second.id());
    tokio::time::advance(Duration::from_millis(1500)).await;

    let (evicted, lease) = tokio::join!(pool.evict_idle(), pool.acquire(TARGET));
    let lease = lease.unwrap();

    assert_eq!(evicted, 2);
    let pooled = pool
        .connection(lease.id())
        .expect("leased connection must stay pooled");
    assert!(pooled.active);
    assert_eq!(connector.closes.load(Ordering::SeqCst), 2);
    assert_eq!(pool.stats().total, 1);
}

#[tokio::test(start_paused = true)]
async fn test_started_pool_evicts_idle_connections() {
    let connector = Arc::new(StubConnector::default());
    let pool = pool_with(
        connector.clone(),
        PoolConfig {
            idle_timeout_secs: 2,
            ..config(2, 10)
        },
    );

    let lease = pool.acquire(TARGET).await.unwrap();
    let stale = lease.id().to_string();
    pool.release(lease.id());
    let busy = pool.acquire("http://busy:80").await.unwrap();

    pool.start().await;

    // Cleanup runs every second but only takes connections idle for more than two
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(pool.connection(&stale).is_some());

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(pool.connection(&stale).is_none());
    assert!(pool.connection(busy.id()).is_some());
    assert_eq!(connector.closes.load(Ordering::SeqCst), 1);

    pool.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_started_pool_removes_connection_after_failed_health_cycles() {
    let connector = Arc::new(StubConnector::default());
    let pool = pool_with(
        connector.clone(),
        PoolConfig {
            health_check_interval_secs: 1,
            idle_timeout_secs: 3600,
            ..config(2, 10)
        },
    );

    let lease = pool.acquire(TARGET).await.unwrap();
    let idle_id = lease.id().to_string();
    pool.release(lease.id());
    connector.failing_checks.store(true, Ordering::SeqCst);

    pool.start().await;

    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(pool.connection(&idle_id).unwrap().consecutive_failures, 2);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(pool.connection(&idle_id).is_none());
    assert_eq!(pool.stats().evicted_total, 1);

    pool.shutdown().await;
}

#[tokio::test]
async fn test_three_failed_checks_remove_idle_connection() {
    let connector = Arc::new(StubConnector::default());
    let pool = pool_with(connector.clone(), config(2, 10));

    let idle = pool.acquire(TARGET).await.unwrap();
    let busy = pool.acquire(TARGET).await.unwrap();
    let idle_id = idle.id().to_string();
    pool.release(idle.id());

    connector.failing_checks.store(true, Ordering::SeqCst);
    assert_eq!(pool.check_idle_connections().await, 0);
    assert_eq!(pool.check_idle_connections().await, 0);
    assert_eq!(pool.connection(&idle_id).unwrap().consecutive_failures, 2);
    assert_eq!(pool.check_idle_connections().await, 1);

    assert!(pool.connection(&idle_id).is_none());
    // Checked-out connections are never probed
    assert!(pool.connection(busy.id()).is_some());
    assert_eq!(pool.stats().evicted_total, 1);
}

#[tokio::test]
async fn test_warmup_creates_idle_connections() {
    let connector = Arc::new(StubConnector::default());
    let pool = pool_with(connector.clone(), config(3, 10));

    let targets = vec!["http://a:80".to_string(), "http://b:80".to_string()];
    assert_eq!(pool.warmup(&targets, 2).await, 4);

    let stats = pool.stats();
    assert_eq!(stats.total, 4);
    assert_eq!(stats.idle, 4);
    assert_eq!(stats.targets["http://a:80"].total, 2);
}

#[tokio::test]
async fn test_failed_connect_releases_reservation() {
    let pool = pool_with(Arc::new(StubConnector::default()), config(1, 1));

    let err = assert_err!(pool.acquire("http://unreachable:80").await);
    assert!(matches!(err, GatewayError::UpstreamTransport(_)));

    let stats = pool.stats();
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.total, 0);
    assert!(pool.acquire(TARGET).await.is_ok());
}

#[tokio::test]
async fn test_shutdown_closes_everything() {
    let connector = Arc::new(StubConnector::default());
    let pool = pool_with(connector.clone(), config(2, 10));
    pool.start().await;

    let lease = pool.acquire(TARGET).await.unwrap();
    pool.release(lease.id());
    pool.acquire("http://other:80").await.unwrap();

    pool.shutdown().await;
    assert_eq!(pool.stats().total, 0);
    assert_eq!(connector.closes.load(Ordering::SeqCst), 2);
}
