//! Load balancer implementation with multiple strategies

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tracing::debug;

use crate::error::{GatewayError, Result};

/// Load balancing strategy, selectable per service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadBalancingStrategy {
    /// Cycle through healthy instances
    #[default]
    RoundRobin,
    /// Fewest checked-out pooled connections
    LeastConnections,
    /// Interleaved round-robin proportional to instance weights
    WeightedRoundRobin,
    /// Lowest last-probed response time
    FastestResponse,
}

impl LoadBalancingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadBalancingStrategy::RoundRobin => "round-robin",
            LoadBalancingStrategy::LeastConnections => "least-connections",
            LoadBalancingStrategy::WeightedRoundRobin => "weighted-round-robin",
            LoadBalancingStrategy::FastestResponse => "fastest-response",
        }
    }
}

impl fmt::Display for LoadBalancingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An instance as seen by the balancer at selection time
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub url: String,
    pub weight: u32,
    pub healthy: bool,
    pub response_time: Option<Duration>,
    pub active_connections: usize,
}

/// State for weighted round-robin algorithm
#[derive(Debug)]
struct WeightedRoundRobinState {
    current_index: Option<usize>,
    current_weight: i64,
}

/// Load balancer holding per-service selection state
#[derive(Default)]
pub struct LoadBalancer {
    round_robin_index: DashMap<String, usize>,
    weighted_state: Mutex<HashMap<String, WeightedRoundRobinState>>,
}

impl LoadBalancer {
    /// Create a new load balancer
    pub fn new() -> Self {
        Self::default()
    }

    /// Select one healthy instance of `service` using `strategy`.
    ///
    /// Unhealthy candidates are filtered out before the strategy runs; when
    /// none remain the call fails instead of falling back.
    pub fn select(
        &self,
        service: &str,
        strategy: LoadBalancingStrategy,
        candidates: &[Candidate],
    ) -> Result<Candidate> {
        let healthy: Vec<&Candidate> = candidates.iter().filter(|c| c.healthy).collect();

        if healthy.is_empty() {
            return Err(GatewayError::unavailable(service, "no healthy instance"));
        }

        let selected = match strategy {
            LoadBalancingStrategy::RoundRobin => self.select_round_robin(service, &healthy),
            LoadBalancingStrategy::LeastConnections => select_least_connections(&healthy),
            LoadBalancingStrategy::WeightedRoundRobin => {
                self.select_weighted_round_robin(service, &healthy)
            }
            LoadBalancingStrategy::FastestResponse => select_fastest_response(&healthy),
        };

        debug!(
            service = %service,
            instance = %selected.url,
            strategy = %strategy,
            healthy = healthy.len(),
            "Selected instance"
        );

        Ok(selected.clone())
    }

    /// Drop selection state for a service, e.g. after reconfiguration
    pub fn reset(&self, service: &str) {
        self.round_robin_index.remove(service);
        self.weighted_state.lock().remove(service);
    }

    /// Round-robin selection
    fn select_round_robin<'a>(&self, service: &str, healthy: &[&'a Candidate]) -> &'a Candidate {
        let mut index = self.round_robin_index.entry(service.to_string()).or_insert(0);
        let selected = healthy[*index % healthy.len()];
        *index = index.wrapping_add(1);
        selected
    }

    /// Weighted round-robin selection
    fn select_weighted_round_robin<'a>(
        &self,
        service: &str,
        healthy: &[&'a Candidate],
    ) -> &'a Candidate {
        if healthy.len() == 1 {
            return healthy[0];
        }

        let weights: Vec<i64> = healthy.iter().map(|c| c.weight.max(1) as i64).collect();
        let max_weight = weights.iter().copied().max().unwrap_or(1);
        let step = weights.iter().fold(0, |acc, &w| gcd(acc, w)).max(1);

        let mut states = self.weighted_state.lock();
        let state = states
            .entry(service.to_string())
            .or_insert(WeightedRoundRobinState {
                current_index: None,
                current_weight: 0,
            });

        loop {
            let next = match state.current_index {
                Some(index) => (index + 1) % healthy.len(),
                None => 0,
            };
            state.current_index = Some(next);

            if next == 0 {
                state.current_weight -= step;
                if state.current_weight <= 0 {
                    state.current_weight = max_weight;
                }
            }

            if weights[next] >= state.current_weight {
                return healthy[next];
            }
        }
    }
}

/// Fewest active connections; first in configuration order wins ties
fn select_least_connections<'a>(healthy: &[&'a Candidate]) -> &'a Candidate {
    healthy
        .iter()
        .copied()
        .min_by_key(|c| c.active_connections)
        .unwrap_or(healthy[0])
}

/// Lowest measured response time; unmeasured instances rank last
fn select_fastest_response<'a>(healthy: &[&'a Candidate]) -> &'a Candidate {
    healthy
        .iter()
        .copied()
        .min_by_key(|c| c.response_time.unwrap_or(Duration::MAX))
        .unwrap_or(healthy[0])
}

/// Calculate greatest common divisor
fn gcd(a: i64, b: i64) -> i64 {
    if b == 0 {
        a.abs()
    } else {
        gcd(b, a % b)
    }
}
