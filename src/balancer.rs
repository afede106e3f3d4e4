//! Balancing policies.
//!
//! A policy selects one endpoint out of a group's pool. Policies only ever
//! see the endpoint list; per-call scratch state (the round-robin tried set)
//! stays local to the call.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::endpoint::Endpoint;

pub const ROUND_ROBIN: &str = "roundrobin";
pub const FAILOVER: &str = "failover";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BalanceError {
    #[error("no endpoints available")]
    Empty,
    #[error("the only endpoint available is unreachable")]
    SoleEndpointDown,
    #[error("all endpoints are down")]
    AllDown,
}

/// Endpoint selection policy.
pub trait Balancer: Send + Sync {
    /// Select an alive endpoint, or report that none can serve.
    fn select(&self, endpoints: &[Arc<Endpoint>]) -> Result<Arc<Endpoint>, BalanceError>;

    /// Policy name for logging.
    fn name(&self) -> &'static str;
}

/// Build the policy configured for a group; unknown names fall back to
/// round-robin.
pub fn from_algorithm(algorithm: &str) -> Box<dyn Balancer> {
    match algorithm.to_ascii_lowercase().as_str() {
        FAILOVER => Box::new(Failover),
        _ => Box::new(RoundRobin::new()),
    }
}

/// Rotating selection over the alive subset.
///
/// The index advances with compare-and-swap so concurrent callers never lose
/// an update: a CAS loser re-reads and lands on a later slot instead of
/// double-serving the same one. A dead candidate still advances the shared
/// index, so other callers do not re-probe the dead slot, and is recorded in
/// a per-call tried set; once the tried set covers the pool the call fails.
#[derive(Debug, Default)]
pub struct RoundRobin {
    next_index: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Balancer for RoundRobin {
    fn select(&self, endpoints: &[Arc<Endpoint>]) -> Result<Arc<Endpoint>, BalanceError> {
        if endpoints.is_empty() {
            return Err(BalanceError::Empty);
        }

        let len = endpoints.len();
        let mut tried: Vec<usize> = Vec::new();

        loop {
            let index = self.next_index.load(Ordering::Acquire);
            let candidate = &endpoints[index % len];
            let successor = if index + 1 < len { index + 1 } else { 0 };

            if candidate.is_alive() {
                if self
                    .next_index
                    .compare_exchange(index, successor, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return Ok(candidate.clone());
                }
                // Another caller advanced the counter; re-read.
                continue;
            }

            // Dead slot: push the shared index past it so other callers skip
            // it too, then account for it locally.
            let _ = self.next_index.compare_exchange(
                index,
                successor,
                Ordering::AcqRel,
                Ordering::Acquire,
            );

            if !tried.contains(&index) {
                tried.push(index);
            }
            if tried.len() == len {
                return Err(BalanceError::AllDown);
            }
        }
    }

    fn name(&self) -> &'static str {
        ROUND_ROBIN
    }
}

/// Deterministic first-alive selection in configuration order.
#[derive(Debug, Default)]
pub struct Failover;

impl Balancer for Failover {
    fn select(&self, endpoints: &[Arc<Endpoint>]) -> Result<Arc<Endpoint>, BalanceError> {
        endpoints
            .iter()
            .find(|endpoint| endpoint.is_alive())
            .cloned()
            .ok_or(BalanceError::AllDown)
    }

    fn name(&self) -> &'static str {
        FAILOVER
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EndpointConfig;
    use crate::session::SessionAffinity;

    fn pool(addresses: &[&str]) -> Vec<Arc<Endpoint>> {
        let affinity = SessionAffinity::default();
        addresses
            .iter()
            .map(|address| {
                let config = EndpointConfig {
                    address: address.to_string(),
                    ..Default::default()
                };
                let endpoint = Endpoint::new(&config, "", &affinity).unwrap();
                endpoint.set_alive(true);
                endpoint
            })
            .collect()
    }

    fn addresses(endpoints: &[Arc<Endpoint>], picks: &[Arc<Endpoint>]) -> Vec<usize> {
        picks
            .iter()
            .map(|pick| {
                endpoints
                    .iter()
                    .position(|e| Arc::ptr_eq(e, pick))
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn round_robin_rotates_in_order() {
        let endpoints = pool(&[
            "http://10.0.0.1:80",
            "http://10.0.0.2:80",
            "http://10.0.0.3:80",
        ]);
        let balancer = RoundRobin::new();

        let picks: Vec<_> = (0..6).map(|_| balancer.select(&endpoints).unwrap()).collect();
        assert_eq!(addresses(&endpoints, &picks), vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn round_robin_coverage_is_fair() {
        let endpoints = pool(&["http://a:80", "http://b:80", "http://c:80"]);
        let balancer = RoundRobin::new();

        let mut counts = [0usize; 3];
        for _ in 0..9 {
            let pick = balancer.select(&endpoints).unwrap();
            let index = endpoints.iter().position(|e| Arc::ptr_eq(e, &pick)).unwrap();
            counts[index] += 1;
        }
        assert_eq!(counts, [3, 3, 3]);
    }

    #[test]
    fn round_robin_skips_dead_endpoint() {
        let endpoints = pool(&["http://a:80", "http://b:80", "http://c:80"]);
        let balancer = RoundRobin::new();

        // Advance so the next candidate would be b, then kill b.
        balancer.select(&endpoints).unwrap();
        endpoints[1].set_alive(false);

        let picks: Vec<_> = (0..3).map(|_| balancer.select(&endpoints).unwrap()).collect();
        assert_eq!(addresses(&endpoints, &picks), vec![2, 0, 2]);
    }

    #[test]
    fn round_robin_reports_all_down() {
        let endpoints = pool(&["http://a:80", "http://b:80"]);
        for endpoint in &endpoints {
            endpoint.set_alive(false);
        }

        let balancer = RoundRobin::new();
        assert_eq!(balancer.select(&endpoints), Err(BalanceError::AllDown));
    }

    #[test]
    fn round_robin_recovers_after_revival() {
        let endpoints = pool(&["http://a:80", "http://b:80"]);
        let balancer = RoundRobin::new();

        endpoints[0].set_alive(false);
        endpoints[1].set_alive(false);
        assert!(balancer.select(&endpoints).is_err());

        endpoints[0].set_alive(true);
        let pick = balancer.select(&endpoints).unwrap();
        assert!(Arc::ptr_eq(&pick, &endpoints[0]));
    }

    #[test]
    fn failover_prefers_lowest_alive_index() {
        let endpoints = pool(&["http://a:80", "http://b:80", "http://c:80"]);
        endpoints[0].set_alive(false);

        let balancer = Failover;
        for _ in 0..4 {
            let pick = balancer.select(&endpoints).unwrap();
            assert!(Arc::ptr_eq(&pick, &endpoints[1]));
        }

        endpoints[1].set_alive(false);
        let pick = balancer.select(&endpoints).unwrap();
        assert!(Arc::ptr_eq(&pick, &endpoints[2]));
    }

    #[test]
    fn failover_reports_all_down() {
        let endpoints = pool(&["http://a:80"]);
        endpoints[0].set_alive(false);
        assert_eq!(Failover.select(&endpoints), Err(BalanceError::AllDown));
    }

    #[test]
    fn algorithm_names_are_case_insensitive() {
        assert_eq!(from_algorithm("FAILOVER").name(), FAILOVER);
        assert_eq!(from_algorithm("RoundRobin").name(), ROUND_ROBIN);
        assert_eq!(from_algorithm("").name(), ROUND_ROBIN);
        assert_eq!(from_algorithm("mystery").name(), ROUND_ROBIN);
    }
}
