//! Upstream selection for proxy clusters
//!
//! Every proxying location compiles into one [`Cluster`]. A single-upstream
//! location is simply a cluster with one destination.

use hyper::Uri;
use rand::Rng;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::model::LoadBalanceAlgorithm;

/// One upstream of a cluster
#[derive(Debug)]
pub struct Destination {
    pub address: Uri,
    pub weight: u32,
    /// Replaces the `Host` header sent upstream
    pub host_override: Option<String>,
    in_flight: AtomicUsize,
}

impl Destination {
    pub fn new(address: Uri, weight: u32, host_override: Option<String>) -> Self {
        Self {
            address,
            weight: weight.max(1),
            host_override,
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }
}

/// Holds a destination's in-flight slot until dropped
#[derive(Debug)]
pub struct Selected {
    destination: Arc<Destination>,
}

impl Selected {
    pub fn destination(&self) -> &Destination {
        &self.destination
    }
}

impl Drop for Selected {
    fn drop(&mut self) {
        self.destination.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Destinations of one location plus the selector state
#[derive(Debug)]
pub struct Cluster {
    id: String,
    destinations: Vec<Arc<Destination>>,
    algorithm: LoadBalanceAlgorithm,
    total_weight: usize,
    round_robin_index: AtomicUsize,
}

impl Cluster {
    pub fn new(id: &str, destinations: Vec<Destination>, algorithm: LoadBalanceAlgorithm) -> Self {
        let total_weight = destinations.iter().map(|d| d.weight as usize).sum();
        Self {
            id: id.to_string(),
            destinations: destinations.into_iter().map(Arc::new).collect(),
            algorithm,
            total_weight,
            round_robin_index: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn algorithm(&self) -> LoadBalanceAlgorithm {
        self.algorithm
    }

    pub fn destinations(&self) -> impl Iterator<Item = &Destination> {
        self.destinations.iter().map(|d| d.as_ref())
    }

    pub fn len(&self) -> usize {
        self.destinations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.destinations.is_empty()
    }

    /// Pick the destination for a request from `client`
    pub fn select(&self, client: &IpAddr) -> Option<Selected> {
        if self.destinations.is_empty() {
            return None;
        }
        let count = self.destinations.len();

        let index = match self.algorithm {
            _ if count == 1 => 0,
            LoadBalanceAlgorithm::RoundRobin => {
                self.round_robin_index.fetch_add(1, Ordering::Relaxed) % count
            }
            LoadBalanceAlgorithm::WeightedRoundRobin => {
                let tick = self.round_robin_index.fetch_add(1, Ordering::Relaxed) % self.total_weight.max(1);
                self.weighted_index(tick)
            }
            LoadBalanceAlgorithm::IpHash => {
                let mut hasher = DefaultHasher::new();
                crate::iprange::canonical(client).hash(&mut hasher);
                (hasher.finish() % count as u64) as usize
            }
            LoadBalanceAlgorithm::Random => {
                let tick = rand::thread_rng().gen_range(0..self.total_weight.max(1));
                self.weighted_index(tick)
            }
            LoadBalanceAlgorithm::LeastRequests => self
                .destinations
                .iter()
                .enumerate()
                .min_by_key(|(_, d)| d.in_flight())
                .map(|(i, _)| i)
                .unwrap_or(0),
        };

        let destination = Arc::clone(&self.destinations[index]);
        destination.in_flight.fetch_add(1, Ordering::Relaxed);
        debug!(
            cluster = self.id,
            upstream = %destination.address,
            algorithm = ?self.algorithm,
            "Selected upstream"
        );
        Some(Selected { destination })
    }

    fn weighted_index(&self, mut tick: usize) -> usize {
        for (i, destination) in self.destinations.iter().enumerate() {
            let weight = destination.weight as usize;
            if tick < weight {
                return i;
            }
            tick -= weight;
        }
        self.destinations.len() - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster(weights: &[u32], algorithm: LoadBalanceAlgorithm) -> Cluster {
        let destinations = weights
            .iter()
            .enumerate()
            .map(|(i, w)| {
                Destination::new(
                    format!("http://10.0.0.{}:80", i + 1).parse().unwrap(),
                    *w,
                    None,
                )
            })
            .collect();
        Cluster::new("loc-1", destinations, algorithm)
    }

    fn pick(cluster: &Cluster, client: &str) -> String {
        let selected = cluster.select(&client.parse().unwrap()).unwrap();
        selected.destination().address.host().unwrap().to_string()
    }

    #[test]
    fn test_round_robin() {
        let cluster = cluster(&[1, 1, 1], LoadBalanceAlgorithm::RoundRobin);
        let picks: Vec<String> = (0..4).map(|_| pick(&cluster, "1.1.1.1")).collect();
        assert_eq!(picks, vec!["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.1"]);
    }

    #[test]
    fn test_weighted_round_robin() {
        let cluster = cluster(&[3, 1], LoadBalanceAlgorithm::WeightedRoundRobin);
        let picks: Vec<String> = (0..8).map(|_| pick(&cluster, "1.1.1.1")).collect();
        let first = picks.iter().filter(|p| *p == "10.0.0.1").count();
        assert_eq!(first, 6);
    }

    #[test]
    fn test_ip_hash_is_sticky() {
        let cluster = cluster(&[1, 1, 1, 1], LoadBalanceAlgorithm::IpHash);
        let first = pick(&cluster, "203.0.113.5");
        for _ in 0..10 {
            assert_eq!(pick(&cluster, "203.0.113.5"), first);
        }
        assert_eq!(pick(&cluster, "::ffff:203.0.113.5"), first);
    }

    #[test]
    fn test_random_stays_in_range() {
        let cluster = cluster(&[1, 2], LoadBalanceAlgorithm::Random);
        for _ in 0..50 {
            let host = pick(&cluster, "1.1.1.1");
            assert!(host == "10.0.0.1" || host == "10.0.0.2");
        }
    }

    #[test]
    fn test_least_requests_prefers_idle() {
        let cluster = cluster(&[1, 1], LoadBalanceAlgorithm::LeastRequests);
        let client: IpAddr = "1.1.1.1".parse().unwrap();

        let held = cluster.select(&client).unwrap();
        assert_eq!(held.destination().in_flight(), 1);
        let held_host = held.destination().address.host().unwrap().to_string();

        let next = cluster.select(&client).unwrap();
        assert_ne!(next.destination().address.host().unwrap(), held_host);
        drop(next);
        drop(held);

        assert!(cluster.destinations().all(|d| d.in_flight() == 0));
    }

    #[test]
    fn test_single_destination() {
        let cluster = cluster(&[1], LoadBalanceAlgorithm::IpHash);
        assert_eq!(pick(&cluster, "9.9.9.9"), "10.0.0.1");
        assert_eq!(cluster.len(), 1);
    }
}
