use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum BalancerError {
    #[error("no available targets")]
    NoAvailableTargets,
    #[error("target not found")]
    TargetNotFound,
    #[error("invalid target url: {0}")]
    InvalidUrl(String),
    #[error("{0}")]
    Unsupported(&'static str),
}

/// Snapshot of a backend target. Mutating a snapshot has no effect on the
/// balancer.
#[derive(Debug, Clone)]
pub struct Target {
    pub url: String,
    pub healthy: bool,
    pub last_checked: Instant,
    pub failure_count: u32,
    pub success_count: u32,
    pub weight: u32,
    pub active_conns: i64,
}

/// Health-aware backend selection. `next_target` only returns healthy
/// targets and increments the target's active connection count; callers
/// release the slot with `release_conn` exactly once on completion.
pub trait LoadBalancer: Send + Sync {
    fn next_target(&self) -> Result<String, BalancerError>;
    fn add_target(&self, url: &str, weight: u32) -> Result<(), BalancerError>;
    fn remove_target(&self, url: &str) -> Result<(), BalancerError>;
    fn mark_target_down(&self, url: &str) -> Result<(), BalancerError>;
    fn mark_target_up(&self, url: &str) -> Result<(), BalancerError>;
    fn release_conn(&self, url: &str);
    fn targets(&self) -> Vec<Target>;
}

struct Backend {
    url: String,
    healthy: bool,
    last_checked: Instant,
    failure_count: u32,
    success_count: u32,
    weight: u32,
    active_conns: AtomicI64,
}

impl Backend {
    fn new(url: String, weight: u32) -> Self {
        Self {
            url,
            healthy: true,
            last_checked: Instant::now(),
            failure_count: 0,
            success_count: 0,
            weight: weight.max(1),
            active_conns: AtomicI64::new(0),
        }
    }

    fn snapshot(&self) -> Target {
        Target {
            url: self.url.clone(),
            healthy: self.healthy,
            last_checked: self.last_checked,
            failure_count: self.failure_count,
            success_count: self.success_count,
            weight: self.weight,
            active_conns: self.active_conns.load(Ordering::Relaxed),
        }
    }
}

/// Target set shared by the multi-target policies.
struct TargetSet {
    backends: RwLock<Vec<Backend>>,
}

impl TargetSet {
    fn new(urls: &[String]) -> Self {
        let set = Self { backends: RwLock::new(Vec::with_capacity(urls.len())) };
        for url in urls {
            let _ = set.add(url, 1);
        }
        set
    }

    fn add(&self, url: &str, weight: u32) -> Result<(), BalancerError> {
        Url::parse(url).map_err(|e| BalancerError::InvalidUrl(e.to_string()))?;

        let mut backends = self.backends.write().expect("balancer lock poisoned");
        if backends.iter().any(|b| b.url == url) {
            return Ok(());
        }
        backends.push(Backend::new(url.to_string(), weight));
        Ok(())
    }

    fn remove(&self, url: &str) -> Result<(), BalancerError> {
        let mut backends = self.backends.write().expect("balancer lock poisoned");
        let before = backends.len();
        backends.retain(|b| b.url != url);
        if backends.len() == before {
            return Err(BalancerError::TargetNotFound);
        }
        Ok(())
    }

    fn mark_down(&self, url: &str) -> Result<(), BalancerError> {
        let mut backends = self.backends.write().expect("balancer lock poisoned");
        let backend = backends
            .iter_mut()
            .find(|b| b.url == url)
            .ok_or(BalancerError::TargetNotFound)?;
        backend.healthy = false;
        backend.last_checked = Instant::now();
        backend.failure_count += 1;
        warn!(target = %url, failures = backend.failure_count, "backend marked down");
        Ok(())
    }

    fn mark_up(&self, url: &str) -> Result<(), BalancerError> {
        let mut backends = self.backends.write().expect("balancer lock poisoned");
        let backend = backends
            .iter_mut()
            .find(|b| b.url == url)
            .ok_or(BalancerError::TargetNotFound)?;
        backend.healthy = true;
        backend.last_checked = Instant::now();
        backend.success_count += 1;
        backend.failure_count = 0;
        Ok(())
    }

    fn release(&self, url: &str) {
        let backends = self.backends.read().expect("balancer lock poisoned");
        if let Some(backend) = backends.iter().find(|b| b.url == url) {
            // Never go below zero even on spurious releases.
            let _ = backend.active_conns.fetch_update(
                Ordering::Relaxed,
                Ordering::Relaxed,
                |count| if count > 0 { Some(count - 1) } else { None },
            );
        }
    }

    fn snapshots(&self) -> Vec<Target> {
        let backends = self.backends.read().expect("balancer lock poisoned");
        backends.iter().map(Backend::snapshot).collect()
    }
}

/// Round-robin selection over the healthy subset.
pub struct RoundRobinBalancer {
    targets: TargetSet,
    position: AtomicU64,
}

impl RoundRobinBalancer {
    pub fn new(urls: &[String]) -> Self {
        Self { targets: TargetSet::new(urls), position: AtomicU64::new(0) }
    }
}

impl LoadBalancer for RoundRobinBalancer {
    fn next_target(&self) -> Result<String, BalancerError> {
        let backends = self.targets.backends.read().expect("balancer lock poisoned");
        let healthy: Vec<&Backend> = backends.iter().filter(|b| b.healthy).collect();
        if healthy.is_empty() {
            return Err(BalancerError::NoAvailableTargets);
        }

        let position = self.position.fetch_add(1, Ordering::Relaxed) as usize % healthy.len();
        let selected = healthy[position];
        selected.active_conns.fetch_add(1, Ordering::Relaxed);
        debug!(target = %selected.url, "round-robin selected backend");
        Ok(selected.url.clone())
    }

    fn add_target(&self, url: &str, weight: u32) -> Result<(), BalancerError> {
        self.targets.add(url, weight)
    }

    fn remove_target(&self, url: &str) -> Result<(), BalancerError> {
        self.targets.remove(url)
    }

    fn mark_target_down(&self, url: &str) -> Result<(), BalancerError> {
        self.targets.mark_down(url)
    }

    fn mark_target_up(&self, url: &str) -> Result<(), BalancerError> {
        self.targets.mark_up(url)
    }

    fn release_conn(&self, url: &str) {
        self.targets.release(url);
    }

    fn targets(&self) -> Vec<Target> {
        self.targets.snapshots()
    }
}

/// Weighted round-robin: the healthy set is logically expanded by weight
/// before the modulo step, so a weight-3 target receives three slots per
/// cycle.
pub struct WeightedRoundRobinBalancer {
    targets: TargetSet,
    position: AtomicU64,
}

impl WeightedRoundRobinBalancer {
    pub fn new(url_weights: &[(String, u32)]) -> Self {
        let balancer = Self {
            targets: TargetSet::new(&[]),
            position: AtomicU64::new(0),
        };
        for (url, weight) in url_weights {
            let _ = balancer.targets.add(url, *weight);
        }
        balancer
    }
}

impl LoadBalancer for WeightedRoundRobinBalancer {
    fn next_target(&self) -> Result<String, BalancerError> {
        let backends = self.targets.backends.read().expect("balancer lock poisoned");
        let mut expanded: Vec<&Backend> = Vec::new();
        for backend in backends.iter().filter(|b| b.healthy) {
            for _ in 0..backend.weight {
                expanded.push(backend);
            }
        }
        if expanded.is_empty() {
            return Err(BalancerError::NoAvailableTargets);
        }

        let position = self.position.fetch_add(1, Ordering::Relaxed) as usize % expanded.len();
        let selected = expanded[position];
        selected.active_conns.fetch_add(1, Ordering::Relaxed);
        Ok(selected.url.clone())
    }

    fn add_target(&self, url: &str, weight: u32) -> Result<(), BalancerError> {
        self.targets.add(url, weight)
    }

    fn remove_target(&self, url: &str) -> Result<(), BalancerError> {
        self.targets.remove(url)
    }

    fn mark_target_down(&self, url: &str) -> Result<(), BalancerError> {
        self.targets.mark_down(url)
    }

    fn mark_target_up(&self, url: &str) -> Result<(), BalancerError> {
        self.targets.mark_up(url)
    }

    fn release_conn(&self, url: &str) {
        self.targets.release(url);
    }

    fn targets(&self) -> Vec<Target> {
        self.targets.snapshots()
    }
}

/// Least-connections selection; ties break on first occurrence.
pub struct LeastConnectionsBalancer {
    targets: TargetSet,
}

impl LeastConnectionsBalancer {
    pub fn new(urls: &[String]) -> Self {
        Self { targets: TargetSet::new(urls) }
    }
}

impl LoadBalancer for LeastConnectionsBalancer {
    fn next_target(&self) -> Result<String, BalancerError> {
        let backends = self.targets.backends.read().expect("balancer lock poisoned");

        let mut selected: Option<&Backend> = None;
        let mut min_conns = i64::MAX;
        for backend in backends.iter().filter(|b| b.healthy) {
            let conns = backend.active_conns.load(Ordering::Relaxed);
            if conns < min_conns {
                min_conns = conns;
                selected = Some(backend);
            }
        }

        let selected = selected.ok_or(BalancerError::NoAvailableTargets)?;
        selected.active_conns.fetch_add(1, Ordering::Relaxed);
        debug!(target = %selected.url, connections = min_conns, "least-connections selected backend");
        Ok(selected.url.clone())
    }

    fn add_target(&self, url: &str, weight: u32) -> Result<(), BalancerError> {
        self.targets.add(url, weight)
    }

    fn remove_target(&self, url: &str) -> Result<(), BalancerError> {
        self.targets.remove(url)
    }

    fn mark_target_down(&self, url: &str) -> Result<(), BalancerError> {
        self.targets.mark_down(url)
    }

    fn mark_target_up(&self, url: &str) -> Result<(), BalancerError> {
        self.targets.mark_up(url)
    }

    fn release_conn(&self, url: &str) {
        self.targets.release(url);
    }

    fn targets(&self) -> Vec<Target> {
        self.targets.snapshots()
    }
}

/// Degenerate balancer for a single backend. Adding or removing targets is
/// not supported.
pub struct SingleTargetBalancer {
    target: RwLock<Backend>,
}

impl SingleTargetBalancer {
    pub fn new(url: &str) -> Self {
        let url = if Url::parse(url).is_ok() { url } else { "http://localhost:8080" };
        Self { target: RwLock::new(Backend::new(url.to_string(), 1)) }
    }
}

impl LoadBalancer for SingleTargetBalancer {
    fn next_target(&self) -> Result<String, BalancerError> {
        let target = self.target.read().expect("balancer lock poisoned");
        if !target.healthy {
            return Err(BalancerError::NoAvailableTargets);
        }
        target.active_conns.fetch_add(1, Ordering::Relaxed);
        Ok(target.url.clone())
    }

    fn add_target(&self, _url: &str, _weight: u32) -> Result<(), BalancerError> {
        Err(BalancerError::Unsupported("single target balancer does not support adding targets"))
    }

    fn remove_target(&self, _url: &str) -> Result<(), BalancerError> {
        Err(BalancerError::Unsupported("single target balancer does not support removing targets"))
    }

    fn mark_target_down(&self, url: &str) -> Result<(), BalancerError> {
        let mut target = self.target.write().expect("balancer lock poisoned");
        if target.url != url {
            return Err(BalancerError::TargetNotFound);
        }
        target.healthy = false;
        target.last_checked = Instant::now();
        target.failure_count += 1;
        Ok(())
    }

    fn mark_target_up(&self, url: &str) -> Result<(), BalancerError> {
        let mut target = self.target.write().expect("balancer lock poisoned");
        if target.url != url {
            return Err(BalancerError::TargetNotFound);
        }
        target.healthy = true;
        target.last_checked = Instant::now();
        target.success_count += 1;
        target.failure_count = 0;
        Ok(())
    }

    fn release_conn(&self, url: &str) {
        let target = self.target.read().expect("balancer lock poisoned");
        if target.url == url {
            let _ = target.active_conns.fetch_update(
                Ordering::Relaxed,
                Ordering::Relaxed,
                |count| if count > 0 { Some(count - 1) } else { None },
            );
        }
    }

    fn targets(&self) -> Vec<Target> {
        let target = self.target.read().expect("balancer lock poisoned");
        vec![target.snapshot()]
    }
}
