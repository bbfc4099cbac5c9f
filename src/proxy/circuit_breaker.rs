use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::error::GatewayError;

/// Circuit breaker configuration. Zero or out-of-range values fall back to
/// the defaults on construction.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Failure ratio (0.0-1.0) that trips the breaker.
    pub error_threshold: f64,
    /// Minimum observed requests before the ratio is evaluated.
    pub min_requests: u64,
    /// How long the breaker stays open before probing.
    pub timeout: Duration,
    /// Maximum concurrent probe calls while half-open.
    pub half_open_max: u32,
    /// Consecutive probe successes required to close.
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            error_threshold: 0.5,
            min_requests: 10,
            timeout: Duration::from_secs(60),
            half_open_max: 5,
            success_threshold: 2,
        }
    }
}

impl BreakerConfig {
    fn normalized(mut self) -> Self {
        let defaults = BreakerConfig::default();
        if self.error_threshold <= 0.0 || self.error_threshold > 1.0 {
            self.error_threshold = defaults.error_threshold;
        }
        if self.min_requests == 0 {
            self.min_requests = defaults.min_requests;
        }
        if self.timeout.is_zero() {
            self.timeout = defaults.timeout;
        }
        if self.half_open_max == 0 {
            self.half_open_max = defaults.half_open_max;
        }
        if self.success_threshold == 0 {
            self.success_threshold = defaults.success_threshold;
        }
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    HalfOpen,
    Open,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::HalfOpen => "half-open",
            BreakerState::Open => "open",
        }
    }
}

/// Point-in-time view of the breaker, for diagnostics and tests.
#[derive(Debug, Clone)]
pub struct BreakerMetrics {
    pub state: BreakerState,
    pub success_count: u64,
    pub failure_count: u64,
    pub error_rate: f64,
    pub consecutive_successes: u32,
    pub last_state_change: Instant,
    pub open_since: Option<Instant>,
}

struct Core {
    state: BreakerState,
    success_count: u64,
    failure_count: u64,
    consecutive_successes: u32,
    inflight_half_open: u32,
    last_state_change: Instant,
    open_since: Option<Instant>,
}

/// Fault isolation for a backend dependency: trips open on a high error
/// ratio, rejects calls while open, and probes recovery with a bounded
/// number of half-open calls.
///
/// Admission decisions and state transitions share one lock, so the ratio
/// check always sees both counters consistently; a failure that pushes the
/// ratio past the threshold transitions to open before `execute` returns.
pub struct CircuitBreaker {
    config: BreakerConfig,
    core: Mutex<Core>,
}

enum Admission {
    Normal,
    Probe,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config: config.normalized(),
            core: Mutex::new(Core {
                state: BreakerState::Closed,
                success_count: 0,
                failure_count: 0,
                consecutive_successes: 0,
                inflight_half_open: 0,
                last_state_change: Instant::now(),
                open_since: None,
            }),
        }
    }

    /// Run `op` under the breaker. Errors from `op` bubble up verbatim; the
    /// breaker itself synthesizes `CircuitOpen` and `TooManyRequests`.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T, GatewayError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        self.execute_classified(op, |_| false).await
    }

    /// Like [`execute`](Self::execute), but also counts successful results
    /// for which `is_failure` returns true (an upstream 5xx is delivered to
    /// the caller yet still trips the breaker).
    pub async fn execute_classified<T, F, Fut, C>(
        &self,
        op: F,
        is_failure: C,
    ) -> Result<T, GatewayError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
        C: FnOnce(&T) -> bool,
    {
        let admission = self.try_admit()?;
        let result = op().await;
        let failed = match &result {
            Ok(value) => is_failure(value),
            Err(_) => true,
        };
        self.settle(&admission, failed);
        result
    }

    pub fn state(&self) -> BreakerState {
        self.core.lock().expect("breaker lock poisoned").state
    }

    pub fn metrics(&self) -> BreakerMetrics {
        let core = self.core.lock().expect("breaker lock poisoned");
        let total = core.success_count + core.failure_count;
        let error_rate = if total > 0 {
            core.failure_count as f64 / total as f64
        } else {
            0.0
        };
        BreakerMetrics {
            state: core.state,
            success_count: core.success_count,
            failure_count: core.failure_count,
            error_rate,
            consecutive_successes: core.consecutive_successes,
            last_state_change: core.last_state_change,
            open_since: core.open_since,
        }
    }

    /// Return to closed with all counters zeroed.
    pub fn reset(&self) {
        let mut core = self.core.lock().expect("breaker lock poisoned");
        core.state = BreakerState::Closed;
        core.success_count = 0;
        core.failure_count = 0;
        core.consecutive_successes = 0;
        core.inflight_half_open = 0;
        core.last_state_change = Instant::now();
        core.open_since = None;
    }

    fn try_admit(&self) -> Result<Admission, GatewayError> {
        let mut core = self.core.lock().expect("breaker lock poisoned");
        match core.state {
            BreakerState::Closed => Ok(Admission::Normal),
            BreakerState::Open => {
                let opened = core.open_since.expect("open state without open_since");
                if opened.elapsed() < self.config.timeout {
                    return Err(GatewayError::CircuitOpen);
                }
                transition(&mut core, BreakerState::HalfOpen);
                info!("circuit breaker probing after open timeout");
                core.inflight_half_open = 1;
                Ok(Admission::Probe)
            }
            BreakerState::HalfOpen => {
                if core.inflight_half_open >= self.config.half_open_max {
                    return Err(GatewayError::TooManyRequests);
                }
                core.inflight_half_open += 1;
                Ok(Admission::Probe)
            }
        }
    }

    fn settle(&self, admission: &Admission, failed: bool) {
        let mut core = self.core.lock().expect("breaker lock poisoned");
        let probe = matches!(admission, Admission::Probe);

        if probe {
            core.inflight_half_open = core.inflight_half_open.saturating_sub(1);
        }

        if failed {
            core.failure_count += 1;
            core.consecutive_successes = 0;

            if probe && core.state != BreakerState::Open {
                warn!("probe failed, circuit breaker reopening");
                transition(&mut core, BreakerState::Open);
                core.open_since = Some(Instant::now());
            } else if core.state == BreakerState::Closed {
                let total = core.success_count + core.failure_count;
                if total >= self.config.min_requests {
                    let error_rate = core.failure_count as f64 / total as f64;
                    if error_rate >= self.config.error_threshold {
                        warn!(error_rate, "error threshold exceeded, circuit breaker opening");
                        transition(&mut core, BreakerState::Open);
                        core.open_since = Some(Instant::now());
                    }
                }
            }
        } else {
            core.success_count += 1;
            core.consecutive_successes += 1;
            if probe
                && core.state == BreakerState::HalfOpen
                && core.consecutive_successes >= self.config.success_threshold
            {
                info!("circuit breaker closed after successful probes");
                transition(&mut core, BreakerState::Closed);
                core.success_count = 0;
                core.failure_count = 0;
                core.open_since = None;
            }
        }
    }
}

fn transition(core: &mut Core, next: BreakerState) {
    core.state = next;
    core.last_state_change = Instant::now();
    core.consecutive_successes = 0;
    core.inflight_half_open = 0;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn breaker(timeout: Duration) -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            error_threshold: 0.5,
            min_requests: 5,
            timeout,
            half_open_max: 1,
            success_threshold: 2,
        })
    }

    async fn fail(cb: &CircuitBreaker) -> Result<(), GatewayError> {
        cb.execute(|| async { Err::<(), _>(GatewayError::Upstream("boom".into())) })
            .await
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<(), GatewayError> {
        cb.execute(|| async { Ok(()) }).await
    }

    #[tokio::test]
    async fn closed_passes_calls_through() {
        let cb = breaker(Duration::from_secs(60));
        assert!(succeed(&cb).await.is_ok());
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn opens_when_error_ratio_exceeds_threshold() {
        let cb = breaker(Duration::from_secs(60));
        for _ in 0..5 {
            let _ = fail(&cb).await;
        }
        assert_eq!(cb.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn stays_closed_below_min_requests() {
        let cb = breaker(Duration::from_secs(60));
        for _ in 0..4 {
            let _ = fail(&cb).await;
        }
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn open_rejects_without_invoking() {
        let cb = breaker(Duration::from_secs(60));
        for _ in 0..5 {
            let _ = fail(&cb).await;
        }

        let invoked = Arc::new(AtomicU32::new(0));
        let counter = invoked.clone();
        let result = cb
            .execute(|| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(GatewayError::CircuitOpen)));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn half_opens_after_timeout_and_closes_on_successes() {
        let cb = breaker(Duration::from_millis(50));
        for _ in 0..5 {
            let _ = fail(&cb).await;
        }
        assert_eq!(cb.state(), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(succeed(&cb).await.is_ok());
        assert_eq!(cb.state(), BreakerState::HalfOpen);

        assert!(succeed(&cb).await.is_ok());
        assert_eq!(cb.state(), BreakerState::Closed);

        let metrics = cb.metrics();
        assert_eq!(metrics.failure_count, 0);
        assert!(metrics.open_since.is_none());
    }

    #[tokio::test]
    async fn probe_failure_reopens() {
        let cb = breaker(Duration::from_millis(50));
        for _ in 0..5 {
            let _ = fail(&cb).await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        let _ = fail(&cb).await;
        assert_eq!(cb.state(), BreakerState::Open);

        // The open window restarts from the probe failure.
        assert!(matches!(succeed(&cb).await, Err(GatewayError::CircuitOpen)));
    }

    #[tokio::test]
    async fn half_open_limits_concurrent_probes() {
        let cb = Arc::new(breaker(Duration::from_millis(50)));
        for _ in 0..5 {
            let _ = fail(&cb).await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let slow = cb.clone();
        let probe = tokio::spawn(async move {
            slow.execute(|| async move {
                let _ = started_tx.send(());
                let _ = release_rx.await;
                Ok(())
            })
            .await
        });

        started_rx.await.unwrap();

        // One probe in flight with half_open_max=1: the next call is shed.
        assert!(matches!(succeed(&cb).await, Err(GatewayError::TooManyRequests)));

        let _ = release_tx.send(());
        assert!(probe.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn reset_returns_to_closed_with_zeroed_counters() {
        let cb = breaker(Duration::from_secs(60));
        for _ in 0..5 {
            let _ = fail(&cb).await;
        }
        assert_eq!(cb.state(), BreakerState::Open);

        cb.reset();
        let metrics = cb.metrics();
        assert_eq!(metrics.state, BreakerState::Closed);
        assert_eq!(metrics.success_count, 0);
        assert_eq!(metrics.failure_count, 0);
        assert_eq!(metrics.consecutive_successes, 0);
        assert!(succeed(&cb).await.is_ok());
    }

    #[tokio::test]
    async fn user_errors_bubble_verbatim() {
        let cb = breaker(Duration::from_secs(60));
        let err = fail(&cb).await.unwrap_err();
        assert!(matches!(err, GatewayError::Upstream(_)));
    }

    #[tokio::test]
    async fn classified_results_count_as_failures() {
        let cb = breaker(Duration::from_secs(60));

        // Each call succeeds from the caller's point of view but is
        // classified as a failure, like an upstream 500.
        for _ in 0..5 {
            let result = cb
                .execute_classified(|| async { Ok(500u16) }, |status| *status >= 500)
                .await;
            assert_eq!(result.unwrap(), 500);
        }
        assert_eq!(cb.state(), BreakerState::Open);
    }
}
