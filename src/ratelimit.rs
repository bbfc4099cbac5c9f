use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::watch;
use tracing::debug;

/// Keyed request-rate limiter. Keys are arbitrary strings, typically
/// `clientIP:routePath`. Exhaustion is signalled only by `allow` returning
/// false; the limiter itself never fails.
pub trait RateLimiter: Send + Sync {
    /// Admit a single request for `key`.
    fn allow(&self, key: &str) -> bool {
        self.allow_n(key, 1)
    }

    /// Admit `n` requests for `key` atomically.
    fn allow_n(&self, key: &str, n: u32) -> bool;

    /// Current admission state without consuming: (remaining, would admit one).
    fn peek(&self, key: &str) -> (u32, bool);

    /// Time until one admission would succeed again. At least one second,
    /// suitable for a `Retry-After` header.
    fn retry_after(&self, key: &str) -> Duration;

    /// Forget all state for `key`.
    fn reset(&self, key: &str);

    /// Stop the background sweeper.
    fn stop(&self);
}

/// Token-bucket limiter: each key owns a bucket of `max_requests` tokens
/// refilled at `max_requests / window` tokens per second.
pub struct TokenBucket {
    buckets: Arc<DashMap<String, Bucket>>,
    rate: f64,
    capacity: u32,
    window: Duration,
    shutdown: watch::Sender<bool>,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant, rate: f64, capacity: u32) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(capacity as f64);
        self.last_refill = now;
    }
}

impl TokenBucket {
    pub fn new(window: Duration, max_requests: u32) -> Self {
        let window = window.max(Duration::from_millis(10));
        let rate = max_requests as f64 / window.as_secs_f64();
        let buckets: Arc<DashMap<String, Bucket>> = Arc::new(DashMap::new());
        let (shutdown, mut rx) = watch::channel(false);

        let sweep_targets = buckets.clone();
        let capacity = max_requests;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(window * 2);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let now = Instant::now();
                        sweep_targets.retain(|_, bucket| {
                            let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
                            let current = (bucket.tokens + elapsed * rate).min(capacity as f64);
                            !(current >= capacity as f64
                                && now.duration_since(bucket.last_refill) > window * 2)
                        });
                        debug!(active_buckets = sweep_targets.len(), "rate limiter sweep complete");
                    }
                    _ = rx.changed() => return,
                }
            }
        });

        Self { buckets, rate, capacity, window, shutdown }
    }
}

impl RateLimiter for TokenBucket {
    fn allow_n(&self, key: &str, n: u32) -> bool {
        let now = Instant::now();
        let mut bucket = self.buckets.entry(key.to_string()).or_insert_with(|| Bucket {
            tokens: self.capacity as f64,
            last_refill: now,
        });

        bucket.refill(now, self.rate, self.capacity);

        if bucket.tokens < n as f64 {
            return false;
        }
        bucket.tokens -= n as f64;
        true
    }

    fn peek(&self, key: &str) -> (u32, bool) {
        match self.buckets.get(key) {
            Some(bucket) => {
                let elapsed = Instant::now().duration_since(bucket.last_refill).as_secs_f64();
                let tokens = (bucket.tokens + elapsed * self.rate).min(self.capacity as f64);
                (tokens as u32, tokens >= 1.0)
            }
            None => (self.capacity, self.capacity >= 1),
        }
    }

    fn retry_after(&self, key: &str) -> Duration {
        let deficit = match self.buckets.get(key) {
            Some(bucket) => {
                let elapsed = Instant::now().duration_since(bucket.last_refill).as_secs_f64();
                let tokens = (bucket.tokens + elapsed * self.rate).min(self.capacity as f64);
                1.0 - tokens
            }
            None => 0.0,
        };

        if deficit <= 0.0 || self.rate <= 0.0 {
            return Duration::from_secs(1);
        }
        Duration::from_secs((deficit / self.rate).ceil().max(1.0) as u64)
    }

    fn reset(&self, key: &str) {
        self.buckets.remove(key);
    }

    fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Sliding-window limiter: each key keeps the timestamps of admissions in
/// the last `window`; a request is admitted while fewer than `max_requests`
/// timestamps remain in the window.
pub struct SlidingWindow {
    clients: Arc<DashMap<String, Vec<Instant>>>,
    window: Duration,
    max_requests: u32,
    shutdown: watch::Sender<bool>,
}

impl SlidingWindow {
    pub fn new(window: Duration, max_requests: u32) -> Self {
        let window = window.max(Duration::from_millis(10));
        let clients: Arc<DashMap<String, Vec<Instant>>> = Arc::new(DashMap::new());
        let (shutdown, mut rx) = watch::channel(false);

        let sweep_targets = clients.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(window / 2);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let now = Instant::now();
                        sweep_targets.retain(|_, stamps| {
                            stamps.retain(|ts| now.duration_since(*ts) < window);
                            !stamps.is_empty()
                        });
                    }
                    _ = rx.changed() => return,
                }
            }
        });

        Self { clients, window, max_requests, shutdown }
    }
}

impl RateLimiter for SlidingWindow {
    fn allow_n(&self, key: &str, n: u32) -> bool {
        let now = Instant::now();

        let mut stamps = self.clients.entry(key.to_string()).or_default();
        stamps.retain(|ts| now.duration_since(*ts) < self.window);

        if stamps.len() as u32 + n > self.max_requests {
            return false;
        }
        for _ in 0..n {
            stamps.push(now);
        }
        true
    }

    fn peek(&self, key: &str) -> (u32, bool) {
        let now = Instant::now();
        let used = self
            .clients
            .get(key)
            .map(|stamps| {
                stamps.iter().filter(|ts| now.duration_since(**ts) < self.window).count() as u32
            })
            .unwrap_or(0);

        let remaining = self.max_requests.saturating_sub(used);
        (remaining, remaining >= 1)
    }

    fn retry_after(&self, key: &str) -> Duration {
        let now = Instant::now();
        let oldest = self.clients.get(key).and_then(|stamps| {
            stamps
                .iter()
                .filter(|ts| now.duration_since(**ts) < self.window)
                .min()
                .copied()
        });

        match oldest {
            Some(ts) => {
                let until_free = (ts + self.window).saturating_duration_since(now);
                until_free.max(Duration::from_secs(1))
            }
            None => Duration::from_secs(1),
        }
    }

    fn reset(&self, key: &str) {
        self.clients.remove(key);
    }

    fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn token_bucket_admits_up_to_capacity() {
        let limiter = TokenBucket::new(Duration::from_secs(10), 3);
        assert!(limiter.allow("k"));
        assert!(limiter.allow("k"));
        assert!(limiter.allow("k"));
        assert!(!limiter.allow("k"));
        limiter.stop();
    }

    #[tokio::test]
    async fn token_bucket_refills_over_time() {
        let limiter = TokenBucket::new(Duration::from_millis(100), 2);
        assert!(limiter.allow("k"));
        assert!(limiter.allow("k"));
        assert!(!limiter.allow("k"));

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(limiter.allow("k"));
        limiter.stop();
    }

    #[tokio::test]
    async fn token_bucket_never_exceeds_capacity() {
        let limiter = TokenBucket::new(Duration::from_millis(50), 2);
        assert!(limiter.allow_n("k", 2));
        tokio::time::sleep(Duration::from_millis(500)).await;

        // Long idle must not accumulate more than the capacity.
        assert!(limiter.allow_n("k", 2));
        assert!(!limiter.allow("k"));
        limiter.stop();
    }

    #[tokio::test]
    async fn token_bucket_peek_does_not_consume() {
        let limiter = TokenBucket::new(Duration::from_secs(10), 5);
        let (remaining, ok) = limiter.peek("k");
        assert_eq!(remaining, 5);
        assert!(ok);

        let (remaining, ok) = limiter.peek("k");
        assert_eq!(remaining, 5);
        assert!(ok);
        limiter.stop();
    }

    #[tokio::test]
    async fn token_bucket_reset_restores_full_bucket() {
        let limiter = TokenBucket::new(Duration::from_secs(10), 1);
        assert!(limiter.allow("k"));
        assert!(!limiter.allow("k"));

        limiter.reset("k");
        assert!(limiter.allow("k"));
        limiter.stop();
    }

    #[tokio::test]
    async fn token_bucket_allow_n_is_all_or_nothing() {
        let limiter = TokenBucket::new(Duration::from_secs(10), 3);
        assert!(!limiter.allow_n("k", 4));
        assert!(limiter.allow_n("k", 3));
        limiter.stop();
    }

    #[tokio::test]
    async fn sliding_window_enforces_limit_within_window() {
        let limiter = SlidingWindow::new(Duration::from_millis(100), 2);
        assert!(limiter.allow("k"));
        assert!(limiter.allow("k"));
        assert!(!limiter.allow("k"));

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(limiter.allow("k"));
        limiter.stop();
    }

    #[tokio::test]
    async fn sliding_window_peek_reports_remaining() {
        let limiter = SlidingWindow::new(Duration::from_secs(10), 3);
        assert!(limiter.allow("k"));
        let (remaining, ok) = limiter.peek("k");
        assert_eq!(remaining, 2);
        assert!(ok);
        limiter.stop();
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let limiter = TokenBucket::new(Duration::from_secs(10), 1);
        assert!(limiter.allow("a"));
        assert!(limiter.allow("b"));
        assert!(!limiter.allow("a"));
        limiter.stop();
    }
}
