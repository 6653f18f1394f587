// Per-actor rate limiting.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Per-actor token bucket state
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Shared rate limiter — clone freely (it's an Arc inside). Keyed by actor
/// identity rather than source address: one noisy dashboard user must not
/// starve everyone behind the same NAT.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<RateLimiterInner>,
}

struct RateLimiterInner {
    buckets: DashMap<String, Bucket>,
    /// Maximum tokens per actor (burst capacity)
    capacity: f64,
    /// Tokens added per second (sustained rate)
    refill_rate: f64,
}

impl RateLimiter {
    pub fn new(requests_per_second: f64, burst: f64) -> Self {
        Self {
            inner: Arc::new(RateLimiterInner {
                buckets: DashMap::new(),
                capacity: burst,
                refill_rate: requests_per_second,
            }),
        }
    }

    /// Returns true if a request from `actor` is within limits. Consumes one
    /// token. Diagnostic routes never call this.
    pub fn check(&self, actor: &str) -> bool {
        let now = Instant::now();
        let mut bucket = self
            .inner
            .buckets
            .entry(actor.to_string())
            .or_insert_with(|| Bucket {
                tokens: self.inner.capacity,
                last_refill: now,
            });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.inner.refill_rate).min(self.inner.capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            tracing::warn!(actor, "rate limit exceeded");
            false
        }
    }

    /// Purge buckets idle for more than `idle_secs`. Called periodically
    /// from a background task.
    pub fn purge_idle(&self, idle_secs: u64) {
        let cutoff = Duration::from_secs(idle_secs);
        let now = Instant::now();
        self.inner
            .buckets
            .retain(|_, bucket| now.duration_since(bucket.last_refill) < cutoff);
    }

    pub fn tracked_actors(&self) -> usize {
        self.inner.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allows_within_burst() {
        let limiter = RateLimiter::new(2.0, 10.0);
        for i in 0..10 {
            assert!(limiter.check("u1"), "request {i} should be allowed within burst");
        }
    }

    #[test]
    fn test_blocks_over_burst() {
        let limiter = RateLimiter::new(1.0, 3.0);
        assert!(limiter.check("u1"));
        assert!(limiter.check("u1"));
        assert!(limiter.check("u1"));
        assert!(!limiter.check("u1"));
        assert!(!limiter.check("u1"));
    }

    #[test]
    fn test_actors_independent() {
        let limiter = RateLimiter::new(1.0, 2.0);
        assert!(limiter.check("alice"));
        assert!(limiter.check("alice"));
        assert!(!limiter.check("alice"));

        assert!(limiter.check("bob"));
        assert!(limiter.check("bob"));
        assert!(!limiter.check("bob"));
    }

    #[test]
    fn test_tracked_actors() {
        let limiter = RateLimiter::new(10.0, 100.0);
        assert_eq!(limiter.tracked_actors(), 0);
        limiter.check("a");
        limiter.check("b");
        limiter.check("guest");
        assert_eq!(limiter.tracked_actors(), 3);
    }

    #[tokio::test]
    async fn test_concurrent_checks_single_actor() {
        let limiter = Arc::new(RateLimiter::new(1.0, 10.0));
        let allowed = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut handles = Vec::new();

        for _ in 0..100 {
            let l = Arc::clone(&limiter);
            let a = Arc::clone(&allowed);
            handles.push(tokio::spawn(async move {
                if l.check("guest") {
                    a.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        // Entry-level locking keeps the count close to burst; small overrun
        // from the token-check TOCTOU is acceptable.
        let count = allowed.load(std::sync::atomic::Ordering::Relaxed);
        assert!(
            (10..=15).contains(&count),
            "concurrent burst: expected ~10 allowed, got {count}"
        );
    }
}
