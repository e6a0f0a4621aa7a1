//! In-process token-bucket rate limiting
//!
//! ## Overview
//! - Buckets keyed by category + identifier (IP, node id, cluster id)
//! - Refill-per-minute equals burst for every category
//! - Repeated auth-failure breaches escalate to a one-hour block
//!
//! Bucket state lives in one map behind a mutex; entries idle for over an
//! hour are evicted by a periodic sweep.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

use crate::error::ServiceError;

/// How often the sweep task runs.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Entries untouched for this long are evicted.
const IDLE_EVICTION: Duration = Duration::from_secs(60 * 60);
/// Consecutive empty-bucket denials before an auth-failure key is blocked.
const ESCALATION_BREACHES: u32 = 3;
/// Length of the escalation block.
const ESCALATION_BLOCK: Duration = Duration::from_secs(60 * 60);

/// Rate-limit categories and what keys them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    /// Failed authentication attempts, keyed by client IP.
    AuthFailure,
    /// Authenticated requests, keyed by node id.
    Request,
    /// Bundle uploads, keyed by cluster id.
    BundleUpload,
    /// Health probes, keyed by client IP.
    HealthCheck,
}

/// Per-category capacities (refill per minute; burst equals capacity).
#[derive(Debug, Clone, Copy)]
pub struct Capacities {
    pub auth_failure: u32,
    pub request: u32,
    pub bundle_upload: u32,
    pub health_check: u32,
}

impl Default for Capacities {
    fn default() -> Self {
        Capacities {
            auth_failure: 10,
            request: 100,
            bundle_upload: 10,
            health_check: 30,
        }
    }
}

impl Capacities {
    fn for_category(&self, category: Category) -> u32 {
        match category {
            Category::AuthFailure => self.auth_failure,
            Category::Request => self.request,
            Category::BundleUpload => self.bundle_upload,
            Category::HealthCheck => self.health_check,
        }
    }
}

/// Outcome of an `allow` call. When denied, `retry_after` is the hint the
/// response carries in `Retry-After`.
#[derive(Debug, Clone, Copy)]
pub struct Decision {
    pub allowed: bool,
    pub retry_after: Option<Duration>,
}

impl Decision {
    /// Convert a denial into the wire error; allowed decisions pass.
    pub fn check(self) -> Result<(), ServiceError> {
        if self.allowed {
            Ok(())
        } else {
            Err(ServiceError::RateLimitExceeded {
                retry_after: self.retry_after,
            })
        }
    }
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
    blocked_until: Option<Instant>,
    breaches: u32,
    last_touched: Instant,
}

/// Token-bucket limiter shared by the whole server.
pub struct RateLimiter {
    caps: Capacities,
    buckets: Mutex<HashMap<(Category, String), Bucket>>,
}

impl RateLimiter {
    pub fn new(caps: Capacities) -> Self {
        RateLimiter {
            caps,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn allow(&self, category: Category, key: &str) -> Decision {
        self.allow_at(category, key, Instant::now())
    }

    fn allow_at(&self, category: Category, key: &str, now: Instant) -> Decision {
        let capacity = f64::from(self.caps.for_category(category));
        let rate_per_sec = capacity / 60.0;

        let mut buckets = self.buckets.lock();
        let bucket = buckets
            .entry((category, key.to_string()))
            .or_insert_with(|| Bucket {
                tokens: capacity,
                last_refill: now,
                blocked_until: None,
                breaches: 0,
                last_touched: now,
            });
        bucket.last_touched = now;

        if let Some(until) = bucket.blocked_until {
            if now < until {
                return Decision {
                    allowed: false,
                    retry_after: Some(until - now),
                };
            }
            bucket.blocked_until = None;
            bucket.breaches = 0;
        }

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * rate_per_sec).min(capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            bucket.breaches = 0;
            return Decision {
                allowed: true,
                retry_after: None,
            };
        }

        let deficit = 1.0 - bucket.tokens;
        let mut retry_after = Duration::from_secs_f64((deficit / rate_per_sec).ceil());

        if category == Category::AuthFailure {
            bucket.breaches += 1;
            if bucket.breaches >= ESCALATION_BREACHES {
                bucket.blocked_until = Some(now + ESCALATION_BLOCK);
                retry_after = ESCALATION_BLOCK;
            }
        }

        Decision {
            allowed: false,
            retry_after: Some(retry_after),
        }
    }

    /// Evict entries idle for over an hour.
    pub fn sweep(&self) {
        self.sweep_at(Instant::now());
    }

    fn sweep_at(&self, now: Instant) {
        let mut buckets = self.buckets.lock();
        let before = buckets.len();
        buckets.retain(|_, b| now.duration_since(b.last_touched) < IDLE_EVICTION);
        let evicted = before - buckets.len();
        if evicted > 0 {
            debug!(evicted, remaining = buckets.len(), "rate-limit sweep");
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.buckets.lock().len()
    }
}

/// Background sweep loop; exits when the shutdown channel flips.
pub async fn sweep_loop(
    limiter: std::sync::Arc<RateLimiter>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => limiter.sweep(),
            _ = shutdown.changed() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> RateLimiter {
        RateLimiter::new(Capacities::default())
    }

    #[test]
    fn burst_drains_then_denies_with_retry_hint() {
        let rl = limiter();
        let t0 = Instant::now();
        for _ in 0..10 {
            assert!(rl.allow_at(Category::BundleUpload, "c1", t0).allowed);
        }
        let denied = rl.allow_at(Category::BundleUpload, "c1", t0);
        assert!(!denied.allowed);
        let hint = denied.retry_after.unwrap();
        assert!(hint >= Duration::from_secs(1) && hint <= Duration::from_secs(60));
    }

    #[test]
    fn refill_restores_tokens() {
        let rl = limiter();
        let t0 = Instant::now();
        for _ in 0..10 {
            rl.allow_at(Category::BundleUpload, "c1", t0);
        }
        assert!(!rl.allow_at(Category::BundleUpload, "c1", t0).allowed);
        // 10/min means one token every 6 s.
        let later = t0 + Duration::from_secs(7);
        assert!(rl.allow_at(Category::BundleUpload, "c1", later).allowed);
    }

    #[test]
    fn keys_are_independent() {
        let rl = limiter();
        let t0 = Instant::now();
        for _ in 0..10 {
            rl.allow_at(Category::BundleUpload, "c1", t0);
        }
        assert!(!rl.allow_at(Category::BundleUpload, "c1", t0).allowed);
        assert!(rl.allow_at(Category::BundleUpload, "c2", t0).allowed);
        assert!(rl.allow_at(Category::Request, "c1", t0).allowed);
    }

    #[test]
    fn repeated_auth_failure_breach_escalates_to_hour_block() {
        let rl = limiter();
        let t0 = Instant::now();
        for _ in 0..10 {
            rl.allow_at(Category::AuthFailure, "198.51.100.7", t0);
        }
        // Three empty-bucket denials trip the block.
        for _ in 0..ESCALATION_BREACHES {
            rl.allow_at(Category::AuthFailure, "198.51.100.7", t0);
        }
        let denied = rl.allow_at(Category::AuthFailure, "198.51.100.7", t0);
        assert!(!denied.allowed);
        assert!(denied.retry_after.unwrap() >= Duration::from_secs(59 * 60));

        // Even a minute later (bucket would have refilled) the block holds.
        let later = t0 + Duration::from_secs(120);
        assert!(!rl.allow_at(Category::AuthFailure, "198.51.100.7", later).allowed);

        // After the block expires the key recovers.
        let after = t0 + ESCALATION_BLOCK + Duration::from_secs(1);
        assert!(rl.allow_at(Category::AuthFailure, "198.51.100.7", after).allowed);
    }

    #[test]
    fn sweep_evicts_idle_entries() {
        let rl = limiter();
        let t0 = Instant::now();
        rl.allow_at(Category::Request, "n1", t0);
        rl.allow_at(Category::Request, "n2", t0);
        assert_eq!(rl.len(), 2);

        rl.sweep_at(t0 + Duration::from_secs(61 * 60));
        assert_eq!(rl.len(), 0);
    }

    #[test]
    fn denial_converts_to_service_error() {
        let rl = limiter();
        let t0 = Instant::now();
        for _ in 0..30 {
            rl.allow_at(Category::HealthCheck, "ip", t0);
        }
        let err = rl.allow_at(Category::HealthCheck, "ip", t0).check().unwrap_err();
        assert!(err.is_rate_limited());
    }
}
