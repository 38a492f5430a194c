//! Token-bucket admission control per (instance, scope).
//!
//! Refill is computed lazily from elapsed wall-clock time at each
//! acquisition; refill and spend happen under one lock so concurrent
//! invocations cannot double-spend a token.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::definition::RateLimitPolicy;
use crate::types::InstanceId;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BucketScope {
    Instance,
    Action(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    pub instance: InstanceId,
    pub scope: BucketScope,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    Granted,
    Denied { retry_after: Duration },
}

impl Decision {
    pub fn is_granted(&self) -> bool {
        matches!(self, Decision::Granted)
    }
}

#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(policy: RateLimitPolicy, now: Instant) -> Self {
        let capacity = f64::from(policy.capacity);
        Self {
            capacity,
            refill_per_sec: policy.refill_per_sec.max(0.0),
            tokens: capacity,
            last_refill: now,
        }
    }

    /// Adopt `policy` if it differs from the bucket's current shape.
    /// Tokens are clamped to the new capacity so a shrink takes effect
    /// immediately; already-spent tokens are not refunded on a grow.
    fn reconfigure(&mut self, policy: RateLimitPolicy) {
        let capacity = f64::from(policy.capacity);
        let refill_per_sec = policy.refill_per_sec.max(0.0);
        if self.capacity == capacity && self.refill_per_sec == refill_per_sec {
            return;
        }
        self.capacity = capacity;
        self.refill_per_sec = refill_per_sec;
        self.tokens = self.tokens.min(capacity);
    }

    fn acquire(&mut self, now: Instant, fallback_retry_after: Duration) -> Decision {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Decision::Granted;
        }

        let retry_after = if self.refill_per_sec > 0.0 {
            Duration::from_secs_f64((1.0 - self.tokens) / self.refill_per_sec)
        } else {
            // A bucket that never refills has no honest wait time; report
            // the configured advisory instead.
            fallback_retry_after
        };
        Decision::Denied { retry_after }
    }
}

pub struct RateLimiter {
    buckets: Mutex<HashMap<BucketKey, TokenBucket>>,
    fallback_retry_after: Duration,
}

impl RateLimiter {
    pub fn new(fallback_retry_after: Duration) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            fallback_retry_after,
        }
    }

    /// Acquire one token from the bucket for `key`, creating the bucket
    /// from `policy` on first touch. A bucket that already exists under a
    /// different policy is reshaped to the presented one before spending,
    /// so the policy in effect is always the caller's, not whichever one
    /// happened to touch the key first.
    pub fn acquire(&self, key: BucketKey, policy: RateLimitPolicy) -> Decision {
        self.acquire_at(key, policy, Instant::now())
    }

    /// Same as [`acquire`](Self::acquire) with an explicit clock reading,
    /// for deterministic tests.
    pub fn acquire_at(&self, key: BucketKey, policy: RateLimitPolicy, now: Instant) -> Decision {
        let mut buckets = self
            .buckets
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let bucket = buckets
            .entry(key)
            .or_insert_with(|| TokenBucket::new(policy, now));
        bucket.reconfigure(policy);
        bucket.acquire(now, self.fallback_retry_after)
    }
}
