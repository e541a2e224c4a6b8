//! Lazy token bucket over wall-clock time.
//!
//! No timer ever refills a bucket. Every operation derives the current token
//! count from the elapsed time since `last_refill_at`, so any process holding
//! the record can apply it, in any order, and reach the same state.

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::config::Config;

/// Where a bucket's capacity came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketSource {
    Default,
    Learned,
}

impl BucketSource {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "default" => Some(BucketSource::Default),
            "learned" => Some(BucketSource::Learned),
            _ => None,
        }
    }
}

/// Tokens one call spends. A bucket smaller than this could never grant.
pub const CALL_COST: f64 = 1.0;

/// Parameters for buckets that have not observed a server limit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketPolicy {
    pub default_capacity: f64,
    pub default_refill_rate: f64,
    pub ttl: Duration,
}

impl BucketPolicy {
    /// One second worth of the conservative rate, but never less than one call.
    pub fn from_config(config: &Config) -> Self {
        Self {
            default_capacity: config.conservative_default_rps.max(CALL_COST),
            default_refill_rate: config.conservative_default_rps,
            ttl: config.cache_ttl(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateBucket {
    pub key: String,
    pub capacity: f64,
    /// tokens per second
    pub refill_rate: f64,
    pub tokens_available: f64,
    /// seconds since the Unix epoch
    pub last_refill_at: f64,
    pub source: BucketSource,
    pub expires_at: f64,
}

impl RateBucket {
    /// A full bucket at the conservative default.
    pub fn new_default(key: &str, policy: &BucketPolicy, now: f64) -> Self {
        Self {
            key: key.to_string(),
            capacity: policy.default_capacity,
            refill_rate: policy.default_refill_rate,
            tokens_available: policy.default_capacity,
            last_refill_at: now,
            source: BucketSource::Default,
            expires_at: now + policy.ttl.as_secs_f64(),
        }
    }

    /// Token count at `now` without touching the record.
    pub fn tokens_at(&self, now: f64) -> f64 {
        let elapsed = (now - self.last_refill_at).max(0.0);
        (self.tokens_available + elapsed * self.refill_rate).min(self.capacity)
    }

    /// Refill, then take `cost` tokens if they are there. A denial leaves the
    /// record untouched.
    pub fn try_acquire(&mut self, cost: f64, now: f64) -> bool {
        let tokens = self.tokens_at(now);
        if tokens >= cost {
            self.tokens_available = tokens - cost;
            self.last_refill_at = self.last_refill_at.max(now);
            true
        } else {
            false
        }
    }

    /// Reverts an expired learned bucket to the default. Returns whether it did.
    pub fn expire_if_due(&mut self, policy: &BucketPolicy, now: f64) -> bool {
        if self.source != BucketSource::Learned || now < self.expires_at {
            return false;
        }

        self.refill(now);
        self.capacity = policy.default_capacity;
        self.refill_rate = policy.default_refill_rate;
        self.tokens_available = self.tokens_available.min(self.capacity);
        self.source = BucketSource::Default;
        self.expires_at = now + policy.ttl.as_secs_f64();
        true
    }

    /// Overwrites capacity with an observed (already safety-scaled) limit.
    pub fn apply_observed_limit(
        &mut self,
        capacity: f64,
        window_seconds: f64,
        policy: &BucketPolicy,
        now: f64,
    ) {
        self.refill(now);

        let window = if window_seconds > 0.0 { window_seconds } else { 1.0 };
        self.capacity = capacity;
        self.refill_rate = capacity / window;
        self.tokens_available = self.tokens_available.min(capacity);
        self.source = BucketSource::Learned;
        self.expires_at = now + policy.ttl.as_secs_f64();
    }

    fn refill(&mut self, now: f64) {
        self.tokens_available = self.tokens_at(now);
        self.last_refill_at = self.last_refill_at.max(now);
    }
}

/// Wall-clock seconds since the Unix epoch.
pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
