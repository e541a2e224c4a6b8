//! Shared and process-local storage for rate buckets.
//!
//! Every mutation is a single atomic read-modify-write against the backend.
//! Callers never read a bucket, change it and write it back themselves.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;

use crate::error::Result;
use crate::token_bucket::{BucketPolicy, RateBucket};

pub use memory::MemoryStore;
pub use self::redis::RedisStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Networked store shared by every worker process
    Shared,
    /// Map local to this process
    Memory,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Shared => f.write_str("shared"),
            Backend::Memory => f.write_str("memory"),
        }
    }
}

#[async_trait]
pub trait BudgetStore: Send + Sync {
    /// Existing record, or a new one at the conservative default.
    async fn get_or_init(&self, key: &str) -> Result<RateBucket>;

    /// Refill, then take `cost` tokens if available. Denials leave the record as is.
    async fn try_acquire(&self, key: &str, cost: f64) -> Result<bool>;

    /// Replace capacity with an observed, safety-scaled limit and mark it learned.
    async fn record_observed_limit(
        &self,
        key: &str,
        capacity: f64,
        window_seconds: f64,
    ) -> Result<()>;

    /// Drop the record; the next access starts over at the default.
    async fn reset(&self, key: &str) -> Result<()>;

    /// Lightweight liveness check.
    async fn ping(&self) -> Result<()>;

    fn backend(&self) -> Backend;

    /// Whether a shared store was abandoned for the local one at runtime.
    fn degraded(&self) -> bool {
        false
    }

    fn policy(&self) -> &BucketPolicy;
}
