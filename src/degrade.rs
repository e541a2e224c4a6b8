//! Store selection at startup and the one-way switch to local buckets.
//!
//! The backend is chosen once per process. A shared store that fails its
//! startup probe is never contacted again, and one that fails later is
//! abandoned for good. There is no switching back.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::store::{Backend, BudgetStore, MemoryStore, RedisStore};
use crate::token_bucket::{BucketPolicy, RateBucket};

/// Picks the bucket store for this process and logs the choice.
pub async fn open_store(config: &Config) -> Result<Arc<dyn BudgetStore>> {
    let policy = BucketPolicy::from_config(config);

    let Some(url) = config.shared_store_endpoint.as_deref() else {
        info!(backend = %Backend::Memory, "No shared store configured, rate buckets are process-local");
        return Ok(Arc::new(MemoryStore::new(policy)));
    };

    match RedisStore::connect(url, policy, config.probe_timeout()).await {
        Ok(store) => {
            info!(backend = %Backend::Shared, "Connected to shared rate bucket store");
            if config.fallback_on_store_error {
                Ok(Arc::new(FallbackStore::new(Arc::new(store), MemoryStore::new(policy))))
            } else {
                Ok(Arc::new(store))
            }
        }
        Err(e) if config.fallback_on_store_error => {
            warn!(
                backend = %Backend::Memory,
                error = %e,
                "Shared store unavailable at startup, falling back to process-local rate buckets"
            );
            Ok(Arc::new(MemoryStore::new(policy)))
        }
        Err(e) => Err(e),
    }
}

/// Serves from the shared store until its first failure, then from local
/// buckets for the rest of the process lifetime.
pub struct FallbackStore {
    primary: Arc<dyn BudgetStore>,
    fallback: MemoryStore,
    degraded: AtomicBool,
}

impl FallbackStore {
    pub fn new(primary: Arc<dyn BudgetStore>, fallback: MemoryStore) -> Self {
        Self {
            primary,
            fallback,
            degraded: AtomicBool::new(false),
        }
    }

    fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    fn degrade(&self, reason: &str) {
        if !self.degraded.swap(true, Ordering::AcqRel) {
            warn!(
                backend = %Backend::Memory,
                error = reason,
                "Shared store failed, using process-local rate buckets for the rest of this process"
            );
        }
    }
}

#[async_trait]
impl BudgetStore for FallbackStore {
    async fn get_or_init(&self, key: &str) -> Result<RateBucket> {
        if !self.is_degraded() {
            match self.primary.get_or_init(key).await {
                Err(Error::Store(reason)) => self.degrade(&reason),
                other => return other,
            }
        }
        self.fallback.get_or_init(key).await
    }

    async fn try_acquire(&self, key: &str, cost: f64) -> Result<bool> {
        if !self.is_degraded() {
            match self.primary.try_acquire(key, cost).await {
                Err(Error::Store(reason)) => self.degrade(&reason),
                other => return other,
            }
        }
        self.fallback.try_acquire(key, cost).await
    }

    async fn record_observed_limit(
        &self,
        key: &str,
        capacity: f64,
        window_seconds: f64,
    ) -> Result<()> {
        if !self.is_degraded() {
            match self
                .primary
                .record_observed_limit(key, capacity, window_seconds)
                .await
            {
                Err(Error::Store(reason)) => self.degrade(&reason),
                other => return other,
            }
        }
        self.fallback
            .record_observed_limit(key, capacity, window_seconds)
            .await
    }

    async fn reset(&self, key: &str) -> Result<()> {
        if !self.is_degraded() {
            match self.primary.reset(key).await {
                Err(Error::Store(reason)) => self.degrade(&reason),
                other => return other,
            }
        }
        self.fallback.reset(key).await
    }

    async fn ping(&self) -> Result<()> {
        if self.is_degraded() {
            self.fallback.ping().await
        } else {
            self.primary.ping().await
        }
    }

    fn backend(&self) -> Backend {
        if self.is_degraded() {
            Backend::Memory
        } else {
            self.primary.backend()
        }
    }

    fn degraded(&self) -> bool {
        self.is_degraded()
    }

    fn policy(&self) -> &BucketPolicy {
        self.fallback.policy()
    }
}
