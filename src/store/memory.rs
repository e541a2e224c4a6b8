use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::{Backend, BudgetStore};
use crate::error::{Error, Result};
use crate::token_bucket::{now_secs, BucketPolicy, RateBucket};

/// Source of wall-clock seconds; swapped out in tests.
pub type Clock = Arc<dyn Fn() -> f64 + Send + Sync>;

/// Process-local bucket map. Coordinates threads of one process only and is
/// lost on restart.
#[derive(Clone)]
pub struct MemoryStore {
    policy: BucketPolicy,
    buckets: Arc<Mutex<HashMap<String, RateBucket>>>,
    clock: Clock,
}

impl MemoryStore {
    pub fn new(policy: BucketPolicy) -> Self {
        Self::with_clock(policy, Arc::new(now_secs))
    }

    pub fn with_clock(policy: BucketPolicy, clock: Clock) -> Self {
        Self {
            policy,
            buckets: Arc::new(Mutex::new(HashMap::new())),
            clock,
        }
    }

    /// Number of buckets currently held
    pub fn len(&self) -> usize {
        self.buckets.lock().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs `f` on the (created if missing, expired if due) bucket while the
    /// map lock is held.
    fn with_bucket<T>(&self, key: &str, f: impl FnOnce(&mut RateBucket, f64) -> T) -> Result<T> {
        let now = (self.clock)();
        let mut buckets = self
            .buckets
            .lock()
            .map_err(|_| Error::Internal("Failed to acquire lock on buckets".to_string()))?;

        let bucket = buckets
            .entry(key.to_string())
            .or_insert_with(|| RateBucket::new_default(key, &self.policy, now));
        bucket.expire_if_due(&self.policy, now);

        Ok(f(bucket, now))
    }
}

#[async_trait]
impl BudgetStore for MemoryStore {
    async fn get_or_init(&self, key: &str) -> Result<RateBucket> {
        self.with_bucket(key, |bucket, _| bucket.clone())
    }

    async fn try_acquire(&self, key: &str, cost: f64) -> Result<bool> {
        self.with_bucket(key, |bucket, now| bucket.try_acquire(cost, now))
    }

    async fn record_observed_limit(
        &self,
        key: &str,
        capacity: f64,
        window_seconds: f64,
    ) -> Result<()> {
        let policy = self.policy;
        self.with_bucket(key, |bucket, now| {
            bucket.apply_observed_limit(capacity, window_seconds, &policy, now)
        })
    }

    async fn reset(&self, key: &str) -> Result<()> {
        let mut buckets = self
            .buckets
            .lock()
            .map_err(|_| Error::Internal("Failed to acquire lock on buckets".to_string()))?;
        buckets.remove(key);
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn backend(&self) -> Backend {
        Backend::Memory
    }

    fn policy(&self) -> &BucketPolicy {
        &self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token_bucket::BucketSource;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    fn policy() -> BucketPolicy {
        BucketPolicy {
            default_capacity: 1.0,
            default_refill_rate: 1.0,
            ttl: Duration::from_secs(3600),
        }
    }

    /// Clock stepping in whole milliseconds under test control.
    fn manual_clock() -> (Clock, Arc<AtomicU64>) {
        let millis = Arc::new(AtomicU64::new(1_000_000));
        let handle = millis.clone();
        let clock: Clock = Arc::new(move || handle.load(Ordering::SeqCst) as f64 / 1000.0);
        (clock, millis)
    }

    #[tokio::test]
    async fn test_get_or_init_is_stable_within_ttl() {
        let store = MemoryStore::new(policy());
        let first = store.get_or_init("/api/v1/lead/").await.unwrap();
        let second = store.get_or_init("/api/v1/lead/").await.unwrap();

        assert_eq!(first.capacity.to_bits(), second.capacity.to_bits());
        assert_eq!(first.source, BucketSource::Default);
        assert_eq!(second.source, BucketSource::Default);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_try_acquire_exhausts_then_refills() {
        let (clock, millis) = manual_clock();
        let store = MemoryStore::with_clock(policy(), clock);

        assert!(store.try_acquire("k", 1.0).await.unwrap());
        assert!(!store.try_acquire("k", 1.0).await.unwrap());

        millis.fetch_add(1_000, Ordering::SeqCst);
        assert!(store.try_acquire("k", 1.0).await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_acquire_grants_only_available_tokens() {
        let (clock, _millis) = manual_clock();
        let store = Arc::new(MemoryStore::with_clock(
            BucketPolicy {
                default_capacity: 5.0,
                ..policy()
            },
            clock,
        ));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.try_acquire("k", 1.0).await.unwrap() }));
        }

        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 5);
    }

    #[tokio::test]
    async fn test_record_observed_limit_marks_learned() {
        let store = MemoryStore::new(policy());
        store.record_observed_limit("k", 128.0, 8.0).await.unwrap();

        let bucket = store.get_or_init("k").await.unwrap();
        assert_eq!(bucket.capacity, 128.0);
        assert_eq!(bucket.refill_rate, 16.0);
        assert_eq!(bucket.source, BucketSource::Learned);
    }

    #[tokio::test]
    async fn test_learned_limit_expires_back_to_default() {
        let (clock, millis) = manual_clock();
        let store = MemoryStore::with_clock(policy(), clock);
        store.record_observed_limit("k", 50.0, 10.0).await.unwrap();

        millis.fetch_add(3_600_000, Ordering::SeqCst);
        let bucket = store.get_or_init("k").await.unwrap();
        assert_eq!(bucket.source, BucketSource::Default);
        assert_eq!(bucket.capacity, 1.0);
    }

    #[tokio::test]
    async fn test_reset_recreates_default_bucket() {
        let store = MemoryStore::new(policy());
        store.record_observed_limit("k", 50.0, 10.0).await.unwrap();
        store.reset("k").await.unwrap();
        assert!(store.is_empty());

        let bucket = store.get_or_init("k").await.unwrap();
        assert_eq!(bucket.source, BucketSource::Default);
        assert_eq!(bucket.tokens_available, 1.0);
    }
}
