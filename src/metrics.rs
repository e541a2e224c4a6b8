use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;

/// Counters for one bucket key, local to this process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BucketMetrics {
    pub granted: u64,
    pub denied: u64,
    pub retries: u64,
    pub successes: u64,
    pub failures: u64,
    pub last_updated: u64,
}

#[derive(Debug, Clone, Default)]
pub struct MetricsCollector {
    buckets: Arc<RwLock<HashMap<String, BucketMetrics>>>,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    async fn update(&self, bucket: &str, f: impl FnOnce(&mut BucketMetrics)) {
        let mut metrics = self.buckets.write().await;
        let entry = metrics.entry(bucket.to_string()).or_default();
        f(entry);
        entry.last_updated = unix_now();
    }

    pub async fn record_acquire(&self, bucket: &str, granted: bool) {
        self.update(bucket, |m| {
            if granted {
                m.granted += 1;
            } else {
                m.denied += 1;
            }
        })
        .await;
    }

    pub async fn record_retry(&self, bucket: &str) {
        self.update(bucket, |m| m.retries += 1).await;
    }

    pub async fn record_outcome(&self, bucket: &str, success: bool) {
        self.update(bucket, |m| {
            if success {
                m.successes += 1;
            } else {
                m.failures += 1;
            }
        })
        .await;
    }

    pub async fn get_bucket_metrics(&self, bucket: &str) -> Option<BucketMetrics> {
        let metrics = self.buckets.read().await;
        metrics.get(bucket).cloned()
    }

    pub async fn get_all_metrics(&self) -> HashMap<String, BucketMetrics> {
        let metrics = self.buckets.read().await;
        metrics.clone()
    }

    pub async fn get_global_metrics(&self) -> BucketMetrics {
        let metrics = self.buckets.read().await;
        let mut global = BucketMetrics::default();

        for bucket in metrics.values() {
            global.granted += bucket.granted;
            global.denied += bucket.denied;
            global.retries += bucket.retries;
            global.successes += bucket.successes;
            global.failures += bucket.failures;
            global.last_updated = global.last_updated.max(bucket.last_updated);
        }

        global
    }

    pub async fn reset_bucket_metrics(&self, bucket: &str) {
        let mut metrics = self.buckets.write().await;
        metrics.remove(bucket);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counters_per_bucket() {
        let collector = MetricsCollector::new();
        collector.record_acquire("/api/v1/lead/", true).await;
        collector.record_acquire("/api/v1/lead/", false).await;
        collector.record_retry("/api/v1/lead/").await;
        collector.record_outcome("/api/v1/lead/", true).await;
        collector.record_outcome("/api/v1/task/", false).await;

        let lead = collector.get_bucket_metrics("/api/v1/lead/").await.unwrap();
        assert_eq!(lead.granted, 1);
        assert_eq!(lead.denied, 1);
        assert_eq!(lead.retries, 1);
        assert_eq!(lead.successes, 1);

        let global = collector.get_global_metrics().await;
        assert_eq!(global.failures, 1);
        assert_eq!(global.successes, 1);
        assert_eq!(collector.get_all_metrics().await.len(), 2);
    }

    #[tokio::test]
    async fn test_reset_bucket_metrics() {
        let collector = MetricsCollector::new();
        collector.record_retry("k").await;
        collector.reset_bucket_metrics("k").await;
        assert!(collector.get_bucket_metrics("k").await.is_none());
    }
}
