use serde::Serialize;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use crate::store::{Backend, BudgetStore};

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub timestamp: u64,
    pub version: String,
    pub uptime_seconds: u64,
    pub store: StoreHealth,
}

#[derive(Debug, Serialize)]
pub struct StoreHealth {
    pub status: String,
    pub backend: Backend,
    /// Shared store was abandoned at runtime
    pub degraded: bool,
    pub response_time_ms: u64,
    pub error: Option<String>,
}

static START_TIME: std::sync::LazyLock<SystemTime> = std::sync::LazyLock::new(SystemTime::now);

pub struct HealthChecker {
    store: Arc<dyn BudgetStore>,
}

impl HealthChecker {
    pub fn new(store: Arc<dyn BudgetStore>) -> Self {
        Self { store }
    }

    pub async fn check_health(&self) -> HealthStatus {
        let now = SystemTime::now();
        let uptime = now.duration_since(*START_TIME).unwrap_or_default().as_secs();

        let store = self.check_store().await;

        // Local buckets still limit this process, so running on them is degraded, not down
        let overall_status = match (&store.error, store.backend, store.degraded) {
            (Some(_), _, _) => "unhealthy",
            (None, Backend::Shared, false) => "healthy",
            _ => "degraded",
        };

        HealthStatus {
            status: overall_status.to_string(),
            timestamp: now
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: uptime,
            store,
        }
    }

    async fn check_store(&self) -> StoreHealth {
        let start = Instant::now();
        let result = self.store.ping().await;
        let response_time_ms = start.elapsed().as_millis() as u64;

        StoreHealth {
            status: if result.is_ok() { "healthy" } else { "unavailable" }.to_string(),
            backend: self.store.backend(),
            degraded: self.store.degraded(),
            response_time_ms,
            error: result.err().map(|e| e.to_string()),
        }
    }
}
