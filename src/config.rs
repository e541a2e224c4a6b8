use envconfig::Envconfig;
use std::time::Duration;
use validator::Validate;

use crate::error::{Error, Result};

/// Process-wide settings, built once at startup and handed to constructors.
#[derive(Debug, Envconfig, Validate, Clone)]
pub struct Config {
    /// Shared store connection URL; unset means in-memory only
    #[envconfig(from = "SHARED_STORE_URL")]
    pub shared_store_endpoint: Option<String>,

    /// Host of the rate-limited API; other hosts are never throttled
    #[envconfig(from = "API_HOST", default = "api.close.com")]
    #[validate(length(min = 1))]
    pub api_host: String,

    /// Path prefix in front of the resource segment
    #[envconfig(from = "API_PATH_PREFIX", default = "/api/v1/")]
    #[validate(length(min = 1))]
    pub api_path_prefix: String,

    /// Rate used by buckets that have not learned a server limit yet
    #[envconfig(from = "CONSERVATIVE_DEFAULT_RPS", default = "1.0")]
    #[validate(range(exclusive_min = 0.0))]
    pub conservative_default_rps: f64,

    /// Fraction of the server-reported limit this process may use
    #[envconfig(from = "SAFETY_FACTOR", default = "0.8")]
    #[validate(range(exclusive_min = 0.0, exclusive_max = 1.0))]
    pub safety_factor: f64,

    /// Lifetime of a learned limit before the bucket relearns
    #[envconfig(from = "CACHE_EXPIRATION_SECONDS", default = "3600")]
    #[validate(range(min = 1))]
    pub cache_expiration_seconds: u64,

    #[envconfig(from = "FALLBACK_ON_STORE_ERROR", default = "true")]
    pub fallback_on_store_error: bool,

    #[envconfig(from = "STORE_PROBE_TIMEOUT_MS", default = "2000")]
    #[validate(range(min = 1))]
    pub store_probe_timeout_ms: u64,

    /// Name of the response header carrying `limit=N; remaining=M; reset=S`
    #[envconfig(from = "RATE_LIMIT_HEADER", default = "ratelimit")]
    #[validate(length(min = 1))]
    pub rate_limit_header: String,

    /// Timeout of a single HTTP attempt
    #[envconfig(from = "REQUEST_TIMEOUT_SECONDS", default = "30")]
    #[validate(range(min = 1))]
    pub request_timeout_seconds: u64,

    /// Upper bound for one backoff sleep
    #[envconfig(from = "MAX_BACKOFF_SECONDS", default = "60")]
    #[validate(range(min = 1))]
    pub max_backoff_seconds: u64,

    #[envconfig(from = "LOG_LEVEL", default = "info")]
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            shared_store_endpoint: None,
            api_host: "api.close.com".to_string(),
            api_path_prefix: "/api/v1/".to_string(),
            conservative_default_rps: 1.0,
            safety_factor: 0.8,
            cache_expiration_seconds: 3600,
            fallback_on_store_error: true,
            store_probe_timeout_ms: 2000,
            rate_limit_header: "ratelimit".to_string(),
            request_timeout_seconds: 30,
            max_backoff_seconds: 60,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables and validate it
    pub fn from_env() -> Result<Self> {
        let config = Config::init_from_env().map_err(|e| Error::Config(e.to_string()))?;
        config.ensure_valid()?;
        Ok(config)
    }

    /// Field-level checks plus the store URL scheme
    pub fn ensure_valid(&self) -> Result<()> {
        self.validate()?;

        if let Some(url) = &self.shared_store_endpoint {
            validate_store_url(url)?;
        }

        Ok(())
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_expiration_seconds)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.store_probe_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_seconds)
    }
}

fn validate_store_url(url: &str) -> Result<()> {
    if url.is_empty() {
        return Err(Error::Config("Shared store URL cannot be empty".to_string()));
    }

    if !url.starts_with("redis://") && !url.starts_with("rediss://") {
        return Err(Error::Config(
            "Shared store URL must start with 'redis://' or 'rediss://'".to_string(),
        ));
    }

    Ok(())
}
