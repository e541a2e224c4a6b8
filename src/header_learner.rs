//! Learns bucket limits from the API's rate-limit response header.
//!
//! The header looks like `limit=160; remaining=159; reset=8`. Learning is
//! best effort: a missing or malformed header is logged and ignored.

use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::response::ApiResponse;
use crate::store::BudgetStore;
use crate::token_bucket::CALL_COST;

const REQUIRED_FIELDS: [&str; 3] = ["limit", "remaining", "reset"];

/// Server-reported quota for one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDescriptor {
    pub limit: u64,
    pub remaining: u64,
    /// seconds until the server window resets
    pub reset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeaderParseError {
    #[error("header is empty")]
    Empty,
    #[error("no key=value pairs found")]
    NoPairs,
    #[error("empty value for '{0}'")]
    EmptyValue(String),
    #[error("non-numeric value '{value}' for '{field}'")]
    NonNumeric { field: String, value: String },
    #[error("missing required fields: {0}")]
    Missing(String),
}

impl FromStr for RateLimitDescriptor {
    type Err = HeaderParseError;

    fn from_str(header: &str) -> Result<Self, Self::Err> {
        let header = header.trim();
        if header.is_empty() {
            return Err(HeaderParseError::Empty);
        }

        let mut values: [Option<u64>; 3] = [None; 3];
        let mut saw_pair = false;

        for part in header.split(';') {
            let Some((key, value)) = part.split_once('=') else {
                continue;
            };
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim();

            if value.is_empty() {
                return Err(HeaderParseError::EmptyValue(key));
            }
            saw_pair = true;

            // Unknown fields are tolerated whatever their value.
            let Some(slot) = REQUIRED_FIELDS.iter().position(|f| *f == key) else {
                continue;
            };

            // Fractional values are truncated.
            let number = value
                .parse::<f64>()
                .ok()
                .filter(|n| n.is_finite() && *n >= 0.0)
                .ok_or_else(|| HeaderParseError::NonNumeric {
                    field: key.clone(),
                    value: value.to_string(),
                })?;
            values[slot] = Some(number.trunc() as u64);
        }

        if !saw_pair {
            return Err(HeaderParseError::NoPairs);
        }

        match values {
            [Some(limit), Some(remaining), Some(reset)] => Ok(Self {
                limit,
                remaining,
                reset,
            }),
            _ => {
                let missing: Vec<&str> = REQUIRED_FIELDS
                    .iter()
                    .zip(values.iter())
                    .filter(|(_, v)| v.is_none())
                    .map(|(f, _)| *f)
                    .collect();
                Err(HeaderParseError::Missing(missing.join(", ")))
            }
        }
    }
}

pub struct HeaderLearner {
    store: Arc<dyn BudgetStore>,
    header_name: String,
    safety_factor: f64,
}

impl HeaderLearner {
    pub fn new(store: Arc<dyn BudgetStore>, header_name: &str, safety_factor: f64) -> Self {
        Self {
            store,
            header_name: header_name.to_string(),
            safety_factor,
        }
    }

    pub fn safety_factor(&self) -> f64 {
        self.safety_factor
    }

    /// Records the scaled server limit for `bucket`. Never fails.
    pub async fn learn(&self, bucket: &str, response: &ApiResponse) {
        let Some(raw) = response.header(&self.header_name) else {
            return;
        };

        let descriptor = match raw.parse::<RateLimitDescriptor>() {
            Ok(descriptor) => descriptor,
            Err(e) => {
                warn!(bucket, header = raw, error = %e, "Ignoring malformed rate limit header");
                return;
            }
        };

        if descriptor.limit == 0 {
            debug!(bucket, header = raw, "Ignoring rate limit header with zero limit");
            return;
        }

        let capacity = descriptor.limit as f64 * self.safety_factor;
        // Tokens never exceed capacity, so a bucket smaller than one call would deny until expiry
        if capacity < CALL_COST {
            warn!(bucket, header = raw, capacity, "Ignoring rate limit too small for one call");
            return;
        }
        let window_seconds = descriptor.reset as f64;

        match self
            .store
            .record_observed_limit(bucket, capacity, window_seconds)
            .await
        {
            Ok(()) => info!(
                bucket,
                limit = descriptor.limit,
                remaining = descriptor.remaining,
                reset = descriptor.reset,
                capacity,
                "Learned rate limit from response"
            ),
            Err(e) => warn!(bucket, error = %e, "Failed to record learned rate limit"),
        }
    }
}
