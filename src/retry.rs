//! Failure classification and backoff bookkeeping.
//!
//! Whether to retry is a pure function of the failure kind and the attempt
//! count, see [`decide`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Per-call retry settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt; local denials count too
    pub max_retries: u32,

    /// Sleep before the first retry, doubled after each one
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,

    /// Upper bound for a single sleep
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Our own bucket had no token
    LocalThrottleDenial,
    /// HTTP 429
    RemoteRateLimit,
    /// HTTP 5xx
    ServerError,
    /// Connect failure, timeout, DNS
    TransportError,
    /// HTTP 4xx other than 429
    ClientError,
}

impl FailureKind {
    /// Kind of failure an HTTP status represents, `None` for a usable response.
    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            429 => Some(FailureKind::RemoteRateLimit),
            400..=499 => Some(FailureKind::ClientError),
            500..=599 => Some(FailureKind::ServerError),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, FailureKind::ClientError)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::LocalThrottleDenial => "local_throttle_denial",
            FailureKind::RemoteRateLimit => "remote_rate_limit",
            FailureKind::ServerError => "server_error",
            FailureKind::TransportError => "transport_error",
            FailureKind::ClientError => "client_error",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attempt counter and current backoff of one call. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryState {
    attempt_number: u32,
    current_delay: Duration,
    max_attempts: u32,
    max_delay: Duration,
}

impl RetryState {
    pub fn new(policy: &RetryPolicy) -> Self {
        Self {
            attempt_number: 1,
            current_delay: policy.initial_delay.min(policy.max_delay),
            max_attempts: policy.max_retries.saturating_add(1),
            max_delay: policy.max_delay,
        }
    }

    /// 1-based number of the attempt in progress
    pub fn attempt_number(&self) -> u32 {
        self.attempt_number
    }

    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn has_remaining(&self) -> bool {
        self.attempt_number < self.max_attempts
    }

    /// Moves to the next attempt and doubles the delay.
    pub fn advance(&mut self) {
        self.attempt_number += 1;
        self.current_delay = self.current_delay.saturating_mul(2).min(self.max_delay);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep this long, then try again
    Retry(Duration),
    /// Retryable, but the attempt budget is spent
    Exhausted,
    /// Never retried
    Fatal,
}

pub fn decide(kind: FailureKind, state: &RetryState) -> RetryDecision {
    if !kind.is_retryable() {
        RetryDecision::Fatal
    } else if state.has_remaining() {
        RetryDecision::Retry(state.current_delay())
    } else {
        RetryDecision::Exhausted
    }
}
