//! The public entry point: classify, acquire, call, learn, retry.
//!
//! A token is spent before each network attempt and never refunded. The
//! server counted the request whatever the client saw, so a failed attempt
//! still costs budget. No lock is held across the network call.

use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::bucket_key::{BucketKey, BucketKeyClassifier};
use crate::config::Config;
use crate::degrade::open_store;
use crate::error::{CallFailure, Error, Result, TransportError};
use crate::header_learner::HeaderLearner;
use crate::metrics::MetricsCollector;
use crate::response::ApiResponse;
use crate::retry::{decide, FailureKind, RetryDecision, RetryPolicy, RetryState};
use crate::store::BudgetStore;
use crate::token_bucket::CALL_COST;
use crate::transport::{ApiRequest, ReqwestTransport, Transport};

/// What went wrong with one attempt, before deciding what to do about it.
enum AttemptFailure {
    Response(ApiResponse),
    Transport(TransportError),
}

impl AttemptFailure {
    fn into_call_failure(self) -> CallFailure {
        match self {
            AttemptFailure::Response(response) => CallFailure::Status {
                status: response.status_code,
                body: response.body,
            },
            AttemptFailure::Transport(err) => CallFailure::Transport(err),
        }
    }
}

pub struct ResilientExecutor {
    classifier: BucketKeyClassifier,
    store: Arc<dyn BudgetStore>,
    learner: HeaderLearner,
    transport: Arc<dyn Transport>,
    metrics: MetricsCollector,
    max_backoff: Duration,
}

impl ResilientExecutor {
    pub fn new(config: &Config, store: Arc<dyn BudgetStore>, transport: Arc<dyn Transport>) -> Self {
        Self {
            classifier: BucketKeyClassifier::from_config(config),
            learner: HeaderLearner::new(store.clone(), &config.rate_limit_header, config.safety_factor),
            store,
            transport,
            metrics: MetricsCollector::new(),
            max_backoff: config.max_backoff(),
        }
    }

    /// Validates the configuration, picks the store and builds the HTTP client.
    /// Meant to run once at process startup.
    pub async fn from_config(config: &Config) -> Result<Self> {
        config.ensure_valid()?;
        let store = open_store(config).await?;
        let transport = Arc::new(ReqwestTransport::new(config.request_timeout())?);
        Ok(Self::new(config, store, transport))
    }

    pub fn classifier(&self) -> &BucketKeyClassifier {
        &self.classifier
    }

    pub fn store(&self) -> &Arc<dyn BudgetStore> {
        &self.store
    }

    pub fn learner(&self) -> &HeaderLearner {
        &self.learner
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// Runs one logical call to completion. `request.timeout`, when set,
    /// bounds everything including backoff sleeps.
    pub async fn execute(&self, request: ApiRequest) -> Result<ApiResponse> {
        request.validate()?;

        let span = info_span!(
            "execute",
            call_id = %Uuid::new_v4(),
            method = %request.method,
            url = %request.url,
        );

        match request.timeout {
            Some(limit) => time::timeout(limit, self.run(&request))
                .instrument(span.clone())
                .await
                .map_err(|_| {
                    span.in_scope(|| warn!(timeout_ms = limit.as_millis() as u64, "Call timed out"));
                    Error::Timeout(limit)
                })?,
            None => self.run(&request).instrument(span).await,
        }
    }

    async fn run(&self, request: &ApiRequest) -> Result<ApiResponse> {
        let policy = RetryPolicy {
            max_retries: request.max_retries,
            initial_delay: request.initial_delay,
            max_delay: self.max_backoff,
        };
        let mut state = RetryState::new(&policy);

        loop {
            let bucket = self.classifier.classify(&request.url);
            let attempt = state.attempt_number();

            if let BucketKey::Throttled(key) = &bucket {
                let granted = self.store.try_acquire(key, CALL_COST).await?;
                self.metrics.record_acquire(key, granted).await;

                if !granted {
                    match decide(FailureKind::LocalThrottleDenial, &state) {
                        RetryDecision::Retry(delay) => {
                            warn!(
                                bucket = %key,
                                attempt,
                                max_attempts = state.max_attempts(),
                                delay_ms = delay.as_millis() as u64,
                                "Rate budget denied, backing off"
                            );
                            self.metrics.record_retry(key).await;
                            time::sleep(delay).await;
                            state.advance();
                            continue;
                        }
                        _ => {
                            error!(bucket = %key, attempt, "Rate budget exhausted, giving up");
                            self.metrics.record_outcome(key, false).await;
                            return Err(Error::RateLimitExceeded {
                                bucket: key.clone(),
                                attempts: attempt,
                            });
                        }
                    }
                }
            }

            let (kind, failure) = match self.transport.send(request).await {
                Ok(response) => {
                    if let BucketKey::Throttled(key) = &bucket {
                        self.learner.learn(key, &response).await;
                    }

                    match FailureKind::from_status(response.status_code) {
                        None => {
                            if attempt > 1 {
                                info!(bucket = %bucket, attempt, "Call succeeded after retry");
                            }
                            self.metrics.record_outcome(bucket.as_str(), true).await;
                            return Ok(response);
                        }
                        Some(kind) => (kind, AttemptFailure::Response(response)),
                    }
                }
                Err(err) => (FailureKind::TransportError, AttemptFailure::Transport(err)),
            };

            match decide(kind, &state) {
                RetryDecision::Retry(delay) => {
                    warn!(
                        bucket = %bucket,
                        attempt,
                        max_attempts = state.max_attempts(),
                        kind = %kind,
                        delay_ms = delay.as_millis() as u64,
                        "Attempt failed, retrying"
                    );
                    self.metrics.record_retry(bucket.as_str()).await;
                    time::sleep(delay).await;
                    state.advance();
                }
                RetryDecision::Fatal => {
                    self.metrics.record_outcome(bucket.as_str(), false).await;
                    return Err(match failure {
                        AttemptFailure::Response(response) => {
                            warn!(
                                bucket = %bucket,
                                attempt,
                                kind = %kind,
                                status = response.status_code,
                                "Non-retryable response"
                            );
                            Error::Client {
                                status: response.status_code,
                                response: Box::new(response),
                            }
                        }
                        AttemptFailure::Transport(err) => Error::RequestFailed {
                            attempts: attempt,
                            last: CallFailure::Transport(err),
                        },
                    });
                }
                RetryDecision::Exhausted => {
                    let last = failure.into_call_failure();
                    error!(
                        bucket = %bucket,
                        attempt,
                        kind = %kind,
                        error = %last,
                        "Retries exhausted"
                    );
                    self.metrics.record_outcome(bucket.as_str(), false).await;
                    return Err(Error::RequestFailed {
                        attempts: attempt,
                        last,
                    });
                }
            }
        }
    }
}
