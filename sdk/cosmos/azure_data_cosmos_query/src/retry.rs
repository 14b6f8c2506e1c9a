// Copyright (c) Microsoft Corporation. All rights reserved.
// Licensed under the MIT License.

//! Retry policies applied to every request the pipeline sends.

use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::{
    error::{classify, ErrorClass},
    models::QueryPlan,
    transport::{QueryRequest, QueryResponse, QueryTransport},
    Error,
};

/// Decides whether a failed request is retried and prepares each attempt.
///
/// Policies only see errors classified as [`ErrorClass::Retryable`]. Partition splits and re-planning
/// are handled by the pipeline itself and never reach the policy.
pub trait RetryPolicy: Send + Sync {
    /// Called before every attempt, including the first. May adjust routing.
    fn before_send(&self, _request: &mut QueryRequest) {}

    /// Returns the delay before the next attempt, or `None` to give up.
    ///
    /// `attempt` is the number of attempts made so far, starting at 1.
    fn should_retry(&self, error: &Error, attempt: u32) -> Option<Duration>;
}

/// Retries throttled, timed-out and unavailable responses, as well as transport failures.
#[derive(Clone, Debug)]
pub struct ThrottlingRetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_wait: Duration,
}

impl Default for ThrottlingRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 9,
            base_delay: Duration::from_millis(100),
            max_wait: Duration::from_secs(30),
        }
    }
}

impl ThrottlingRetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Caps any single delay, including one suggested by the service.
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }
}

impl RetryPolicy for ThrottlingRetryPolicy {
    fn should_retry(&self, error: &Error, attempt: u32) -> Option<Duration> {
        if classify(error) != ErrorClass::Retryable || attempt >= self.max_attempts {
            return None;
        }
        let backoff = self
            .base_delay
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(16));
        let delay = error
            .as_http()
            .and_then(|e| e.retry_after())
            .unwrap_or(backoff);
        Some(delay.min(self.max_wait))
    }
}

/// A [`QueryTransport`] that applies a [`RetryPolicy`] around another transport.
pub struct RetryingTransport {
    inner: Arc<dyn QueryTransport>,
    policy: Arc<dyn RetryPolicy>,
}

impl RetryingTransport {
    pub fn new(inner: Arc<dyn QueryTransport>, policy: Arc<dyn RetryPolicy>) -> Self {
        Self { inner, policy }
    }

    async fn send_with_retries<T, F, Fut>(
        &self,
        mut request: QueryRequest,
        mut send: F,
    ) -> crate::Result<T>
    where
        F: FnMut(QueryRequest) -> Fut + Send,
        Fut: Future<Output = crate::Result<T>> + Send,
        T: Send,
    {
        let mut attempt = 0;
        loop {
            self.policy.before_send(&mut request);
            attempt += 1;

            let error = match send(request.clone()).await {
                Ok(response) => return Ok(response),
                Err(error) => error,
            };

            if classify(&error) != ErrorClass::Retryable {
                return Err(error);
            }

            match self.policy.should_retry(&error, attempt) {
                Some(delay) => {
                    tracing::debug!(
                        attempt,
                        ?delay,
                        pkrange_id = ?request.pkrange_id,
                        %error,
                        "retrying query request"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                None => {
                    return Err(Error::RetriesExhausted {
                        attempts: attempt,
                        source: Box::new(error),
                    })
                }
            }
        }
    }
}

#[async_trait]
impl QueryTransport for RetryingTransport {
    async fn execute(&self, request: QueryRequest) -> crate::Result<QueryResponse> {
        self.send_with_retries(request, |r| self.inner.execute(r))
            .await
    }

    async fn query_plan(&self, request: QueryRequest) -> crate::Result<QueryPlan> {
        self.send_with_retries(request, |r| self.inner.query_plan(r))
            .await
    }
}
