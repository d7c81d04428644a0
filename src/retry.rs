//! Retry policy and predicates for handling transient failures.
//!
//! [`RetryPolicy::with_retry`] runs one logical operation, retrying transient
//! failures with exponential backoff and jitter. A query id is generated once
//! per logical operation and handed unchanged to every attempt.

use crate::Error;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// How a computed backoff delay is randomized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Jitter {
    /// Use the delay unchanged.
    None,
    /// Half the delay plus a random amount up to the other half.
    #[default]
    Equal,
    /// A random amount between zero and the full delay.
    Full,
}

/// Defines when and how to retry failed operations.
///
/// The delay before retry `n` (1-indexed) is
/// `min(max_backoff, initial_backoff * multiplier^(n-1))`, then jittered.
///
/// # Examples
///
/// ```
/// use clickhttp::retry::{Jitter, RetryPolicy};
/// use std::time::Duration;
///
/// let policy = RetryPolicy::default()
///     .max_attempts(5)
///     .initial_backoff(Duration::from_millis(100))
///     .multiplier(2.0)
///     .jitter(Jitter::None);
///
/// // 100ms, 200ms, 400ms, 800ms...
/// assert_eq!(policy.calculate_delay(3), Duration::from_millis(400));
/// ```
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: usize,
    initial_backoff: Duration,
    max_backoff: Duration,
    multiplier: f64,
    jitter: Jitter,
    predicate: Arc<dyn RetryPredicate>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(120),
            multiplier: 1.6,
            jitter: Jitter::Equal,
            predicate: Arc::new(RetryOnRetryable),
        }
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("initial_backoff", &self.initial_backoff)
            .field("max_backoff", &self.max_backoff)
            .field("multiplier", &self.multiplier)
            .field("jitter", &self.jitter)
            .finish_non_exhaustive()
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt.
    pub fn none() -> Self {
        Self::default().max_attempts(1)
    }

    /// Total attempts including the first one.
    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Delay before the first retry.
    pub fn initial_backoff(mut self, delay: Duration) -> Self {
        self.initial_backoff = delay;
        self
    }

    /// Upper bound for any single delay, before jitter.
    pub fn max_backoff(mut self, delay: Duration) -> Self {
        self.max_backoff = delay;
        self
    }

    /// Growth factor between consecutive delays.
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Replaces the transient-failure classification.
    ///
    /// By default, failures are retried based on [`Error::is_retryable`].
    pub fn predicate(mut self, predicate: impl RetryPredicate + 'static) -> Self {
        self.predicate = Arc::new(predicate);
        self
    }

    pub fn get_max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Checks the policy for values that cannot work.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigurationError`] for zero attempts, a multiplier
    /// below 1, or an initial backoff above the maximum.
    pub fn validate(&self) -> crate::Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::ConfigurationError(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if !(self.multiplier >= 1.0 && self.multiplier.is_finite()) {
            return Err(Error::ConfigurationError(format!(
                "backoff multiplier must be a finite number >= 1.0, got {}",
                self.multiplier
            )));
        }
        if self.initial_backoff > self.max_backoff {
            return Err(Error::ConfigurationError(format!(
                "initial backoff {:?} exceeds max backoff {:?}",
                self.initial_backoff, self.max_backoff
            )));
        }
        Ok(())
    }

    /// Returns the un-jittered delay before retry `attempt` (1-indexed).
    pub fn base_delay(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as usize) as i32;
        let nanos = self.initial_backoff.as_nanos() as f64 * self.multiplier.powi(exponent);
        let capped = nanos.min(self.max_backoff.as_nanos() as f64);
        Duration::from_nanos(capped as u64)
    }

    /// Returns the jittered delay before retry `attempt` (1-indexed).
    pub fn calculate_delay(&self, attempt: usize) -> Duration {
        let delay = self.base_delay(attempt);
        match self.jitter {
            Jitter::None => delay,
            Jitter::Equal => {
                let half = delay / 2;
                let extra = rand::thread_rng().gen_range(0.0..=1.0);
                half + (delay - half).mul_f64(extra)
            }
            Jitter::Full => delay.mul_f64(rand::thread_rng().gen_range(0.0..=1.0)),
        }
    }

    /// Runs `operation` until it succeeds, fails fatally, or attempts run out.
    ///
    /// `operation` receives the query id and the attempt number (1-indexed).
    /// The query id is `query_id` when given, otherwise a fresh UUID, and is the
    /// same for every attempt. Retrying a non-idempotent operation logs a
    /// warning but still proceeds.
    ///
    /// The last error is returned as-is once retries are exhausted.
    pub async fn with_retry<T, F, Fut>(
        &self,
        idempotent: bool,
        query_id: Option<String>,
        mut operation: F,
    ) -> crate::Result<T>
    where
        F: FnMut(String, usize) -> Fut,
        Fut: Future<Output = crate::Result<T>>,
    {
        let query_id = query_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let mut attempt = 0;

        loop {
            attempt += 1;

            let error = match operation(query_id.clone(), attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(
                            attempts = attempt,
                            query_id = %query_id,
                            "Operation succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            tracing::warn!(
                error = %error,
                attempt = attempt,
                query_id = %query_id,
                "Attempt failed"
            );

            if attempt >= self.max_attempts || !self.predicate.should_retry(&error, attempt) {
                return Err(error);
            }

            if !idempotent {
                tracing::warn!(
                    query_id = %query_id,
                    attempt = attempt,
                    "Retrying a non-idempotent operation; it may be applied more than once"
                );
            }

            let delay = self.calculate_delay(attempt);
            tracing::info!(
                delay_ms = delay.as_millis(),
                attempt = attempt,
                "Retrying after delay"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

/// Trait for determining whether a failed operation should be retried.
///
/// # Examples
///
/// ```
/// use clickhttp::{Error, RetryPredicate};
///
/// struct RetryOnThrottle;
///
/// impl RetryPredicate for RetryOnThrottle {
///     fn should_retry(&self, error: &Error, _attempt: usize) -> bool {
///         matches!(error.status(), Some(status) if status.as_u16() == 429)
///     }
/// }
/// ```
pub trait RetryPredicate: Send + Sync {
    /// Determines whether the operation should be retried after `error`.
    ///
    /// `attempt` is the number of the attempt that just failed (1-indexed).
    fn should_retry(&self, error: &Error, attempt: usize) -> bool;
}

/// Retry all errors that are marked as retryable.
///
/// This uses [`Error::is_retryable`]: transport failures, timeouts, pool-wait
/// timeouts and HTTP 429/5xx responses.
#[derive(Debug, Clone, Copy)]
pub struct RetryOnRetryable;

impl RetryPredicate for RetryOnRetryable {
    fn should_retry(&self, error: &Error, _attempt: usize) -> bool {
        error.is_retryable()
    }
}

/// Combine multiple retry predicates with OR logic.
///
/// Retries if ANY of the predicates return `true`.
pub struct OrPredicate {
    predicates: Vec<Box<dyn RetryPredicate>>,
}

impl OrPredicate {
    /// Creates a new `OrPredicate` from a list of predicates.
    pub fn new(predicates: Vec<Box<dyn RetryPredicate>>) -> Self {
        Self { predicates }
    }
}

impl RetryPredicate for OrPredicate {
    fn should_retry(&self, error: &Error, attempt: usize) -> bool {
        self.predicates
            .iter()
            .any(|p| p.should_retry(error, attempt))
    }
}
