//! Retry policy shared by channels and the multipart coordinator.
//!
//! A budget belongs to one logical operation (one chunk, one part, one
//! completion). Resumes of the same chunk draw from the same budget.

use rand::Rng;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{FailureKind, TransferError, TransferResult};

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Physical attempts allowed per logical operation, including the first
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Upper bound for a single delay
    pub max_backoff: Duration,
    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
    /// Wall-clock budget per logical operation
    pub total_timeout: Option<Duration>,
    /// Deadline for each physical request or stream read
    pub attempt_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(32),
            jitter: 0.25,
            total_timeout: Some(Duration::from_secs(600)),
            attempt_timeout: Some(Duration::from_secs(120)),
        }
    }
}

/// Whether a failure may be retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retryability {
    Retry,
    Fatal,
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_initial_backoff(mut self, delay: Duration) -> Self {
        self.initial_backoff = delay;
        self
    }

    pub fn with_max_backoff(mut self, delay: Duration) -> Self {
        self.max_backoff = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn with_total_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.total_timeout = timeout;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Open the budget for one logical operation
    pub fn start(&self) -> RetryState {
        RetryState {
            attempt: 0,
            max_attempts: self.max_attempts,
            started: Instant::now(),
            budget: self.total_timeout,
        }
    }

    pub fn classify(&self, kind: FailureKind) -> Retryability {
        match kind {
            FailureKind::Transient | FailureKind::RateLimited => Retryability::Retry,
            FailureKind::Precondition
            | FailureKind::Malformed
            | FailureKind::NotFound
            | FailureKind::BudgetExhausted
            | FailureKind::Cancelled => Retryability::Fatal,
        }
    }

    /// Delay before retry number `retry` (0-based), exponential with jitter
    pub fn backoff(&self, retry: u32) -> Duration {
        let base = self.initial_backoff.as_millis() as u64;
        let exponential = base.saturating_mul(1u64 << retry.min(20));
        let capped = exponential.min(self.max_backoff.as_millis() as u64);

        let jitter_range = (capped as f64 * self.jitter) as u64;
        let jitter = if jitter_range > 0 {
            rand::thread_rng().gen_range(0..=jitter_range)
        } else {
            0
        };

        Duration::from_millis(capped.saturating_add(jitter))
    }

    /// Run one physical attempt, bounded by `attempt_timeout` and `cancel`
    pub async fn attempt<F, T>(&self, cancel: &CancellationToken, fut: F) -> TransferResult<T>
    where
        F: Future<Output = TransferResult<T>>,
    {
        let bounded = async {
            match self.attempt_timeout {
                Some(limit) => match tokio::time::timeout(limit, fut).await {
                    Ok(result) => result,
                    Err(_) => Err(TransferError::Timeout {
                        message: format!("no response within {limit:?}"),
                    }),
                },
                None => fut.await,
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransferError::Cancelled),
            result = bounded => result,
        }
    }

    /// Sleep between attempts; wakes early with `Cancelled`
    pub async fn pause(&self, delay: Duration, cancel: &CancellationToken) -> TransferResult<()> {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        if delay.is_zero() {
            return Ok(());
        }
        tokio::select! {
            _ = cancel.cancelled() => Err(TransferError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Execute an operation with retry logic, one budget for all attempts
    pub async fn run<F, Fut, T>(&self, cancel: &CancellationToken, mut operation: F) -> TransferResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = TransferResult<T>>,
    {
        let mut state = self.start();
        loop {
            match self.attempt(cancel, operation()).await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    let delay = state.record_failure(self, error)?;
                    self.pause(delay, cancel).await?;
                }
            }
        }
    }
}

/// Attempt accounting for the logical operation currently in flight
#[derive(Debug)]
pub struct RetryState {
    attempt: u32,
    max_attempts: u32,
    started: Instant,
    budget: Option<Duration>,
}

impl RetryState {
    /// Failed attempts so far
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Account for a failure.
    ///
    /// Fatal errors come back unchanged. Retryable ones return the delay
    /// to wait before the next attempt, or `BudgetExhausted` once the
    /// attempt or time budget is spent.
    pub fn record_failure(&mut self, policy: &RetryPolicy, error: TransferError) -> TransferResult<Duration> {
        let kind = error.kind();
        if policy.classify(kind) == Retryability::Fatal {
            return Err(error);
        }

        self.attempt += 1;
        let elapsed = self.elapsed();
        let out_of_time = self.budget.map_or(false, |budget| elapsed >= budget);
        if self.attempt >= self.max_attempts || out_of_time {
            return Err(TransferError::BudgetExhausted {
                attempts: self.attempt,
                elapsed,
                last: Box::new(error),
            });
        }

        let delay = policy.backoff(self.attempt - 1);
        warn!(
            attempt = self.attempt,
            max_attempts = self.max_attempts,
            delay_ms = delay.as_millis() as u64,
            kind = ?kind,
            error = %error,
            "Transfer attempt failed, retrying"
        );
        Ok(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick() -> RetryPolicy {
        RetryPolicy::default()
            .with_initial_backoff(Duration::ZERO)
            .with_jitter(0.0)
    }

    #[test]
    fn test_delay_calculation() {
        let policy = RetryPolicy::default()
            .with_initial_backoff(Duration::from_millis(1000))
            .with_max_backoff(Duration::from_millis(30_000))
            .with_jitter(0.0);

        assert_eq!(policy.backoff(0), Duration::from_millis(1000));
        assert_eq!(policy.backoff(1), Duration::from_millis(2000));
        assert_eq!(policy.backoff(2), Duration::from_millis(4000));
        assert_eq!(policy.backoff(5), Duration::from_millis(30_000)); // Capped
    }

    #[test]
    fn jitter_stays_in_range() {
        let policy = RetryPolicy::default()
            .with_initial_backoff(Duration::from_millis(100))
            .with_jitter(0.5);
        for _ in 0..50 {
            let delay = policy.backoff(0);
            assert!(delay >= Duration::from_millis(100) && delay <= Duration::from_millis(150));
        }
    }

    #[test]
    fn fatal_errors_pass_through_untouched() {
        let policy = quick();
        let mut state = policy.start();
        let err = state
            .record_failure(&policy, TransferError::from_status(412, "generation mismatch"))
            .unwrap_err();
        assert!(matches!(err, TransferError::PreconditionFailed { .. }));
        assert_eq!(state.attempt(), 0);
    }

    #[test]
    fn budget_is_counted_per_operation() {
        let policy = quick().with_max_attempts(3);
        let mut state = policy.start();
        assert!(state.record_failure(&policy, TransferError::transient("reset")).is_ok());
        assert!(state
            .record_failure(&policy, TransferError::from_status(429, "slow down"))
            .is_ok());
        let err = state
            .record_failure(&policy, TransferError::transient("reset"))
            .unwrap_err();
        match err {
            TransferError::BudgetExhausted { attempts, last, .. } => {
                assert_eq!(attempts, 3);
                assert_eq!(last.kind(), FailureKind::Transient);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn time_budget_exhausts() {
        let policy = quick().with_total_timeout(Some(Duration::ZERO));
        let mut state = policy.start();
        let err = state
            .record_failure(&policy, TransferError::transient("reset"))
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::BudgetExhausted);
    }

    #[tokio::test]
    async fn run_retries_transient_failures() {
        let policy = quick();
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result = policy
            .run(&cancel, || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(TransferError::from_status(503, "unavailable"))
                } else {
                    Ok("done")
                }
            })
            .await
            .unwrap();

        assert_eq!(result, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn run_never_retries_not_found() {
        let policy = quick();
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result: TransferResult<()> = policy
            .run(&cancel, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TransferError::not_found("upload upl_1"))
            })
            .await;

        assert!(result.unwrap_err().is_not_found());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn attempt_timeout_is_transient() {
        let policy = quick().with_attempt_timeout(Some(Duration::from_millis(5)));
        let cancel = CancellationToken::new();
        let result: TransferResult<()> = policy
            .attempt(&cancel, async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            })
            .await;
        let err = result.unwrap_err();
        assert!(matches!(err, TransferError::Timeout { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn cancellation_fails_fast() {
        let policy = RetryPolicy::default();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let paused = policy.pause(Duration::from_secs(30), &cancel).await;
        assert!(matches!(paused, Err(TransferError::Cancelled)));

        let attempted: TransferResult<()> = policy
            .attempt(&cancel, std::future::pending())
            .await;
        assert!(matches!(attempted, Err(TransferError::Cancelled)));
    }
}
