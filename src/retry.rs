use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use crate::TaskError;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Backoff {
    Fixed,
    Exponential { multiplier: f64, max_delay: Duration },
}

/// Per-task retry policy.
///
/// `max_retries` counts retries on top of the first attempt, so a task with
/// `max_retries = 2` runs at most three times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub backoff: Backoff,
    /// Upper bound for a single attempt.
    pub timeout: Option<Duration>,
    /// Treat an expired attempt as permanent instead of transient.
    pub timeout_is_permanent: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            retry_delay: Duration::from_secs(1),
            backoff: Backoff::Fixed,
            timeout: None,
            timeout_is_permanent: false,
        }
    }
}

impl RetryPolicy {
    pub fn fixed(max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            max_retries,
            retry_delay,
            ..Self::default()
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.retry_delay,
            Backoff::Exponential { multiplier, max_delay } => {
                let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
                let secs = self.retry_delay.as_secs_f64() * multiplier.max(1.0).powi(exp);
                let delay = Duration::try_from_secs_f64(secs).unwrap_or(max_delay);
                delay.min(max_delay)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome<T> {
    Succeeded { value: T, attempts: u32 },
    Failed { error: TaskError, attempts: u32 },
    /// Stopped by cancellation. `attempts == 0` means the task never started.
    Cancelled { attempts: u32, last_error: Option<TaskError> },
}

pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation` until it succeeds, fails permanently, exhausts the
    /// retry budget, or `cancel` fires.
    ///
    /// Each attempt holds one permit of `workers` and releases it while waiting
    /// out the retry delay, so a backing-off task never blocks the pool.
    /// Cancellation is observed only between attempts; a running attempt is
    /// never interrupted.
    pub async fn execute_with_retry<F, Fut, T>(
        &self,
        cancel: &CancellationToken,
        workers: &Semaphore,
        task_id: &str,
        mut operation: F,
    ) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, TaskError>>,
    {
        let mut last_error = None;
        let mut attempt = 1;

        loop {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = workers.acquire() => permit.ok(),
            };
            let Some(permit) = permit else {
                return RetryOutcome::Cancelled { attempts: attempt - 1, last_error };
            };

            debug!(task = %task_id, attempt, "starting attempt");
            let result = match self.policy.timeout {
                Some(limit) => match timeout(limit, operation(attempt)).await {
                    Ok(result) => result,
                    Err(_) => Err(TaskError::Timeout(limit)),
                },
                None => operation(attempt).await,
            };
            drop(permit);

            let error = match result {
                Ok(value) => return RetryOutcome::Succeeded { value, attempts: attempt },
                Err(e) => e,
            };

            if !error.is_retryable(&self.policy) || attempt > self.policy.max_retries {
                return RetryOutcome::Failed { error, attempts: attempt };
            }

            let delay = self.policy.delay_after(attempt);
            warn!(
                task = %task_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "attempt failed, retrying"
            );
            last_error = Some(error);

            tokio::select! {
                _ = cancel.cancelled() => {
                    return RetryOutcome::Cancelled { attempts: attempt, last_error };
                }
                _ = sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}
