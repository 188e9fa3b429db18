//! Bounded retry with optional exponential backoff.
//!
//! Token refresh, conflict resolution on local writes and replication error
//! recovery all go through [`retry_with_policy`]. The operation decides per
//! attempt whether it finished, wants another try, or must stop now.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

/// Async sleeping abstraction so retry loops stay testable.
#[async_trait]
pub trait Sleeper: Send + Sync {
    /// Suspend execution for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// Tokio-based sleeper.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Attempt budget and delay schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one (minimum 1).
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub initial_delay: Duration,
    /// Factor applied to the delay after each further failure.
    pub multiplier: u32,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Same delay between every attempt.
    ///
    /// # Examples
    /// ```
    /// use std::time::Duration;
    /// use client::domain::RetryPolicy;
    ///
    /// let policy = RetryPolicy::fixed(5, Duration::from_millis(500));
    /// assert_eq!(policy.delay_after(4), Duration::from_millis(500));
    /// ```
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: delay,
            multiplier: 1,
            max_delay: delay,
        }
    }

    /// Doubling delay from `initial_delay`, capped at `max_delay`.
    pub fn exponential(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            multiplier: 2,
            max_delay,
        }
    }

    /// Attempts without any delay, for conflict retries on local writes.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::fixed(max_attempts, Duration::ZERO)
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = self
            .multiplier
            .max(1)
            .saturating_pow(attempt.saturating_sub(1));
        let base_ms = u64::try_from(self.initial_delay.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(base_ms.saturating_mul(u64::from(factor)).min(max_ms))
    }
}

/// Verdict of a single attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt<T, E> {
    /// Finished; stop with this value.
    Done(T),
    /// Failed in a way another attempt may fix.
    Retry(E),
    /// Failed in a way retrying cannot fix.
    Abort(E),
}

/// Why a retry loop gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError<E> {
    /// Every attempt asked to retry.
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// Error of the final attempt.
        last: E,
    },
    /// An attempt aborted the loop.
    Aborted(E),
}

impl<E> RetryError<E> {
    /// The underlying error, whichever way the loop ended.
    pub fn into_inner(self) -> E {
        match self {
            Self::Exhausted { last, .. } | Self::Aborted(last) => last,
        }
    }
}

/// Run `operation` until it is done, aborts, or the attempt budget is spent.
///
/// The closure receives the 1-based attempt number.
///
/// # Examples
/// ```
/// use client::domain::{Attempt, RetryPolicy, TokioSleeper, retry_with_policy};
///
/// # tokio::runtime::Runtime::new().expect("runtime").block_on(async {
/// let result = retry_with_policy(&RetryPolicy::immediate(3), &TokioSleeper, |attempt| async move {
///     if attempt < 3 { Attempt::Retry("busy") } else { Attempt::Done(attempt) }
/// })
/// .await;
/// assert_eq!(result, Ok(3));
/// # });
/// ```
pub async fn retry_with_policy<T, E, F, Fut>(
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Attempt<T, E>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation(attempt).await {
            Attempt::Done(value) => return Ok(value),
            Attempt::Abort(error) => return Err(RetryError::Aborted(error)),
            Attempt::Retry(error) if attempt >= max_attempts => {
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: error,
                });
            }
            Attempt::Retry(_) => {
                let delay = policy.delay_after(attempt);
                if !delay.is_zero() {
                    sleeper.sleep(delay).await;
                }
                attempt += 1;
            }
        }
    }
}
