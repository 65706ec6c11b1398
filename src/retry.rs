use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::time::Instant;

/// Repeats a failing operation a bounded number of times with a fixed
/// delay between attempts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one. At least 1.
    pub attempts: u32,
    /// Pause between two consecutive attempts.
    pub delay: Duration,
}

impl RetryPolicy {
    pub const fn new(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }

    pub const fn single_attempt() -> Self {
        Self::new(1, Duration::ZERO)
    }

    fn effective_attempts(&self) -> u32 {
        self.attempts.max(1)
    }

    /// The longest time [`RetryPolicy::run`] can take when every attempt is
    /// bounded by `attempt_timeout`.
    pub fn budget(&self, attempt_timeout: Duration) -> Duration {
        let attempts = self.effective_attempts();
        attempt_timeout * attempts + self.delay * (attempts - 1)
    }

    /// Runs `attempt` until it succeeds or the attempts are exhausted,
    /// bounding each attempt by `attempt_timeout`. Returns the error of the
    /// last attempt.
    pub async fn run<T, F, Fut>(&self, what: &str, attempt_timeout: Duration, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.effective_attempts();
        let deadline = Instant::now() + self.budget(attempt_timeout);

        let mut number = 1;
        loop {
            let result = match tokio::time::timeout(attempt_timeout, attempt()).await {
                Ok(result) => result,
                Err(_) => Err(anyhow::anyhow!(
                    "timed out after {:?}",
                    attempt_timeout
                )),
            };

            let err = match result {
                Ok(value) => {
                    if number > 1 {
                        tracing::info!("{}: succeeded after {} attempts", what, number);
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if number >= attempts || Instant::now() + self.delay >= deadline {
                return Err(err).with_context(|| format!("{}: giving up after {} attempt(s)", what, number));
            }

            tracing::warn!(
                "{}: attempt {}/{} failed: {:#}. Retrying in {:?}",
                what,
                number,
                attempts,
                err,
                self.delay
            );
            tokio::time::sleep(self.delay).await;
            number += 1;
        }
    }
}
