use std::{future::Future, time::Duration};

/// How the delay between attempts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Growth {
    Fixed,
    /// `base * attempt`
    Linear,
    /// `base * multiplier^(attempt - 1)`
    Exponential { multiplier: u32 },
}

/// One parameterized retry/backoff policy shared by the task poller, the start
/// driver, address discovery, the publish queue and store transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub growth: Growth,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub const fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            growth: Growth::Fixed,
            max_delay: delay,
        }
    }

    pub const fn linear(max_attempts: u32, step: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: step,
            growth: Growth::Linear,
            max_delay,
        }
    }

    pub const fn exponential(
        max_attempts: u32,
        base_delay: Duration,
        multiplier: u32,
        max_delay: Duration,
    ) -> Self {
        Self {
            max_attempts,
            base_delay,
            growth: Growth::Exponential { multiplier },
            max_delay,
        }
    }

    /// Delay to wait after the `attempt`-th failure (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let raw = match self.growth {
            Growth::Fixed => self.base_delay,
            Growth::Linear => self.base_delay.saturating_mul(attempt),
            Growth::Exponential { multiplier } => {
                let pow = attempt.saturating_sub(1).min(30);
                let mult = multiplier.max(1).checked_pow(pow).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(mult)
            }
        };
        raw.min(self.max_delay)
    }

    /// Runs `op` until it succeeds, `retryable` rejects the error, or
    /// `max_attempts` is reached. Returns the last error on exhaustion.
    pub async fn run<T, E, F, Fut, R>(&self, label: &str, mut op: F, retryable: R) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let max = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(v) => return Ok(v),
                Err(err) if attempt < max && retryable(&err) => {
                    let delay = self.delay(attempt);
                    tracing::warn!(
                        label,
                        attempt,
                        max_attempts = max,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "attempt failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
