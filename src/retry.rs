use crate::error::ScanError;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

type Result<T> = std::result::Result<T, ScanError>;

#[derive(Debug, Clone, PartialEq)]
pub enum RetryStrategy {
    None,
    Linear { max_attempts: u32, delay_ms: u64 },
    Exponential { max_attempts: u32, base_delay_ms: u64, max_delay_ms: u64 },
}

impl RetryStrategy {
    /// Exponential backoff capped at 16x the base delay.
    pub fn exponential(max_attempts: u32, base_delay_ms: u64) -> Self {
        RetryStrategy::Exponential {
            max_attempts,
            base_delay_ms,
            max_delay_ms: base_delay_ms * 16,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        match self {
            RetryStrategy::None => 1,
            RetryStrategy::Linear { max_attempts, .. }
            | RetryStrategy::Exponential { max_attempts, .. } => (*max_attempts).max(1),
        }
    }

    fn delay_after(&self, attempt: u32) -> Duration {
        match self {
            RetryStrategy::None => Duration::ZERO,
            RetryStrategy::Linear { delay_ms, .. } => Duration::from_millis(*delay_ms),
            RetryStrategy::Exponential { base_delay_ms, max_delay_ms, .. } => {
                let factor = 1u64 << (attempt.saturating_sub(1)).min(16);
                Duration::from_millis(base_delay_ms.saturating_mul(factor).min(*max_delay_ms))
            }
        }
    }
}

/// Retry executor for recoverable operations such as the model weight fetch
pub struct RetryExecutor {
    strategy: RetryStrategy,
}

impl RetryExecutor {
    pub fn new(strategy: RetryStrategy) -> Self {
        Self { strategy }
    }

    /// Execute an operation, retrying while the error is recoverable and
    /// attempts remain.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let max_attempts = self.strategy.max_attempts();
        let mut attempt = 1;

        loop {
            debug!("Attempt {} of {}", attempt, max_attempts);

            match operation().await {
                Ok(result) => return Ok(result),
                Err(err) => {
                    if !err.is_recoverable() || attempt >= max_attempts {
                        return Err(err);
                    }

                    let delay = self.strategy.delay_after(attempt);
                    warn!(
                        "Attempt {} failed: {}, retrying in {}ms",
                        attempt,
                        err,
                        delay.as_millis()
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
