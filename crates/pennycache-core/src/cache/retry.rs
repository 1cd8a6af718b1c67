use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::api::ApiError;

/// Number of retries after the first failed attempt.
pub const DEFAULT_RETRIES: u32 = 2;

/// Initial backoff delay, doubled after every retry.
pub const INITIAL_BACKOFF_MS: u64 = 1000;

/// Upper bound on a single backoff delay.
pub const MAX_BACKOFF_MS: u64 = 30_000;

/// Bounded exponential backoff for transient remote failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Add up to 25% random jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_RETRIES,
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_millis(MAX_BACKOFF_MS),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        let base = self.initial_backoff.saturating_mul(factor).min(self.max_backoff);
        if self.jitter && !base.is_zero() {
            let extra = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 4);
            base + Duration::from_millis(extra)
        } else {
            base
        }
    }

    /// Run `op`, retrying transient failures. Permanent failures and the
    /// failure after the last retry are returned as-is.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, ApiError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let mut retries = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && retries < self.max_retries => {
                    retries += 1;
                    let backoff = self.backoff(retries);
                    warn!(
                        label,
                        retry = retries,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Transient failure, backing off"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    debug!(label, retries, transient = e.is_transient(), error = %e, "Giving up");
                    return Err(e);
                }
            }
        }
    }
}
