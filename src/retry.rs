//! Bounded retry with exponential backoff, shared by the bulk writer and the tracker.

use log::{debug, warn};
use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

const DEFAULT_BACKOFF_FACTOR: u64 = 2;
const MAX_BACKOFF_MS: u64 = 30_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub factor: u64,
    /// Add up to 25% random jitter to every delay.
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn new(attempts: u32, initial_backoff_ms: u64) -> Self {
        Self {
            attempts: attempts.max(1),
            initial_backoff: Duration::from_millis(initial_backoff_ms),
            factor: DEFAULT_BACKOFF_FACTOR,
            jitter: true,
        }
    }

    /// Single attempt, no sleeping.
    pub fn none() -> Self {
        Self {
            attempts: 1,
            initial_backoff: Duration::ZERO,
            factor: DEFAULT_BACKOFF_FACTOR,
            jitter: false,
        }
    }

    fn delay(&self, backoff_ms: u64) -> Duration {
        let capped = backoff_ms.min(MAX_BACKOFF_MS);
        if !self.jitter || capped == 0 {
            return Duration::from_millis(capped);
        }
        let jitter = rand::thread_rng().gen_range(0..=capped / 4);
        Duration::from_millis(capped + jitter)
    }

    /// Run `op` until it succeeds or attempts are exhausted, returning the last error.
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut op: F) -> Result<T, E>
    where
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut backoff_ms = self.initial_backoff.as_millis() as u64;
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt >= self.attempts => {
                    warn!(
                        "{}: attempt {} of {} failed, giving up: {}",
                        label, attempt, self.attempts, err
                    );
                    return Err(err);
                }
                Err(err) => {
                    warn!(
                        "{}: attempt {} of {} failed: {}",
                        label, attempt, self.attempts, err
                    );
                    let delay = self.delay(backoff_ms);
                    debug!("{}: retrying after {:?}", label, delay);
                    sleep(delay).await;
                    backoff_ms = backoff_ms.saturating_mul(self.factor);
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, 500)
    }
}
