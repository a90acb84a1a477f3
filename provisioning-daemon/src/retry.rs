//! Retry-with-backoff around read-modify-write updates.

use std::time::Duration;

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub attempts: u32,
    pub initial: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            attempts: 5,
            initial: Duration::from_millis(10),
            max: Duration::from_millis(500),
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt` (0-based), doubling up to `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

/// Run `op` until it succeeds, fails with something other than a conflict,
/// or the attempts run out. `op` must re-read whatever it writes.
pub async fn retry_on_conflict<T, F>(backoff: Backoff, mut op: F) -> Result<T, EngineError>
where
    F: FnMut() -> Result<T, EngineError>,
{
    let mut attempt = 0;
    loop {
        match op() {
            Err(e) if e.is_conflict() && attempt + 1 < backoff.attempts => {
                let delay = backoff.delay(attempt);
                tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying after conflict");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}
