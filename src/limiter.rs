use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::store::Store;
use crate::types::Result;

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Grant,
    /// Limit reached; try again after this long (the rest of the window).
    Wait(Duration),
}

/// Fixed-window rate limiter keyed by source. The counter lives in the
/// store so the bound holds across worker processes; the store's
/// increment-and-get is the atomic check.
pub struct RateLimiter {
    store: Arc<dyn Store>,
    max_per_window: u64,
    window: Duration,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn Store>, max_per_window: u64, window: Duration) -> Self {
        Self {
            store,
            max_per_window,
            window,
        }
    }

    pub async fn acquire(&self, key: &str) -> Result<Decision> {
        let window_secs = self.window.as_secs().max(1) as i64;
        let now = Utc::now().timestamp();
        let window_start = now - now.rem_euclid(window_secs);

        let count = self.store.incr_rate_counter(key, window_start).await?;
        if count <= self.max_per_window {
            Ok(Decision::Grant)
        } else {
            let remaining = (window_start + window_secs - now).max(1) as u64;
            debug!(key, count, "rate limit reached, backing off");
            Ok(Decision::Wait(Duration::from_secs(remaining)))
        }
    }

    /// Back off until a grant is available. Callers that cannot tolerate
    /// waiting should use `acquire` directly.
    pub async fn acquire_blocking(&self, key: &str) -> Result<()> {
        loop {
            match self.acquire(key).await? {
                Decision::Grant => return Ok(()),
                Decision::Wait(delay) => tokio::time::sleep(delay).await,
            }
        }
    }
}
