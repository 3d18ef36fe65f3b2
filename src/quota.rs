//! Fixed-window quota accounting on top of a [`CounterStore`].

use crate::error::StoreError;
use crate::store::CounterStore;
use std::time::Duration;
use tokio::time;

/// Length of one fixed window; keys carry a one-second timestamp.
pub const WINDOW: Duration = Duration::from_secs(1);

/// What a single increment told us about the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaCheck {
    pub limit: u64,
    /// Requests counted in this window before this one.
    pub usage: u64,
    /// `limit - usage`, clamped at zero.
    pub remaining: u64,
    pub exceeded: bool,
}

impl QuotaCheck {
    pub fn from_usage(limit: u64, usage: u64) -> Self {
        let remaining = limit.saturating_sub(usage);
        Self {
            limit,
            usage,
            remaining,
            exceeded: remaining == 0,
        }
    }

    /// Remaining figure shown to clients: what is left once this request is
    /// counted. Zero when the quota is exceeded.
    pub fn reported_remaining(&self) -> u64 {
        if self.exceeded {
            0
        } else {
            self.remaining - 1
        }
    }
}

/// Counts requests per key within a fixed window.
#[derive(Debug, Clone)]
pub struct QuotaCounter {
    limit: u64,
    window: Duration,
    timeout: Duration,
}

impl QuotaCounter {
    pub fn new(limit: u64, timeout: Duration) -> Self {
        Self {
            limit,
            window: WINDOW,
            timeout,
        }
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Count one request against `key`.
    ///
    /// The store call is bounded by the configured timeout and never retried.
    pub async fn increment_and_check<S>(&self, store: &S, key: &str) -> Result<QuotaCheck, StoreError>
    where
        S: CounterStore + ?Sized,
    {
        let reply = time::timeout(
            self.timeout,
            store.incr_with_first_expiry(key, 1, self.window),
        )
        .await
        .map_err(|_| StoreError::Timeout(self.timeout))??;

        // nil only shows up if the store was reset underneath us
        let usage = reply.map_or(0, |value| value.saturating_sub(1).max(0) as u64);

        Ok(QuotaCheck::from_usage(self.limit, usage))
    }
}
