// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::{Result, anyhow};
use tokio::{
    sync::Mutex,
    time::{Instant, sleep_until},
};
use tokio_util::sync::CancellationToken;

/// Enforces a minimum wall-clock spacing between successful calls to one
/// external service.
///
/// Waiters queue on the inner mutex, which tokio hands out in FIFO order,
/// so the limiter is fair. `acquire` is cancellable; a cancelled waiter
/// does not consume a slot.
#[derive(Debug)]
pub struct RateLimiter {
    last: Mutex<Option<Instant>>,
    min_spacing: Duration,
}

impl RateLimiter {
    pub fn new(min_spacing: Duration) -> Self {
        Self {
            last: Mutex::new(None),
            min_spacing,
        }
    }

    pub fn min_spacing(&self) -> Duration {
        self.min_spacing
    }

    /// Block until at least `min_spacing` has passed since the previous
    /// successful acquire, or until `cancel` fires.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<()> {
        let mut last = tokio::select! {
            guard = self.last.lock() => guard,
            _ = cancel.cancelled() => return Err(anyhow!("rate limiter acquire cancelled")),
        };

        if let Some(prev) = *last {
            let ready_at = prev + self.min_spacing;
            tokio::select! {
                _ = sleep_until(ready_at) => {},
                _ = cancel.cancelled() => return Err(anyhow!("rate limiter acquire cancelled")),
            }
        }

        *last = Some(Instant::now());
        Ok(())
    }

    /// Forget the spacing history; the next acquire proceeds immediately.
    /// Backs the `.ratereset` meta-command.
    pub async fn reset(&self) {
        *self.last.lock().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn spacing_is_enforced() {
        let limiter = RateLimiter::new(Duration::from_millis(200));
        let cancel = CancellationToken::new();

        let started = Instant::now();
        for _ in 0..10 {
            limiter.acquire(&cancel).await.expect("acquire");
        }
        let elapsed = started.elapsed();
        // Nine gaps of 200 ms between ten calls.
        assert!(elapsed >= Duration::from_millis(1800), "elapsed {elapsed:?}");
    }

    #[tokio::test]
    async fn cancel_unblocks_waiter() {
        let limiter = RateLimiter::new(Duration::from_secs(60));
        let cancel = CancellationToken::new();

        limiter.acquire(&cancel).await.expect("first is free");

        cancel.cancel();
        let err = limiter.acquire(&cancel).await;
        assert!(err.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn reset_clears_history() {
        let limiter = RateLimiter::new(Duration::from_secs(60));
        let cancel = CancellationToken::new();

        limiter.acquire(&cancel).await.expect("first");
        limiter.reset().await;

        let started = Instant::now();
        limiter.acquire(&cancel).await.expect("after reset");
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
