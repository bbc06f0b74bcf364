//! Per-source request pacing.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Enforces a minimum interval between consecutive requests to one source.
/// Shared by the source's worker and the manifest expander.
pub struct RateLimiter {
    min_interval: Duration,
    next_slot: Mutex<Instant>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            next_slot: Mutex::new(Instant::now()),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Wait until a request may be sent and book the following slot.
    pub async fn acquire(&self) {
        let mut next = self.next_slot.lock().await;
        let now = Instant::now();
        if *next > now {
            tokio::time::sleep_until(*next).await;
        }
        *next = Instant::now() + self.min_interval;
    }

    /// Hold every request back for at least `delay` from now.
    pub async fn push_back(&self, delay: Duration) {
        let mut next = self.next_slot.lock().await;
        let until = Instant::now() + delay;
        if until > *next {
            *next = until;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn spaces_requests_by_min_interval() {
        let limiter = RateLimiter::new(Duration::from_millis(100));
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(200));
        assert!(start.elapsed() < Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn push_back_delays_next_request() {
        let limiter = RateLimiter::new(Duration::from_millis(10));
        limiter.acquire().await;
        let start = Instant::now();
        limiter.push_back(Duration::from_secs(60)).await;
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn shorter_push_back_does_not_advance_the_slot() {
        let limiter = RateLimiter::new(Duration::from_secs(5));
        limiter.acquire().await;
        let start = Instant::now();
        limiter.push_back(Duration::from_secs(1)).await;
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(5));
    }
}
