//! Global sliding-window rate limiter shared by every `GridWorker` against one exchange.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::time::sleep;

pub struct RateLimiter {
    calls: Mutex<VecDeque<Instant>>,
    max_calls: usize,
    window: Duration,
}

impl RateLimiter {
    pub fn new(max_calls: usize, window: Duration) -> Self {
        Self { calls: Mutex::new(VecDeque::with_capacity(max_calls)), max_calls, window }
    }

    /// Blocks until a call slot is available, then reserves it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut calls = self.calls.lock().await;
                let now = Instant::now();
                while calls.front().is_some_and(|t| now.duration_since(*t) >= self.window) {
                    calls.pop_front();
                }
                if calls.len() < self.max_calls {
                    calls.push_back(now);
                    None
                } else {
                    let oldest = *calls.front().unwrap();
                    Some(self.window - now.duration_since(oldest))
                }
            };
            match wait {
                None => return,
                Some(d) => sleep(d).await,
            }
        }
    }

    pub async fn current_load(&self) -> usize {
        let mut calls = self.calls.lock().await;
        let now = Instant::now();
        while calls.front().is_some_and(|t| now.duration_since(*t) >= self.window) {
            calls.pop_front();
        }
        calls.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_never_exceeds_window_capacity() {
        let limiter = RateLimiter::new(3, Duration::from_millis(200));
        for _ in 0..3 {
            limiter.acquire().await;
        }
        assert_eq!(limiter.current_load().await, 3);
    }

    #[tokio::test]
    async fn acquire_blocks_until_window_rolls() {
        let limiter = RateLimiter::new(1, Duration::from_millis(50));
        limiter.acquire().await;
        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(40));
    }
}
