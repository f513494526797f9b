//! Generic circuit breaker wrapping calls to the exchange capability.

use std::future::Future;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    #[error("circuit breaker open, call rejected")]
    Open,
    #[error(transparent)]
    Inner(E),
}

struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
}

/// Trips open after `failure_threshold` consecutive failures, stays open for
/// `reset_timeout`, then allows one probe call through (half-open); `success_threshold`
/// consecutive probe successes close it again.
pub struct CircuitBreaker {
    inner: Mutex<Inner>,
    failure_threshold: u32,
    success_threshold: u32,
    reset_timeout: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, success_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
            }),
            failure_threshold,
            success_threshold,
            reset_timeout,
        }
    }

    pub async fn is_open(&self) -> bool {
        let mut inner = self.inner.lock().await;
        self.transition_if_ready(&mut inner);
        inner.state == BreakerState::Open
    }

    fn transition_if_ready(&self, inner: &mut Inner) {
        if inner.state == BreakerState::Open {
            if let Some(opened_at) = inner.opened_at {
                if opened_at.elapsed() >= self.reset_timeout {
                    inner.state = BreakerState::HalfOpen;
                    inner.consecutive_successes = 0;
                }
            }
        }
    }

    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        {
            let mut inner = self.inner.lock().await;
            self.transition_if_ready(&mut inner);
            if inner.state == BreakerState::Open {
                return Err(CircuitBreakerError::Open);
            }
        }

        match f().await {
            Ok(v) => {
                let mut inner = self.inner.lock().await;
                inner.consecutive_failures = 0;
                match inner.state {
                    BreakerState::HalfOpen => {
                        inner.consecutive_successes += 1;
                        if inner.consecutive_successes >= self.success_threshold {
                            inner.state = BreakerState::Closed;
                            inner.opened_at = None;
                        }
                    }
                    _ => {}
                }
                Ok(v)
            }
            Err(e) => {
                let mut inner = self.inner.lock().await;
                inner.consecutive_failures += 1;
                if inner.state == BreakerState::HalfOpen || inner.consecutive_failures >= self.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                }
                Err(CircuitBreakerError::Inner(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_after_consecutive_failures() {
        let breaker = CircuitBreaker::new(2, 1, Duration::from_millis(20));
        for _ in 0..2 {
            let res: Result<(), &str> = breaker.call(|| async { Err("boom") }).await.map_err(|_| "err").map(|_| ());
            let _ = res;
        }
        assert!(breaker.is_open().await);
    }

    #[tokio::test]
    async fn half_open_probe_closes_breaker_on_success() {
        let breaker = CircuitBreaker::new(1, 1, Duration::from_millis(10));
        let _: Result<(), CircuitBreakerError<&str>> = breaker.call(|| async { Err("boom") }).await;
        assert!(breaker.is_open().await);
        tokio::time::sleep(Duration::from_millis(15)).await;
        let res: Result<i32, CircuitBreakerError<&str>> = breaker.call(|| async { Ok(1) }).await;
        assert!(res.is_ok());
        assert!(!breaker.is_open().await);
    }
}
