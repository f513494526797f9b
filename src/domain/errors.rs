//! Domain error types shared across the grid engine.

use thiserror::Error;

/// Errors surfaced by the exchange capability boundary.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExchangeError {
    #[error("transient exchange error: {0}")]
    Transient(String),

    #[error("exchange rate limit exceeded")]
    RateLimited,

    #[error("exchange authentication failed: {0}")]
    Auth(String),

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("terminal exchange error: {0}")]
    Terminal(String),

    #[error("order not found: {0}")]
    NotFound(String),
}

impl ExchangeError {
    /// Whether this error should count toward the API error-rate estimator
    /// and is safe to retry under backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, ExchangeError::Transient(_) | ExchangeError::RateLimited)
    }
}

/// Errors surfaced by the grid core to its callers (controller, HTTP layer).
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CoreError {
    #[error("stop-loss tripped for {symbol}, acknowledge before restarting")]
    StopLossTripped { symbol: String },

    #[error("killed by risk supervisor: {reason}")]
    KilledByRisk { reason: String },

    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error("invalid grid parameters: {0}")]
    InvalidParameters(String),

    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),

    #[error("worker unavailable: {0}")]
    WorkerUnavailable(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(ExchangeError::Transient("timeout".into()).is_transient());
        assert!(ExchangeError::RateLimited.is_transient());
        assert!(!ExchangeError::Auth("bad key".into()).is_transient());
        assert!(!ExchangeError::Terminal("insufficient balance".into()).is_transient());
    }
}
