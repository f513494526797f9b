pub mod alert_router;
pub mod circuit_breaker;
pub mod controller;
pub mod grid_worker;
pub mod rate_limiter;
pub mod risk_supervisor;
