use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    /// Open, but the reset timeout has passed; the next check will close it.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Trips when `failures / (failures + successes)` exceeds this.
    pub error_rate_threshold: f64,
    pub reset_timeout_seconds: u64,
    /// Timeout used after a run of `success_threshold` consecutive successes.
    pub reduced_timeout_seconds: u64,
    pub success_threshold: u32,
    /// Successes needed to close an open breaker without waiting out the timeout.
    pub close_after_successes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            error_rate_threshold: 0.3,
            reset_timeout_seconds: 60,
            reduced_timeout_seconds: 30,
            success_threshold: 10,
            close_after_successes: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSnapshot {
    pub service: String,
    pub state: CircuitState,
    pub is_open: bool,
    pub failure_count: u32,
    pub success_count: u32,
    pub consecutive_successes: u32,
    pub error_rate: f64,
    pub reset_timeout_seconds: i64,
    pub last_failure_time: Option<DateTime<Utc>>,
}
