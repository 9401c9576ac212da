use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::{
    clients::clock::Clock,
    models::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerSnapshot, CircuitState},
};

#[derive(Debug)]
struct BreakerState {
    is_open: bool,
    failure_count: u32,
    success_count: u32,
    consecutive_successes: u32,
    last_failure_time: Option<DateTime<Utc>>,
    reset_timeout: Duration,
}

impl BreakerState {
    fn error_rate(&self) -> f64 {
        let total = self.failure_count + self.success_count;
        if total == 0 {
            0.0
        } else {
            f64::from(self.failure_count) / f64::from(total)
        }
    }

    fn timed_out(&self, now: DateTime<Utc>) -> bool {
        self.last_failure_time
            .is_some_and(|last| now - last > self.reset_timeout)
    }
}

/// Error-rate breaker guarding the push gateway.
///
/// One instance is owned by the notification service and shared by every
/// dispatch and retry path in the process.
pub struct CircuitBreaker {
    service_name: String,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<BreakerState>,
}

fn seconds(value: u64) -> Duration {
    i64::try_from(value)
        .ok()
        .and_then(Duration::try_seconds)
        .unwrap_or(Duration::MAX)
}

impl CircuitBreaker {
    pub fn new(service_name: String, config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        info!(service = %service_name, "Circuit breaker initialized");

        let state = BreakerState {
            is_open: false,
            failure_count: 0,
            success_count: 0,
            consecutive_successes: 0,
            last_failure_time: None,
            reset_timeout: seconds(config.reset_timeout_seconds),
        };

        Self {
            service_name,
            config,
            clock,
            state: Mutex::new(state),
        }
    }

    /// Whether dispatch is suspended.
    ///
    /// An open breaker whose reset timeout has elapsed since the last failure
    /// closes here, on the query itself.
    pub fn is_open(&self) -> bool {
        let now = self.clock.now();
        let mut state = self.state.lock();

        if state.is_open && state.timed_out(now) {
            state.is_open = false;
            state.failure_count = 0;
            info!(
                service = %self.service_name,
                reset_timeout_seconds = state.reset_timeout.num_seconds(),
                "Circuit breaker closed after reset timeout"
            );
        }

        state.is_open
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock();

        state.success_count = state.success_count.saturating_add(1);
        state.consecutive_successes = state.consecutive_successes.saturating_add(1);
        state.failure_count = state.failure_count.saturating_sub(1);

        let reduced = seconds(self.config.reduced_timeout_seconds);
        if state.consecutive_successes >= self.config.success_threshold && state.reset_timeout != reduced {
            state.reset_timeout = reduced;
            debug!(
                service = %self.service_name,
                reset_timeout_seconds = reduced.num_seconds(),
                "Circuit breaker reset timeout reduced"
            );
        }

        if state.is_open && state.success_count >= self.config.close_after_successes {
            state.is_open = false;
            state.failure_count = 0;
            info!(service = %self.service_name, "Circuit breaker closed after successes");
        }
    }

    pub fn record_failure(&self) {
        let now = self.clock.now();
        let mut state = self.state.lock();

        state.failure_count = state.failure_count.saturating_add(1);
        state.consecutive_successes = 0;
        state.reset_timeout = seconds(self.config.reset_timeout_seconds);
        state.last_failure_time = Some(now);

        let error_rate = state.error_rate();
        if error_rate > self.config.error_rate_threshold && !state.is_open {
            state.is_open = true;
            warn!(
                service = %self.service_name,
                failure_count = state.failure_count,
                success_count = state.success_count,
                error_rate,
                "Circuit breaker opened"
            );
        }
    }

    pub fn record(&self, success: bool) {
        if success {
            self.record_success();
        } else {
            self.record_failure();
        }
    }

    /// Read-only view; does not perform the reset check.
    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let now = self.clock.now();
        let state = self.state.lock();

        let circuit_state = match (state.is_open, state.timed_out(now)) {
            (false, _) => CircuitState::Closed,
            (true, false) => CircuitState::Open,
            (true, true) => CircuitState::HalfOpen,
        };

        CircuitBreakerSnapshot {
            service: self.service_name.clone(),
            state: circuit_state,
            is_open: state.is_open,
            failure_count: state.failure_count,
            success_count: state.success_count,
            consecutive_successes: state.consecutive_successes,
            error_rate: state.error_rate(),
            reset_timeout_seconds: state.reset_timeout.num_seconds(),
            last_failure_time: state.last_failure_time,
        }
    }
}
