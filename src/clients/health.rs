use std::{collections::BTreeMap, sync::Arc, time::Instant};

use tracing::{debug, warn};

use crate::{
    clients::{circuit_breaker::CircuitBreaker, store::DocumentStore},
    models::{
        circuit_breaker::CircuitState,
        health::{HealthStatus, ServiceHealth},
    },
};

pub struct HealthChecker {
    store: Arc<dyn DocumentStore>,
    breaker: Arc<CircuitBreaker>,
}

impl HealthChecker {
    pub fn new(store: Arc<dyn DocumentStore>, breaker: Arc<CircuitBreaker>) -> Self {
        Self { store, breaker }
    }

    pub async fn check_all(&self) -> BTreeMap<String, ServiceHealth> {
        let mut checks = BTreeMap::new();
        checks.insert("document_store".to_string(), self.check_store().await);
        checks.insert("push_gateway".to_string(), self.check_circuit_breaker());
        checks
    }

    async fn check_store(&self) -> ServiceHealth {
        let start = Instant::now();

        match self.store.ping().await {
            Ok(()) => {
                let elapsed = start.elapsed().as_millis() as u64;
                debug!(response_time_ms = elapsed, "Document store health check passed");
                ServiceHealth::healthy(elapsed)
            }
            Err(e) => {
                warn!(error = %e, "Document store health check failed");
                ServiceHealth::unhealthy(format!("Ping failed: {}", e))
            }
        }
    }

    fn check_circuit_breaker(&self) -> ServiceHealth {
        let snapshot = self.breaker.snapshot();
        let state = snapshot.state.as_str().to_string();

        match snapshot.state {
            CircuitState::Closed => ServiceHealth::healthy(0).with_circuit_breaker(state),
            CircuitState::HalfOpen => {
                ServiceHealth::degraded("Circuit breaker in recovery mode".to_string())
                    .with_circuit_breaker(state)
            }
            CircuitState::Open => ServiceHealth::degraded(format!(
                "Dispatch suspended, error rate {:.2}",
                snapshot.error_rate
            ))
            .with_circuit_breaker(state),
        }
    }

    /// Unhealthy if any check is; degraded under maintenance or any degraded check.
    pub fn determine_overall_status(
        checks: &BTreeMap<String, ServiceHealth>,
        maintenance_mode: bool,
    ) -> HealthStatus {
        let has_unhealthy = checks
            .values()
            .any(|health| health.status == HealthStatus::Unhealthy);

        let has_degraded = checks
            .values()
            .any(|health| health.status == HealthStatus::Degraded);

        if has_unhealthy {
            HealthStatus::Unhealthy
        } else if has_degraded || maintenance_mode {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}
