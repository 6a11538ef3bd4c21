use std::{collections::BTreeMap, future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use tokio::time::{Instant, timeout};
use tracing::{debug, warn};

use crate::{
    clients::circuit_breaker::CircuitBreaker,
    models::{
        circuit_breaker::CircuitState,
        health::{ComponentHealth, HealthReport, HealthStatus},
    },
    error::StoreError,
    store::{KeyValueStore, NotificationRepository},
    supervisor::{BrokerConnector, ConnectionSupervisor},
};

/// Upper bound for each dependency check, so a stalled backend reads as
/// unhealthy instead of hanging the health endpoint.
pub const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(2);

/// Anything that can say whether the broker connection is currently usable.
#[async_trait]
pub trait BrokerReadiness: Send + Sync {
    async fn is_ready(&self) -> bool;
}

#[async_trait]
impl<C: BrokerConnector> BrokerReadiness for ConnectionSupervisor<C> {
    async fn is_ready(&self) -> bool {
        ConnectionSupervisor::is_ready(self).await
    }
}

pub struct HealthChecker {
    broker: Arc<dyn BrokerReadiness>,
    cache: Arc<dyn KeyValueStore>,
    notifications: Arc<dyn NotificationRepository>,
    circuit_breakers: Vec<Arc<CircuitBreaker>>,
    check_timeout: Duration,
}

impl HealthChecker {
    pub fn new(
        broker: Arc<dyn BrokerReadiness>,
        cache: Arc<dyn KeyValueStore>,
        notifications: Arc<dyn NotificationRepository>,
        circuit_breakers: Vec<Arc<CircuitBreaker>>,
    ) -> Self {
        Self {
            broker,
            cache,
            notifications,
            circuit_breakers,
            check_timeout: DEFAULT_CHECK_TIMEOUT,
        }
    }

    pub fn with_check_timeout(mut self, check_timeout: Duration) -> Self {
        self.check_timeout = check_timeout;
        self
    }

    async fn bounded(
        &self,
        check: impl Future<Output = Result<(), StoreError>>,
    ) -> Result<(), StoreError> {
        timeout(self.check_timeout, check)
            .await
            .unwrap_or(Err(StoreError::Timeout))
    }

    pub async fn check_all(&self) -> HealthReport {
        let mut checks = BTreeMap::new();

        checks.insert("message_broker".to_string(), self.check_broker().await);
        checks.insert("cache_service".to_string(), self.check_cache().await);
        checks.insert("database".to_string(), self.check_database().await);

        for breaker in &self.circuit_breakers {
            checks.insert(breaker.name().to_string(), check_circuit_breaker(breaker));
        }

        let status = overall_status(&checks);

        HealthReport {
            status,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            checks,
        }
    }

    async fn check_broker(&self) -> ComponentHealth {
        let start = Instant::now();
        if timeout(self.check_timeout, self.broker.is_ready())
            .await
            .unwrap_or(false)
        {
            ComponentHealth::healthy(start.elapsed().as_millis() as u64)
        } else {
            warn!("Broker connection not ready");
            ComponentHealth::unhealthy("Broker connection not ready")
        }
    }

    async fn check_cache(&self) -> ComponentHealth {
        let start = Instant::now();
        match self.bounded(self.cache.ping()).await {
            Ok(()) => {
                let elapsed = start.elapsed().as_millis() as u64;
                debug!(response_time_ms = elapsed, "Cache health check passed");
                ComponentHealth::healthy(elapsed)
            }
            Err(e) => {
                warn!(error = %e, "Cache health check failed");
                ComponentHealth::unhealthy(format!("Ping failed: {}", e))
            }
        }
    }

    async fn check_database(&self) -> ComponentHealth {
        let start = Instant::now();
        match self.bounded(self.notifications.ping()).await {
            Ok(()) => {
                let elapsed = start.elapsed().as_millis() as u64;
                debug!(response_time_ms = elapsed, "Database health check passed");
                ComponentHealth::healthy(elapsed)
            }
            Err(e) => {
                warn!(error = %e, "Database health check failed");
                ComponentHealth::unhealthy(format!("Health check query failed: {}", e))
            }
        }
    }
}

fn check_circuit_breaker(breaker: &CircuitBreaker) -> ComponentHealth {
    let state = breaker.state();
    debug!(service = breaker.name(), circuit_state = state.as_str(), "Circuit breaker state checked");

    match state {
        CircuitState::Closed => ComponentHealth::circuit(state.as_str(), HealthStatus::Healthy),
        CircuitState::HalfOpen | CircuitState::Open => {
            ComponentHealth::circuit(state.as_str(), HealthStatus::Degraded)
        }
    }
}

fn overall_status(checks: &BTreeMap<String, ComponentHealth>) -> HealthStatus {
    if checks
        .values()
        .any(|health| health.status == HealthStatus::Unhealthy)
    {
        HealthStatus::Unhealthy
    } else if checks
        .values()
        .any(|health| health.status == HealthStatus::Degraded)
    {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}
