use std::{sync::Arc, time::Duration};

use anyhow::{Context, Error, Result};
use notification_gateway::{
    api::{AppState, run_api_server},
    clients::{
        circuit_breaker::CircuitBreaker,
        database::DatabaseClient,
        health::HealthChecker,
        proxy::ProxyGateway,
        rbmq::{BrokerSupervisor, LapinConnector},
        redis::RedisStore,
    },
    config::Config,
    logging::init_tracing,
    metrics::Metrics,
    publisher::{QueueRoutes, ReliablePublisher},
    store::{IdempotencyStore, KeyValueStore, NotificationRepository},
    utils::shutdown_signal,
};
use tokio::sync::watch;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Error> {
    let config = Config::load()?;
    init_tracing(config.log_format);

    let cache: Arc<dyn KeyValueStore> = Arc::new(
        RedisStore::connect(&config.redis_url, config.store_timeout())
            .await
            .context("Failed to connect to Redis")?,
    );
    let notifications: Arc<dyn NotificationRepository> = Arc::new(
        DatabaseClient::connect(&config.database_url, config.store_timeout())
            .await
            .context("Failed to connect to PostgreSQL")?,
    );

    let topology = config.topology();
    let broker = Arc::new(BrokerSupervisor::new(
        LapinConnector::new(config.rabbitmq_url.clone(), topology.clone()),
        config.reconnect_delay(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let supervisor = tokio::spawn(broker.clone().run(shutdown_rx));

    let publisher = ReliablePublisher::new(
        IdempotencyStore::new(
            cache.clone(),
            Duration::from_secs(config.idempotency_ttl_seconds),
            Duration::from_secs(config.idempotency_reservation_ttl_seconds),
        ),
        notifications.clone(),
        broker.clone(),
        QueueRoutes::from(&topology),
        config.retry_config(),
    );

    let proxy_timeout = Duration::from_secs(config.proxy_timeout_seconds);
    let circuit_breaker = Arc::new(CircuitBreaker::new(
        "downstream_services",
        config.circuit_breaker_config(),
    ));
    let users = ProxyGateway::new(
        "user_service",
        config.user_service_url.clone(),
        proxy_timeout,
        circuit_breaker.clone(),
    )?;
    let templates = ProxyGateway::new(
        "template_service",
        config.template_service_url.clone(),
        proxy_timeout,
        circuit_breaker.clone(),
    )?;

    let health_checker = HealthChecker::new(
        broker.clone(),
        cache,
        notifications,
        vec![circuit_breaker],
    );

    let state = Arc::new(AppState {
        publisher,
        users,
        templates,
        health_checker,
        metrics: Arc::new(Metrics::new().context("Failed to register metrics")?),
    });

    let served = run_api_server(state, config.server_port, shutdown_signal()).await;

    let _ = shutdown_tx.send(true);
    if let Err(e) = supervisor.await {
        warn!(error = %e, "Broker supervisor task failed");
    }

    info!("Gateway shut down");
    served
}
