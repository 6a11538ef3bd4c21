use std::{sync::Arc, time::Duration};

use anyhow::{Context, Error, Result};
use notification_gateway::{
    clients::{
        database::DatabaseClient,
        rbmq::{BrokerSupervisor, LapinConnector},
        redis::RedisStore,
    },
    config::Config,
    consumer::{DedupConsumer, SimulatedDelivery},
    logging::init_tracing,
    models::status::NotificationType,
    store::{DedupLock, KeyValueStore},
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
    let notifications = Arc::new(
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
    let mut tasks = vec![tokio::spawn(broker.clone().run(shutdown_rx.clone()))];

    let settings = config.consumer_settings();
    let latency = Duration::from_millis(config.delivery_latency_ms);
    let consumer = Arc::new(
        DedupConsumer::new(
            DedupLock::new(cache, settings.lock_ttl),
            notifications,
            settings,
        )
        .with_handler(
            NotificationType::Email,
            Arc::new(SimulatedDelivery::new(NotificationType::Email, latency)),
        )
        .with_handler(
            NotificationType::Push,
            Arc::new(SimulatedDelivery::new(NotificationType::Push, latency)),
        )
        .with_dead_letters(broker.clone(), topology.failed_queue.clone()),
    );

    for queue in [&topology.email_queue, &topology.push_queue] {
        tasks.push(tokio::spawn(consumer.clone().run_queue(
            broker.clone(),
            queue.clone(),
            shutdown_rx.clone(),
        )));
    }

    info!("Notification consumer started");
    shutdown_signal().await;

    let _ = shutdown_tx.send(true);
    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "Consumer task failed");
        }
    }

    info!("Notification consumer shut down");
    Ok(())
}
