use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
    options::{
        BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
};
use tokio::{sync::oneshot, time::timeout};
use tracing::{debug, info};

use crate::{
    config::BrokerTopology,
    error::BrokerError,
    publisher::MessagePublisher,
    supervisor::{BrokerConnector, Connected, ConnectionSupervisor},
};

const PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection and channel produced by one successful connect.
#[derive(Clone)]
pub struct AmqpSession {
    pub connection: Arc<Connection>,
    pub channel: Channel,
}

pub struct LapinConnector {
    rabbitmq_url: String,
    topology: BrokerTopology,
}

pub type BrokerSupervisor = ConnectionSupervisor<LapinConnector>;

impl LapinConnector {
    pub fn new(rabbitmq_url: impl Into<String>, topology: BrokerTopology) -> Self {
        Self {
            rabbitmq_url: rabbitmq_url.into(),
            topology,
        }
    }

    pub fn topology(&self) -> &BrokerTopology {
        &self.topology
    }

    async fn declare_topology(&self, channel: &Channel) -> Result<(), BrokerError> {
        let topology = &self.topology;

        channel
            .basic_qos(topology.prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| BrokerError::Declare(format!("qos: {}", e)))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BrokerError::Declare(format!("confirm mode: {}", e)))?;

        channel
            .exchange_declare(
                &topology.exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Declare(format!("exchange {}: {}", topology.exchange, e)))?;

        for queue in topology.queues() {
            channel
                .queue_declare(
                    queue,
                    QueueDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| BrokerError::Declare(format!("queue {}: {}", queue, e)))?;

            channel
                .queue_bind(
                    queue,
                    &topology.exchange,
                    queue,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| BrokerError::Declare(format!("binding {}: {}", queue, e)))?;

            debug!(queue, exchange = %topology.exchange, "Queue declared and bound");
        }

        Ok(())
    }
}

#[async_trait]
impl BrokerConnector for LapinConnector {
    type Handle = AmqpSession;

    async fn connect(&self) -> Result<Connected<AmqpSession>, BrokerError> {
        info!("Connecting to RabbitMQ");

        let connection = Connection::connect(&self.rabbitmq_url, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Connect(e.to_string()))?;

        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                let _ = connection.close(0, "channel creation failed").await;
                return Err(BrokerError::Channel(e.to_string()));
            }
        };

        if let Err(e) = self.declare_topology(&channel).await {
            let _ = connection.close(0, "topology declaration failed").await;
            return Err(e);
        }

        let (closed_tx, closed_rx) = oneshot::channel();
        let closed_tx = Mutex::new(Some(closed_tx));
        connection.on_error(move |err| {
            if let Some(tx) = closed_tx.lock().ok().and_then(|mut slot| slot.take()) {
                let _ = tx.send(err.to_string());
            }
        });

        Ok(Connected {
            handle: AmqpSession {
                connection: Arc::new(connection),
                channel,
            },
            closed: closed_rx,
        })
    }

    fn is_usable(&self, handle: &AmqpSession) -> bool {
        handle.channel.status().connected()
    }

    async fn close(&self, handle: AmqpSession) {
        let _ = handle.channel.close(200, "shutting down").await;
        let _ = handle.connection.close(200, "shutting down").await;
    }
}

#[async_trait]
impl MessagePublisher for BrokerSupervisor {
    async fn publish(
        &self,
        routing_key: &str,
        payload: &[u8],
        correlation_id: &str,
    ) -> Result<(), BrokerError> {
        let session = self.current().await.ok_or(BrokerError::NotConnected)?;
        let exchange = &self.connector().topology().exchange;

        let mut headers = FieldTable::default();
        headers.insert(
            "request_id".into(),
            AMQPValue::LongString(correlation_id.to_string().into()),
        );

        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(2)
            .with_correlation_id(correlation_id.to_string().into())
            .with_timestamp(Utc::now().timestamp().max(0) as u64)
            .with_headers(headers);

        let publish = async {
            let confirm = session
                .channel
                .basic_publish(
                    exchange,
                    routing_key,
                    BasicPublishOptions::default(),
                    payload,
                    properties,
                )
                .await
                .map_err(|e| BrokerError::Publish(e.to_string()))?;

            let confirmation = confirm
                .await
                .map_err(|e| BrokerError::Publish(e.to_string()))?;

            if confirmation.is_nack() {
                return Err(BrokerError::Publish("broker rejected the message".to_string()));
            }
            Ok(())
        };

        timeout(PUBLISH_TIMEOUT, publish)
            .await
            .map_err(|_| BrokerError::Publish("publish timed out".to_string()))??;

        debug!(%exchange, routing_key, correlation_id, "Message published");
        Ok(())
    }
}
