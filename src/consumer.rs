//! Queue workers that advance notifications from `queued` to `sent`/`failed`.
//!
//! Each delivery is processed under a dedup lock keyed by its
//! `(type, template_id)` fingerprint, so at most one handler invocation per
//! fingerprint is in flight across all consumers. The lock is released in
//! the same attempt that took it; its TTL only matters if the holder dies.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use futures_util::StreamExt;
use lapin::{
    Channel,
    options::{BasicAckOptions, BasicConsumeOptions},
    types::FieldTable,
};
use serde_json::Value as JsonValue;
use tokio::{sync::watch, time::sleep};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    clients::rbmq::BrokerSupervisor,
    config::{AckMode, ConsumerSettings},
    error::{BrokerError, DeliveryError},
    models::{
        message::{DlqMessage, NotificationMessage},
        status::{NotificationStatus, NotificationType},
    },
    publisher::MessagePublisher,
    store::{DedupLock, NotificationRepository},
};

/// Acknowledges deliveries back to the broker.
#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    async fn ack(&self, delivery_tag: u64);
}

#[async_trait]
impl DeliveryAcker for Channel {
    async fn ack(&self, delivery_tag: u64) {
        if let Err(e) = self
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
        {
            warn!(delivery_tag, error = %e, "Failed to acknowledge message");
        }
    }
}

/// Performs the actual send for one channel (email, push).
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn deliver(&self, message: &NotificationMessage) -> Result<(), DeliveryError>;
}

/// Stand-in transport: waits `latency`, logs the send and reports success.
pub struct SimulatedDelivery {
    channel: NotificationType,
    latency: Duration,
}

impl SimulatedDelivery {
    pub fn new(channel: NotificationType, latency: Duration) -> Self {
        Self { channel, latency }
    }
}

#[async_trait]
impl DeliveryHandler for SimulatedDelivery {
    async fn deliver(&self, message: &NotificationMessage) -> Result<(), DeliveryError> {
        sleep(self.latency).await;

        let recipient = JsonValue::Object(message.recipient.clone());
        info!(
            channel = %self.channel,
            %recipient,
            template_id = message.template_id(),
            "Delivering notification"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Undecodable or unroutable payload; dropped.
    Malformed,
    /// Another delivery with the same fingerprint holds the lock.
    Skipped,
    Sent(Uuid),
    Failed {
        notification_id: Option<Uuid>,
        reason: String,
    },
}

struct DeadLetters {
    publisher: Arc<dyn MessagePublisher>,
    queue: String,
}

pub struct DedupConsumer {
    lock: DedupLock,
    notifications: Arc<dyn NotificationRepository>,
    handlers: HashMap<NotificationType, Arc<dyn DeliveryHandler>>,
    dead_letters: Option<DeadLetters>,
    settings: ConsumerSettings,
}

impl DedupConsumer {
    pub fn new(
        lock: DedupLock,
        notifications: Arc<dyn NotificationRepository>,
        settings: ConsumerSettings,
    ) -> Self {
        Self {
            lock,
            notifications,
            handlers: HashMap::new(),
            dead_letters: None,
            settings,
        }
    }

    pub fn with_handler(
        mut self,
        notification_type: NotificationType,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Self {
        self.handlers.insert(notification_type, handler);
        self
    }

    /// Failed deliveries are also published to `queue` as [`DlqMessage`]s.
    pub fn with_dead_letters(
        mut self,
        publisher: Arc<dyn MessagePublisher>,
        queue: impl Into<String>,
    ) -> Self {
        self.dead_letters = Some(DeadLetters {
            publisher,
            queue: queue.into(),
        });
        self
    }

    /// Processes one queue payload end to end.
    pub async fn process_delivery(&self, payload: &[u8]) -> ProcessOutcome {
        let message = match serde_json::from_slice::<NotificationMessage>(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Dropping undecodable message");
                return ProcessOutcome::Malformed;
            }
        };

        let Some((kind, handler)) = message
            .kind()
            .and_then(|kind| self.handlers.get(&kind).map(|handler| (kind, handler.clone())))
        else {
            warn!(
                notification_type = %message.notification_type,
                "Dropping message without a delivery handler"
            );
            return ProcessOutcome::Malformed;
        };

        let lock_key = message.lock_key();
        if !self.lock.acquire(&lock_key).await {
            info!(%lock_key, "Duplicate delivery in flight, skipping");
            return ProcessOutcome::Skipped;
        }

        debug!(%lock_key, notification_type = %kind, "Received notification");
        let outcome = self.deliver_locked(&message, kind, handler.as_ref()).await;

        self.lock.release(&lock_key).await;

        if let ProcessOutcome::Failed {
            notification_id,
            reason,
        } = &outcome
        {
            self.dead_letter(&message, *notification_id, reason).await;
        }

        outcome
    }

    async fn deliver_locked(
        &self,
        message: &NotificationMessage,
        kind: NotificationType,
        handler: &dyn DeliveryHandler,
    ) -> ProcessOutcome {
        let delivered = handler.deliver(message).await;

        let notification_id = match self
            .notifications
            .find_latest(message.template_id(), kind)
            .await
        {
            Ok(Some(id)) => id,
            Ok(None) => {
                warn!(
                    template_id = message.template_id(),
                    notification_type = %kind,
                    "Could not find notification to update"
                );
                return ProcessOutcome::Failed {
                    notification_id: None,
                    reason: DeliveryError::UnknownNotification.to_string(),
                };
            }
            Err(e) => {
                warn!(error = %e, "Notification lookup failed");
                return ProcessOutcome::Failed {
                    notification_id: None,
                    reason: DeliveryError::Store(e).to_string(),
                };
            }
        };

        match delivered {
            Ok(()) => match self
                .notifications
                .update_status(notification_id, NotificationStatus::Sent)
                .await
            {
                Ok(()) => {
                    info!(%notification_id, notification_type = %kind, "Notification sent");
                    ProcessOutcome::Sent(notification_id)
                }
                Err(e) => {
                    warn!(
                        %notification_id,
                        error = %e,
                        "Delivered, but the sent status was not recorded"
                    );
                    ProcessOutcome::Failed {
                        notification_id: Some(notification_id),
                        reason: DeliveryError::Store(e).to_string(),
                    }
                }
            },
            Err(e) => {
                error!(%notification_id, notification_type = %kind, error = %e, "Delivery failed");
                if let Err(e) = self
                    .notifications
                    .update_status(notification_id, NotificationStatus::Failed)
                    .await
                {
                    warn!(%notification_id, error = %e, "Failed to update notification status");
                }
                ProcessOutcome::Failed {
                    notification_id: Some(notification_id),
                    reason: e.to_string(),
                }
            }
        }
    }

    async fn dead_letter(
        &self,
        message: &NotificationMessage,
        notification_id: Option<Uuid>,
        reason: &str,
    ) {
        let Some(dead_letters) = &self.dead_letters else {
            return;
        };

        let record = DlqMessage {
            original_message: message.clone(),
            failure_reason: reason.to_string(),
            failed_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        };
        let payload = match serde_json::to_vec(&record) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Failed to encode dead letter");
                return;
            }
        };

        let correlation_id = notification_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| message.lock_key());

        if let Err(e) = dead_letters
            .publisher
            .publish(&dead_letters.queue, &payload, &correlation_id)
            .await
        {
            warn!(queue = %dead_letters.queue, error = %e, "Failed to publish dead letter");
        }
    }

    /// Consumes `queue` until shutdown, resubscribing after every broker loss.
    pub async fn run_queue(
        self: Arc<Self>,
        broker: Arc<BrokerSupervisor>,
        queue: String,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            let Some(session) = broker.current().await else {
                debug!(%queue, "Broker not ready, waiting");
                if wait_or_shutdown(self.settings.poll_interval, &mut shutdown).await {
                    break;
                }
                continue;
            };

            let consumer_tag = format!("{}-{}", queue, Uuid::new_v4());
            let mut consumer = match session
                .channel
                .basic_consume(
                    &queue,
                    &consumer_tag,
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| BrokerError::Consume(e.to_string()))
            {
                Ok(consumer) => consumer,
                Err(e) => {
                    warn!(%queue, error = %e, "Failed to start consuming, backing off");
                    if wait_or_shutdown(self.settings.subscribe_backoff, &mut shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            info!(%queue, %consumer_tag, "Consuming notifications");

            loop {
                let next = tokio::select! {
                    next = consumer.next() => next,
                    _ = shutdown.changed() => {
                        info!(%queue, "Consumer shutting down");
                        return;
                    }
                };

                match next {
                    Some(Ok(delivery)) => {
                        let outcome = self
                            .handle_delivery(&session.channel, delivery.delivery_tag, &delivery.data)
                            .await;
                        debug!(delivery_tag = delivery.delivery_tag, ?outcome, "Delivery processed");
                    }
                    Some(Err(e)) => {
                        warn!(%queue, error = %e, "Delivery stream failed, resubscribing");
                        break;
                    }
                    None => {
                        warn!(%queue, "Delivery stream ended, resubscribing");
                        break;
                    }
                }
            }
        }

        info!(%queue, "Consumer stopped");
    }

    /// Processes one delivery, acknowledging it before or after processing
    /// according to the configured [`AckMode`].
    pub async fn handle_delivery(
        &self,
        acker: &dyn DeliveryAcker,
        delivery_tag: u64,
        payload: &[u8],
    ) -> ProcessOutcome {
        if self.settings.ack_mode == AckMode::OnReceipt {
            acker.ack(delivery_tag).await;
        }

        let outcome = self.process_delivery(payload).await;

        if self.settings.ack_mode == AckMode::AfterProcessing {
            acker.ack(delivery_tag).await;
        }

        outcome
    }
}

/// Sleeps for `delay`; returns `true` if shutdown was requested meanwhile.
async fn wait_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = sleep(delay) => false,
        _ = shutdown.changed() => true,
    }
}
