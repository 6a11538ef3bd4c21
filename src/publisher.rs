//! Intake pipeline: turns one send request into one durably queued message.
//!
//! Order per request: idempotency check, reservation, second idempotency
//! check under the reservation, persist `queued`,
//! route, publish with retry, idempotency marker, confirm `queued`. The
//! marker is written only after the broker accepted the message so a failed
//! publish never hides a later retry of the same request id.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    config::BrokerTopology,
    error::{BrokerError, PublishError},
    models::{
        message::NotificationMessage,
        notification::Notification,
        retry::RetryConfig,
        status::{NotificationStatus, NotificationType},
    },
    store::{IdempotencyStore, NotificationRepository, Reservation},
    utils::retry_with_backoff,
};

/// Broker-facing half of the pipeline.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    /// Publishes a persistent JSON message to the notification exchange.
    async fn publish(
        &self,
        routing_key: &str,
        payload: &[u8],
        correlation_id: &str,
    ) -> Result<(), BrokerError>;
}

/// Routing keys per notification type; each equals its queue name.
#[derive(Debug, Clone)]
pub struct QueueRoutes {
    pub email: String,
    pub push: String,
}

impl QueueRoutes {
    pub fn route(&self, notification_type: NotificationType) -> &str {
        match notification_type {
            NotificationType::Email => &self.email,
            NotificationType::Push => &self.push,
        }
    }
}

impl From<&BrokerTopology> for QueueRoutes {
    fn from(topology: &BrokerTopology) -> Self {
        Self {
            email: topology.email_queue.clone(),
            push: topology.push_queue.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Queued { notification_id: Uuid },
    Duplicate,
}

pub struct ReliablePublisher {
    idempotency: IdempotencyStore,
    notifications: Arc<dyn NotificationRepository>,
    broker: Arc<dyn MessagePublisher>,
    routes: QueueRoutes,
    retry: RetryConfig,
}

impl ReliablePublisher {
    pub fn new(
        idempotency: IdempotencyStore,
        notifications: Arc<dyn NotificationRepository>,
        broker: Arc<dyn MessagePublisher>,
        routes: QueueRoutes,
        retry: RetryConfig,
    ) -> Self {
        Self {
            idempotency,
            notifications,
            broker,
            routes,
            retry,
        }
    }

    pub async fn publish(
        &self,
        message: &NotificationMessage,
        request_id: &str,
    ) -> Result<PublishOutcome, PublishError> {
        if self.idempotency.exists(request_id).await {
            info!(request_id, "Duplicate request ignored");
            return Ok(PublishOutcome::Duplicate);
        }

        let reservation = self.idempotency.reserve(request_id).await;
        if reservation == Reservation::Contended {
            info!(request_id, "Request with the same id is already in flight");
            return Ok(PublishOutcome::Duplicate);
        }

        // The marker may have landed between the first check and the reservation.
        if reservation == Reservation::Acquired && self.idempotency.exists(request_id).await {
            self.idempotency.release_reservation(request_id).await;
            info!(request_id, "Duplicate request ignored");
            return Ok(PublishOutcome::Duplicate);
        }

        let result = self.publish_reserved(message, request_id).await;

        if reservation == Reservation::Acquired {
            self.idempotency.release_reservation(request_id).await;
        }

        result
    }

    async fn publish_reserved(
        &self,
        message: &NotificationMessage,
        request_id: &str,
    ) -> Result<PublishOutcome, PublishError> {
        let notification = Notification::queued(request_id, message);

        let notification_id = match self.notifications.insert(&notification).await {
            Ok(id) => id,
            Err(e) => {
                // Delivery availability wins over bookkeeping; the row may be missing.
                warn!(
                    request_id,
                    notification_id = %notification.id,
                    error = %e,
                    "Failed to persist notification, publishing anyway"
                );
                notification.id
            }
        };

        let Some(kind) = message.kind() else {
            warn!(
                request_id,
                notification_type = %message.notification_type,
                "Rejecting notification with unknown type"
            );
            self.set_status(notification_id, NotificationStatus::Failed).await;
            return Err(PublishError::InvalidType(message.notification_type.clone()));
        };

        let routing_key = self.routes.route(kind);
        let payload = match serde_json::to_vec(message) {
            Ok(payload) => payload,
            Err(e) => {
                self.set_status(notification_id, NotificationStatus::Failed).await;
                return Err(PublishError::Serialization(e));
            }
        };

        let published = retry_with_backoff(&self.retry, |attempt| {
            let payload = &payload;
            async move {
                if attempt > 1 {
                    info!(request_id, attempt, "Retrying queue publish");
                }
                self.broker.publish(routing_key, payload, request_id).await
            }
        })
        .await;

        if let Err((source, attempts)) = published {
            error!(
                request_id,
                %notification_id,
                attempts,
                error = %source,
                "Failed to queue notification"
            );
            self.set_status(notification_id, NotificationStatus::Failed).await;
            return Err(PublishError::EnqueueFailed { attempts, source });
        }

        self.idempotency.mark_done(request_id).await;
        self.set_status(notification_id, NotificationStatus::Queued).await;

        info!(
            request_id,
            %notification_id,
            queue = routing_key,
            "Notification queued"
        );

        Ok(PublishOutcome::Queued { notification_id })
    }

    async fn set_status(&self, id: Uuid, status: NotificationStatus) {
        if let Err(e) = self.notifications.update_status(id, status).await {
            warn!(notification_id = %id, %status, error = %e, "Failed to update notification status");
        }
    }
}
