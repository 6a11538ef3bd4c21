//! Test doubles shared by the integration tests.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use notification_gateway::{
    clients::memory::{InMemoryKeyValueStore, InMemoryNotificationStore},
    consumer::DeliveryHandler,
    error::{BrokerError, DeliveryError, StoreError},
    models::{
        message::{NotificationMessage, Payload},
        retry::RetryConfig,
        status::NotificationType,
    },
    publisher::{MessagePublisher, QueueRoutes, ReliablePublisher},
    store::{IdempotencyStore, KeyValueStore},
};
use serde_json::json;
use tokio::{sync::Mutex, time::sleep};

#[derive(Debug, Clone)]
pub struct Published {
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub correlation_id: String,
}

/// Broker double that fails a configurable number of publishes first.
#[derive(Default)]
pub struct FlakyPublisher {
    failures_left: AtomicU32,
    attempts: AtomicU32,
    delay: Duration,
    published: Mutex<Vec<Published>>,
}

impl FlakyPublisher {
    pub fn reliable() -> Self {
        Self::default()
    }

    pub fn failing(times: u32) -> Self {
        Self {
            failures_left: AtomicU32::new(times),
            ..Self::default()
        }
    }

    pub fn always_failing() -> Self {
        Self::failing(u32::MAX)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub async fn published(&self) -> Vec<Published> {
        self.published.lock().await.clone()
    }
}

#[async_trait]
impl MessagePublisher for FlakyPublisher {
    async fn publish(
        &self,
        routing_key: &str,
        payload: &[u8],
        correlation_id: &str,
    ) -> Result<(), BrokerError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }

        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(BrokerError::Publish("connection reset".to_string()));
        }

        self.published.lock().await.push(Published {
            routing_key: routing_key.to_string(),
            payload: payload.to_vec(),
            correlation_id: correlation_id.to_string(),
        });
        Ok(())
    }
}

/// Cache double whose every round-trip fails.
pub struct UnavailableStore;

#[async_trait]
impl KeyValueStore for UnavailableStore {
    async fn set_if_absent(&self, _key: &str, _ttl: Duration) -> Result<bool, StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }

    async fn delete(&self, _key: &str) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }

    async fn contains(&self, _key: &str) -> Result<bool, StoreError> {
        Err(StoreError::Timeout)
    }
}

/// Delivery handler that records concurrency and can be made to fail.
#[derive(Default)]
pub struct RecordingHandler {
    pub fail: bool,
    pub delay: Duration,
    calls: AtomicU32,
    in_flight: AtomicU32,
    max_in_flight: AtomicU32,
}

impl RecordingHandler {
    pub fn succeeding() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> u32 {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeliveryHandler for RecordingHandler {
    async fn deliver(&self, _message: &NotificationMessage) -> Result<(), DeliveryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.fail {
            Err(DeliveryError::Transport("smtp relay refused".to_string()))
        } else {
            Ok(())
        }
    }
}

pub fn recipient(email: &str) -> Payload {
    match json!({ "email": email }) {
        serde_json::Value::Object(map) => map,
        _ => Payload::new(),
    }
}

pub fn email_message(template_id: &str) -> NotificationMessage {
    NotificationMessage::new(NotificationType::Email, recipient("a@b.com")).with_template(template_id)
}

pub fn routes() -> QueueRoutes {
    QueueRoutes {
        email: "email.queue".to_string(),
        push: "push.queue".to_string(),
    }
}

pub fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_retries: 5,
        base_delay_ms: 5,
    }
}

pub fn publisher(
    cache: Arc<dyn KeyValueStore>,
    notifications: Arc<InMemoryNotificationStore>,
    broker: Arc<FlakyPublisher>,
) -> ReliablePublisher {
    ReliablePublisher::new(
        IdempotencyStore::new(cache, Duration::from_secs(60), Duration::from_secs(60)),
        notifications,
        broker,
        routes(),
        fast_retry(),
    )
}

pub fn memory_stores() -> (Arc<InMemoryKeyValueStore>, Arc<InMemoryNotificationStore>) {
    (
        Arc::new(InMemoryKeyValueStore::new()),
        Arc::new(InMemoryNotificationStore::new()),
    )
}
