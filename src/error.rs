use thiserror::Error;
use uuid::Uuid;

use crate::models::status::NotificationStatus;

/// Failures of the key/value cache and the notification store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store operation timed out")]
    Timeout,

    #[error("notification {0} not found")]
    NotFound(Uuid),

    #[error("notification {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: Uuid,
        from: NotificationStatus,
        to: NotificationStatus,
    },

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker connection is not ready")]
    NotConnected,

    #[error("failed to connect to broker: {0}")]
    Connect(String),

    #[error("failed to open channel: {0}")]
    Channel(String),

    #[error("failed to declare topology: {0}")]
    Declare(String),

    #[error("failed to publish message: {0}")]
    Publish(String),

    #[error("failed to start consumer: {0}")]
    Consume(String),
}

/// Outcome of the intake pipeline that the caller must react to.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("invalid notification type '{0}'")]
    InvalidType(String),

    #[error("enqueue failed after {attempts} attempts: {source}")]
    EnqueueFailed {
        attempts: u32,
        #[source]
        source: BrokerError,
    },

    #[error("failed to encode message: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Error returned by [`crate::clients::circuit_breaker::CircuitBreaker::execute`].
///
/// `Open` and `TooManyRequests` mean the wrapped call was never attempted.
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    #[error("circuit breaker is open")]
    Open,

    #[error("circuit breaker is half-open and at its trial call limit")]
    TooManyRequests,

    #[error(transparent)]
    Inner(E),
}

impl<E> BreakerError<E> {
    pub fn is_rejection(&self) -> bool {
        matches!(self, BreakerError::Open | BreakerError::TooManyRequests)
    }
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("no downstream configured for this route")]
    NotConfigured,

    #[error("downstream circuit breaker rejected the call")]
    BreakerOpen,

    #[error("downstream request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("delivery transport failed: {0}")]
    Transport(String),

    #[error("no notification row matches the delivery")]
    UnknownNotification,

    #[error(transparent)]
    Store(#[from] StoreError),
}
