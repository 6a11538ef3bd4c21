//! Storage seams shared by the gateway and the consumer.
//!
//! [`KeyValueStore`] is the raw cache backend (Redis in production). The
//! [`IdempotencyStore`] and [`DedupLock`] wrappers put the failure policy on
//! top of it: an unreachable cache never blocks the pipeline, it degrades to
//! "not present / not acquired" and logs.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tracing::warn;
use uuid::Uuid;

use crate::{
    error::StoreError,
    models::{notification::Notification, status::NotificationStatus, status::NotificationType},
};

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Atomically creates `key` with a TTL if it does not exist.
    async fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Deletes `key`; absent keys are not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    async fn contains(&self, key: &str) -> Result<bool, StoreError>;

    /// Cheap reachability check.
    async fn ping(&self) -> Result<(), StoreError> {
        self.contains("health:ping").await.map(|_| ())
    }
}

#[async_trait]
pub trait NotificationRepository: Send + Sync {
    /// Stores a new row and returns its id. If a row already holds the
    /// request id, a `failed` one is moved back to `queued`, and the
    /// existing id is returned either way.
    async fn insert(&self, notification: &Notification) -> Result<Uuid, StoreError>;

    /// Applies a status transition, refreshing `updated_at`.
    async fn update_status(&self, id: Uuid, status: NotificationStatus) -> Result<(), StoreError>;

    /// Most recently created row with this template and type.
    async fn find_latest(
        &self,
        template_id: &str,
        notification_type: NotificationType,
    ) -> Result<Option<Uuid>, StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<Notification>, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

pub fn idempotency_key(request_id: &str) -> String {
    format!("idempotency:{}", request_id)
}

pub fn reservation_key(request_id: &str) -> String {
    format!("idempotency_lock:{}", request_id)
}

/// Request-level duplicate gate.
///
/// The `idempotency:` marker is written once, after a successful publish,
/// and never released early. The short-lived reservation serialises
/// concurrent requests that share a request id.
#[derive(Clone)]
pub struct IdempotencyStore {
    store: Arc<dyn KeyValueStore>,
    ttl: Duration,
    reservation_ttl: Duration,
}

/// Result of trying to reserve a request id for publishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    Acquired,
    /// Another request with the same id is in flight.
    Contended,
    /// The cache is unreachable; proceed without a reservation.
    Unavailable,
}

impl IdempotencyStore {
    pub fn new(store: Arc<dyn KeyValueStore>, ttl: Duration, reservation_ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            reservation_ttl,
        }
    }

    pub async fn exists(&self, request_id: &str) -> bool {
        let key = idempotency_key(request_id);
        match self.store.contains(&key).await {
            Ok(found) => found,
            Err(e) => {
                warn!(%key, error = %e, "Idempotency check unavailable, treating request as new");
                false
            }
        }
    }

    pub async fn mark_done(&self, request_id: &str) {
        let key = idempotency_key(request_id);
        if let Err(e) = self.store.set_if_absent(&key, self.ttl).await {
            warn!(%key, error = %e, "Failed to record idempotency marker");
        }
    }

    pub async fn reserve(&self, request_id: &str) -> Reservation {
        let key = reservation_key(request_id);
        match self.store.set_if_absent(&key, self.reservation_ttl).await {
            Ok(true) => Reservation::Acquired,
            Ok(false) => Reservation::Contended,
            Err(e) => {
                warn!(%key, error = %e, "Idempotency reservation unavailable, continuing without it");
                Reservation::Unavailable
            }
        }
    }

    pub async fn release_reservation(&self, request_id: &str) {
        let key = reservation_key(request_id);
        if let Err(e) = self.store.delete(&key).await {
            warn!(%key, error = %e, "Failed to release idempotency reservation");
        }
    }
}

/// Consumer-side mutual exclusion keyed by the `(type, template_id)` fingerprint.
#[derive(Clone)]
pub struct DedupLock {
    store: Arc<dyn KeyValueStore>,
    ttl: Duration,
}

impl DedupLock {
    pub fn new(store: Arc<dyn KeyValueStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// `false` when the lock is held elsewhere or the cache cannot be reached.
    pub async fn acquire(&self, key: &str) -> bool {
        match self.store.set_if_absent(key, self.ttl).await {
            Ok(acquired) => acquired,
            Err(e) => {
                warn!(lock_key = %key, error = %e, "Dedup lock unavailable");
                false
            }
        }
    }

    pub async fn release(&self, key: &str) {
        if let Err(e) = self.store.delete(key).await {
            warn!(lock_key = %key, error = %e, "Failed to release dedup lock, TTL will expire it");
        }
    }
}
