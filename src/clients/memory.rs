use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use tokio::{sync::Mutex, time::Instant};
use uuid::Uuid;

use crate::{
    error::StoreError,
    models::{
        notification::Notification,
        status::{NotificationStatus, NotificationType},
    },
    store::{KeyValueStore, NotificationRepository},
};

/// In-process key/value store with TTL expiry, for tests and local runs.
#[derive(Default)]
pub struct InMemoryKeyValueStore {
    entries: Mutex<HashMap<String, Instant>>,
}

impl InMemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live keys, for assertions.
    pub async fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(_, expires_at)| **expires_at > now)
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;

        match entries.get(key) {
            Some(expires_at) if *expires_at > now => Ok(false),
            _ => {
                entries.insert(key.to_string(), now + ttl);
                Ok(true)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn contains(&self, key: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        Ok(entries.get(key).is_some_and(|expires_at| *expires_at > now))
    }
}

#[derive(Default)]
pub struct InMemoryNotificationStore {
    rows: Mutex<Vec<Notification>>,
}

impl InMemoryNotificationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<Notification> {
        self.rows.lock().await.clone()
    }
}

#[async_trait]
impl NotificationRepository for InMemoryNotificationStore {
    async fn insert(&self, notification: &Notification) -> Result<Uuid, StoreError> {
        let mut rows = self.rows.lock().await;

        if let Some(row) = rows
            .iter_mut()
            .find(|row| row.request_id == notification.request_id)
        {
            if row.status == NotificationStatus::Failed {
                row.status = NotificationStatus::Queued;
                row.updated_at = Utc::now();
            }
            return Ok(row.id);
        }

        rows.push(notification.clone());
        Ok(notification.id)
    }

    async fn update_status(&self, id: Uuid, status: NotificationStatus) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().await;
        let row = rows
            .iter_mut()
            .find(|row| row.id == id)
            .ok_or(StoreError::NotFound(id))?;

        if !row.status.can_transition_to(status) {
            return Err(StoreError::InvalidTransition {
                id,
                from: row.status,
                to: status,
            });
        }

        row.status = status;
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn find_latest(
        &self,
        template_id: &str,
        notification_type: NotificationType,
    ) -> Result<Option<Uuid>, StoreError> {
        let rows = self.rows.lock().await;
        Ok(rows
            .iter()
            .filter(|row| {
                row.template_id == template_id
                    && row.notification_type == notification_type.as_str()
            })
            .max_by_key(|row| row.created_at)
            .map(|row| row.id))
    }

    async fn get(&self, id: Uuid) -> Result<Option<Notification>, StoreError> {
        Ok(self.rows.lock().await.iter().find(|row| row.id == id).cloned())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
