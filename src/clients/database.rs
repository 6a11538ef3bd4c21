use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio::time::timeout;
use tokio_postgres::{Client, NoTls, Row};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::{
    error::StoreError,
    models::{
        message::Payload,
        notification::Notification,
        status::{NotificationStatus, NotificationType},
    },
    store::NotificationRepository,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS notifications (
    id UUID PRIMARY KEY,
    request_id TEXT NOT NULL,
    type TEXT NOT NULL,
    template_id TEXT NOT NULL DEFAULT '',
    recipient JSONB NOT NULL,
    variables JSONB NOT NULL,
    status TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS notifications_request_id_key ON notifications (request_id);
CREATE INDEX IF NOT EXISTS notifications_template_type_idx
    ON notifications (template_id, type, created_at DESC);
"#;

pub struct DatabaseClient {
    client: Client,
    op_timeout: Duration,
}

impl DatabaseClient {
    pub async fn connect(database_url: &str, op_timeout: Duration) -> Result<Self, StoreError> {
        info!("Connecting to PostgreSQL database");

        let (client, connection) = tokio_postgres::connect(database_url, NoTls)
            .await
            .map_err(|e| StoreError::Unavailable(format!("failed to connect to database: {}", e)))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "PostgreSQL connection terminated");
            }
        });

        client
            .batch_execute(SCHEMA)
            .await
            .map_err(|e| StoreError::Unavailable(format!("failed to prepare schema: {}", e)))?;

        info!("PostgreSQL connection established");

        Ok(Self { client, op_timeout })
    }

    fn notification_from_row(row: &Row) -> Result<Notification, StoreError> {
        let status: String = row.try_get("status").map_err(corrupt)?;
        let recipient: JsonValue = row.try_get("recipient").map_err(corrupt)?;
        let variables: JsonValue = row.try_get("variables").map_err(corrupt)?;

        Ok(Notification {
            id: row.try_get("id").map_err(corrupt)?,
            request_id: row.try_get("request_id").map_err(corrupt)?,
            notification_type: row.try_get("type").map_err(corrupt)?,
            template_id: row.try_get("template_id").map_err(corrupt)?,
            recipient: into_payload(recipient),
            variables: into_payload(variables),
            status: status.parse().map_err(StoreError::Corrupt)?,
            created_at: row.try_get("created_at").map_err(corrupt)?,
            updated_at: row.try_get("updated_at").map_err(corrupt)?,
        })
    }
}

fn unavailable(e: tokio_postgres::Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

fn corrupt(e: tokio_postgres::Error) -> StoreError {
    StoreError::Corrupt(e.to_string())
}

fn into_payload(value: JsonValue) -> Payload {
    match value {
        JsonValue::Object(map) => map,
        _ => Payload::new(),
    }
}

#[async_trait]
impl NotificationRepository for DatabaseClient {
    async fn insert(&self, notification: &Notification) -> Result<Uuid, StoreError> {
        let recipient = JsonValue::Object(notification.recipient.clone());
        let variables = JsonValue::Object(notification.variables.clone());

        // A retried request id reuses its row; only a failed row is re-queued.
        let row = self
            .client
            .query_one(
                r#"
                INSERT INTO notifications (
                    id, request_id, type, template_id, recipient, variables,
                    status, created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (request_id) DO UPDATE SET
                    status = CASE WHEN notifications.status = 'failed'
                        THEN EXCLUDED.status ELSE notifications.status END,
                    updated_at = CASE WHEN notifications.status = 'failed'
                        THEN NOW() ELSE notifications.updated_at END
                RETURNING id
                "#,
                &[
                    &notification.id,
                    &notification.request_id,
                    &notification.notification_type,
                    &notification.template_id,
                    &recipient,
                    &variables,
                    &notification.status.as_str(),
                    &notification.created_at,
                    &notification.updated_at,
                ],
            )
            .await
            .map_err(unavailable)?;
        let id: Uuid = row.try_get("id").map_err(corrupt)?;

        debug!(
            notification_id = %id,
            request_id = %notification.request_id,
            reused = id != notification.id,
            "Notification row written"
        );

        Ok(id)
    }

    async fn update_status(&self, id: Uuid, status: NotificationStatus) -> Result<(), StoreError> {
        // Only queued rows move; terminal rows are left untouched.
        let updated = self
            .client
            .execute(
                "UPDATE notifications SET status = $1, updated_at = NOW() \
                 WHERE id = $2 AND status = 'queued'",
                &[&status.as_str(), &id],
            )
            .await
            .map_err(unavailable)?;

        if updated == 1 {
            debug!(notification_id = %id, %status, "Notification status updated");
            return Ok(());
        }

        match self.get(id).await? {
            Some(current) => Err(StoreError::InvalidTransition {
                id,
                from: current.status,
                to: status,
            }),
            None => Err(StoreError::NotFound(id)),
        }
    }

    async fn find_latest(
        &self,
        template_id: &str,
        notification_type: NotificationType,
    ) -> Result<Option<Uuid>, StoreError> {
        let row = self
            .client
            .query_opt(
                "SELECT id FROM notifications WHERE template_id = $1 AND type = $2 \
                 ORDER BY created_at DESC LIMIT 1",
                &[&template_id, &notification_type.as_str()],
            )
            .await
            .map_err(unavailable)?;

        row.map(|row| row.try_get::<_, Uuid>("id").map_err(corrupt))
            .transpose()
    }

    async fn get(&self, id: Uuid) -> Result<Option<Notification>, StoreError> {
        let row = self
            .client
            .query_opt(
                "SELECT id, request_id, type, template_id, recipient, variables, status, \
                 created_at, updated_at FROM notifications WHERE id = $1",
                &[&id],
            )
            .await
            .map_err(unavailable)?;

        row.as_ref().map(Self::notification_from_row).transpose()
    }

    async fn ping(&self) -> Result<(), StoreError> {
        timeout(self.op_timeout, self.client.simple_query("SELECT 1"))
            .await
            .map_err(|_| StoreError::Timeout)?
            .map_err(unavailable)?;
        Ok(())
    }
}
