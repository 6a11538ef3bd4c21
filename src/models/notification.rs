use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{
    message::{NotificationMessage, Payload},
    status::NotificationStatus,
};

/// Durable record of one accepted send request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub request_id: String,
    /// Raw type as submitted; an unrecognised value is still recorded.
    pub notification_type: String,
    pub template_id: String,
    pub recipient: Payload,
    pub variables: Payload,
    pub status: NotificationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Notification {
    pub fn queued(request_id: &str, message: &NotificationMessage) -> Self {
        let now = Utc::now();

        Self {
            id: Uuid::new_v4(),
            request_id: request_id.to_string(),
            notification_type: message.notification_type.clone(),
            template_id: message.template_id().to_string(),
            recipient: message.recipient.clone(),
            variables: message.variables.clone(),
            status: NotificationStatus::Queued,
            created_at: now,
            updated_at: now,
        }
    }
}
