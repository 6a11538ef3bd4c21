use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::models::status::NotificationType;

/// Opaque key/value payload; passed through in insertion order.
pub type Payload = Map<String, Value>;

/// Body of `POST /notifications/send` and, unchanged, the queue payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationMessage {
    #[serde(rename = "type")]
    pub notification_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,

    pub recipient: Payload,

    #[serde(default)]
    pub variables: Payload,
}

impl NotificationMessage {
    pub fn new(notification_type: NotificationType, recipient: Payload) -> Self {
        Self {
            notification_type: notification_type.as_str().to_string(),
            template_id: None,
            recipient,
            variables: Payload::new(),
        }
    }

    pub fn with_template(mut self, template_id: impl Into<String>) -> Self {
        self.template_id = Some(template_id.into());
        self
    }

    pub fn with_variables(mut self, variables: Payload) -> Self {
        self.variables = variables;
        self
    }

    /// Missing template ids collapse to the empty string, matching the stored column.
    pub fn template_id(&self) -> &str {
        self.template_id.as_deref().unwrap_or_default()
    }

    pub fn kind(&self) -> Option<NotificationType> {
        self.notification_type.parse().ok()
    }

    /// Consumer-side dedup fingerprint.
    pub fn lock_key(&self) -> String {
        format!("notif_lock:{}:{}", self.notification_type, self.template_id())
    }
}

/// Record published to the failed queue when a delivery cannot be completed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqMessage {
    pub original_message: NotificationMessage,
    pub failure_reason: String,
    pub failed_at: String,
}
