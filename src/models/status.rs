use std::{
    fmt::{Display, Formatter, Result},
    str::FromStr,
};

use serde::{Deserialize, Serialize};

/// Lifecycle of a notification row.
///
/// The gateway owns a row while it is `Queued`; the consumer performs the
/// single move out of `Queued`. `Sent` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    Queued,
    Sent,
    Failed,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Queued => "queued",
            NotificationStatus::Sent => "sent",
            NotificationStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, NotificationStatus::Sent | NotificationStatus::Failed)
    }

    /// `queued -> queued` is the publisher's confirmation write.
    pub fn can_transition_to(&self, next: NotificationStatus) -> bool {
        matches!(
            (self, next),
            (NotificationStatus::Queued, NotificationStatus::Queued)
                | (NotificationStatus::Queued, NotificationStatus::Sent)
                | (NotificationStatus::Queued, NotificationStatus::Failed)
        )
    }
}

impl Display for NotificationStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for NotificationStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "queued" => Ok(NotificationStatus::Queued),
            "sent" => Ok(NotificationStatus::Sent),
            "failed" => Ok(NotificationStatus::Failed),
            other => Err(format!("unknown notification status '{}'", other)),
        }
    }
}

/// Delivery channel; selects the destination queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationType {
    Email,
    Push,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::Email => "email",
            NotificationType::Push => "push",
        }
    }
}

impl Display for NotificationType {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for NotificationType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "email" => Ok(NotificationType::Email),
            "push" => Ok(NotificationType::Push),
            other => Err(format!("unknown notification type '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_accept_no_transition() {
        for terminal in [NotificationStatus::Sent, NotificationStatus::Failed] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(NotificationStatus::Queued));
            assert!(!terminal.can_transition_to(NotificationStatus::Sent));
            assert!(!terminal.can_transition_to(NotificationStatus::Failed));
        }
    }

    #[test]
    fn queued_moves_to_any_state() {
        let queued = NotificationStatus::Queued;
        assert!(queued.can_transition_to(NotificationStatus::Queued));
        assert!(queued.can_transition_to(NotificationStatus::Sent));
        assert!(queued.can_transition_to(NotificationStatus::Failed));
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert_eq!("push".parse::<NotificationType>(), Ok(NotificationType::Push));
        assert!("sms".parse::<NotificationType>().is_err());
    }
}
