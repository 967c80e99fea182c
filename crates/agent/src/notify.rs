use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use tandem_core::domain::identity::UserId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    CriticalRisk,
    Escalation,
    AppointmentBooked,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub recipient_id: UserId,
    pub kind: NotificationKind,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Error)]
#[error("notification delivery failed: {0}")]
pub struct NotifyError(pub String);

/// Delivery channel for best-effort messages sent after a durable write.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError>;
}

/// Writes notifications to the log instead of an external channel.
#[derive(Clone, Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
        info!(
            event_name = "notification.logged",
            recipient_id = %notification.recipient_id,
            kind = ?notification.kind,
            subject = %notification.subject,
            "notification recorded"
        );
        Ok(())
    }
}
