use std::sync::Mutex;

use async_trait::async_trait;
use rota_shared::{NotificationKind, UserId};

/// Push-notification collaborator. Delivery is best effort.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        user_id: UserId,
        kind: NotificationKind,
        context: serde_json::Value,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Fire-and-forget: a failed delivery is logged and never reaches the caller.
pub async fn notify_quietly(
    notifier: &dyn Notifier,
    user_id: UserId,
    kind: NotificationKind,
    context: serde_json::Value,
) {
    if let Err(e) = notifier.notify(user_id, kind, context).await {
        tracing::error!(user_id = %user_id, kind = ?kind, error = %e, "Push notification failed");
    }
}

/// Writes notifications to the log instead of delivering them.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(
        &self,
        user_id: UserId,
        kind: NotificationKind,
        context: serde_json::Value,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        tracing::info!(user_id = %user_id, kind = ?kind, context = %context, "Push notification");
        Ok(())
    }
}

/// Keeps every notification in memory. Can be told to fail.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(UserId, NotificationKind, serde_json::Value)>>,
    failing: bool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            failing: true,
        }
    }

    pub fn sent(&self) -> Vec<(UserId, NotificationKind, serde_json::Value)> {
        self.sent
            .lock()
            .map(|sent| sent.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(
        &self,
        user_id: UserId,
        kind: NotificationKind,
        context: serde_json::Value,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if self.failing {
            return Err("push gateway unavailable".into());
        }
        self.sent
            .lock()
            .map_err(|_| "recording notifier poisoned")?
            .push((user_id, kind, context));
        Ok(())
    }
}
