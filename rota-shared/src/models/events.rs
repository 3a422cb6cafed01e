use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::UserId;

/// Push templates the core asks the notification collaborator to deliver.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    GuestInvite,
    SuspensionNotice,
    PodDisbanded,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Notification {
    pub user_id: UserId,
    pub kind: NotificationKind,
    pub context: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}
