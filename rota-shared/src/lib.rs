//! Data model shared by every rota crate.
//!
//! These are plain records: no storage handles, no back-pointers. Relations
//! are expressed through the opaque `UserId` / `PodId` fields.

pub mod models;

pub use models::events::{Notification, NotificationKind};
pub use models::pod::{Pod, PodMembership, PodRole, PodStatus};
pub use models::profile::{CommutePreference, CommuteProfile};
pub use models::schedule::{ScheduleSlot, Workday};

pub type UserId = uuid::Uuid;
pub type PodId = uuid::Uuid;

/// Returned when a stored string does not name a known enum variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}
