pub mod clock;
pub mod geo;
pub mod notify;
pub mod repository;

pub use clock::{Clock, DefaultClock, FixedClock, SharedClock};
pub use geo::GeoIndex;
pub use notify::{notify_quietly, LogNotifier, Notifier, RecordingNotifier};
pub use repository::{PodRepository, ProfileStore, Store, StoreTx};

use chrono::{DateTime, NaiveDate, Utc};
use rota_shared::{PodId, UserId};

/// Seats in a pod, guests included.
pub const POD_CAPACITY: usize = 4;
/// Below this many non-guest members a pod collapses.
pub const MIN_ROTATION_MEMBERS: usize = 2;
/// Smallest same-key group batch clustering turns into a pod.
pub const MIN_BATCH_GROUP: usize = 3;
pub const STRIKE_THRESHOLD: i32 = 2;
pub const DEFAULT_DEPARTURE_TIME: &str = "06:30";
pub const GUEST_CANDIDATE_LIMIT: usize = 5;
/// Calendar days scanned when mapping a leave range onto weekdays.
pub const LEAVE_SCAN_DAYS: i64 = 7;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Cannot generate a schedule for a pod with no members")]
    EmptyPod,
    #[error("Pod not found: {0}")]
    PodNotFound(PodId),
    #[error("Commute profile not found for user {0}")]
    ProfileNotFound(UserId),
    #[error("Pod {0} was filled by a concurrent join; retry via batch clustering")]
    CapacityRace(PodId),
    #[error("Invalid leave range: {start} is after {end}")]
    InvalidLeaveRange { start: NaiveDate, end: NaiveDate },
    #[error("Guest invite expired at {0}")]
    GuestInviteExpired(DateTime<Utc>),
    #[error("Pod {0} has no free seat")]
    PodFull(PodId),
    #[error("User {user_id} is not a member of pod {pod_id}")]
    NotPodMember { pod_id: PodId, user_id: UserId },
    #[error("User {0} already belongs to a pod")]
    AlreadyInPod(UserId),
    #[error("Invalid coordinates: {0}")]
    InvalidCoordinates(String),
    #[error("Invalid departure time: {0}")]
    InvalidDepartureTime(String),
    #[error("Job already running: {0}")]
    JobAlreadyRunning(&'static str),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Internal service error: {0}")]
    InternalError(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
