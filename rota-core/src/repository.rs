//! Storage ports.
//!
//! Every multi-row mutation runs inside one [`StoreTx`] obtained from
//! [`Store::begin`]. A transaction is only made durable by
//! [`StoreTx::commit`]; dropping it on any other path (early `?` return,
//! panic, or a cancelled future) rolls it back.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rota_shared::{CommuteProfile, Pod, PodId, PodMembership, ScheduleSlot, UserId, Workday};

use crate::CoreResult;

/// Commute profiles, keyed by user.
#[async_trait]
pub trait ProfileStore: Send {
    async fn get_profile(&mut self, user_id: UserId) -> CoreResult<Option<CommuteProfile>>;

    /// Insert or replace.
    async fn save_profile(&mut self, profile: &CommuteProfile) -> CoreResult<()>;

    /// ROTATION profiles holding no pod membership of any role.
    async fn unmatched_rotation_profiles(&mut self) -> CoreResult<Vec<CommuteProfile>>;

    /// CARPOOL profiles on `match_key` that are open to suggestions, not on
    /// leave and in no pod. Fewest strikes first.
    async fn guest_candidates(
        &mut self,
        match_key: &str,
        limit: usize,
    ) -> CoreResult<Vec<CommuteProfile>>;

    /// Profiles on leave whose end date is on or before `today`.
    async fn profiles_with_elapsed_leave(
        &mut self,
        today: NaiveDate,
    ) -> CoreResult<Vec<CommuteProfile>>;

    /// CARPOOL profiles whose home bucket is one of `cells`.
    async fn carpool_profiles_in_cells(
        &mut self,
        cells: &[String],
    ) -> CoreResult<Vec<CommuteProfile>>;
}

/// Pods, their memberships and their weekday schedule.
///
/// A seat in a collapsed pod is lapsed: per-user lookups and the
/// "in no pod" profile queries ignore it, and the next `insert_membership`
/// for that user removes it.
#[async_trait]
pub trait PodRepository: Send {
    async fn get_pod(&mut self, pod_id: PodId) -> CoreResult<Option<Pod>>;

    /// Reads the pod and holds it against concurrent writers until the
    /// transaction ends.
    async fn lock_pod(&mut self, pod_id: PodId) -> CoreResult<Option<Pod>>;

    /// Active pods flagged `needs_replacement` whose key is in `keys`,
    /// oldest first.
    async fn open_pods_for_keys(&mut self, keys: &[String]) -> CoreResult<Vec<Pod>>;

    async fn insert_pod(&mut self, pod: &Pod) -> CoreResult<()>;

    async fn update_pod(&mut self, pod: &Pod) -> CoreResult<()>;

    /// All memberships of a pod in join order.
    async fn memberships(&mut self, pod_id: PodId) -> CoreResult<Vec<PodMembership>>;

    /// The user's memberships in active pods.
    async fn memberships_for_user(&mut self, user_id: UserId) -> CoreResult<Vec<PodMembership>>;

    /// Fails with `AlreadyInPod` if the pair exists or the user would hold a
    /// second non-guest membership.
    async fn insert_membership(&mut self, membership: &PodMembership) -> CoreResult<()>;

    /// Returns whether a row was removed.
    async fn delete_membership(&mut self, pod_id: PodId, user_id: UserId) -> CoreResult<bool>;

    async fn expired_guests(&mut self, now: DateTime<Utc>) -> CoreResult<Vec<PodMembership>>;

    /// Slots of a pod ordered Monday to Friday.
    async fn slots(&mut self, pod_id: PodId) -> CoreResult<Vec<ScheduleSlot>>;

    async fn insert_slots(&mut self, slots: &[ScheduleSlot]) -> CoreResult<()>;

    async fn delete_all_slots(&mut self, pod_id: PodId) -> CoreResult<u64>;

    async fn delete_slots_on(&mut self, pod_id: PodId, days: &[Workday]) -> CoreResult<u64>;

    async fn delete_driver_slots_on(
        &mut self,
        pod_id: PodId,
        driver_id: UserId,
        days: &[Workday],
    ) -> CoreResult<u64>;

    /// Non-guest member ids in join order.
    async fn rotation_member_ids(&mut self, pod_id: PodId) -> CoreResult<Vec<UserId>> {
        Ok(self
            .memberships(pod_id)
            .await?
            .into_iter()
            .filter(|m| !m.is_guest())
            .map(|m| m.user_id)
            .collect())
    }

    /// The user's single non-guest membership, if any.
    async fn rotation_membership(&mut self, user_id: UserId) -> CoreResult<Option<PodMembership>> {
        Ok(self
            .memberships_for_user(user_id)
            .await?
            .into_iter()
            .find(|m| !m.is_guest()))
    }
}

/// One open transaction spanning both repositories.
#[async_trait]
pub trait StoreTx: ProfileStore + PodRepository {
    async fn commit(self: Box<Self>) -> CoreResult<()>;
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self) -> CoreResult<Box<dyn StoreTx>>;
}
