//! In-process store.
//!
//! One async mutex guards the whole state, so transactions are fully
//! serialized. A transaction keeps the guard plus a copy of the state taken
//! at `begin`; unless `commit` runs, the copy is written back on drop.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rota_core::{CoreError, CoreResult, PodRepository, ProfileStore, Store, StoreTx};
use rota_shared::{
    CommutePreference, CommuteProfile, Pod, PodId, PodMembership, ScheduleSlot, UserId, Workday,
};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

#[derive(Debug, Clone, Default)]
struct MemoryState {
    profiles: BTreeMap<UserId, CommuteProfile>,
    pods: Vec<Pod>,
    memberships: Vec<PodMembership>,
    slots: Vec<ScheduleSlot>,
}

impl MemoryState {
    fn has_membership(&self, user_id: UserId) -> bool {
        self.memberships
            .iter()
            .any(|m| m.user_id == user_id && !self.is_lapsed(m))
    }

    /// Seats in a collapsed pod no longer count as membership.
    fn is_lapsed(&self, membership: &PodMembership) -> bool {
        self.pods
            .iter()
            .any(|p| p.id == membership.pod_id && !p.is_active())
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> CoreResult<Box<dyn StoreTx>> {
        let guard = self.state.clone().lock_owned().await;
        let rollback = guard.clone();
        Ok(Box::new(MemoryTx {
            guard,
            rollback: Some(rollback),
        }))
    }
}

pub struct MemoryTx {
    guard: OwnedMutexGuard<MemoryState>,
    rollback: Option<MemoryState>,
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        if let Some(previous) = self.rollback.take() {
            *self.guard = previous;
            debug!("Memory transaction rolled back");
        }
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn commit(mut self: Box<Self>) -> CoreResult<()> {
        self.rollback = None;
        Ok(())
    }
}

#[async_trait]
impl ProfileStore for MemoryTx {
    async fn get_profile(&mut self, user_id: UserId) -> CoreResult<Option<CommuteProfile>> {
        Ok(self.guard.profiles.get(&user_id).cloned())
    }

    async fn save_profile(&mut self, profile: &CommuteProfile) -> CoreResult<()> {
        self.guard.profiles.insert(profile.user_id, profile.clone());
        Ok(())
    }

    async fn unmatched_rotation_profiles(&mut self) -> CoreResult<Vec<CommuteProfile>> {
        let state = &*self.guard;
        Ok(state
            .profiles
            .values()
            .filter(|p| p.preference == CommutePreference::Rotation)
            .filter(|p| !state.has_membership(p.user_id))
            .cloned()
            .collect())
    }

    async fn guest_candidates(
        &mut self,
        match_key: &str,
        limit: usize,
    ) -> CoreResult<Vec<CommuteProfile>> {
        let state = &*self.guard;
        let mut candidates: Vec<CommuteProfile> = state
            .profiles
            .values()
            .filter(|p| p.match_key == match_key)
            .filter(|p| p.preference == CommutePreference::Carpool)
            .filter(|p| p.open_to_suggestions && !p.is_on_leave)
            .filter(|p| !state.has_membership(p.user_id))
            .cloned()
            .collect();
        candidates.sort_by_key(|p| (p.strikes, p.user_id));
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn profiles_with_elapsed_leave(
        &mut self,
        today: NaiveDate,
    ) -> CoreResult<Vec<CommuteProfile>> {
        Ok(self
            .guard
            .profiles
            .values()
            .filter(|p| p.leave_elapsed(today))
            .cloned()
            .collect())
    }

    async fn carpool_profiles_in_cells(
        &mut self,
        cells: &[String],
    ) -> CoreResult<Vec<CommuteProfile>> {
        let cells: HashSet<&str> = cells.iter().map(String::as_str).collect();
        Ok(self
            .guard
            .profiles
            .values()
            .filter(|p| p.preference == CommutePreference::Carpool)
            .filter(|p| cells.contains(p.home_key.as_str()))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl PodRepository for MemoryTx {
    async fn get_pod(&mut self, pod_id: PodId) -> CoreResult<Option<Pod>> {
        Ok(self.guard.pods.iter().find(|p| p.id == pod_id).cloned())
    }

    async fn lock_pod(&mut self, pod_id: PodId) -> CoreResult<Option<Pod>> {
        // The transaction already holds the whole store.
        self.get_pod(pod_id).await
    }

    async fn open_pods_for_keys(&mut self, keys: &[String]) -> CoreResult<Vec<Pod>> {
        let keys: HashSet<&str> = keys.iter().map(String::as_str).collect();
        let mut pods: Vec<Pod> = self
            .guard
            .pods
            .iter()
            .filter(|p| p.is_active() && p.needs_replacement)
            .filter(|p| keys.contains(p.match_key.as_str()))
            .cloned()
            .collect();
        pods.sort_by_key(|p| p.created_at);
        Ok(pods)
    }

    async fn insert_pod(&mut self, pod: &Pod) -> CoreResult<()> {
        if self.guard.pods.iter().any(|p| p.id == pod.id) {
            return Err(CoreError::Storage(format!("pod {} already exists", pod.id)));
        }
        self.guard.pods.push(pod.clone());
        Ok(())
    }

    async fn update_pod(&mut self, pod: &Pod) -> CoreResult<()> {
        let stored = self
            .guard
            .pods
            .iter_mut()
            .find(|p| p.id == pod.id)
            .ok_or(CoreError::PodNotFound(pod.id))?;
        *stored = pod.clone();
        Ok(())
    }

    async fn memberships(&mut self, pod_id: PodId) -> CoreResult<Vec<PodMembership>> {
        let mut members: Vec<PodMembership> = self
            .guard
            .memberships
            .iter()
            .filter(|m| m.pod_id == pod_id)
            .cloned()
            .collect();
        members.sort_by_key(|m| (m.joined_at, m.user_id));
        Ok(members)
    }

    async fn memberships_for_user(&mut self, user_id: UserId) -> CoreResult<Vec<PodMembership>> {
        let state = &*self.guard;
        Ok(state
            .memberships
            .iter()
            .filter(|m| m.user_id == user_id && !state.is_lapsed(m))
            .cloned()
            .collect())
    }

    async fn insert_membership(&mut self, membership: &PodMembership) -> CoreResult<()> {
        let lapsed: Vec<PodId> = self
            .guard
            .memberships
            .iter()
            .filter(|m| m.user_id == membership.user_id && self.guard.is_lapsed(m))
            .map(|m| m.pod_id)
            .collect();
        if !lapsed.is_empty() {
            self.guard
                .memberships
                .retain(|m| !(m.user_id == membership.user_id && lapsed.contains(&m.pod_id)));
            debug!(user_id = %membership.user_id, released = lapsed.len(), "Released lapsed seats");
        }

        let duplicate = self.guard.memberships.iter().any(|m| {
            m.user_id == membership.user_id
                && (m.pod_id == membership.pod_id || (!m.is_guest() && !membership.is_guest()))
        });
        if duplicate {
            return Err(CoreError::AlreadyInPod(membership.user_id));
        }
        self.guard.memberships.push(membership.clone());
        Ok(())
    }

    async fn delete_membership(&mut self, pod_id: PodId, user_id: UserId) -> CoreResult<bool> {
        let before = self.guard.memberships.len();
        self.guard
            .memberships
            .retain(|m| !(m.pod_id == pod_id && m.user_id == user_id));
        Ok(self.guard.memberships.len() < before)
    }

    async fn expired_guests(&mut self, now: DateTime<Utc>) -> CoreResult<Vec<PodMembership>> {
        Ok(self
            .guard
            .memberships
            .iter()
            .filter(|m| m.is_expired(now))
            .cloned()
            .collect())
    }

    async fn slots(&mut self, pod_id: PodId) -> CoreResult<Vec<ScheduleSlot>> {
        let mut slots: Vec<ScheduleSlot> = self
            .guard
            .slots
            .iter()
            .filter(|s| s.pod_id == pod_id)
            .cloned()
            .collect();
        slots.sort_by_key(|s| s.day);
        Ok(slots)
    }

    async fn insert_slots(&mut self, slots: &[ScheduleSlot]) -> CoreResult<()> {
        for slot in slots {
            let taken = self
                .guard
                .slots
                .iter()
                .any(|s| s.pod_id == slot.pod_id && s.day == slot.day);
            if taken {
                return Err(CoreError::Storage(format!(
                    "pod {} already has a {} slot",
                    slot.pod_id,
                    slot.day.as_str()
                )));
            }
            self.guard.slots.push(slot.clone());
        }
        Ok(())
    }

    async fn delete_all_slots(&mut self, pod_id: PodId) -> CoreResult<u64> {
        Ok(self.remove_slots(|s| s.pod_id == pod_id))
    }

    async fn delete_slots_on(&mut self, pod_id: PodId, days: &[Workday]) -> CoreResult<u64> {
        Ok(self.remove_slots(|s| s.pod_id == pod_id && days.contains(&s.day)))
    }

    async fn delete_driver_slots_on(
        &mut self,
        pod_id: PodId,
        driver_id: UserId,
        days: &[Workday],
    ) -> CoreResult<u64> {
        Ok(self.remove_slots(|s| {
            s.pod_id == pod_id && s.driver_id == driver_id && days.contains(&s.day)
        }))
    }
}

impl MemoryTx {
    fn remove_slots(&mut self, matches: impl Fn(&ScheduleSlot) -> bool) -> u64 {
        let before = self.guard.slots.len();
        self.guard.slots.retain(|s| !matches(s));
        (before - self.guard.slots.len()) as u64
    }
}
