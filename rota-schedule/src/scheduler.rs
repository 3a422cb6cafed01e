//! Fair driving rotation for a pod: initial generation, repair after a
//! member leaves, and gap filling.

use std::sync::{Arc, Mutex};

use chrono::{Datelike, NaiveDate};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rota_core::{
    notify_quietly, CoreError, CoreResult, Notifier, SharedClock, Store, StoreTx,
    DEFAULT_DEPARTURE_TIME, MIN_ROTATION_MEMBERS,
};
use rota_shared::{
    CommutePreference, NotificationKind, Pod, PodId, PodMembership, PodStatus, ScheduleSlot,
    UserId, Workday,
};
use serde_json::json;
use tracing::{debug, info, warn};

/// What `repair_on_dropout` did to the pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepairOutcome {
    /// Fewer than two rotation members were left; every slot is gone.
    Collapsed { remaining: Option<UserId> },
    /// The listed future days were reassigned.
    Healed { days: Vec<Workday> },
}

/// A user's rotation pod as seen by its members.
#[derive(Debug, Clone)]
pub struct PodRoster {
    pub pod: Pod,
    pub members: Vec<PodMembership>,
    pub slots: Vec<ScheduleSlot>,
}

pub struct Scheduler {
    store: Arc<dyn Store>,
    clock: SharedClock,
    notifier: Arc<dyn Notifier>,
    rng: Mutex<StdRng>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn Store>,
        clock: SharedClock,
        notifier: Arc<dyn Notifier>,
        rng: StdRng,
    ) -> Self {
        Self {
            store,
            clock,
            notifier,
            rng: Mutex::new(rng),
        }
    }

    /// Replaces the pod's whole week with a shuffled rotation over
    /// `member_ids`.
    pub async fn generate_initial(
        &self,
        pod_id: PodId,
        member_ids: &[UserId],
        departure_time: Option<&str>,
    ) -> CoreResult<Vec<ScheduleSlot>> {
        let mut tx = self.store.begin().await?;
        let departure = departure_time.unwrap_or(DEFAULT_DEPARTURE_TIME);
        let slots = self
            .generate_in(tx.as_mut(), pod_id, member_ids, departure)
            .await?;
        tx.commit().await?;
        Ok(slots)
    }

    /// `generate_initial` inside a transaction the caller owns.
    pub async fn generate_in(
        &self,
        tx: &mut dyn StoreTx,
        pod_id: PodId,
        member_ids: &[UserId],
        departure_time: &str,
    ) -> CoreResult<Vec<ScheduleSlot>> {
        if member_ids.is_empty() {
            return Err(CoreError::EmptyPod);
        }
        if tx.get_pod(pod_id).await?.is_none() {
            return Err(CoreError::PodNotFound(pod_id));
        }

        let drivers = self.shuffled(member_ids);
        let slots = assign_round_robin(pod_id, &drivers, &Workday::ALL, departure_time);

        tx.delete_all_slots(pod_id).await?;
        tx.insert_slots(&slots).await?;

        info!(pod_id = %pod_id, members = drivers.len(), "Generated initial schedule");
        Ok(slots)
    }

    fn shuffled(&self, member_ids: &[UserId]) -> Vec<UserId> {
        let mut drivers = member_ids.to_vec();
        // A poisoned generator is still a usable generator.
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        drivers.shuffle(&mut *rng);
        drivers
    }

    /// Removes `dropped` from the pod and either collapses or heals it.
    pub async fn repair_on_dropout(
        &self,
        pod_id: PodId,
        dropped: UserId,
    ) -> CoreResult<RepairOutcome> {
        let mut tx = self.store.begin().await?;
        let outcome = self.repair_in(tx.as_mut(), pod_id, dropped).await?;
        tx.commit().await?;

        self.announce(pod_id, &outcome).await;
        Ok(outcome)
    }

    /// The repair itself, inside a transaction the caller owns. Callers
    /// send [`Scheduler::announce`] once their transaction has committed.
    pub async fn repair_in(
        &self,
        tx: &mut dyn StoreTx,
        pod_id: PodId,
        dropped: UserId,
    ) -> CoreResult<RepairOutcome> {
        let mut pod = tx
            .lock_pod(pod_id)
            .await?
            .ok_or(CoreError::PodNotFound(pod_id))?;

        if !tx.delete_membership(pod_id, dropped).await? {
            return Err(CoreError::NotPodMember {
                pod_id,
                user_id: dropped,
            });
        }

        let members = tx.rotation_member_ids(pod_id).await?;

        if members.len() < MIN_ROTATION_MEMBERS {
            let removed = tx.delete_all_slots(pod_id).await?;
            pod.status = PodStatus::Collapsed;
            pod.needs_replacement = true;
            tx.update_pod(&pod).await?;

            let remaining = members.first().copied();
            if let Some(user_id) = remaining {
                match tx.get_profile(user_id).await? {
                    Some(mut profile) => {
                        profile.preference = CommutePreference::Carpool;
                        tx.save_profile(&profile).await?;
                    }
                    None => warn!(user_id = %user_id, "Remaining member has no commute profile"),
                }
            }

            info!(pod_id = %pod_id, dropped = %dropped, slots_removed = removed, "Pod collapsed");
            return Ok(RepairOutcome::Collapsed { remaining });
        }

        pod.needs_replacement = true;
        tx.update_pod(&pod).await?;

        let today = self.clock.utc().date_naive();
        let days = future_workdays(today);
        if days.is_empty() {
            debug!(pod_id = %pod_id, "No workdays left this week to heal");
            return Ok(RepairOutcome::Healed { days });
        }

        tx.delete_slots_on(pod_id, &days).await?;
        let departure = tx
            .slots(pod_id)
            .await?
            .first()
            .map(|s| s.departure_time.clone())
            .unwrap_or_else(|| DEFAULT_DEPARTURE_TIME.to_string());

        let slots = assign_round_robin(pod_id, &members, &days, &departure);
        tx.insert_slots(&slots).await?;

        info!(pod_id = %pod_id, dropped = %dropped, healed_days = days.len(), "Pod healed");
        Ok(RepairOutcome::Healed { days })
    }

    /// Tells a lone survivor that their pod is gone.
    pub async fn announce(&self, pod_id: PodId, outcome: &RepairOutcome) {
        if let RepairOutcome::Collapsed {
            remaining: Some(user_id),
        } = outcome
        {
            notify_quietly(
                self.notifier.as_ref(),
                *user_id,
                NotificationKind::PodDisbanded,
                json!({ "pod_id": pod_id }),
            )
            .await;
        }
    }

    /// Fills weekdays with no slot; existing slots are left alone.
    pub async fn rebalance(&self, pod_id: PodId) -> CoreResult<Vec<ScheduleSlot>> {
        let mut tx = self.store.begin().await?;
        let filled = self.rebalance_in(tx.as_mut(), pod_id).await?;
        tx.commit().await?;
        Ok(filled)
    }

    async fn rebalance_in(
        &self,
        tx: &mut dyn StoreTx,
        pod_id: PodId,
    ) -> CoreResult<Vec<ScheduleSlot>> {
        if tx.lock_pod(pod_id).await?.is_none() {
            return Err(CoreError::PodNotFound(pod_id));
        }
        if !is_rotation_unit(tx, pod_id).await? {
            debug!(pod_id = %pod_id, "Pod no longer rotates; nothing to rebalance");
            return Ok(Vec::new());
        }

        let existing = tx.slots(pod_id).await?;
        let missing: Vec<Workday> = Workday::ALL
            .into_iter()
            .filter(|day| !existing.iter().any(|s| s.day == *day))
            .collect();
        if missing.is_empty() {
            return Ok(Vec::new());
        }

        let drivers = available_drivers(tx, pod_id).await?;
        if drivers.is_empty() {
            warn!(pod_id = %pod_id, "No available driver to fill missing days");
            return Ok(Vec::new());
        }

        let departure = existing
            .first()
            .map(|s| s.departure_time.clone())
            .unwrap_or_else(|| DEFAULT_DEPARTURE_TIME.to_string());
        let slots = assign_round_robin(pod_id, &drivers, &missing, &departure);
        tx.insert_slots(&slots).await?;

        info!(pod_id = %pod_id, filled = slots.len(), "Rebalanced schedule");
        Ok(slots)
    }

    /// The user's rotation pod with its members and week, if any.
    pub async fn roster(&self, user_id: UserId) -> CoreResult<Option<PodRoster>> {
        let mut tx = self.store.begin().await?;
        let Some(membership) = tx.rotation_membership(user_id).await? else {
            return Ok(None);
        };

        let pod = tx
            .get_pod(membership.pod_id)
            .await?
            .ok_or(CoreError::PodNotFound(membership.pod_id))?;
        let members = tx.memberships(pod.id).await?;
        let slots = tx.slots(pod.id).await?;
        tx.commit().await?;

        Ok(Some(PodRoster { pod, members, slots }))
    }

    /// Voluntary exit from the user's rotation pod; `None` if they had none.
    pub async fn leave_pod(&self, user_id: UserId) -> CoreResult<Option<RepairOutcome>> {
        let mut tx = self.store.begin().await?;
        let Some(membership) = tx.rotation_membership(user_id).await? else {
            return Ok(None);
        };

        let outcome = self.repair_in(tx.as_mut(), membership.pod_id, user_id).await?;
        tx.commit().await?;

        self.announce(membership.pod_id, &outcome).await;
        Ok(Some(outcome))
    }
}

/// Whether the pod is active with enough non-guest members to share a
/// week.
pub(crate) async fn is_rotation_unit(tx: &mut dyn StoreTx, pod_id: PodId) -> CoreResult<bool> {
    let Some(pod) = tx.get_pod(pod_id).await? else {
        return Ok(false);
    };
    Ok(pod.is_active() && tx.rotation_member_ids(pod_id).await?.len() >= MIN_ROTATION_MEMBERS)
}

/// Non-guest members who are not on leave, in join order.
pub(crate) async fn available_drivers(
    tx: &mut dyn StoreTx,
    pod_id: PodId,
) -> CoreResult<Vec<UserId>> {
    let mut drivers = Vec::new();
    for user_id in tx.rotation_member_ids(pod_id).await? {
        let on_leave = tx
            .get_profile(user_id)
            .await?
            .is_some_and(|p| p.is_on_leave);
        if !on_leave {
            drivers.push(user_id);
        }
    }
    Ok(drivers)
}

/// Workdays after `today` in the current week. Every workday on a weekend,
/// none on a Friday.
pub fn future_workdays(today: NaiveDate) -> Vec<Workday> {
    match Workday::from_weekday(today.weekday()) {
        Some(day) => day.remaining_after().to_vec(),
        None => Workday::ALL.to_vec(),
    }
}

fn assign_round_robin(
    pod_id: PodId,
    drivers: &[UserId],
    days: &[Workday],
    departure_time: &str,
) -> Vec<ScheduleSlot> {
    days.iter()
        .enumerate()
        .map(|(i, day)| ScheduleSlot {
            pod_id,
            day: *day,
            driver_id: drivers[i % drivers.len()],
            departure_time: departure_time.to_string(),
        })
        .collect()
}
