//! Leave of absence: schedule cut-out, guest backfill and the daily
//! return/expiry sweep.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc};
use rota_core::{
    notify_quietly, CoreError, CoreResult, Notifier, SharedClock, Store, DEFAULT_DEPARTURE_TIME,
    GUEST_CANDIDATE_LIMIT, LEAVE_SCAN_DAYS, POD_CAPACITY,
};
use rota_shared::{NotificationKind, PodId, PodMembership, ScheduleSlot, UserId, Workday};
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

use crate::scheduler::{available_drivers, is_rotation_unit, Scheduler};

#[derive(Debug, Clone, Default)]
pub struct LeaveOutcome {
    pub pod_id: Option<PodId>,
    /// Slots the leaving user no longer drives.
    pub released_days: Vec<Workday>,
    pub covered: Vec<ScheduleSlot>,
    pub invited: Option<UserId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub returned: usize,
    pub regenerated_pods: Vec<PodId>,
    pub expired_guests: usize,
    pub failures: usize,
}

pub struct LeaveCoordinator {
    store: Arc<dyn Store>,
    clock: SharedClock,
    notifier: Arc<dyn Notifier>,
    scheduler: Arc<Scheduler>,
}

impl LeaveCoordinator {
    pub fn new(
        store: Arc<dyn Store>,
        clock: SharedClock,
        notifier: Arc<dyn Notifier>,
        scheduler: Arc<Scheduler>,
    ) -> Self {
        Self {
            store,
            clock,
            notifier,
            scheduler,
        }
    }

    pub async fn request_leave(
        &self,
        user_id: UserId,
        start: NaiveDate,
        end: NaiveDate,
    ) -> CoreResult<LeaveOutcome> {
        if start > end {
            return Err(CoreError::InvalidLeaveRange { start, end });
        }
        info!(user_id = %user_id, %start, %end, "Processing leave request");

        let mut tx = self.store.begin().await?;
        let mut profile = tx
            .get_profile(user_id)
            .await?
            .ok_or(CoreError::ProfileNotFound(user_id))?;
        profile.start_leave(start, end);
        tx.save_profile(&profile).await?;

        let mut outcome = LeaveOutcome::default();
        if let Some(membership) = tx.rotation_membership(user_id).await? {
            let days = leave_weekdays(start, end);
            let driven: Vec<Workday> = tx
                .slots(membership.pod_id)
                .await?
                .into_iter()
                .filter(|s| s.driver_id == user_id && days.contains(&s.day))
                .map(|s| s.day)
                .collect();
            tx.delete_driver_slots_on(membership.pod_id, user_id, &days)
                .await?;
            outcome.pod_id = Some(membership.pod_id);
            outcome.released_days = driven;
        }
        tx.commit().await?;

        // Each of these opens its own transaction.
        let Some(pod_id) = outcome.pod_id else {
            return Ok(outcome);
        };
        outcome.covered = self.scheduler.rebalance(pod_id).await?;
        outcome.invited = match self.find_guest_rider(pod_id, end).await {
            Ok(invited) => invited,
            Err(e) => {
                error!(pod_id = %pod_id, error = %e, "Guest rider search failed");
                None
            }
        };
        Ok(outcome)
    }

    /// Invites the best open CARPOOL commuter on the pod's key to ride as a
    /// guest until `until`. `None` when nobody qualifies.
    pub async fn find_guest_rider(
        &self,
        pod_id: PodId,
        until: NaiveDate,
    ) -> CoreResult<Option<UserId>> {
        let mut tx = self.store.begin().await?;
        let pod = tx
            .get_pod(pod_id)
            .await?
            .ok_or(CoreError::PodNotFound(pod_id))?;
        if !pod.is_active() {
            debug!(pod_id = %pod_id, "Collapsed pod takes no guests");
            return Ok(None);
        }
        let candidates = tx
            .guest_candidates(&pod.match_key, GUEST_CANDIDATE_LIMIT)
            .await?;
        tx.commit().await?;

        let Some(top) = candidates.first() else {
            info!(pod_id = %pod_id, "No guest rider available");
            return Ok(None);
        };

        notify_quietly(
            self.notifier.as_ref(),
            top.user_id,
            NotificationKind::GuestInvite,
            json!({ "pod_id": pod_id, "until": until }),
        )
        .await;
        info!(pod_id = %pod_id, user_id = %top.user_id, "Guest invite sent");
        Ok(Some(top.user_id))
    }

    /// Seats the user as a guest until the start of `until` (UTC). Guests
    /// take a seat but never a driving slot.
    pub async fn accept_guest_invite(
        &self,
        user_id: UserId,
        pod_id: PodId,
        until: NaiveDate,
    ) -> CoreResult<PodMembership> {
        let now = self.clock.utc();
        let expires_at = guest_expiry(until);
        if expires_at <= now {
            return Err(CoreError::GuestInviteExpired(expires_at));
        }

        let mut tx = self.store.begin().await?;
        let pod = tx
            .lock_pod(pod_id)
            .await?
            .filter(|p| p.is_active())
            .ok_or(CoreError::PodNotFound(pod_id))?;
        if !tx.memberships_for_user(user_id).await?.is_empty() {
            return Err(CoreError::AlreadyInPod(user_id));
        }

        let guests = tx
            .memberships(pod.id)
            .await?
            .iter()
            .filter(|m| m.is_guest())
            .count();
        let drivers = available_drivers(tx.as_mut(), pod.id).await?.len();
        if guests + drivers >= POD_CAPACITY {
            return Err(CoreError::PodFull(pod.id));
        }

        let membership = PodMembership::guest(pod.id, user_id, now, expires_at);
        tx.insert_membership(&membership).await?;
        tx.commit().await?;

        info!(pod_id = %pod.id, user_id = %user_id, %expires_at, "Guest rider joined");
        Ok(membership)
    }

    /// Daily sweep. Safe to re-run: a second pass finds nothing to do.
    #[instrument(skip(self))]
    pub async fn process_leave_returns_and_expirations(&self) -> CoreResult<SweepReport> {
        let now = self.clock.utc();
        let today = now.date_naive();
        let mut report = SweepReport::default();

        let returning = {
            let mut tx = self.store.begin().await?;
            let profiles = tx.profiles_with_elapsed_leave(today).await?;
            tx.commit().await?;
            profiles
        };

        for profile in returning {
            match self.reintegrate(profile.user_id, today).await {
                Ok(pod) => {
                    report.returned += 1;
                    if let Some(pod_id) = pod {
                        if !report.regenerated_pods.contains(&pod_id) {
                            report.regenerated_pods.push(pod_id);
                        }
                    }
                }
                Err(e) => {
                    report.failures += 1;
                    error!(user_id = %profile.user_id, error = %e, "Leave return failed");
                }
            }
        }

        let mut tx = self.store.begin().await?;
        for guest in tx.expired_guests(now).await? {
            if tx.delete_membership(guest.pod_id, guest.user_id).await? {
                report.expired_guests += 1;
                info!(pod_id = %guest.pod_id, user_id = %guest.user_id, "Removed expired guest rider");
            }
        }
        tx.commit().await?;

        info!(
            returned = report.returned,
            regenerated = report.regenerated_pods.len(),
            expired_guests = report.expired_guests,
            failures = report.failures,
            "Leave sweep finished"
        );
        Ok(report)
    }

    /// Clears one user's leave and rebuilds their pod's week.
    async fn reintegrate(&self, user_id: UserId, today: NaiveDate) -> CoreResult<Option<PodId>> {
        let mut tx = self.store.begin().await?;
        let Some(mut profile) = tx.get_profile(user_id).await? else {
            return Err(CoreError::ProfileNotFound(user_id));
        };
        if !profile.leave_elapsed(today) {
            // Handled by an earlier or concurrent sweep.
            return Ok(None);
        }
        profile.end_leave();
        tx.save_profile(&profile).await?;

        let mut regenerated = None;
        if let Some(membership) = tx.rotation_membership(user_id).await? {
            let pod_id = membership.pod_id;
            if !is_rotation_unit(tx.as_mut(), pod_id).await? {
                tx.commit().await?;
                info!(user_id = %user_id, pod_id = %pod_id, "Leave ended; pod no longer rotates");
                return Ok(None);
            }
            let drivers = available_drivers(tx.as_mut(), pod_id).await?;
            let departure = tx
                .slots(pod_id)
                .await?
                .first()
                .map(|s| s.departure_time.clone())
                .unwrap_or_else(|| DEFAULT_DEPARTURE_TIME.to_string());
            if drivers.is_empty() {
                warn!(pod_id = %pod_id, "Nobody available to drive after leave return");
            } else {
                self.scheduler
                    .generate_in(tx.as_mut(), pod_id, &drivers, &departure)
                    .await?;
                regenerated = Some(pod_id);
            }
        }
        tx.commit().await?;

        info!(user_id = %user_id, pod_id = ?regenerated, "Leave ended");
        Ok(regenerated)
    }
}

/// Weekdays touched by a leave range, scanning at most the first
/// `LEAVE_SCAN_DAYS` calendar days. Week order.
pub fn leave_weekdays(start: NaiveDate, end: NaiveDate) -> Vec<Workday> {
    let mut days = BTreeSet::new();
    let mut date = start;
    for _ in 0..LEAVE_SCAN_DAYS {
        if date > end {
            break;
        }
        if let Some(day) = Workday::from_weekday(date.weekday()) {
            days.insert(day);
        }
        date += Duration::days(1);
    }
    days.into_iter().collect()
}

fn guest_expiry(until: NaiveDate) -> DateTime<Utc> {
    until.and_time(NaiveTime::MIN).and_utc()
}
