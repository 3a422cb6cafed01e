//! Forced eviction of commuters who keep missing their duty.

use std::sync::Arc;

use rota_core::{notify_quietly, CoreError, CoreResult, Notifier, Store, STRIKE_THRESHOLD};
use rota_shared::{NotificationKind, PodId, UserId};
use serde_json::json;
use tracing::{info, warn};

use crate::scheduler::{RepairOutcome, Scheduler};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrikeOutcome {
    pub strikes: i32,
    pub suspended: bool,
    pub repair: Option<RepairOutcome>,
}

/// Eviction for cause goes through the same repair as a voluntary exit.
pub struct SuspensionGate {
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    scheduler: Arc<Scheduler>,
}

impl SuspensionGate {
    pub fn new(store: Arc<dyn Store>, notifier: Arc<dyn Notifier>, scheduler: Arc<Scheduler>) -> Self {
        Self {
            store,
            notifier,
            scheduler,
        }
    }

    /// Called by the penalty collaborator once the user's strikes reach
    /// the threshold.
    pub async fn on_strike_threshold_reached(
        &self,
        user_id: UserId,
        pod_id: PodId,
    ) -> CoreResult<RepairOutcome> {
        let mut tx = self.store.begin().await?;
        let mut profile = tx
            .get_profile(user_id)
            .await?
            .ok_or(CoreError::ProfileNotFound(user_id))?;
        profile.suspend_from_rotation();
        tx.save_profile(&profile).await?;

        let outcome = self.scheduler.repair_in(tx.as_mut(), pod_id, user_id).await?;
        tx.commit().await?;

        warn!(user_id = %user_id, pod_id = %pod_id, strikes = profile.strikes, "Suspended from rotation");
        self.notify_suspended(user_id, Some(pod_id)).await;
        self.scheduler.announce(pod_id, &outcome).await;
        Ok(outcome)
    }

    /// Adds one strike; crossing the threshold suspends the user in the
    /// same transaction.
    pub async fn record_strike(&self, user_id: UserId) -> CoreResult<StrikeOutcome> {
        let mut tx = self.store.begin().await?;
        let mut profile = tx
            .get_profile(user_id)
            .await?
            .ok_or(CoreError::ProfileNotFound(user_id))?;
        let crossed = profile.strikes < STRIKE_THRESHOLD && profile.strikes + 1 >= STRIKE_THRESHOLD;
        profile.strikes += 1;

        if !crossed {
            tx.save_profile(&profile).await?;
            tx.commit().await?;
            info!(user_id = %user_id, strikes = profile.strikes, "Strike recorded");
            return Ok(StrikeOutcome {
                strikes: profile.strikes,
                suspended: false,
                repair: None,
            });
        }

        profile.suspend_from_rotation();
        tx.save_profile(&profile).await?;
        let pod_id = tx.rotation_membership(user_id).await?.map(|m| m.pod_id);
        let repair = match pod_id {
            Some(pod_id) => Some(self.scheduler.repair_in(tx.as_mut(), pod_id, user_id).await?),
            None => None,
        };
        tx.commit().await?;

        warn!(user_id = %user_id, strikes = profile.strikes, pod_id = ?pod_id, "Suspended from rotation");
        self.notify_suspended(user_id, pod_id).await;
        if let (Some(pod_id), Some(outcome)) = (pod_id, repair.as_ref()) {
            self.scheduler.announce(pod_id, outcome).await;
        }

        Ok(StrikeOutcome {
            strikes: profile.strikes,
            suspended: true,
            repair,
        })
    }

    async fn notify_suspended(&self, user_id: UserId, pod_id: Option<PodId>) {
        notify_quietly(
            self.notifier.as_ref(),
            user_id,
            NotificationKind::SuspensionNotice,
            json!({ "pod_id": pod_id, "strike_threshold": STRIKE_THRESHOLD }),
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rota_core::{FixedClock, RecordingNotifier};
    use rota_shared::{CommutePreference, CommuteProfile, Pod, PodMembership};
    use rota_store::MemoryStore;
    use uuid::Uuid;

    struct Fixture {
        store: Arc<MemoryStore>,
        notifier: Arc<RecordingNotifier>,
        gate: SuspensionGate,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2026, 10, 20, 8, 0, 0).unwrap()));
        let notifier = Arc::new(RecordingNotifier::new());
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            clock,
            notifier.clone(),
            StdRng::seed_from_u64(3),
        ));
        let gate = SuspensionGate::new(store.clone(), notifier.clone(), scheduler);
        Fixture { store, notifier, gate }
    }

    async fn seed_pod(store: &MemoryStore, size: usize) -> (PodId, Vec<UserId>) {
        let now = Utc::now();
        let mut tx = store.begin().await.unwrap();
        let pod = Pod::new("a_b_06:30".into(), "a".into(), "b".into(), size < 4, now);
        tx.insert_pod(&pod).await.unwrap();
        let mut members = Vec::new();
        for _ in 0..size {
            let p = CommuteProfile::new(
                Uuid::new_v4(),
                CommutePreference::Rotation,
                "a".into(),
                "b".into(),
                "06:30".into(),
                "a_b_06:30".into(),
            );
            tx.save_profile(&p).await.unwrap();
            tx.insert_membership(&PodMembership::member(pod.id, p.user_id, now))
                .await
                .unwrap();
            members.push(p.user_id);
        }
        tx.commit().await.unwrap();
        (pod.id, members)
    }

    #[tokio::test]
    async fn test_threshold_evicts_through_dropout_path() {
        let f = fixture();
        let (pod_id, members) = seed_pod(&f.store, 4).await;
        let x = members[1];

        let outcome = f.gate.on_strike_threshold_reached(x, pod_id).await.unwrap();
        assert!(matches!(outcome, RepairOutcome::Healed { .. }));

        let mut tx = f.store.begin().await.unwrap();
        let profile = tx.get_profile(x).await.unwrap().unwrap();
        assert_eq!(profile.preference, CommutePreference::Carpool);
        assert!(!profile.open_to_suggestions);
        assert_eq!(tx.rotation_member_ids(pod_id).await.unwrap().len(), 3);
        assert!(tx.get_pod(pod_id).await.unwrap().unwrap().needs_replacement);
        drop(tx);

        let sent = f.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, NotificationKind::SuspensionNotice);
    }

    #[tokio::test]
    async fn test_failed_repair_keeps_profile_untouched() {
        let f = fixture();
        let (_, members) = seed_pod(&f.store, 3).await;

        let result = f.gate.on_strike_threshold_reached(members[0], Uuid::new_v4()).await;
        assert!(matches!(result, Err(CoreError::PodNotFound(_))));

        let mut tx = f.store.begin().await.unwrap();
        let profile = tx.get_profile(members[0]).await.unwrap().unwrap();
        assert_eq!(profile.preference, CommutePreference::Rotation);
        assert!(profile.open_to_suggestions);
        drop(tx);
        assert!(f.notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn test_second_strike_suspends_once() {
        let f = fixture();
        let (pod_id, members) = seed_pod(&f.store, 2).await;
        let user = members[0];

        let first = f.gate.record_strike(user).await.unwrap();
        assert_eq!(first, StrikeOutcome { strikes: 1, suspended: false, repair: None });

        let second = f.gate.record_strike(user).await.unwrap();
        assert!(second.suspended);
        assert_eq!(second.repair, Some(RepairOutcome::Collapsed { remaining: Some(members[1]) }));

        let third = f.gate.record_strike(user).await.unwrap();
        assert_eq!(third.strikes, 3);
        assert!(!third.suspended);

        let kinds: Vec<NotificationKind> = f.notifier.sent().into_iter().map(|(_, k, _)| k).collect();
        assert_eq!(kinds, vec![NotificationKind::SuspensionNotice, NotificationKind::PodDisbanded]);

        let mut tx = f.store.begin().await.unwrap();
        assert!(tx.slots(pod_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_strike_for_unknown_profile() {
        let f = fixture();
        let result = f.gate.record_strike(Uuid::new_v4()).await;
        assert!(matches!(result, Err(CoreError::ProfileNotFound(_))));
    }
}
