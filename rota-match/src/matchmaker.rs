//! Placing unmatched ROTATION commuters into pods.

use std::collections::BTreeMap;
use std::sync::Arc;

use rota_core::{CoreError, CoreResult, GeoIndex, SharedClock, Store, MIN_BATCH_GROUP, POD_CAPACITY};
use rota_schedule::Scheduler;
use rota_shared::{CommuteProfile, Pod, PodId, PodMembership, UserId};
use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstantMatch {
    Joined { pod_id: PodId, now_full: bool },
    /// Nothing open nearby; the user waits for batch clustering.
    NoMatch,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub candidates: usize,
    pub pods_created: Vec<PodId>,
    pub left_unmatched: usize,
    pub failed_groups: usize,
}

pub struct Matchmaker {
    store: Arc<dyn Store>,
    clock: SharedClock,
    scheduler: Arc<Scheduler>,
    batch_running: Mutex<()>,
}

impl Matchmaker {
    pub fn new(store: Arc<dyn Store>, clock: SharedClock, scheduler: Arc<Scheduler>) -> Self {
        Self {
            store,
            clock,
            scheduler,
            batch_running: Mutex::new(()),
        }
    }

    /// Joins the oldest open pod on the profile's exact key, or failing
    /// that on one of its 49 neighboring keys.
    pub async fn attempt_instant_match(
        &self,
        user_id: UserId,
        profile: &CommuteProfile,
    ) -> CoreResult<InstantMatch> {
        let mut keys = vec![profile.match_key.clone()];
        for key in GeoIndex::neighboring_keys_for_cells(
            &profile.home_key,
            &profile.work_key,
            &profile.departure_time,
        )? {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }

        let mut tx = self.store.begin().await?;
        let mut open = tx.open_pods_for_keys(&keys).await?;
        // Stable: oldest first within each group.
        open.sort_by_key(|pod| pod.match_key != profile.match_key);
        let Some(candidate) = open.first() else {
            return Ok(InstantMatch::NoMatch);
        };

        // Re-read under the row lock: another join may have taken the seat.
        let mut pod = tx
            .lock_pod(candidate.id)
            .await?
            .ok_or(CoreError::PodNotFound(candidate.id))?;
        let count = tx.rotation_member_ids(pod.id).await?.len();
        if !pod.is_active() || !pod.needs_replacement || count >= POD_CAPACITY {
            warn!(pod_id = %pod.id, user_id = %user_id, "Lost the race for the last seat");
            return Err(CoreError::CapacityRace(pod.id));
        }

        let now = self.clock.utc();
        tx.insert_membership(&PodMembership::member(pod.id, user_id, now))
            .await?;
        let now_full = count + 1 >= POD_CAPACITY;
        pod.needs_replacement = !now_full;
        tx.update_pod(&pod).await?;
        tx.commit().await?;

        info!(pod_id = %pod.id, user_id = %user_id, members = count + 1, "Instant match");
        Ok(InstantMatch::Joined {
            pod_id: pod.id,
            now_full,
        })
    }

    /// Groups unmatched ROTATION profiles by exact key and turns every group
    /// of three or more into pods. Refuses to start while a run is active.
    #[instrument(skip(self))]
    pub async fn run_batch_clustering(&self) -> CoreResult<BatchReport> {
        let _running = self
            .batch_running
            .try_lock()
            .map_err(|_| CoreError::JobAlreadyRunning("batch_clustering"))?;

        let unmatched = {
            let mut tx = self.store.begin().await?;
            let profiles = tx.unmatched_rotation_profiles().await?;
            tx.commit().await?;
            profiles
        };

        let mut report = BatchReport {
            candidates: unmatched.len(),
            ..BatchReport::default()
        };

        let mut groups: BTreeMap<String, Vec<CommuteProfile>> = BTreeMap::new();
        for profile in unmatched {
            groups.entry(profile.match_key.clone()).or_default().push(profile);
        }

        for (match_key, profiles) in groups {
            let sizes = partition_sizes(profiles.len());
            let placed: usize = sizes.iter().sum();
            report.left_unmatched += profiles.len() - placed;

            let mut rest = profiles.as_slice();
            for size in sizes {
                let (group, tail) = rest.split_at(size);
                rest = tail;
                match self.create_pod(&match_key, group).await {
                    Ok(pod_id) => report.pods_created.push(pod_id),
                    Err(e) => {
                        report.failed_groups += 1;
                        report.left_unmatched += group.len();
                        error!(match_key = %match_key, size = group.len(), error = %e, "Pod creation failed");
                    }
                }
            }
        }

        info!(
            candidates = report.candidates,
            pods = report.pods_created.len(),
            left_unmatched = report.left_unmatched,
            failed_groups = report.failed_groups,
            "Batch clustering finished"
        );
        Ok(report)
    }

    /// One pod, its members and its first week, atomically.
    async fn create_pod(&self, match_key: &str, group: &[CommuteProfile]) -> CoreResult<PodId> {
        let first = group.first().ok_or(CoreError::EmptyPod)?;
        let now = self.clock.utc();
        let pod = Pod::new(
            match_key.to_string(),
            first.home_key.clone(),
            first.work_key.clone(),
            group.len() < POD_CAPACITY,
            now,
        );

        let mut tx = self.store.begin().await?;
        tx.insert_pod(&pod).await?;
        for profile in group {
            tx.insert_membership(&PodMembership::member(pod.id, profile.user_id, now))
                .await?;
        }
        let member_ids: Vec<UserId> = group.iter().map(|p| p.user_id).collect();
        let departure = GeoIndex::canonical_time(&first.departure_time)?;
        self.scheduler
            .generate_in(tx.as_mut(), pod.id, &member_ids, &departure)
            .await?;
        tx.commit().await?;

        info!(pod_id = %pod.id, match_key = %match_key, members = group.len(), "Pod created");
        Ok(pod.id)
    }
}

/// Pod sizes for a same-key group of `n`: fours and threes, never a pod
/// under three. Whatever cannot be placed waits for a later run.
pub fn partition_sizes(n: usize) -> Vec<usize> {
    if n < MIN_BATCH_GROUP {
        return Vec::new();
    }
    if n == 5 {
        return vec![POD_CAPACITY];
    }
    let threes = match n % POD_CAPACITY {
        0 => 0,
        1 => 3,
        2 => 2,
        _ => 1,
    };
    let fours = (n - threes * MIN_BATCH_GROUP) / POD_CAPACITY;
    let mut sizes = vec![POD_CAPACITY; fours];
    sizes.extend(std::iter::repeat(MIN_BATCH_GROUP).take(threes));
    sizes
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rota_core::{FixedClock, RecordingNotifier};
    use rota_shared::{CommutePreference, PodStatus};
    use rota_store::MemoryStore;
    use rstest::rstest;
    use uuid::Uuid;

    const HOME: (f64, f64) = (1.3521, 103.8198);
    const WORK: (f64, f64) = (1.2839, 103.8515);

    fn fixture() -> (Arc<MemoryStore>, Matchmaker) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap()));
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            clock.clone(),
            Arc::new(RecordingNotifier::new()),
            StdRng::seed_from_u64(5),
        ));
        let matchmaker = Matchmaker::new(store.clone(), clock, scheduler);
        (store, matchmaker)
    }

    fn rotation_profile(home: (f64, f64), work: (f64, f64)) -> CommuteProfile {
        let home_key = GeoIndex::bucket(home.0, home.1).unwrap();
        let work_key = GeoIndex::bucket(work.0, work.1).unwrap();
        let match_key = GeoIndex::compose_key(&home_key, &work_key, "06:30");
        CommuteProfile::new(
            Uuid::new_v4(),
            CommutePreference::Rotation,
            home_key,
            work_key,
            "06:30".to_string(),
            match_key,
        )
    }

    async fn save_all(store: &MemoryStore, profiles: &[CommuteProfile]) {
        let mut tx = store.begin().await.unwrap();
        for p in profiles {
            tx.save_profile(p).await.unwrap();
        }
        tx.commit().await.unwrap();
    }

    async fn open_pod(store: &MemoryStore, key_owner: &CommuteProfile, members: usize, age_secs: i64) -> PodId {
        let created = Utc.with_ymd_and_hms(2026, 10, 1, 0, 0, 0).unwrap() + chrono::Duration::seconds(age_secs);
        let pod = Pod::new(
            key_owner.match_key.clone(),
            key_owner.home_key.clone(),
            key_owner.work_key.clone(),
            members < POD_CAPACITY,
            created,
        );
        let mut tx = store.begin().await.unwrap();
        tx.insert_pod(&pod).await.unwrap();
        for _ in 0..members {
            tx.insert_membership(&PodMembership::member(pod.id, Uuid::new_v4(), created))
                .await
                .unwrap();
        }
        tx.commit().await.unwrap();
        pod.id
    }

    #[rstest]
    #[case(0, vec![])]
    #[case(2, vec![])]
    #[case(3, vec![3])]
    #[case(4, vec![4])]
    #[case(5, vec![4])]
    #[case(6, vec![3, 3])]
    #[case(7, vec![4, 3])]
    #[case(8, vec![4, 4])]
    #[case(9, vec![3, 3, 3])]
    #[case(13, vec![4, 3, 3, 3])]
    fn test_partition_sizes(#[case] n: usize, #[case] expected: Vec<usize>) {
        assert_eq!(partition_sizes(n), expected);
    }

    #[tokio::test]
    async fn test_instant_match_prefers_exact_key() {
        let (store, matchmaker) = fixture();
        let user = rotation_profile(HOME, WORK);
        // Same work cell, home one cell over.
        let home_neighbor = GeoIndex::cell_neighbors(&user.home_key)
            .unwrap()
            .into_iter()
            .find(|hex| *hex != user.home_key)
            .unwrap();
        let mut near = user.clone();
        near.home_key = home_neighbor.clone();
        near.match_key = GeoIndex::compose_key(&home_neighbor, &user.work_key, "06:30");

        let older_neighbor_pod = open_pod(&store, &near, 2, 0).await;
        let exact_pod = open_pod(&store, &user, 3, 60).await;
        save_all(&store, &[user.clone()]).await;

        let result = matchmaker.attempt_instant_match(user.user_id, &user).await.unwrap();
        assert_eq!(result, InstantMatch::Joined { pod_id: exact_pod, now_full: true });

        let mut tx = store.begin().await.unwrap();
        assert!(!tx.get_pod(exact_pod).await.unwrap().unwrap().needs_replacement);
        assert!(tx.get_pod(older_neighbor_pod).await.unwrap().unwrap().needs_replacement);
    }

    #[tokio::test]
    async fn test_instant_match_uses_neighbor_key() {
        let (store, matchmaker) = fixture();
        let user = rotation_profile(HOME, WORK);
        let work_neighbor = GeoIndex::cell_neighbors(&user.work_key).unwrap()[3].clone();
        let mut near = user.clone();
        near.work_key = work_neighbor.clone();
        near.match_key = GeoIndex::compose_key(&user.home_key, &work_neighbor, "06:30");
        let pod_id = open_pod(&store, &near, 2, 0).await;

        let result = matchmaker.attempt_instant_match(user.user_id, &user).await.unwrap();
        assert_eq!(result, InstantMatch::Joined { pod_id, now_full: false });
    }

    #[tokio::test]
    async fn test_instant_match_ignores_far_pods_and_other_times() {
        let (store, matchmaker) = fixture();
        let user = rotation_profile(HOME, WORK);
        let far = rotation_profile((1.4400, 103.7000), WORK);
        let mut later = user.clone();
        later.match_key = GeoIndex::compose_key(&user.home_key, &user.work_key, "07:30");
        open_pod(&store, &far, 2, 0).await;
        open_pod(&store, &later, 2, 0).await;

        let result = matchmaker.attempt_instant_match(user.user_id, &user).await.unwrap();
        assert_eq!(result, InstantMatch::NoMatch);
    }

    #[tokio::test]
    async fn test_instant_match_skips_collapsed_pods() {
        let (store, matchmaker) = fixture();
        let user = rotation_profile(HOME, WORK);
        let pod_id = open_pod(&store, &user, 1, 0).await;
        {
            let mut tx = store.begin().await.unwrap();
            let mut pod = tx.get_pod(pod_id).await.unwrap().unwrap();
            pod.status = PodStatus::Collapsed;
            tx.update_pod(&pod).await.unwrap();
            tx.commit().await.unwrap();
        }

        let result = matchmaker.attempt_instant_match(user.user_id, &user).await.unwrap();
        assert_eq!(result, InstantMatch::NoMatch);
    }

    #[tokio::test]
    async fn test_full_pod_reports_capacity_race() {
        let (store, matchmaker) = fixture();
        let user = rotation_profile(HOME, WORK);
        // Flag was never cleared although the pod is full.
        let pod_id = open_pod(&store, &user, 4, 0).await;
        {
            let mut tx = store.begin().await.unwrap();
            let mut pod = tx.get_pod(pod_id).await.unwrap().unwrap();
            pod.needs_replacement = true;
            tx.update_pod(&pod).await.unwrap();
            tx.commit().await.unwrap();
        }

        let result = matchmaker.attempt_instant_match(user.user_id, &user).await;
        assert!(matches!(result, Err(CoreError::CapacityRace(id)) if id == pod_id));

        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.rotation_member_ids(pod_id).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_batch_creates_pods_per_exact_key() {
        let (store, matchmaker) = fixture();
        let trio: Vec<CommuteProfile> = (0..3).map(|_| rotation_profile(HOME, WORK)).collect();
        let pair: Vec<CommuteProfile> = (0..2).map(|_| rotation_profile((1.4400, 103.7000), WORK)).collect();
        save_all(&store, &trio).await;
        save_all(&store, &pair).await;

        let report = matchmaker.run_batch_clustering().await.unwrap();

        assert_eq!(report.candidates, 5);
        assert_eq!(report.pods_created.len(), 1);
        assert_eq!(report.left_unmatched, 2);
        assert_eq!(report.failed_groups, 0);

        let pod_id = report.pods_created[0];
        let mut tx = store.begin().await.unwrap();
        let pod = tx.get_pod(pod_id).await.unwrap().unwrap();
        assert!(pod.needs_replacement);
        assert_eq!(pod.match_key, trio[0].match_key);
        assert_eq!(tx.rotation_member_ids(pod_id).await.unwrap().len(), 3);
        let slots = tx.slots(pod_id).await.unwrap();
        assert_eq!(slots.len(), 5);
        for p in &trio {
            assert!(slots.iter().any(|s| s.driver_id == p.user_id));
        }
        assert_eq!(tx.unmatched_rotation_profiles().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_batch_splits_large_groups() {
        let (store, matchmaker) = fixture();
        let crowd: Vec<CommuteProfile> = (0..7).map(|_| rotation_profile(HOME, WORK)).collect();
        save_all(&store, &crowd).await;

        let report = matchmaker.run_batch_clustering().await.unwrap();
        assert_eq!(report.pods_created.len(), 2);
        assert_eq!(report.left_unmatched, 0);

        let mut tx = store.begin().await.unwrap();
        let mut sizes = Vec::new();
        for pod_id in &report.pods_created {
            let size = tx.rotation_member_ids(*pod_id).await.unwrap().len();
            let pod = tx.get_pod(*pod_id).await.unwrap().unwrap();
            assert_eq!(pod.needs_replacement, size < POD_CAPACITY);
            sizes.push(size);
        }
        sizes.sort();
        assert_eq!(sizes, vec![3, 4]);
    }

    #[tokio::test]
    async fn test_failed_group_leaves_sibling_groups_intact() {
        let (store, matchmaker) = fixture();
        let good: Vec<CommuteProfile> = (0..3).map(|_| rotation_profile(HOME, WORK)).collect();
        let broken: Vec<CommuteProfile> = (0..3)
            .map(|_| {
                let mut p = rotation_profile((1.4400, 103.7000), WORK);
                p.departure_time = "late".to_string();
                p
            })
            .collect();
        save_all(&store, &good).await;
        save_all(&store, &broken).await;

        let report = matchmaker.run_batch_clustering().await.unwrap();

        assert_eq!(report.candidates, 6);
        assert_eq!(report.failed_groups, 1);
        assert_eq!(report.pods_created.len(), 1);
        assert_eq!(report.left_unmatched, 3);

        let mut tx = store.begin().await.unwrap();
        let pod = tx.get_pod(report.pods_created[0]).await.unwrap().unwrap();
        assert_eq!(pod.match_key, good[0].match_key);
        assert_eq!(tx.slots(pod.id).await.unwrap().len(), 5);
        // The failed group's pod and seats were rolled back.
        let mut waiting: Vec<UserId> = tx
            .unmatched_rotation_profiles()
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.user_id)
            .collect();
        let mut expected: Vec<UserId> = broken.iter().map(|p| p.user_id).collect();
        waiting.sort();
        expected.sort();
        assert_eq!(waiting, expected);
        assert!(tx.open_pods_for_keys(&[broken[0].match_key.clone()]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_batch_is_not_reentrant() {
        let (_, matchmaker) = fixture();
        let _held = matchmaker.batch_running.try_lock().unwrap();

        let result = matchmaker.run_batch_clustering().await;
        assert!(matches!(result, Err(CoreError::JobAlreadyRunning(_))));
    }

    #[tokio::test]
    async fn test_batch_rerun_finds_nothing_new() {
        let (store, matchmaker) = fixture();
        let trio: Vec<CommuteProfile> = (0..3).map(|_| rotation_profile(HOME, WORK)).collect();
        save_all(&store, &trio).await;

        matchmaker.run_batch_clustering().await.unwrap();
        let again = matchmaker.run_batch_clustering().await.unwrap();
        assert_eq!(again, BatchReport::default());
    }
}
