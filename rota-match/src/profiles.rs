//! Commute registration: derive the buckets, store the profile, try to
//! place a ROTATION commuter straight away.

use std::sync::Arc;

use rota_core::{CoreError, CoreResult, GeoIndex, Store};
use rota_shared::{CommutePreference, CommuteProfile, UserId};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::matchmaker::{InstantMatch, Matchmaker};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommuteRequest {
    pub user_id: UserId,
    pub preference: CommutePreference,
    pub home_lat: f64,
    pub home_lng: f64,
    pub work_lat: f64,
    pub work_lng: f64,
    pub departure_time: String,
}

#[derive(Debug, Clone)]
pub struct Registration {
    pub profile: CommuteProfile,
    /// `None` when no instant match was attempted.
    pub instant: Option<InstantMatch>,
}

pub struct ProfileService {
    store: Arc<dyn Store>,
    matchmaker: Arc<Matchmaker>,
}

impl ProfileService {
    pub fn new(store: Arc<dyn Store>, matchmaker: Arc<Matchmaker>) -> Self {
        Self { store, matchmaker }
    }

    /// Upserts the profile. Leave and strike state survive re-registration.
    pub async fn register_commute(&self, request: CommuteRequest) -> CoreResult<Registration> {
        let home_key = GeoIndex::bucket(request.home_lat, request.home_lng)?;
        let work_key = GeoIndex::bucket(request.work_lat, request.work_lng)?;
        let departure_time = GeoIndex::canonical_time(&request.departure_time)?;
        let match_key = GeoIndex::compose_key(&home_key, &work_key, &departure_time);

        let mut tx = self.store.begin().await?;
        let profile = match tx.get_profile(request.user_id).await? {
            Some(mut existing) => {
                existing.preference = request.preference;
                existing.home_key = home_key;
                existing.work_key = work_key;
                existing.departure_time = departure_time;
                existing.match_key = match_key;
                existing
            }
            None => CommuteProfile::new(
                request.user_id,
                request.preference,
                home_key,
                work_key,
                departure_time,
                match_key,
            ),
        };
        tx.save_profile(&profile).await?;
        let in_pod = tx.rotation_membership(request.user_id).await?.is_some();
        tx.commit().await?;

        info!(user_id = %profile.user_id, match_key = %profile.match_key, "Commute registered");

        if profile.preference != CommutePreference::Rotation || in_pod {
            return Ok(Registration {
                profile,
                instant: None,
            });
        }

        let instant = match self
            .matchmaker
            .attempt_instant_match(profile.user_id, &profile)
            .await
        {
            Ok(result) => result,
            Err(CoreError::CapacityRace(pod_id)) => {
                warn!(user_id = %profile.user_id, pod_id = %pod_id, "Instant match lost a race; waiting for batch");
                InstantMatch::NoMatch
            }
            Err(e) => return Err(e),
        };

        Ok(Registration {
            profile,
            instant: Some(instant),
        })
    }
}
