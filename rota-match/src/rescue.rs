use std::sync::Arc;

use rota_core::{CoreResult, GeoIndex, Store};
use rota_shared::{CommuteProfile, UserId};
use tracing::info;

/// CARPOOL commuters living in or next to the cell of a broken-down trip.
pub async fn rescue_candidates(
    store: &Arc<dyn Store>,
    lat: f64,
    lng: f64,
    aborted_driver: UserId,
) -> CoreResult<Vec<CommuteProfile>> {
    let cells = GeoIndex::neighbors(lat, lng)?;

    let mut tx = store.begin().await?;
    let candidates: Vec<CommuteProfile> = tx
        .carpool_profiles_in_cells(&cells)
        .await?
        .into_iter()
        .filter(|p| p.user_id != aborted_driver)
        .collect();
    tx.commit().await?;

    info!(driver_id = %aborted_driver, candidates = candidates.len(), "Rescue candidates found");
    Ok(candidates)
}
