//! Spatial-temporal bucketing for commute matching.
//!
//! Coordinates are snapped to H3 cells at resolution 7 (hexagons roughly
//! 1.2 km across). A match key joins the home cell, the work cell and the
//! canonical departure time, so commuters on the same corridor at the same
//! time collide on the same string.

use chrono::NaiveTime;
use h3o::{CellIndex, LatLng, Resolution};

use crate::{CoreError, CoreResult};

pub const MATCH_RESOLUTION: Resolution = Resolution::Seven;

/// Pure functions over the hex grid. Holds no state and needs no locking.
pub struct GeoIndex;

impl GeoIndex {
    /// Hex cell containing the point.
    pub fn bucket(lat: f64, lng: f64) -> CoreResult<String> {
        Ok(Self::cell(lat, lng)?.to_string())
    }

    /// The cell containing the point and its adjacent cells: seven in
    /// general, six when the cell is one of the twelve pentagons of the grid.
    pub fn neighbors(lat: f64, lng: f64) -> CoreResult<Vec<String>> {
        Ok(Self::disk(Self::cell(lat, lng)?))
    }

    /// Same as [`GeoIndex::neighbors`] but starting from a stored hex id.
    pub fn cell_neighbors(hex: &str) -> CoreResult<Vec<String>> {
        let cell = hex
            .parse::<CellIndex>()
            .map_err(|e| CoreError::InvalidCoordinates(format!("{}: {}", hex, e)))?;
        Ok(Self::disk(cell))
    }

    /// `{homeHex}_{workHex}_{HH:mm}`.
    pub fn match_key(
        home_lat: f64,
        home_lng: f64,
        work_lat: f64,
        work_lng: f64,
        departure_time: &str,
    ) -> CoreResult<String> {
        let home = Self::bucket(home_lat, home_lng)?;
        let work = Self::bucket(work_lat, work_lng)?;
        let time = Self::canonical_time(departure_time)?;
        Ok(Self::compose_key(&home, &work, &time))
    }

    /// Cross product of the home and work neighbor sets (7 x 7 = 49 keys).
    ///
    /// A pentagon endpoint has only six cells in its disk, which yields 42
    /// keys (36 if both ends are pentagons). Keys are not deduplicated;
    /// callers that build a lookup set must do so.
    pub fn neighboring_keys(
        home_lat: f64,
        home_lng: f64,
        work_lat: f64,
        work_lng: f64,
        departure_time: &str,
    ) -> CoreResult<Vec<String>> {
        let home = Self::neighbors(home_lat, home_lng)?;
        let work = Self::neighbors(work_lat, work_lng)?;
        let time = Self::canonical_time(departure_time)?;
        Ok(Self::cross_keys(&home, &work, &time))
    }

    /// Neighboring keys computed from the buckets already stored on a profile.
    pub fn neighboring_keys_for_cells(
        home_hex: &str,
        work_hex: &str,
        departure_time: &str,
    ) -> CoreResult<Vec<String>> {
        let home = Self::cell_neighbors(home_hex)?;
        let work = Self::cell_neighbors(work_hex)?;
        let time = Self::canonical_time(departure_time)?;
        Ok(Self::cross_keys(&home, &work, &time))
    }

    /// Trims and normalises a departure time to `HH:mm`.
    pub fn canonical_time(raw: &str) -> CoreResult<String> {
        let trimmed = raw.trim();
        let time = NaiveTime::parse_from_str(trimmed, "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(trimmed, "%H:%M:%S"))
            .map_err(|_| CoreError::InvalidDepartureTime(raw.to_string()))?;
        Ok(time.format("%H:%M").to_string())
    }

    pub fn compose_key(home_hex: &str, work_hex: &str, time: &str) -> String {
        format!("{}_{}_{}", home_hex, work_hex, time)
    }

    fn cell(lat: f64, lng: f64) -> CoreResult<CellIndex> {
        let point = LatLng::new(lat, lng)
            .map_err(|e| CoreError::InvalidCoordinates(format!("({}, {}): {}", lat, lng, e)))?;
        Ok(point.to_cell(MATCH_RESOLUTION))
    }

    fn disk(center: CellIndex) -> Vec<String> {
        center
            .grid_disk::<Vec<_>>(1)
            .into_iter()
            .map(|cell| cell.to_string())
            .collect()
    }

    fn cross_keys(home: &[String], work: &[String], time: &str) -> Vec<String> {
        let mut keys = Vec::with_capacity(home.len() * work.len());
        for h in home {
            for w in work {
                keys.push(Self::compose_key(h, w, time));
            }
        }
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::collections::HashSet;

    // Accra: Madina to Airport City.
    const HOME: (f64, f64) = (5.6819, -0.1676);
    const WORK: (f64, f64) = (5.6052, -0.1718);

    #[test]
    fn test_match_key_is_pure() {
        let a = GeoIndex::match_key(HOME.0, HOME.1, WORK.0, WORK.1, "06:30").unwrap();
        let b = GeoIndex::match_key(HOME.0, HOME.1, WORK.0, WORK.1, "06:30").unwrap();
        assert_eq!(a, b);

        let home = GeoIndex::bucket(HOME.0, HOME.1).unwrap();
        let work = GeoIndex::bucket(WORK.0, WORK.1).unwrap();
        assert_eq!(a, format!("{}_{}_06:30", home, work));
    }

    #[test]
    fn test_pentagon_cell_has_short_disk() {
        let pentagon = MATCH_RESOLUTION.pentagons().next().unwrap().to_string();
        let regular = GeoIndex::bucket(HOME.0, HOME.1).unwrap();

        assert_eq!(GeoIndex::cell_neighbors(&pentagon).unwrap().len(), 6);
        let one_end = GeoIndex::neighboring_keys_for_cells(&pentagon, &regular, "06:30").unwrap();
        assert_eq!(one_end.len(), 42);
        let both_ends = GeoIndex::neighboring_keys_for_cells(&pentagon, &pentagon, "06:30").unwrap();
        assert_eq!(both_ends.len(), 36);
    }

    #[test]
    fn test_neighboring_keys_has_49_entries() {
        let keys = GeoIndex::neighboring_keys(HOME.0, HOME.1, WORK.0, WORK.1, "06:30").unwrap();
        assert_eq!(keys.len(), 49);

        let exact = GeoIndex::match_key(HOME.0, HOME.1, WORK.0, WORK.1, "06:30").unwrap();
        assert!(keys.contains(&exact));
    }

    #[test]
    fn test_neighbors_are_center_plus_six() {
        let center = GeoIndex::bucket(HOME.0, HOME.1).unwrap();
        let ring = GeoIndex::neighbors(HOME.0, HOME.1).unwrap();
        let unique: HashSet<_> = ring.iter().collect();
        assert_eq!(unique.len(), 7);
        assert!(ring.contains(&center));
    }

    #[test]
    fn test_cell_neighbors_match_coordinate_neighbors() {
        let home = GeoIndex::bucket(HOME.0, HOME.1).unwrap();
        let work = GeoIndex::bucket(WORK.0, WORK.1).unwrap();

        let from_coords = GeoIndex::neighboring_keys(HOME.0, HOME.1, WORK.0, WORK.1, "06:30:00").unwrap();
        let from_cells = GeoIndex::neighboring_keys_for_cells(&home, &work, "06:30").unwrap();
        assert_eq!(from_coords, from_cells);
    }

    #[rstest]
    #[case(" 06:30 ", "06:30")]
    #[case("07:05:00", "07:05")]
    #[case("18:45", "18:45")]
    fn test_canonical_time(#[case] raw: &str, #[case] expected: &str) {
        assert_eq!(GeoIndex::canonical_time(raw).unwrap(), expected);
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(matches!(
            GeoIndex::canonical_time("half six"),
            Err(CoreError::InvalidDepartureTime(_))
        ));
        assert!(matches!(
            GeoIndex::bucket(f64::NAN, 0.0),
            Err(CoreError::InvalidCoordinates(_))
        ));
        assert!(GeoIndex::cell_neighbors("not-a-cell").is_err());
    }
}
