use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::{UnknownVariant, UserId};

/// How a commuter wants to travel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommutePreference {
    /// Fixed carpool pairing, no driving duty.
    Carpool,
    /// Opted into a pod's weekly driving rotation.
    Rotation,
}

impl CommutePreference {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommutePreference::Carpool => "CARPOOL",
            CommutePreference::Rotation => "ROTATION",
        }
    }
}

impl FromStr for CommutePreference {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CARPOOL" => Ok(CommutePreference::Carpool),
            "ROTATION" => Ok(CommutePreference::Rotation),
            other => Err(UnknownVariant {
                kind: "commute preference",
                value: other.to_string(),
            }),
        }
    }
}

/// A commuter's travel preference, spatial buckets, leave state and strikes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommuteProfile {
    pub user_id: UserId,
    pub preference: CommutePreference,
    pub home_key: String,
    pub work_key: String,
    /// Canonical `HH:mm`.
    pub departure_time: String,
    pub match_key: String,
    pub is_on_leave: bool,
    pub leave_start: Option<NaiveDate>,
    pub leave_end: Option<NaiveDate>,
    pub open_to_suggestions: bool,
    pub strikes: i32,
}

impl CommuteProfile {
    pub fn new(
        user_id: UserId,
        preference: CommutePreference,
        home_key: String,
        work_key: String,
        departure_time: String,
        match_key: String,
    ) -> Self {
        Self {
            user_id,
            preference,
            home_key,
            work_key,
            departure_time,
            match_key,
            is_on_leave: false,
            leave_start: None,
            leave_end: None,
            open_to_suggestions: true,
            strikes: 0,
        }
    }

    /// Caller guarantees `start <= end`.
    pub fn start_leave(&mut self, start: NaiveDate, end: NaiveDate) {
        self.is_on_leave = true;
        self.leave_start = Some(start);
        self.leave_end = Some(end);
    }

    pub fn end_leave(&mut self) {
        self.is_on_leave = false;
        self.leave_start = None;
        self.leave_end = None;
    }

    /// Leave has run out as of `today` (inclusive of the end date).
    pub fn leave_elapsed(&self, today: NaiveDate) -> bool {
        self.is_on_leave && self.leave_end.is_some_and(|end| end <= today)
    }

    /// Forced out of rotation mode after too many strikes.
    pub fn suspend_from_rotation(&mut self) {
        self.preference = CommutePreference::Carpool;
        self.open_to_suggestions = false;
    }
}
