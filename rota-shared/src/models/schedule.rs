use std::str::FromStr;

use chrono::Weekday;
use serde::{Deserialize, Serialize};

use crate::{PodId, UnknownVariant, UserId};

/// The five fixed working days a pod rotates over.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Workday {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
}

impl Workday {
    pub const ALL: [Workday; 5] = [
        Workday::Monday,
        Workday::Tuesday,
        Workday::Wednesday,
        Workday::Thursday,
        Workday::Friday,
    ];

    /// `None` for Saturday and Sunday.
    pub fn from_weekday(day: Weekday) -> Option<Self> {
        match day {
            Weekday::Mon => Some(Workday::Monday),
            Weekday::Tue => Some(Workday::Tuesday),
            Weekday::Wed => Some(Workday::Wednesday),
            Weekday::Thu => Some(Workday::Thursday),
            Weekday::Fri => Some(Workday::Friday),
            Weekday::Sat | Weekday::Sun => None,
        }
    }

    /// Position in the working week, Monday = 0.
    pub fn index(&self) -> usize {
        *self as usize
    }

    /// Workdays strictly after this one, up to Friday.
    pub fn remaining_after(&self) -> &'static [Workday] {
        &Self::ALL[self.index() + 1..]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Workday::Monday => "MONDAY",
            Workday::Tuesday => "TUESDAY",
            Workday::Wednesday => "WEDNESDAY",
            Workday::Thursday => "THURSDAY",
            Workday::Friday => "FRIDAY",
        }
    }
}

impl FromStr for Workday {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Workday::ALL
            .into_iter()
            .find(|day| day.as_str() == s)
            .ok_or_else(|| UnknownVariant {
                kind: "workday",
                value: s.to_string(),
            })
    }
}

/// One weekday's driver assignment for a pod. At most one per `(pod_id, day)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScheduleSlot {
    pub pod_id: PodId,
    pub day: Workday,
    pub driver_id: UserId,
    /// Canonical `HH:mm`.
    pub departure_time: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remaining_after() {
        assert_eq!(
            Workday::Tuesday.remaining_after(),
            &[Workday::Wednesday, Workday::Thursday, Workday::Friday]
        );
        assert!(Workday::Friday.remaining_after().is_empty());
    }

    #[test]
    fn test_weekend_is_not_a_workday() {
        assert_eq!(Workday::from_weekday(Weekday::Sat), None);
        assert_eq!(Workday::from_weekday(Weekday::Wed), Some(Workday::Wednesday));
        assert_eq!("THURSDAY".parse::<Workday>().unwrap(), Workday::Thursday);
    }
}
