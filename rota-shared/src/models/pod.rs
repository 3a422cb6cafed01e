use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{PodId, UnknownVariant, UserId};

/// Lifecycle of a pod as a rotation unit.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PodStatus {
    Active,
    /// Fell below two members; has no schedule and is never offered to new joiners.
    Collapsed,
}

impl PodStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PodStatus::Active => "ACTIVE",
            PodStatus::Collapsed => "COLLAPSED",
        }
    }
}

impl FromStr for PodStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(PodStatus::Active),
            "COLLAPSED" => Ok(PodStatus::Collapsed),
            other => Err(UnknownVariant {
                kind: "pod status",
                value: other.to_string(),
            }),
        }
    }
}

/// One carpool group sharing a commute corridor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Pod {
    pub id: PodId,
    pub name: String,
    pub match_key: String,
    /// Home hex of the corridor.
    pub origin: String,
    /// Work hex of the corridor.
    pub destination: String,
    pub needs_replacement: bool,
    pub status: PodStatus,
    pub created_at: DateTime<Utc>,
}

impl Pod {
    pub fn new(
        match_key: String,
        origin: String,
        destination: String,
        needs_replacement: bool,
        now: DateTime<Utc>,
    ) -> Self {
        let name = format!("{} to {} Pod", origin, destination);
        Self {
            id: Uuid::new_v4(),
            name,
            match_key,
            origin,
            destination,
            needs_replacement,
            status: PodStatus::Active,
            created_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == PodStatus::Active
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PodRole {
    Member,
    Admin,
    /// Temporary seat-filler; never enters the driving rotation.
    Guest,
}

impl PodRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            PodRole::Member => "MEMBER",
            PodRole::Admin => "ADMIN",
            PodRole::Guest => "GUEST",
        }
    }
}

impl FromStr for PodRole {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MEMBER" => Ok(PodRole::Member),
            "ADMIN" => Ok(PodRole::Admin),
            "GUEST" => Ok(PodRole::Guest),
            other => Err(UnknownVariant {
                kind: "pod role",
                value: other.to_string(),
            }),
        }
    }
}

/// Relates a user to a pod. `(pod_id, user_id)` is unique.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PodMembership {
    pub pod_id: PodId,
    pub user_id: UserId,
    pub role: PodRole,
    pub joined_at: DateTime<Utc>,
    /// Only set for guests.
    pub expires_at: Option<DateTime<Utc>>,
}

impl PodMembership {
    pub fn member(pod_id: PodId, user_id: UserId, now: DateTime<Utc>) -> Self {
        Self {
            pod_id,
            user_id,
            role: PodRole::Member,
            joined_at: now,
            expires_at: None,
        }
    }

    pub fn guest(pod_id: PodId, user_id: UserId, now: DateTime<Utc>, expires_at: DateTime<Utc>) -> Self {
        Self {
            pod_id,
            user_id,
            role: PodRole::Guest,
            joined_at: now,
            expires_at: Some(expires_at),
        }
    }

    pub fn is_guest(&self) -> bool {
        self.role == PodRole::Guest
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.is_guest() && self.expires_at.is_some_and(|at| at <= now)
    }
}
