use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// --- Roles ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UserRole {
    Admin,
    Tourist,
    Owner,
    Driver,
    DriverOwner,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Admin => "admin",
            UserRole::Tourist => "tourist",
            UserRole::Owner => "owner",
            UserRole::Driver => "driver",
            UserRole::DriverOwner => "driver-owner",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Some(UserRole::Admin),
            "tourist" => Some(UserRole::Tourist),
            "owner" => Some(UserRole::Owner),
            "driver" => Some(UserRole::Driver),
            "driver-owner" | "driver_owner" => Some(UserRole::DriverOwner),
            _ => None,
        }
    }

    /// Whether an account with this role may sign in through a client that only
    /// accepts `allowed`. A driver-owner satisfies either half.
    pub fn satisfies(&self, allowed: &[UserRole]) -> bool {
        allowed.iter().any(|a| {
            a == self
                || (*self == UserRole::DriverOwner
                    && matches!(a, UserRole::Driver | UserRole::Owner))
        })
    }
}

impl std::fmt::Display for UserRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// --- Status ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    #[default]
    Active,
    Suspended,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::Suspended => "suspended",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(AccountStatus::Active),
            "suspended" => Some(AccountStatus::Suspended),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suspension {
    pub reason: String,
    pub suspended_by: String,
    pub suspended_at: DateTime<Utc>,
    /// `None` means the suspension never lapses on its own.
    pub suspended_until: Option<DateTime<Utc>>,
}

/// What the login gate sees when it looks at a user's suspension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspensionState {
    NotSuspended,
    Permanent,
    Temporary { remaining_days: i64 },
    Expired,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub name: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub bio: Option<String>,
    pub profile_photo_url: Option<String>,
}

// --- Entity ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub role: UserRole,
    pub status: AccountStatus,
    pub suspension: Option<Suspension>,
    pub force_password_change: bool,
    pub pending_deletion: bool,
    pub profile: UserProfile,
    pub registration_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn new(id: Uuid, email: String, role: UserRole) -> Self {
        let now = Utc::now();
        Self {
            id,
            email,
            role,
            status: AccountStatus::Active,
            suspension: None,
            force_password_change: false,
            pending_deletion: false,
            profile: UserProfile::default(),
            registration_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn suspension_state(&self, now: DateTime<Utc>) -> SuspensionState {
        if self.status != AccountStatus::Suspended {
            return SuspensionState::NotSuspended;
        }
        match self.suspension.as_ref().and_then(|s| s.suspended_until) {
            None => SuspensionState::Permanent,
            Some(until) if until <= now => SuspensionState::Expired,
            Some(until) => SuspensionState::Temporary {
                remaining_days: remaining_days(until - now),
            },
        }
    }

    pub fn suspend(&mut self, suspension: Suspension) {
        self.status = AccountStatus::Suspended;
        self.updated_at = suspension.suspended_at;
        self.suspension = Some(suspension);
    }

    pub fn reactivate(&mut self, now: DateTime<Utc>) {
        self.status = AccountStatus::Active;
        self.suspension = None;
        self.updated_at = now;
    }
}

/// Whole days left, rounded up, so "suspended for another 3 hours" reads as 1 day.
fn remaining_days(left: Duration) -> i64 {
    let secs = left.num_seconds().max(0);
    (secs + 86_399) / 86_400
}
