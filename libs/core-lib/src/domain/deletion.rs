use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Grace period between a deletion request and the actual purge.
pub const DELETION_GRACE_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeletionStatus {
    Scheduled,
    Cancelled,
}

impl DeletionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeletionStatus::Scheduled => "scheduled",
            DeletionStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(DeletionStatus::Scheduled),
            "cancelled" => Some(DeletionStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountDeletionRequest {
    pub id: Uuid,
    pub user_id: Uuid,
    pub status: DeletionStatus,
    pub reason: Option<String>,
    pub requested_at: DateTime<Utc>,
    pub scheduled_deletion_at: DateTime<Utc>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl AccountDeletionRequest {
    pub fn schedule(user_id: Uuid, reason: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            status: DeletionStatus::Scheduled,
            reason,
            requested_at: now,
            scheduled_deletion_at: now + Duration::days(DELETION_GRACE_DAYS),
            cancelled_at: None,
        }
    }

    pub fn days_remaining(&self, now: DateTime<Utc>) -> i64 {
        let secs = (self.scheduled_deletion_at - now).num_seconds().max(0);
        (secs + 86_399) / 86_400
    }
}
