use super::notification::NotificationChannel;
use super::user::UserRole;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Marker stored in place of a password when the registrant left it blank.
pub const PASSWORD_PENDING_APPROVAL: &str = "PENDING_APPROVAL";

// --- Roles & Status ---

/// Roles that go through the admin approval queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistrationRole {
    Driver,
    Owner,
}

impl RegistrationRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistrationRole::Driver => "driver",
            RegistrationRole::Owner => "owner",
        }
    }
}

impl From<RegistrationRole> for UserRole {
    fn from(role: RegistrationRole) -> Self {
        match role {
            RegistrationRole::Driver => UserRole::Driver,
            RegistrationRole::Owner => UserRole::Owner,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RegistrationStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
}

impl RegistrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistrationStatus::Pending => "pending",
            RegistrationStatus::Approved => "approved",
            RegistrationStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RegistrationStatus::Pending),
            "approved" => Some(RegistrationStatus::Approved),
            "rejected" => Some(RegistrationStatus::Rejected),
            _ => None,
        }
    }
}

// --- Profile data ---

/// Applicant-supplied attributes. Known fields are typed; anything else the
/// client sends is kept verbatim in `extra` and forwarded to the identity provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistrationProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experience: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_bool",
        skip_serializing_if = "Option::is_none"
    )]
    pub owns_tartanilla: Option<bool>,
    #[serde(
        default,
        deserialize_with = "lenient_bool",
        skip_serializing_if = "Option::is_none"
    )]
    pub drives_own_tartanilla: Option<bool>,
    #[serde(
        default,
        deserialize_with = "lenient_bool",
        skip_serializing_if = "Option::is_none"
    )]
    pub also_drives: Option<bool>,
    #[serde(
        default,
        deserialize_with = "lenient_count",
        skip_serializing_if = "Option::is_none"
    )]
    pub owned_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_notification: Option<NotificationChannel>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RegistrationProfile {
    pub fn full_name(&self) -> Option<String> {
        let first = self.first_name.as_deref().unwrap_or("").trim();
        let last = self.last_name.as_deref().unwrap_or("").trim();
        let joined = format!("{first} {last}").trim().to_string();
        if joined.is_empty() { None } else { Some(joined) }
    }
}

/// Accepts JSON booleans as well as the loose forms mobile clients send
/// ("yes", "1", 1, ...). Anything unrecognised reads as `false`.
fn lenient_bool<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| match v {
        Value::Null => None,
        Value::Bool(b) => Some(b),
        Value::Number(n) => Some(n.as_f64().is_some_and(|f| f == 1.0)),
        Value::String(s) => Some(matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "y"
        )),
        _ => Some(false),
    }))
}

/// Accepts integers or numeric strings. Blank, negative or unparseable input reads as 0.
fn lenient_count<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| match v {
        Value::Null => None,
        Value::Number(n) => Some(n.as_i64().map_or(0, clamp_count)),
        Value::String(s) if s.trim().is_empty() => Some(0),
        Value::String(s) => Some(s.trim().parse::<i64>().map_or(0, clamp_count)),
        _ => Some(0),
    }))
}

fn clamp_count(n: i64) -> u32 {
    u32::try_from(n.max(0)).unwrap_or(u32::MAX)
}

/// Applies the driver-owner combination rule. Approval and every display of a
/// pending application go through this one function.
pub fn resolve_final_role(role: RegistrationRole, profile: &RegistrationProfile) -> UserRole {
    let also_owns =
        profile.owns_tartanilla.unwrap_or(false) || profile.owned_count.unwrap_or(0) > 0;
    let also_drives =
        profile.drives_own_tartanilla.unwrap_or(false) || profile.also_drives.unwrap_or(false);

    match role {
        RegistrationRole::Driver if also_owns => UserRole::DriverOwner,
        RegistrationRole::Owner if also_drives => UserRole::DriverOwner,
        other => other.into(),
    }
}

// --- Entity ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRegistration {
    pub id: Uuid,
    pub email: String,
    pub phone: Option<String>,
    pub role: RegistrationRole,
    pub status: RegistrationStatus,
    #[serde(skip_serializing, default)]
    pub password: Option<String>,
    pub profile: RegistrationProfile,
    pub created_at: DateTime<Utc>,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub user_id: Option<Uuid>,
    pub rejected_by: Option<String>,
    pub rejected_at: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
}

/// Fields written by the conditional `pending -> approved` transition.
#[derive(Debug, Clone)]
pub struct ApprovalDecision {
    pub approved_by: String,
    pub approved_at: DateTime<Utc>,
    pub user_id: Uuid,
}

/// Fields written by the conditional `pending -> rejected` transition.
#[derive(Debug, Clone)]
pub struct RejectionDecision {
    pub rejected_by: String,
    pub rejected_at: DateTime<Utc>,
    pub reason: String,
}

impl PendingRegistration {
    pub fn new(
        email: String,
        phone: Option<String>,
        role: RegistrationRole,
        password: Option<String>,
        profile: RegistrationProfile,
    ) -> Self {
        let password = match password {
            Some(p) if !p.trim().is_empty() => p,
            _ => PASSWORD_PENDING_APPROVAL.to_string(),
        };
        Self {
            id: Uuid::new_v4(),
            email,
            phone,
            role,
            status: RegistrationStatus::Pending,
            password: Some(password),
            profile,
            created_at: Utc::now(),
            approved_by: None,
            approved_at: None,
            user_id: None,
            rejected_by: None,
            rejected_at: None,
            rejection_reason: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == RegistrationStatus::Pending
    }

    /// The password the registrant chose, if any. `None` means one must be generated.
    pub fn supplied_password(&self) -> Option<&str> {
        match self.password.as_deref() {
            Some(p) if !p.trim().is_empty() && p != PASSWORD_PENDING_APPROVAL => Some(p),
            _ => None,
        }
    }

    pub fn final_role(&self) -> UserRole {
        resolve_final_role(self.role, &self.profile)
    }

    /// Phone on the record, falling back to one supplied inside the profile bag.
    pub fn contact_phone(&self) -> Option<&str> {
        self.phone
            .as_deref()
            .or_else(|| self.profile.extra.get("phone").and_then(Value::as_str))
            .filter(|p| !p.trim().is_empty())
    }

    /// A decided registration no longer holds the applicant's password.
    pub fn apply_approval(&mut self, decision: &ApprovalDecision) {
        self.status = RegistrationStatus::Approved;
        self.password = None;
        self.approved_by = Some(decision.approved_by.clone());
        self.approved_at = Some(decision.approved_at);
        self.user_id = Some(decision.user_id);
    }

    pub fn apply_rejection(&mut self, decision: &RejectionDecision) {
        self.status = RegistrationStatus::Rejected;
        self.password = None;
        self.rejected_by = Some(decision.rejected_by.clone());
        self.rejected_at = Some(decision.rejected_at);
        self.rejection_reason = Some(decision.reason.clone());
    }
}
