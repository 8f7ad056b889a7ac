use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{error::Error as StdError, future::Future};
use uuid::Uuid;

pub mod adapters;
pub mod domain;

use domain::audit::AuditLogEntry;
use domain::deletion::AccountDeletionRequest;
use domain::device::{DeviceVerificationRequest, TrustedDevice};
use domain::registration::{
    ApprovalDecision, PendingRegistration, RegistrationStatus, RejectionDecision,
};
use domain::user::{Suspension, User, UserRole};

// Common error type for the core library
#[derive(thiserror::Error, Debug)]
pub enum CoreError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Upstream error: {0}")]
    Upstream(String),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Infrastructure error: {0}")]
    Infrastructure(#[from] Box<dyn StdError + Send + Sync>),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Internal(format!("JSON error: {err}"))
    }
}

/// Typed failures from the external identity backend. Adapters normalize whatever
/// the provider returns into one of these.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("An account with this email already exists")]
    AlreadyExists,
    #[error("Invalid email or password")]
    InvalidCredentials,
    #[error("Email address has not been confirmed")]
    EmailUnconfirmed,
    #[error("Password rejected by identity provider: {0}")]
    WeakPassword(String),
    #[error("Request rejected by identity provider: {0}")]
    InvalidInput(String),
    #[error("Token is invalid or expired")]
    InvalidToken,
    #[error("Account not found")]
    NotFound,
    #[error("Too many requests")]
    RateLimited,
    #[error("Network error: {0}")]
    Network(String),
    #[error("Request timed out")]
    Timeout,
    #[error("Unexpected identity provider response: {0}")]
    Unexpected(String),
}

impl IdentityError {
    /// Only transport-level failures are worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, IdentityError::Network(_) | IdentityError::Timeout)
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum NotificationError {
    #[error("{0} channel is not configured")]
    NotConfigured(&'static str),
    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),
    #[error("Provider rejected message: {0}")]
    Rejected(String),
    #[error("Transport failure: {0}")]
    Transport(String),
}

// --- Commands ---

// Marker trait for commands
pub trait Command: Send + Sync + 'static {}

// Port for handling commands
pub trait CommandHandler<C: Command>: Send + Sync {
    type Output: Send;
    type Error: From<CoreError> + Send;

    fn handle(
        &self,
        command: C,
    ) -> impl Future<Output = Result<Self::Output, Self::Error>> + Send;
}

// --- Persistence ports ---

#[async_trait]
pub trait RegistrationStore: Send + Sync {
    /// Fails with `Conflict` when the email (case-insensitive) or phone is already
    /// used by any registration or user.
    async fn insert_registration(&self, registration: PendingRegistration) -> Result<(), CoreError>;

    async fn get_registration(&self, id: Uuid) -> Result<Option<PendingRegistration>, CoreError>;

    async fn list_registrations(
        &self,
        status: RegistrationStatus,
    ) -> Result<Vec<PendingRegistration>, CoreError>;

    /// Conditional `pending -> approved`. `Ok(false)` when the record was no longer pending.
    async fn mark_approved(&self, id: Uuid, decision: &ApprovalDecision)
    -> Result<bool, CoreError>;

    /// Conditional `pending -> rejected`. `Ok(false)` when the record was no longer pending.
    async fn mark_rejected(
        &self,
        id: Uuid,
        decision: &RejectionDecision,
    ) -> Result<bool, CoreError>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    /// Fails with `Conflict` if the email or phone is taken by another user, or
    /// by a registration other than the one this user was approved from.
    async fn insert_user(&self, user: User) -> Result<(), CoreError>;

    async fn get_user(&self, id: Uuid) -> Result<Option<User>, CoreError>;

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, CoreError>;

    // Each mutation below touches only its own columns.

    async fn suspend_user(&self, id: Uuid, suspension: &Suspension) -> Result<(), CoreError>;

    /// Conditional `suspended -> active`. `Ok(false)` if the user was not suspended.
    async fn lift_suspension(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, CoreError>;

    async fn set_pending_deletion(
        &self,
        id: Uuid,
        pending: bool,
        at: DateTime<Utc>,
    ) -> Result<(), CoreError>;

    async fn set_force_password_change(
        &self,
        id: Uuid,
        required: bool,
        at: DateTime<Utc>,
    ) -> Result<(), CoreError>;

    /// Conditional `suspended (expired) -> active`. `Ok(false)` if another
    /// request already reactivated the account or the suspension is still running.
    async fn clear_expired_suspension(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError>;

    /// Counts suspended accounts too.
    async fn any_user_with_role(&self, role: UserRole) -> Result<bool, CoreError>;
}

#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn find_trusted(
        &self,
        user_id: Uuid,
        fingerprint: &str,
    ) -> Result<Option<TrustedDevice>, CoreError>;

    async fn touch_last_seen(
        &self,
        user_id: Uuid,
        fingerprint: &str,
        at: DateTime<Utc>,
    ) -> Result<(), CoreError>;

    async fn upsert_trusted(&self, device: TrustedDevice) -> Result<(), CoreError>;

    async fn insert_verification(&self, request: DeviceVerificationRequest)
    -> Result<(), CoreError>;

    /// Most recent unverified request for this user and fingerprint.
    async fn latest_pending_verification(
        &self,
        user_id: Uuid,
        fingerprint: &str,
    ) -> Result<Option<DeviceVerificationRequest>, CoreError>;

    /// Conditional `unverified -> verified`. `Ok(false)` if already consumed.
    async fn mark_verification_used(
        &self,
        request_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<bool, CoreError>;
}

#[async_trait]
pub trait DeletionStore: Send + Sync {
    async fn find_scheduled(
        &self,
        user_id: Uuid,
    ) -> Result<Option<AccountDeletionRequest>, CoreError>;

    /// Fails with `Conflict` when the user already has a scheduled request.
    async fn insert_deletion(&self, request: AccountDeletionRequest) -> Result<(), CoreError>;

    /// Conditional `scheduled -> cancelled`.
    async fn cancel_deletion(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, CoreError>;
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entry: AuditLogEntry) -> Result<(), CoreError>;

    /// Newest first.
    async fn recent(&self, limit: u32, offset: u32) -> Result<Vec<AuditLogEntry>, CoreError>;
}

// --- Identity provider port ---

/// Role and profile metadata attached to an account at creation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountMetadata {
    pub role: Option<UserRole>,
    pub name: Option<String>,
    pub phone: Option<String>,
    #[serde(default)]
    pub force_password_change: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuthenticatedAccount {
    pub account_id: Uuid,
    pub email: String,
    pub metadata: AccountMetadata,
    pub tokens: TokenPair,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn create_account(
        &self,
        email: &str,
        password: &str,
        metadata: &AccountMetadata,
    ) -> Result<Uuid, IdentityError>;

    async fn authenticate(
        &self,
        email: &str,
        password: &str,
    ) -> Result<AuthenticatedAccount, IdentityError>;

    async fn rotate_password(
        &self,
        account_id: Uuid,
        new_password: &str,
    ) -> Result<(), IdentityError>;

    /// Email on the provider account, or `NotFound`.
    async fn account_email(&self, account_id: Uuid) -> Result<String, IdentityError>;

    async fn refresh(&self, refresh_token: &str) -> Result<AuthenticatedAccount, IdentityError>;

    /// Used to undo an account creation that lost a race.
    async fn delete_account(&self, account_id: Uuid) -> Result<(), IdentityError>;
}

// --- Notification port ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryReceipt {
    pub provider: &'static str,
    pub message_id: Option<String>,
}

#[async_trait]
pub trait NotificationGateway: Send + Sync {
    async fn send_email(
        &self,
        to: &str,
        subject: &str,
        body: &str,
    ) -> Result<DeliveryReceipt, NotificationError>;

    /// `to` must already be in canonical international form.
    async fn send_sms(&self, to: &str, body: &str) -> Result<DeliveryReceipt, NotificationError>;
}

// Port for caching data
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CoreError>;
    async fn set(&self, key: &str, value: &[u8], ttl_seconds: Option<u64>)
    -> Result<(), CoreError>;
    async fn delete(&self, key: &str) -> Result<(), CoreError>;
}
