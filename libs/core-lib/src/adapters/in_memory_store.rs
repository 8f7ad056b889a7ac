use crate::domain::{
    audit::AuditLogEntry,
    deletion::{AccountDeletionRequest, DeletionStatus},
    device::{DeviceVerificationRequest, TrustedDevice},
    registration::{ApprovalDecision, PendingRegistration, RegistrationStatus, RejectionDecision},
    user::{AccountStatus, Suspension, SuspensionState, User, UserRole},
};
use crate::{AuditSink, CoreError, DeletionStore, DeviceStore, RegistrationStore, UserStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::{Arc, Mutex, RwLock};
use uuid::Uuid;

/// In-memory implementation of every persistence port, for tests and
/// single-executable mode. Each conditional transition runs under the
/// DashMap entry lock, so it behaves like a compare-and-swap.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    registrations: Arc<DashMap<Uuid, PendingRegistration>>,
    users: Arc<DashMap<Uuid, User>>,
    trusted_devices: Arc<DashMap<(Uuid, String), TrustedDevice>>,
    verifications: Arc<DashMap<Uuid, DeviceVerificationRequest>>,
    deletions: Arc<DashMap<Uuid, AccountDeletionRequest>>,
    audit_log: Arc<RwLock<Vec<AuditLogEntry>>>,
    // Serializes uniqueness-checked inserts across the registration and user maps.
    insert_guard: Arc<Mutex<()>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn email_taken(&self, email: &str, except_registration: Option<Uuid>) -> bool {
        let email = email.to_lowercase();
        self.users.iter().any(|u| u.email.to_lowercase() == email)
            || self.registrations.iter().any(|r| {
                r.email.to_lowercase() == email && Some(r.id) != except_registration
            })
    }

    fn phone_taken(&self, phone: &str, except_registration: Option<Uuid>) -> bool {
        self.users
            .iter()
            .any(|u| u.profile.phone.as_deref() == Some(phone))
            || self.registrations.iter().any(|r| {
                r.phone.as_deref() == Some(phone) && Some(r.id) != except_registration
            })
    }

    fn modify_user(&self, id: Uuid, change: impl FnOnce(&mut User)) -> Result<(), CoreError> {
        match self.users.get_mut(&id) {
            Some(mut entry) => {
                change(&mut entry);
                Ok(())
            }
            None => Err(CoreError::NotFound(format!("User {id}"))),
        }
    }

    fn lock_inserts(&self) -> Result<std::sync::MutexGuard<'_, ()>, CoreError> {
        self.insert_guard
            .lock()
            .map_err(|_| CoreError::Internal("in-memory store lock poisoned".into()))
    }
}

#[async_trait]
impl RegistrationStore for InMemoryStore {
    async fn insert_registration(&self, registration: PendingRegistration) -> Result<(), CoreError> {
        let _guard = self.lock_inserts()?;
        if self.email_taken(&registration.email, None) {
            return Err(CoreError::Conflict("Email is already registered".into()));
        }
        if let Some(phone) = registration.phone.as_deref() {
            if self.phone_taken(phone, None) {
                return Err(CoreError::Conflict("Phone number is already registered".into()));
            }
        }
        self.registrations.insert(registration.id, registration);
        Ok(())
    }

    async fn get_registration(&self, id: Uuid) -> Result<Option<PendingRegistration>, CoreError> {
        Ok(self.registrations.get(&id).map(|r| r.value().clone()))
    }

    async fn list_registrations(
        &self,
        status: RegistrationStatus,
    ) -> Result<Vec<PendingRegistration>, CoreError> {
        let mut out: Vec<PendingRegistration> = self
            .registrations
            .iter()
            .filter(|r| r.status == status)
            .map(|r| r.value().clone())
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }

    async fn mark_approved(&self, id: Uuid, decision: &ApprovalDecision) -> Result<bool, CoreError> {
        match self.registrations.get_mut(&id) {
            Some(mut entry) if entry.is_pending() => {
                entry.apply_approval(decision);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(CoreError::NotFound(format!("Registration {id}"))),
        }
    }

    async fn mark_rejected(
        &self,
        id: Uuid,
        decision: &RejectionDecision,
    ) -> Result<bool, CoreError> {
        match self.registrations.get_mut(&id) {
            Some(mut entry) if entry.is_pending() => {
                entry.apply_rejection(decision);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(CoreError::NotFound(format!("Registration {id}"))),
        }
    }
}

#[async_trait]
impl UserStore for InMemoryStore {
    async fn insert_user(&self, user: User) -> Result<(), CoreError> {
        let _guard = self.lock_inserts()?;
        if self.users.contains_key(&user.id) {
            return Err(CoreError::Conflict(format!("User {} already exists", user.id)));
        }
        if self.email_taken(&user.email, user.registration_id) {
            return Err(CoreError::Conflict("Email is already registered".into()));
        }
        if let Some(phone) = user.profile.phone.as_deref() {
            if self.phone_taken(phone, user.registration_id) {
                return Err(CoreError::Conflict("Phone number is already registered".into()));
            }
        }
        self.users.insert(user.id, user);
        Ok(())
    }

    async fn get_user(&self, id: Uuid) -> Result<Option<User>, CoreError> {
        Ok(self.users.get(&id).map(|u| u.value().clone()))
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, CoreError> {
        let email = email.trim().to_lowercase();
        Ok(self
            .users
            .iter()
            .find(|u| u.email.to_lowercase() == email)
            .map(|u| u.value().clone()))
    }

    async fn suspend_user(&self, id: Uuid, suspension: &Suspension) -> Result<(), CoreError> {
        self.modify_user(id, |user| user.suspend(suspension.clone()))
    }

    async fn lift_suspension(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, CoreError> {
        match self.users.get_mut(&id) {
            Some(mut entry) if entry.status == AccountStatus::Suspended => {
                entry.reactivate(at);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(CoreError::NotFound(format!("User {id}"))),
        }
    }

    async fn set_pending_deletion(
        &self,
        id: Uuid,
        pending: bool,
        at: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        self.modify_user(id, |user| {
            user.pending_deletion = pending;
            user.updated_at = at;
        })
    }

    async fn set_force_password_change(
        &self,
        id: Uuid,
        required: bool,
        at: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        self.modify_user(id, |user| {
            user.force_password_change = required;
            user.updated_at = at;
        })
    }

    async fn clear_expired_suspension(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        match self.users.get_mut(&id) {
            Some(mut entry) if entry.suspension_state(now) == SuspensionState::Expired => {
                entry.reactivate(now);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(CoreError::NotFound(format!("User {id}"))),
        }
    }

    async fn any_user_with_role(&self, role: UserRole) -> Result<bool, CoreError> {
        Ok(self.users.iter().any(|u| u.role == role))
    }
}

#[async_trait]
impl DeviceStore for InMemoryStore {
    async fn find_trusted(
        &self,
        user_id: Uuid,
        fingerprint: &str,
    ) -> Result<Option<TrustedDevice>, CoreError> {
        Ok(self
            .trusted_devices
            .get(&(user_id, fingerprint.to_string()))
            .map(|d| d.value().clone()))
    }

    async fn touch_last_seen(
        &self,
        user_id: Uuid,
        fingerprint: &str,
        at: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        if let Some(mut device) = self
            .trusted_devices
            .get_mut(&(user_id, fingerprint.to_string()))
        {
            device.last_seen_at = at;
        }
        Ok(())
    }

    async fn upsert_trusted(&self, device: TrustedDevice) -> Result<(), CoreError> {
        let key = (device.user_id, device.fingerprint.clone());
        self.trusted_devices
            .entry(key)
            .and_modify(|existing| existing.last_seen_at = device.last_seen_at)
            .or_insert(device);
        Ok(())
    }

    async fn insert_verification(
        &self,
        request: DeviceVerificationRequest,
    ) -> Result<(), CoreError> {
        self.verifications.insert(request.id, request);
        Ok(())
    }

    async fn latest_pending_verification(
        &self,
        user_id: Uuid,
        fingerprint: &str,
    ) -> Result<Option<DeviceVerificationRequest>, CoreError> {
        Ok(self
            .verifications
            .iter()
            .filter(|v| v.user_id == user_id && v.fingerprint == fingerprint && !v.is_verified)
            .max_by_key(|v| v.created_at)
            .map(|v| v.value().clone()))
    }

    async fn mark_verification_used(
        &self,
        request_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        match self.verifications.get_mut(&request_id) {
            Some(mut v) if !v.is_verified => {
                v.is_verified = true;
                v.verified_at = Some(at);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(CoreError::NotFound(format!("Verification request {request_id}"))),
        }
    }
}

#[async_trait]
impl DeletionStore for InMemoryStore {
    async fn find_scheduled(
        &self,
        user_id: Uuid,
    ) -> Result<Option<AccountDeletionRequest>, CoreError> {
        Ok(self
            .deletions
            .iter()
            .find(|d| d.user_id == user_id && d.status == DeletionStatus::Scheduled)
            .map(|d| d.value().clone()))
    }

    async fn insert_deletion(&self, request: AccountDeletionRequest) -> Result<(), CoreError> {
        let _guard = self.lock_inserts()?;
        let already = self
            .deletions
            .iter()
            .any(|d| d.user_id == request.user_id && d.status == DeletionStatus::Scheduled);
        if already {
            return Err(CoreError::Conflict(
                "Account deletion is already scheduled".into(),
            ));
        }
        self.deletions.insert(request.id, request);
        Ok(())
    }

    async fn cancel_deletion(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, CoreError> {
        match self.deletions.get_mut(&id) {
            Some(mut d) if d.status == DeletionStatus::Scheduled => {
                d.status = DeletionStatus::Cancelled;
                d.cancelled_at = Some(at);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(CoreError::NotFound(format!("Deletion request {id}"))),
        }
    }
}

#[async_trait]
impl AuditSink for InMemoryStore {
    async fn record(&self, entry: AuditLogEntry) -> Result<(), CoreError> {
        self.audit_log
            .write()
            .map_err(|_| CoreError::Internal("audit log lock poisoned".into()))?
            .push(entry);
        Ok(())
    }

    async fn recent(&self, limit: u32, offset: u32) -> Result<Vec<AuditLogEntry>, CoreError> {
        let log = self
            .audit_log
            .read()
            .map_err(|_| CoreError::Internal("audit log lock poisoned".into()))?;
        Ok(log
            .iter()
            .rev()
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect())
    }
}
