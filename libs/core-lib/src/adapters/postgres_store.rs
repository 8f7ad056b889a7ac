use crate::domain::{
    audit::AuditLogEntry,
    deletion::{AccountDeletionRequest, DeletionStatus},
    device::{DeviceVerificationRequest, TrustedDevice},
    registration::{
        ApprovalDecision, PendingRegistration, RegistrationProfile, RegistrationRole,
        RegistrationStatus, RejectionDecision,
    },
    user::{AccountStatus, Suspension, User, UserProfile, UserRole},
};
use crate::{AuditSink, CoreError, DeletionStore, DeviceStore, RegistrationStore, UserStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

const UNIQUE_VIOLATION: &str = "23505";

fn infra(e: sqlx::Error) -> CoreError {
    if let sqlx::Error::Database(db) = &e {
        if db.code().as_deref() == Some(UNIQUE_VIOLATION) {
            return CoreError::Conflict(format!(
                "Unique constraint violated: {}",
                db.constraint().unwrap_or("unknown")
            ));
        }
    }
    CoreError::Infrastructure(Box::new(e))
}

fn corrupt(what: &str, value: &str) -> CoreError {
    CoreError::Internal(format!("Unexpected {what} in database: {value}"))
}

// --- Row types ---

#[derive(sqlx::FromRow, Debug)]
struct RegistrationRow {
    id: Uuid,
    email: String,
    phone: Option<String>,
    role: String,
    status: String,
    password: Option<String>,
    profile: Value,
    created_at: DateTime<Utc>,
    approved_by: Option<String>,
    approved_at: Option<DateTime<Utc>>,
    user_id: Option<Uuid>,
    rejected_by: Option<String>,
    rejected_at: Option<DateTime<Utc>>,
    rejection_reason: Option<String>,
}

impl TryFrom<RegistrationRow> for PendingRegistration {
    type Error = CoreError;

    fn try_from(row: RegistrationRow) -> Result<Self, Self::Error> {
        let role = match row.role.as_str() {
            "driver" => RegistrationRole::Driver,
            "owner" => RegistrationRole::Owner,
            other => return Err(corrupt("registration role", other)),
        };
        let status = RegistrationStatus::parse(&row.status)
            .ok_or_else(|| corrupt("registration status", &row.status))?;
        let profile: RegistrationProfile = serde_json::from_value(row.profile)?;
        Ok(PendingRegistration {
            id: row.id,
            email: row.email,
            phone: row.phone,
            role,
            status,
            password: row.password,
            profile,
            created_at: row.created_at,
            approved_by: row.approved_by,
            approved_at: row.approved_at,
            user_id: row.user_id,
            rejected_by: row.rejected_by,
            rejected_at: row.rejected_at,
            rejection_reason: row.rejection_reason,
        })
    }
}

#[derive(sqlx::FromRow, Debug)]
struct UserRow {
    id: Uuid,
    email: String,
    role: String,
    status: String,
    suspension_reason: Option<String>,
    suspended_by: Option<String>,
    suspended_at: Option<DateTime<Utc>>,
    suspended_until: Option<DateTime<Utc>>,
    force_password_change: bool,
    pending_deletion: bool,
    name: Option<String>,
    phone: Option<String>,
    address: Option<String>,
    bio: Option<String>,
    profile_photo_url: Option<String>,
    registration_id: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<UserRow> for User {
    type Error = CoreError;

    fn try_from(row: UserRow) -> Result<Self, Self::Error> {
        let role = UserRole::parse(&row.role).ok_or_else(|| corrupt("user role", &row.role))?;
        let status =
            AccountStatus::parse(&row.status).ok_or_else(|| corrupt("account status", &row.status))?;
        let suspension = match (status, row.suspended_at) {
            (AccountStatus::Suspended, Some(suspended_at)) => Some(Suspension {
                reason: row.suspension_reason.unwrap_or_default(),
                suspended_by: row.suspended_by.unwrap_or_default(),
                suspended_at,
                suspended_until: row.suspended_until,
            }),
            (AccountStatus::Suspended, None) => Some(Suspension {
                reason: row.suspension_reason.unwrap_or_default(),
                suspended_by: row.suspended_by.unwrap_or_default(),
                suspended_at: row.updated_at,
                suspended_until: row.suspended_until,
            }),
            _ => None,
        };
        Ok(User {
            id: row.id,
            email: row.email,
            role,
            status,
            suspension,
            force_password_change: row.force_password_change,
            pending_deletion: row.pending_deletion,
            profile: UserProfile {
                name: row.name,
                phone: row.phone,
                address: row.address,
                bio: row.bio,
                profile_photo_url: row.profile_photo_url,
            },
            registration_id: row.registration_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow, Debug)]
struct TrustedDeviceRow {
    id: Uuid,
    user_id: Uuid,
    fingerprint: String,
    device_info: Option<String>,
    created_at: DateTime<Utc>,
    last_seen_at: DateTime<Utc>,
}

impl From<TrustedDeviceRow> for TrustedDevice {
    fn from(row: TrustedDeviceRow) -> Self {
        TrustedDevice {
            id: row.id,
            user_id: row.user_id,
            fingerprint: row.fingerprint,
            device_info: row.device_info,
            created_at: row.created_at,
            last_seen_at: row.last_seen_at,
        }
    }
}

#[derive(sqlx::FromRow, Debug)]
struct VerificationRow {
    id: Uuid,
    user_id: Uuid,
    fingerprint: String,
    code: String,
    device_info: Option<String>,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    is_verified: bool,
    verified_at: Option<DateTime<Utc>>,
}

impl From<VerificationRow> for DeviceVerificationRequest {
    fn from(row: VerificationRow) -> Self {
        DeviceVerificationRequest {
            id: row.id,
            user_id: row.user_id,
            fingerprint: row.fingerprint,
            code: row.code,
            device_info: row.device_info,
            created_at: row.created_at,
            expires_at: row.expires_at,
            is_verified: row.is_verified,
            verified_at: row.verified_at,
        }
    }
}

#[derive(sqlx::FromRow, Debug)]
struct DeletionRow {
    id: Uuid,
    user_id: Uuid,
    status: String,
    reason: Option<String>,
    requested_at: DateTime<Utc>,
    scheduled_deletion_at: DateTime<Utc>,
    cancelled_at: Option<DateTime<Utc>>,
}

impl TryFrom<DeletionRow> for AccountDeletionRequest {
    type Error = CoreError;

    fn try_from(row: DeletionRow) -> Result<Self, Self::Error> {
        Ok(AccountDeletionRequest {
            id: row.id,
            user_id: row.user_id,
            status: DeletionStatus::parse(&row.status)
                .ok_or_else(|| corrupt("deletion status", &row.status))?,
            reason: row.reason,
            requested_at: row.requested_at,
            scheduled_deletion_at: row.scheduled_deletion_at,
            cancelled_at: row.cancelled_at,
        })
    }
}

#[derive(sqlx::FromRow, Debug)]
struct AuditRow {
    id: Uuid,
    actor_id: Option<String>,
    actor_email: Option<String>,
    actor_role: Option<String>,
    action: String,
    entity_name: String,
    entity_id: Option<String>,
    old_data: Option<Value>,
    new_data: Option<Value>,
    ip_address: Option<String>,
    device_info: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<AuditRow> for AuditLogEntry {
    fn from(row: AuditRow) -> Self {
        AuditLogEntry {
            id: row.id,
            actor_id: row.actor_id,
            actor_email: row.actor_email,
            actor_role: row.actor_role,
            action: row.action,
            entity_name: row.entity_name,
            entity_id: row.entity_id,
            old_data: row.old_data,
            new_data: row.new_data,
            ip_address: row.ip_address,
            device_info: row.device_info,
            created_at: row.created_at,
        }
    }
}

/// PostgreSQL implementation of the persistence ports. Status transitions are
/// single conditional UPDATEs; cross-table uniqueness is checked under a
/// transaction-scoped advisory lock keyed on the email (and phone).
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn lock_identity(
        tx: &mut Transaction<'_, Postgres>,
        key: &str,
    ) -> Result<(), CoreError> {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(key)
            .execute(&mut **tx)
            .await
            .map_err(infra)?;
        Ok(())
    }

    async fn email_in_use(
        tx: &mut Transaction<'_, Postgres>,
        email: &str,
        except_registration: Option<Uuid>,
    ) -> Result<bool, CoreError> {
        let (taken,): (bool,) = sqlx::query_as(
            "SELECT EXISTS (SELECT 1 FROM users WHERE LOWER(email) = LOWER($1))
                 OR EXISTS (SELECT 1 FROM pending_registrations
                            WHERE LOWER(email) = LOWER($1)
                              AND ($2::uuid IS NULL OR id <> $2))",
        )
        .bind(email)
        .bind(except_registration)
        .fetch_one(&mut **tx)
        .await
        .map_err(infra)?;
        Ok(taken)
    }

    async fn phone_in_use(
        tx: &mut Transaction<'_, Postgres>,
        phone: &str,
        except_registration: Option<Uuid>,
    ) -> Result<bool, CoreError> {
        let (taken,): (bool,) = sqlx::query_as(
            "SELECT EXISTS (SELECT 1 FROM users WHERE phone = $1)
                 OR EXISTS (SELECT 1 FROM pending_registrations
                            WHERE phone = $1
                              AND ($2::uuid IS NULL OR id <> $2))",
        )
        .bind(phone)
        .bind(except_registration)
        .fetch_one(&mut **tx)
        .await
        .map_err(infra)?;
        Ok(taken)
    }
}

const REGISTRATION_COLUMNS: &str = "id, email, phone, role, status, password, profile, created_at, \
     approved_by, approved_at, user_id, rejected_by, rejected_at, rejection_reason";

const USER_COLUMNS: &str = "id, email, role, status, suspension_reason, suspended_by, suspended_at, \
     suspended_until, force_password_change, pending_deletion, name, phone, address, bio, \
     profile_photo_url, registration_id, created_at, updated_at";

#[async_trait]
impl RegistrationStore for PostgresStore {
    async fn insert_registration(&self, registration: PendingRegistration) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await.map_err(infra)?;
        Self::lock_identity(&mut tx, &format!("email:{}", registration.email.to_lowercase())).await?;
        if Self::email_in_use(&mut tx, &registration.email, None).await? {
            return Err(CoreError::Conflict("Email is already registered".into()));
        }
        if let Some(phone) = registration.phone.as_deref() {
            Self::lock_identity(&mut tx, &format!("phone:{phone}")).await?;
            if Self::phone_in_use(&mut tx, phone, None).await? {
                return Err(CoreError::Conflict("Phone number is already registered".into()));
            }
        }

        sqlx::query(
            "INSERT INTO pending_registrations
                 (id, email, phone, role, status, password, profile, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(registration.id)
        .bind(&registration.email)
        .bind(&registration.phone)
        .bind(registration.role.as_str())
        .bind(registration.status.as_str())
        .bind(&registration.password)
        .bind(serde_json::to_value(&registration.profile)?)
        .bind(registration.created_at)
        .execute(&mut *tx)
        .await
        .map_err(infra)?;

        tx.commit().await.map_err(infra)
    }

    async fn get_registration(&self, id: Uuid) -> Result<Option<PendingRegistration>, CoreError> {
        let row: Option<RegistrationRow> = sqlx::query_as(&format!(
            "SELECT {REGISTRATION_COLUMNS} FROM pending_registrations WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(infra)?;
        row.map(PendingRegistration::try_from).transpose()
    }

    async fn list_registrations(
        &self,
        status: RegistrationStatus,
    ) -> Result<Vec<PendingRegistration>, CoreError> {
        let rows: Vec<RegistrationRow> = sqlx::query_as(&format!(
            "SELECT {REGISTRATION_COLUMNS} FROM pending_registrations
             WHERE status = $1 ORDER BY created_at DESC"
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(infra)?;
        rows.into_iter().map(PendingRegistration::try_from).collect()
    }

    async fn mark_approved(&self, id: Uuid, decision: &ApprovalDecision) -> Result<bool, CoreError> {
        let result = sqlx::query(
            "UPDATE pending_registrations
             SET status = 'approved', approved_by = $2, approved_at = $3, user_id = $4,
                 password = NULL
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(id)
        .bind(&decision.approved_by)
        .bind(decision.approved_at)
        .bind(decision.user_id)
        .execute(&self.pool)
        .await
        .map_err(infra)?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_rejected(
        &self,
        id: Uuid,
        decision: &RejectionDecision,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            "UPDATE pending_registrations
             SET status = 'rejected', rejected_by = $2, rejected_at = $3, rejection_reason = $4,
                 password = NULL
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(id)
        .bind(&decision.rejected_by)
        .bind(decision.rejected_at)
        .bind(&decision.reason)
        .execute(&self.pool)
        .await
        .map_err(infra)?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl UserStore for PostgresStore {
    async fn insert_user(&self, user: User) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await.map_err(infra)?;
        Self::lock_identity(&mut tx, &format!("email:{}", user.email.to_lowercase())).await?;
        if Self::email_in_use(&mut tx, &user.email, user.registration_id).await? {
            return Err(CoreError::Conflict("Email is already registered".into()));
        }
        if let Some(phone) = user.profile.phone.as_deref() {
            Self::lock_identity(&mut tx, &format!("phone:{phone}")).await?;
            if Self::phone_in_use(&mut tx, phone, user.registration_id).await? {
                return Err(CoreError::Conflict("Phone number is already registered".into()));
            }
        }

        let suspension = user.suspension.as_ref();
        sqlx::query(
            "INSERT INTO users
                 (id, email, role, status, suspension_reason, suspended_by, suspended_at,
                  suspended_until, force_password_change, pending_deletion, name, phone, address,
                  bio, profile_photo_url, registration_id, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)",
        )
        .bind(user.id)
        .bind(&user.email)
        .bind(user.role.as_str())
        .bind(user.status.as_str())
        .bind(suspension.map(|s| s.reason.clone()))
        .bind(suspension.map(|s| s.suspended_by.clone()))
        .bind(suspension.map(|s| s.suspended_at))
        .bind(suspension.and_then(|s| s.suspended_until))
        .bind(user.force_password_change)
        .bind(user.pending_deletion)
        .bind(&user.profile.name)
        .bind(&user.profile.phone)
        .bind(&user.profile.address)
        .bind(&user.profile.bio)
        .bind(&user.profile.profile_photo_url)
        .bind(user.registration_id)
        .bind(user.created_at)
        .bind(user.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(infra)?;

        tx.commit().await.map_err(infra)
    }

    async fn get_user(&self, id: Uuid) -> Result<Option<User>, CoreError> {
        let row: Option<UserRow> =
            sqlx::query_as(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(infra)?;
        row.map(User::try_from).transpose()
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, CoreError> {
        let row: Option<UserRow> = sqlx::query_as(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE LOWER(email) = LOWER($1)"
        ))
        .bind(email.trim())
        .fetch_optional(&self.pool)
        .await
        .map_err(infra)?;
        row.map(User::try_from).transpose()
    }

    async fn suspend_user(&self, id: Uuid, suspension: &Suspension) -> Result<(), CoreError> {
        let result = sqlx::query(
            "UPDATE users
             SET status = 'suspended', suspension_reason = $2, suspended_by = $3,
                 suspended_at = $4, suspended_until = $5, updated_at = $4
             WHERE id = $1",
        )
        .bind(id)
        .bind(&suspension.reason)
        .bind(&suspension.suspended_by)
        .bind(suspension.suspended_at)
        .bind(suspension.suspended_until)
        .execute(&self.pool)
        .await
        .map_err(infra)?;
        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("User {id}")));
        }
        Ok(())
    }

    async fn lift_suspension(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, CoreError> {
        let result = sqlx::query(
            "UPDATE users
             SET status = 'active', suspension_reason = NULL, suspended_by = NULL,
                 suspended_at = NULL, suspended_until = NULL, updated_at = $2
             WHERE id = $1 AND status = 'suspended'",
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(infra)?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_pending_deletion(
        &self,
        id: Uuid,
        pending: bool,
        at: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let result = sqlx::query(
            "UPDATE users SET pending_deletion = $2, updated_at = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(pending)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(infra)?;
        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("User {id}")));
        }
        Ok(())
    }

    async fn set_force_password_change(
        &self,
        id: Uuid,
        required: bool,
        at: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let result = sqlx::query(
            "UPDATE users SET force_password_change = $2, updated_at = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(required)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(infra)?;
        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("User {id}")));
        }
        Ok(())
    }

    async fn clear_expired_suspension(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            "UPDATE users
             SET status = 'active', suspension_reason = NULL, suspended_by = NULL,
                 suspended_at = NULL, suspended_until = NULL, updated_at = $2
             WHERE id = $1 AND status = 'suspended'
               AND suspended_until IS NOT NULL AND suspended_until <= $2",
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(infra)?;
        Ok(result.rows_affected() == 1)
    }

    async fn any_user_with_role(&self, role: UserRole) -> Result<bool, CoreError> {
        let (exists,): (bool,) = sqlx::query_as(
            "SELECT EXISTS (SELECT 1 FROM users WHERE role = $1)",
        )
        .bind(role.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(infra)?;
        Ok(exists)
    }
}

#[async_trait]
impl DeviceStore for PostgresStore {
    async fn find_trusted(
        &self,
        user_id: Uuid,
        fingerprint: &str,
    ) -> Result<Option<TrustedDevice>, CoreError> {
        let row: Option<TrustedDeviceRow> = sqlx::query_as(
            "SELECT id, user_id, fingerprint, device_info, created_at, last_seen_at
             FROM trusted_devices WHERE user_id = $1 AND fingerprint = $2",
        )
        .bind(user_id)
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await
        .map_err(infra)?;
        Ok(row.map(TrustedDevice::from))
    }

    async fn touch_last_seen(
        &self,
        user_id: Uuid,
        fingerprint: &str,
        at: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        sqlx::query(
            "UPDATE trusted_devices SET last_seen_at = $3 WHERE user_id = $1 AND fingerprint = $2",
        )
        .bind(user_id)
        .bind(fingerprint)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(infra)?;
        Ok(())
    }

    async fn upsert_trusted(&self, device: TrustedDevice) -> Result<(), CoreError> {
        sqlx::query(
            "INSERT INTO trusted_devices (id, user_id, fingerprint, device_info, created_at, last_seen_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (user_id, fingerprint) DO UPDATE SET last_seen_at = EXCLUDED.last_seen_at",
        )
        .bind(device.id)
        .bind(device.user_id)
        .bind(&device.fingerprint)
        .bind(&device.device_info)
        .bind(device.created_at)
        .bind(device.last_seen_at)
        .execute(&self.pool)
        .await
        .map_err(infra)?;
        Ok(())
    }

    async fn insert_verification(
        &self,
        request: DeviceVerificationRequest,
    ) -> Result<(), CoreError> {
        sqlx::query(
            "INSERT INTO device_verification_requests
                 (id, user_id, fingerprint, code, device_info, created_at, expires_at, is_verified)
             VALUES ($1, $2, $3, $4, $5, $6, $7, FALSE)",
        )
        .bind(request.id)
        .bind(request.user_id)
        .bind(&request.fingerprint)
        .bind(&request.code)
        .bind(&request.device_info)
        .bind(request.created_at)
        .bind(request.expires_at)
        .execute(&self.pool)
        .await
        .map_err(infra)?;
        Ok(())
    }

    async fn latest_pending_verification(
        &self,
        user_id: Uuid,
        fingerprint: &str,
    ) -> Result<Option<DeviceVerificationRequest>, CoreError> {
        let row: Option<VerificationRow> = sqlx::query_as(
            "SELECT id, user_id, fingerprint, code, device_info, created_at, expires_at,
                    is_verified, verified_at
             FROM device_verification_requests
             WHERE user_id = $1 AND fingerprint = $2 AND is_verified = FALSE
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(user_id)
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await
        .map_err(infra)?;
        Ok(row.map(DeviceVerificationRequest::from))
    }

    async fn mark_verification_used(
        &self,
        request_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            "UPDATE device_verification_requests SET is_verified = TRUE, verified_at = $2
             WHERE id = $1 AND is_verified = FALSE",
        )
        .bind(request_id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(infra)?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl DeletionStore for PostgresStore {
    async fn find_scheduled(
        &self,
        user_id: Uuid,
    ) -> Result<Option<AccountDeletionRequest>, CoreError> {
        let row: Option<DeletionRow> = sqlx::query_as(
            "SELECT id, user_id, status, reason, requested_at, scheduled_deletion_at, cancelled_at
             FROM account_deletion_requests WHERE user_id = $1 AND status = 'scheduled'",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(infra)?;
        row.map(AccountDeletionRequest::try_from).transpose()
    }

    async fn insert_deletion(&self, request: AccountDeletionRequest) -> Result<(), CoreError> {
        sqlx::query(
            "INSERT INTO account_deletion_requests
                 (id, user_id, status, reason, requested_at, scheduled_deletion_at)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(request.id)
        .bind(request.user_id)
        .bind(request.status.as_str())
        .bind(&request.reason)
        .bind(request.requested_at)
        .bind(request.scheduled_deletion_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match infra(e) {
            CoreError::Conflict(_) => {
                CoreError::Conflict("Account deletion is already scheduled".into())
            }
            other => other,
        })?;
        Ok(())
    }

    async fn cancel_deletion(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, CoreError> {
        let result = sqlx::query(
            "UPDATE account_deletion_requests SET status = 'cancelled', cancelled_at = $2
             WHERE id = $1 AND status = 'scheduled'",
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(infra)?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl AuditSink for PostgresStore {
    async fn record(&self, entry: AuditLogEntry) -> Result<(), CoreError> {
        sqlx::query(
            "INSERT INTO audit_logs
                 (id, actor_id, actor_email, actor_role, action, entity_name, entity_id,
                  old_data, new_data, ip_address, device_info, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(entry.id)
        .bind(&entry.actor_id)
        .bind(&entry.actor_email)
        .bind(&entry.actor_role)
        .bind(&entry.action)
        .bind(&entry.entity_name)
        .bind(&entry.entity_id)
        .bind(&entry.old_data)
        .bind(&entry.new_data)
        .bind(&entry.ip_address)
        .bind(&entry.device_info)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .map_err(infra)?;
        Ok(())
    }

    async fn recent(&self, limit: u32, offset: u32) -> Result<Vec<AuditLogEntry>, CoreError> {
        let rows: Vec<AuditRow> = sqlx::query_as(
            "SELECT id, actor_id, actor_email, actor_role, action, entity_name, entity_id,
                    old_data, new_data, ip_address, device_info, created_at
             FROM audit_logs ORDER BY created_at DESC LIMIT $1 OFFSET $2",
        )
        .bind(i64::from(limit))
        .bind(i64::from(offset))
        .fetch_all(&self.pool)
        .await
        .map_err(infra)?;
        Ok(rows.into_iter().map(AuditLogEntry::from).collect())
    }
}
