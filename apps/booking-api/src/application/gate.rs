//! Account checks run after the identity provider accepts a credential and
//! before any token is handed out.

use chrono::{DateTime, Utc};
use core_lib::domain::audit::{AuditActor, AuditLogEntry};
use core_lib::domain::user::{SuspensionState, User, UserRole};
use core_lib::{AuthenticatedAccount, CoreError, DeletionStore, UserStore};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use super::ApplicationError;
use super::audit::{AuditRecorder, ENTITY_DELETION, ENTITY_USER};

pub struct AccountGate {
    users: Arc<dyn UserStore>,
    deletions: Arc<dyn DeletionStore>,
    audit: AuditRecorder,
}

impl AccountGate {
    pub fn new(
        users: Arc<dyn UserStore>,
        deletions: Arc<dyn DeletionStore>,
        audit: AuditRecorder,
    ) -> Self {
        Self {
            users,
            deletions,
            audit,
        }
    }

    /// The local record for a provider account, created from the provider's
    /// metadata when this is the first time the account is seen.
    pub async fn load_or_create_user(
        &self,
        account: &AuthenticatedAccount,
    ) -> Result<User, ApplicationError> {
        if let Some(user) = self.users.get_user(account.account_id).await? {
            return Ok(user);
        }
        if let Some(user) = self.users.find_user_by_email(&account.email).await? {
            warn!(
                account_id = %account.account_id,
                user_id = %user.id,
                "User record id differs from identity provider account id"
            );
            return Ok(user);
        }

        let metadata = &account.metadata;
        let mut user = User::new(
            account.account_id,
            account.email.clone(),
            metadata.role.unwrap_or(UserRole::Tourist),
        );
        user.force_password_change = metadata.force_password_change;
        user.profile.name = metadata.name.clone();
        user.profile.phone = metadata.phone.clone();
        user.registration_id = metadata
            .extra
            .get("registration_id")
            .and_then(Value::as_str)
            .and_then(|id| Uuid::parse_str(id).ok());

        match self.users.insert_user(user.clone()).await {
            Ok(()) => {
                info!(user_id = %user.id, role = %user.role, "Created user record on first login");
                Ok(user)
            }
            // Another request created it first.
            Err(CoreError::Conflict(_)) => self
                .users
                .get_user(account.account_id)
                .await?
                .ok_or_else(|| {
                    ApplicationError::Core(CoreError::Conflict(
                        "Email is already registered to another account".into(),
                    ))
                }),
            Err(e) => Err(e.into()),
        }
    }

    /// Cancels a scheduled deletion. Returns the days that were left when it
    /// was cancelled, or `None` if nothing was scheduled.
    pub async fn cancel_scheduled_deletion(
        &self,
        user: &mut User,
        actor: &AuditActor,
        now: DateTime<Utc>,
    ) -> Result<Option<i64>, ApplicationError> {
        let cancelled = match self.deletions.find_scheduled(user.id).await? {
            Some(request) => {
                let days_remaining = request.days_remaining(now);
                if self.deletions.cancel_deletion(request.id, now).await? {
                    self.audit
                        .record(
                            AuditLogEntry::new(
                                actor,
                                "account_deletion_cancelled",
                                ENTITY_DELETION,
                                Some(request.id.to_string()),
                            )
                            .with_old(json!({ "status": "scheduled" }))
                            .with_new(json!({ "status": "cancelled", "cancelled_by": "login" })),
                        )
                        .await;
                    Some(days_remaining)
                } else {
                    None
                }
            }
            None => None,
        };

        if user.pending_deletion {
            self.users.set_pending_deletion(user.id, false, now).await?;
            user.pending_deletion = false;
            user.updated_at = now;
        }
        if cancelled.is_some() {
            info!(user_id = %user.id, "Scheduled account deletion cancelled by login");
        }
        Ok(cancelled)
    }

    /// Rejects suspended accounts. An expired time-boxed suspension is lifted
    /// and `Ok(true)` is returned.
    pub async fn enforce_suspension(
        &self,
        user: &mut User,
        actor: &AuditActor,
        now: DateTime<Utc>,
    ) -> Result<bool, ApplicationError> {
        let reason = user
            .suspension
            .as_ref()
            .map(|s| s.reason.clone())
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| "Account suspended by admin".to_string());

        match user.suspension_state(now) {
            SuspensionState::NotSuspended => Ok(false),
            SuspensionState::Permanent => {
                Err(ApplicationError::PermanentlySuspended { reason })
            }
            SuspensionState::Temporary { remaining_days } => {
                let suspended_until = user
                    .suspension
                    .as_ref()
                    .and_then(|s| s.suspended_until)
                    .unwrap_or(now);
                Err(ApplicationError::TemporarilySuspended {
                    reason,
                    remaining_days,
                    suspended_until,
                })
            }
            SuspensionState::Expired => {
                let previous = user.suspension.clone();
                if self.users.clear_expired_suspension(user.id, now).await? {
                    info!(user_id = %user.id, "Expired suspension lifted on login");
                    self.audit
                        .record(
                            AuditLogEntry::new(
                                actor,
                                "suspension_expired",
                                ENTITY_USER,
                                Some(user.id.to_string()),
                            )
                            .with_old(json!({ "status": "suspended", "suspension": previous }))
                            .with_new(json!({ "status": "active", "unsuspended_by": "system_auto" })),
                        )
                        .await;
                }
                user.reactivate(now);
                Ok(true)
            }
        }
    }
}
