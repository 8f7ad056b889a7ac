use crate::AppState;
use crate::application::audit::{AuditRecorder, ENTITY_REGISTRATION, actor_for};
use crate::application::authz::{Requirement, authorize};
use crate::application::middleware::{AuthenticatedUser, ClientContext};
use crate::application::notify::{NotificationResults, Outgoing, deliver};
use crate::application::query::PENDING_REGISTRATIONS_CACHE_KEY;
use crate::application::{ApiJson, ApiResponse, ApplicationError};
use axum::{
    Extension,
    extract::{Path, State},
    response::IntoResponse,
};
use chrono::Utc;
use core_lib::domain::audit::{AuditActor, AuditLogEntry};
use core_lib::domain::credentials::generate_password;
use core_lib::domain::notification::{
    NotificationChannel, approval_email, approval_sms, normalize_phone, resolve_delivery,
};
use core_lib::domain::registration::ApprovalDecision;
use core_lib::domain::user::{User, UserRole};
use core_lib::{
    AccountMetadata, Cache, Command, CommandHandler, CoreError, IdentityProvider,
    NotificationGateway, RegistrationStore, UserStore,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Returned for any decision on a registration that is no longer pending,
/// whatever state it ended up in.
pub const NOT_PENDING: &str = "Registration is no longer pending";

/// Keys carried by typed `AccountMetadata` fields; dropped from the profile bag.
const RESERVED_METADATA_KEYS: &[&str] = &["role", "name", "phone", "force_password_change"];

pub struct ApproveRegistration {
    pub registration_id: Uuid,
    pub admin: AuditActor,
    pub notify_via: Option<NotificationChannel>,
}

impl Command for ApproveRegistration {}

#[derive(Debug, Serialize)]
pub struct ApprovalOutcome {
    pub registration_id: Uuid,
    pub user_id: Uuid,
    pub email: String,
    pub role: UserRole,
    pub password_generated: bool,
    pub notifications: NotificationResults,
}

pub struct ApproveRegistrationHandler {
    registrations: Arc<dyn RegistrationStore>,
    users: Arc<dyn UserStore>,
    identity: Arc<dyn IdentityProvider>,
    notifier: Arc<dyn NotificationGateway>,
    cache: Arc<dyn Cache>,
    audit: AuditRecorder,
}

impl ApproveRegistrationHandler {
    pub fn new(
        registrations: Arc<dyn RegistrationStore>,
        users: Arc<dyn UserStore>,
        identity: Arc<dyn IdentityProvider>,
        notifier: Arc<dyn NotificationGateway>,
        cache: Arc<dyn Cache>,
        audit: AuditRecorder,
    ) -> Self {
        Self {
            registrations,
            users,
            identity,
            notifier,
            cache,
            audit,
        }
    }

    /// Removes a provider account whose registration could not be marked approved.
    async fn discard_account(&self, account_id: Uuid) {
        match self.identity.delete_account(account_id).await {
            Ok(()) => info!(account_id = %account_id, "Rolled back account for lost approval"),
            Err(e) => error!(
                account_id = %account_id,
                error = %e,
                "Failed to roll back account; manual cleanup needed"
            ),
        }
    }
}

impl CommandHandler<ApproveRegistration> for ApproveRegistrationHandler {
    type Output = ApprovalOutcome;
    type Error = ApplicationError;

    async fn handle(&self, command: ApproveRegistration) -> Result<ApprovalOutcome, ApplicationError> {
        let registration = self
            .registrations
            .get_registration(command.registration_id)
            .await?
            .ok_or_else(|| CoreError::NotFound("Registration not found".into()))?;
        if !registration.is_pending() {
            return Err(CoreError::InvalidState(NOT_PENDING.into()).into());
        }

        let final_role = registration.final_role();
        let (password, password_generated) = match registration.supplied_password() {
            Some(supplied) => (supplied.to_string(), false),
            None => (generate_password(), true),
        };

        let mut extra = match serde_json::to_value(&registration.profile).map_err(CoreError::from)? {
            Value::Object(map) => map,
            _ => Default::default(),
        };
        for reserved in RESERVED_METADATA_KEYS {
            extra.remove(*reserved);
        }
        extra.insert("registration_id".into(), json!(registration.id));
        let phone = registration.contact_phone().and_then(normalize_phone);
        let metadata = AccountMetadata {
            role: Some(final_role),
            name: registration.profile.full_name(),
            phone: phone.clone(),
            force_password_change: password_generated,
            extra,
        };

        let account_id = self
            .identity
            .create_account(&registration.email, &password, &metadata)
            .await
            .map_err(|e| {
                error!(
                    registration_id = %registration.id,
                    error = %e,
                    "Identity provider refused account creation; registration stays pending"
                );
                ApplicationError::Identity(e)
            })?;

        let decision = ApprovalDecision {
            approved_by: command
                .admin
                .email
                .clone()
                .unwrap_or_else(|| "admin".to_string()),
            approved_at: Utc::now(),
            user_id: account_id,
        };
        match self.registrations.mark_approved(registration.id, &decision).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(registration_id = %registration.id, "Lost approval race");
                self.discard_account(account_id).await;
                return Err(CoreError::InvalidState(NOT_PENDING.into()).into());
            }
            Err(e) => {
                self.discard_account(account_id).await;
                return Err(e.into());
            }
        }
        info!(
            registration_id = %registration.id,
            user_id = %account_id,
            role = %final_role,
            "Registration approved"
        );

        let mut user = User::new(account_id, registration.email.clone(), final_role);
        user.force_password_change = password_generated;
        user.registration_id = Some(registration.id);
        user.profile.name = metadata.name.clone();
        user.profile.phone = phone.clone();
        user.profile.address = registration.profile.address.clone();
        if let Err(e) = self.users.insert_user(user).await {
            // First login rebuilds the record from provider metadata.
            warn!(user_id = %account_id, error = %e, "Could not store user record after approval");
        }

        let plan = resolve_delivery(
            command.notify_via,
            registration.profile.preferred_notification,
            phone.is_some(),
        );
        let disclosed = password_generated.then_some(password.as_str());
        let notifications = deliver(
            self.notifier.as_ref(),
            plan,
            Outgoing {
                email_to: &registration.email,
                phone: phone.as_deref(),
                email: approval_email(final_role.as_str(), &registration.email, disclosed),
                sms: approval_sms(final_role.as_str(), &registration.email, disclosed),
            },
        )
        .await;
        if !notifications.any_delivered() {
            warn!(registration_id = %registration.id, "Approved but no notification was delivered");
        }

        self.audit
            .record(
                AuditLogEntry::new(
                    &command.admin,
                    "registration_approved",
                    ENTITY_REGISTRATION,
                    Some(registration.id.to_string()),
                )
                .with_old(json!({ "status": "pending", "role": registration.role }))
                .with_new(json!({
                    "status": "approved",
                    "user_id": account_id,
                    "final_role": final_role,
                    "password_generated": password_generated,
                    "notifications": notifications,
                })),
            )
            .await;

        if let Err(e) = self.cache.delete(PENDING_REGISTRATIONS_CACHE_KEY).await {
            warn!("Failed to invalidate pending registrations cache: {}", e);
        }

        Ok(ApprovalOutcome {
            registration_id: registration.id,
            user_id: account_id,
            email: registration.email,
            role: final_role,
            password_generated,
            notifications,
        })
    }
}

// --- DTO for the HTTP Request ---

#[derive(Deserialize, Debug, Default)]
pub struct ApproveRegistrationDto {
    #[serde(default)]
    pub notify_via: Option<NotificationChannel>,
}

// --- Axum Route Handler ---

pub async fn handle_approve_registration_request(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthenticatedUser>,
    Path(registration_id): Path<Uuid>,
    client: ClientContext,
    ApiJson(payload): ApiJson<ApproveRegistrationDto>,
) -> Result<impl IntoResponse, ApplicationError> {
    authorize(&ctx, Requirement::AdminOnly)?;

    let handler = ApproveRegistrationHandler::new(
        state.registrations.clone(),
        state.users.clone(),
        state.identity.clone(),
        state.notifier.clone(),
        state.cache.clone(),
        AuditRecorder::new(state.audit.clone()),
    );
    let outcome = handler
        .handle(ApproveRegistration {
            registration_id,
            admin: actor_for(&ctx, &client),
            notify_via: payload.notify_via,
        })
        .await?;

    Ok(ApiResponse::ok(outcome))
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_lib::adapters::in_memory_cache::InMemoryCache;
    use core_lib::adapters::in_memory_identity::InMemoryIdentityProvider;
    use core_lib::adapters::in_memory_notifier::{InMemoryNotifier, OutboxChannel};
    use core_lib::adapters::in_memory_store::InMemoryStore;
    use core_lib::domain::credentials::meets_policy;
    use core_lib::domain::registration::{
        PendingRegistration, RegistrationProfile, RegistrationRole, RegistrationStatus,
    };
    use core_lib::adapters::retry::{RetryPolicy, RetryingIdentityProvider};
    use core_lib::{AuditSink, IdentityError};
    use std::time::Duration;

    struct Fixture {
        store: InMemoryStore,
        idp: InMemoryIdentityProvider,
        notifier: InMemoryNotifier,
        handler: ApproveRegistrationHandler,
    }

    fn fixture() -> Fixture {
        let store = InMemoryStore::default();
        let idp = InMemoryIdentityProvider::default();
        let notifier = InMemoryNotifier::new();
        let shared = Arc::new(store.clone());
        let handler = ApproveRegistrationHandler::new(
            shared.clone(),
            shared.clone(),
            Arc::new(idp.clone()),
            Arc::new(notifier.clone()),
            Arc::new(InMemoryCache::default()),
            AuditRecorder::new(shared),
        );
        Fixture {
            store,
            idp,
            notifier,
            handler,
        }
    }

    fn admin() -> AuditActor {
        AuditActor {
            id: Some(Uuid::new_v4().to_string()),
            email: Some("admin@tartrack.test".into()),
            role: Some("admin".into()),
            ..Default::default()
        }
    }

    async fn pending(
        store: &InMemoryStore,
        role: RegistrationRole,
        phone: Option<&str>,
        password: Option<&str>,
        profile: Value,
    ) -> PendingRegistration {
        let profile: RegistrationProfile = serde_json::from_value(profile).unwrap();
        let registration = PendingRegistration::new(
            format!("{}@example.com", Uuid::new_v4().simple()),
            phone.map(str::to_string),
            role,
            password.map(str::to_string),
            profile,
        );
        store.insert_registration(registration.clone()).await.unwrap();
        registration
    }

    fn approve(registration_id: Uuid, notify_via: Option<NotificationChannel>) -> ApproveRegistration {
        ApproveRegistration {
            registration_id,
            admin: admin(),
            notify_via,
        }
    }

    #[tokio::test]
    async fn test_generated_password_is_sent_and_forces_change() {
        let f = fixture();
        let reg = pending(
            &f.store,
            RegistrationRole::Driver,
            Some("+639171234567"),
            None,
            json!({ "owned_count": "2", "first_name": "Ana" }),
        )
        .await;

        let outcome = f.handler.handle(approve(reg.id, None)).await.unwrap();
        assert_eq!(outcome.role, UserRole::DriverOwner);
        assert!(outcome.password_generated);
        assert!(outcome.notifications.email.success);
        assert!(outcome.notifications.sms.success);

        let user = f.store.get_user(outcome.user_id).await.unwrap().unwrap();
        assert!(user.force_password_change);
        assert_eq!(user.role, UserRole::DriverOwner);

        let email = &f.notifier.sent_to(OutboxChannel::Email, &reg.email)[0];
        let password = email
            .body
            .lines()
            .find_map(|l| l.strip_prefix("Password: "))
            .expect("generated password in email");
        assert!(meets_policy(password));
        assert!(f.idp.authenticate(&reg.email, password).await.is_ok());
    }

    #[tokio::test]
    async fn test_supplied_password_is_never_disclosed() {
        let f = fixture();
        let reg = pending(
            &f.store,
            RegistrationRole::Owner,
            None,
            Some("MyOwnPass99"),
            json!({}),
        )
        .await;

        let outcome = f.handler.handle(approve(reg.id, None)).await.unwrap();
        assert!(!outcome.password_generated);
        let user = f.store.get_user(outcome.user_id).await.unwrap().unwrap();
        assert!(!user.force_password_change);
        for message in f.notifier.messages() {
            assert!(!message.body.contains("MyOwnPass99"));
        }
        assert!(f.idp.authenticate(&reg.email, "MyOwnPass99").await.is_ok());
    }

    #[tokio::test]
    async fn test_second_approval_fails_without_second_account() {
        let f = fixture();
        let reg = pending(&f.store, RegistrationRole::Driver, None, None, json!({})).await;

        f.handler.handle(approve(reg.id, None)).await.unwrap();
        let err = f.handler.handle(approve(reg.id, None)).await.unwrap_err();
        assert!(matches!(err, ApplicationError::Core(CoreError::InvalidState(_))));
        assert_eq!(f.idp.account_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_approvals_create_one_account() {
        let f = Arc::new(fixture());
        let reg = pending(&f.store, RegistrationRole::Driver, None, None, json!({})).await;

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let f = f.clone();
                tokio::spawn(async move { f.handler.handle(approve(reg.id, None)).await.is_ok() })
            })
            .collect();
        let mut successes = 0;
        for task in tasks {
            if task.await.unwrap() {
                successes += 1;
            }
        }
        assert_eq!(successes, 1);
        assert_eq!(f.idp.account_count(), 1);
        let stored = f.store.get_registration(reg.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RegistrationStatus::Approved);
    }

    #[tokio::test]
    async fn test_provider_rejection_leaves_registration_pending() {
        let f = fixture();
        let reg = pending(&f.store, RegistrationRole::Driver, None, None, json!({})).await;
        f.idp.fail_next_create(IdentityError::AlreadyExists);

        let err = f.handler.handle(approve(reg.id, None)).await.unwrap_err();
        assert!(matches!(err, ApplicationError::Identity(IdentityError::AlreadyExists)));
        let stored = f.store.get_registration(reg.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RegistrationStatus::Pending);
        assert!(f.notifier.messages().is_empty());
    }

    #[tokio::test]
    async fn test_lost_create_reply_still_approves_once() {
        let f = fixture();
        let shared = Arc::new(f.store.clone());
        let handler = ApproveRegistrationHandler::new(
            shared.clone(),
            shared.clone(),
            Arc::new(RetryingIdentityProvider::new(
                f.idp.clone(),
                RetryPolicy::new(3, Duration::from_millis(1)),
            )),
            Arc::new(f.notifier.clone()),
            Arc::new(InMemoryCache::default()),
            AuditRecorder::new(shared),
        );
        let reg = pending(&f.store, RegistrationRole::Driver, None, Some("Chosen2025"), json!({})).await;
        f.idp.lose_next_create_reply();

        let outcome = handler.handle(approve(reg.id, None)).await.unwrap();
        assert_eq!(f.idp.account_count(), 1);
        assert_eq!(f.idp.account_id_for(&reg.email), Some(outcome.user_id));
        let stored = f.store.get_registration(reg.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RegistrationStatus::Approved);
        assert!(f.idp.authenticate(&reg.email, "Chosen2025").await.is_ok());
    }

    #[tokio::test]
    async fn test_notification_failure_does_not_undo_approval() {
        let f = fixture();
        f.notifier.fail_channel(OutboxChannel::Email, true);
        let reg = pending(&f.store, RegistrationRole::Driver, None, None, json!({})).await;

        let outcome = f.handler.handle(approve(reg.id, None)).await.unwrap();
        assert!(outcome.notifications.email.attempted);
        assert!(!outcome.notifications.email.success);
        let stored = f.store.get_registration(reg.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RegistrationStatus::Approved);
    }

    #[tokio::test]
    async fn test_both_without_phone_degrades_to_email() {
        let f = fixture();
        let reg = pending(
            &f.store,
            RegistrationRole::Driver,
            None,
            None,
            json!({ "preferred_notification": "both" }),
        )
        .await;

        let outcome = f.handler.handle(approve(reg.id, None)).await.unwrap();
        assert!(outcome.notifications.email.success);
        assert!(!outcome.notifications.sms.attempted);
        assert!(outcome.notifications.sms.error.is_none());
    }

    #[tokio::test]
    async fn test_admin_override_beats_preference() {
        let f = fixture();
        let reg = pending(
            &f.store,
            RegistrationRole::Owner,
            Some("09171234567"),
            None,
            json!({ "preferred_notification": "email" }),
        )
        .await;

        let outcome = f
            .handler
            .handle(approve(reg.id, Some(NotificationChannel::Sms)))
            .await
            .unwrap();
        assert!(!outcome.notifications.email.attempted);
        assert!(outcome.notifications.sms.success);
        assert_eq!(f.notifier.sent_to(OutboxChannel::Sms, "+639171234567").len(), 1);
    }

    #[tokio::test]
    async fn test_approval_is_audited() {
        let f = fixture();
        let reg = pending(&f.store, RegistrationRole::Driver, None, None, json!({})).await;
        f.handler.handle(approve(reg.id, None)).await.unwrap();

        let entries = f.store.recent(10, 0).await.unwrap();
        let entry = entries
            .iter()
            .find(|e| e.action == "registration_approved")
            .expect("approval audit entry");
        assert_eq!(entry.entity_id.as_deref(), Some(reg.id.to_string().as_str()));
        assert_eq!(entry.actor_email.as_deref(), Some("admin@tartrack.test"));
        assert!(!entry.new_data.as_ref().unwrap().to_string().contains("Password"));
    }
}
