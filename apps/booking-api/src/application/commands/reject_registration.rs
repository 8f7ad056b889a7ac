use super::approve_registration::NOT_PENDING;
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
use core_lib::domain::notification::{
    NotificationChannel, normalize_phone, rejection_email, rejection_sms, resolve_delivery,
};
use core_lib::domain::registration::RejectionDecision;
use core_lib::{Cache, Command, CommandHandler, CoreError, NotificationGateway, RegistrationStore};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

pub const DEFAULT_REJECTION_REASON: &str = "Application did not meet requirements";

pub struct RejectRegistration {
    pub registration_id: Uuid,
    pub admin: AuditActor,
    pub reason: String,
    pub notify_via: Option<NotificationChannel>,
}

impl Command for RejectRegistration {}

#[derive(Debug, Serialize)]
pub struct RejectionOutcome {
    pub registration_id: Uuid,
    pub reason: String,
    pub notifications: NotificationResults,
}

pub struct RejectRegistrationHandler {
    registrations: Arc<dyn RegistrationStore>,
    notifier: Arc<dyn NotificationGateway>,
    cache: Arc<dyn Cache>,
    audit: AuditRecorder,
}

impl RejectRegistrationHandler {
    pub fn new(
        registrations: Arc<dyn RegistrationStore>,
        notifier: Arc<dyn NotificationGateway>,
        cache: Arc<dyn Cache>,
        audit: AuditRecorder,
    ) -> Self {
        Self {
            registrations,
            notifier,
            cache,
            audit,
        }
    }
}

impl CommandHandler<RejectRegistration> for RejectRegistrationHandler {
    type Output = RejectionOutcome;
    type Error = ApplicationError;

    async fn handle(&self, command: RejectRegistration) -> Result<RejectionOutcome, ApplicationError> {
        let reason = command.reason.trim().to_string();
        if reason.is_empty() {
            return Err(ApplicationError::validation("Rejection reason is required"));
        }

        let registration = self
            .registrations
            .get_registration(command.registration_id)
            .await?
            .ok_or_else(|| CoreError::NotFound("Registration not found".into()))?;
        if !registration.is_pending() {
            return Err(CoreError::InvalidState(NOT_PENDING.into()).into());
        }

        let decision = RejectionDecision {
            rejected_by: command
                .admin
                .email
                .clone()
                .unwrap_or_else(|| "admin".to_string()),
            rejected_at: Utc::now(),
            reason: reason.clone(),
        };
        if !self.registrations.mark_rejected(registration.id, &decision).await? {
            warn!(registration_id = %registration.id, "Lost rejection race");
            return Err(CoreError::InvalidState(NOT_PENDING.into()).into());
        }
        info!(registration_id = %registration.id, "Registration rejected");

        let phone = registration.contact_phone().and_then(normalize_phone);
        let plan = resolve_delivery(
            command.notify_via,
            registration.profile.preferred_notification,
            phone.is_some(),
        );
        let role = registration.role.as_str();
        let notifications = deliver(
            self.notifier.as_ref(),
            plan,
            Outgoing {
                email_to: &registration.email,
                phone: phone.as_deref(),
                email: rejection_email(role, &reason),
                sms: rejection_sms(role, &reason),
            },
        )
        .await;

        self.audit
            .record(
                AuditLogEntry::new(
                    &command.admin,
                    "registration_rejected",
                    ENTITY_REGISTRATION,
                    Some(registration.id.to_string()),
                )
                .with_old(json!({ "status": "pending" }))
                .with_new(json!({
                    "status": "rejected",
                    "reason": reason,
                    "notifications": notifications,
                })),
            )
            .await;

        if let Err(e) = self.cache.delete(PENDING_REGISTRATIONS_CACHE_KEY).await {
            warn!("Failed to invalidate pending registrations cache: {}", e);
        }

        Ok(RejectionOutcome {
            registration_id: registration.id,
            reason,
            notifications,
        })
    }
}

// --- DTO for the HTTP Request ---

#[derive(Deserialize, Debug, Default)]
pub struct RejectRegistrationDto {
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub notify_via: Option<NotificationChannel>,
}

// --- Axum Route Handler ---

pub async fn handle_reject_registration_request(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthenticatedUser>,
    Path(registration_id): Path<Uuid>,
    client: ClientContext,
    ApiJson(payload): ApiJson<RejectRegistrationDto>,
) -> Result<impl IntoResponse, ApplicationError> {
    authorize(&ctx, Requirement::AdminOnly)?;

    let handler = RejectRegistrationHandler::new(
        state.registrations.clone(),
        state.notifier.clone(),
        state.cache.clone(),
        AuditRecorder::new(state.audit.clone()),
    );
    let outcome = handler
        .handle(RejectRegistration {
            registration_id,
            admin: actor_for(&ctx, &client),
            // An omitted reason falls back to the default; an explicit blank one is refused.
            reason: payload
                .reason
                .unwrap_or_else(|| DEFAULT_REJECTION_REASON.to_string()),
            notify_via: payload.notify_via,
        })
        .await?;

    Ok(ApiResponse::ok(outcome))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::commands::approve_registration::{
        ApproveRegistration, ApproveRegistrationHandler,
    };
    use core_lib::adapters::in_memory_cache::InMemoryCache;
    use core_lib::adapters::in_memory_identity::InMemoryIdentityProvider;
    use core_lib::adapters::in_memory_notifier::{InMemoryNotifier, OutboxChannel};
    use core_lib::adapters::in_memory_store::InMemoryStore;
    use core_lib::domain::registration::{
        PendingRegistration, RegistrationProfile, RegistrationRole, RegistrationStatus,
    };

    fn admin() -> AuditActor {
        AuditActor {
            email: Some("admin@tartrack.test".into()),
            role: Some("admin".into()),
            ..Default::default()
        }
    }

    fn handler(store: &InMemoryStore, notifier: &InMemoryNotifier) -> RejectRegistrationHandler {
        let shared = Arc::new(store.clone());
        RejectRegistrationHandler::new(
            shared.clone(),
            Arc::new(notifier.clone()),
            Arc::new(InMemoryCache::default()),
            AuditRecorder::new(shared),
        )
    }

    async fn pending(store: &InMemoryStore, phone: Option<&str>) -> PendingRegistration {
        let registration = PendingRegistration::new(
            format!("{}@example.com", Uuid::new_v4().simple()),
            phone.map(str::to_string),
            RegistrationRole::Owner,
            None,
            RegistrationProfile::default(),
        );
        store.insert_registration(registration.clone()).await.unwrap();
        registration
    }

    fn reject(registration_id: Uuid, reason: &str) -> RejectRegistration {
        RejectRegistration {
            registration_id,
            admin: admin(),
            reason: reason.to_string(),
            notify_via: None,
        }
    }

    #[tokio::test]
    async fn test_reject_records_reason_and_notifies() {
        let store = InMemoryStore::default();
        let notifier = InMemoryNotifier::new();
        let reg = pending(&store, Some("09171234567")).await;

        let outcome = handler(&store, &notifier)
            .handle(reject(reg.id, "Incomplete documents"))
            .await
            .unwrap();
        assert!(outcome.notifications.email.success);
        assert!(outcome.notifications.sms.success);

        let stored = store.get_registration(reg.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RegistrationStatus::Rejected);
        assert_eq!(stored.rejection_reason.as_deref(), Some("Incomplete documents"));
        assert_eq!(stored.rejected_by.as_deref(), Some("admin@tartrack.test"));

        let email = &notifier.sent_to(OutboxChannel::Email, &reg.email)[0];
        assert!(email.body.contains("Reason: Incomplete documents"));
    }

    #[tokio::test]
    async fn test_blank_reason_is_refused() {
        let store = InMemoryStore::default();
        let notifier = InMemoryNotifier::new();
        let reg = pending(&store, None).await;

        let err = handler(&store, &notifier).handle(reject(reg.id, "   ")).await.unwrap_err();
        assert!(matches!(err, ApplicationError::Core(CoreError::Validation(_))));
        let stored = store.get_registration(reg.id).await.unwrap().unwrap();
        assert!(stored.is_pending());
    }

    #[tokio::test]
    async fn test_non_pending_fails_identically() {
        let store = InMemoryStore::default();
        let notifier = InMemoryNotifier::new();
        let rejecter = handler(&store, &notifier);

        let rejected = pending(&store, None).await;
        rejecter.handle(reject(rejected.id, "No")).await.unwrap();
        let after_reject = rejecter.handle(reject(rejected.id, "No")).await.unwrap_err();

        let approved = pending(&store, None).await;
        let shared = Arc::new(store.clone());
        ApproveRegistrationHandler::new(
            shared.clone(),
            shared.clone(),
            Arc::new(InMemoryIdentityProvider::default()),
            Arc::new(notifier.clone()),
            Arc::new(InMemoryCache::default()),
            AuditRecorder::new(shared),
        )
        .handle(ApproveRegistration {
            registration_id: approved.id,
            admin: admin(),
            notify_via: None,
        })
        .await
        .unwrap();
        let after_approve = rejecter.handle(reject(approved.id, "No")).await.unwrap_err();

        assert_eq!(after_reject.to_string(), after_approve.to_string());
        assert!(matches!(after_approve, ApplicationError::Core(CoreError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_unknown_registration_is_not_found() {
        let store = InMemoryStore::default();
        let notifier = InMemoryNotifier::new();
        let err = handler(&store, &notifier)
            .handle(reject(Uuid::new_v4(), "No"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApplicationError::Core(CoreError::NotFound(_))));
    }
}
