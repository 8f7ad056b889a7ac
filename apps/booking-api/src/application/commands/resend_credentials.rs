use crate::AppState;
use crate::application::audit::{AuditRecorder, ENTITY_USER, actor_for};
use crate::application::authz::{Requirement, authorize};
use crate::application::middleware::{AuthenticatedUser, ClientContext};
use crate::application::notify::{NotificationResults, Outgoing, deliver};
use crate::application::{ApiJson, ApiResponse, ApplicationError};
use axum::{Extension, extract::State, response::IntoResponse};
use chrono::Utc;
use core_lib::domain::audit::{AuditActor, AuditLogEntry};
use core_lib::domain::credentials::generate_password;
use core_lib::domain::notification::{
    NotificationChannel, approval_email, approval_sms, credentials_reminder_email,
    credentials_reminder_sms, normalize_phone, resolve_delivery,
};
use core_lib::domain::user::User;
use core_lib::{
    Command, CommandHandler, CoreError, IdentityError, IdentityProvider, NotificationGateway,
    RegistrationStore, UserStore,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

pub struct ResendCredentials {
    pub email: String,
    pub regenerate_password: bool,
    pub notify_via: Option<NotificationChannel>,
    pub admin: AuditActor,
}

impl Command for ResendCredentials {}

#[derive(Debug, Serialize)]
pub struct ResendOutcome {
    pub user_id: Uuid,
    pub email: String,
    pub password_regenerated: bool,
    pub notifications: NotificationResults,
}

pub struct ResendCredentialsHandler {
    registrations: Arc<dyn RegistrationStore>,
    users: Arc<dyn UserStore>,
    identity: Arc<dyn IdentityProvider>,
    notifier: Arc<dyn NotificationGateway>,
    audit: AuditRecorder,
}

impl ResendCredentialsHandler {
    pub fn new(
        registrations: Arc<dyn RegistrationStore>,
        users: Arc<dyn UserStore>,
        identity: Arc<dyn IdentityProvider>,
        notifier: Arc<dyn NotificationGateway>,
        audit: AuditRecorder,
    ) -> Self {
        Self {
            registrations,
            users,
            identity,
            notifier,
            audit,
        }
    }

    /// Passwords are rotated by user id, so the provider account under that id
    /// must carry the same email.
    async fn ensure_linked(&self, user: &User) -> Result<(), ApplicationError> {
        match self.identity.account_email(user.id).await {
            Ok(email) if email.eq_ignore_ascii_case(&user.email) => Ok(()),
            Ok(_) | Err(IdentityError::NotFound) => {
                warn!(user_id = %user.id, "User record has no matching identity provider account");
                Err(CoreError::InvalidState(
                    "User is not linked to an identity provider account; password not changed".into(),
                )
                .into())
            }
            Err(e) => Err(ApplicationError::Identity(e)),
        }
    }

    /// The channel the applicant asked for when they registered, if the user came
    /// through the approval queue.
    async fn stored_preference(&self, user: &User) -> Option<NotificationChannel> {
        let registration_id = user.registration_id?;
        match self.registrations.get_registration(registration_id).await {
            Ok(registration) => registration.and_then(|r| r.profile.preferred_notification),
            Err(e) => {
                warn!(user_id = %user.id, error = %e, "Could not load registration for notification preference");
                None
            }
        }
    }
}

impl CommandHandler<ResendCredentials> for ResendCredentialsHandler {
    type Output = ResendOutcome;
    type Error = ApplicationError;

    async fn handle(&self, command: ResendCredentials) -> Result<ResendOutcome, ApplicationError> {
        let mut user = self
            .users
            .find_user_by_email(&command.email)
            .await?
            .ok_or_else(|| CoreError::NotFound("User not found".into()))?;

        let password = if command.regenerate_password {
            self.ensure_linked(&user).await?;
            let password = generate_password();
            self.identity
                .rotate_password(user.id, &password)
                .await
                .map_err(|e| {
                    error!(user_id = %user.id, error = %e, "Identity provider refused password rotation");
                    ApplicationError::Identity(e)
                })?;
            self.users
                .set_force_password_change(user.id, true, Utc::now())
                .await?;
            user.force_password_change = true;
            info!(user_id = %user.id, "Password regenerated for credential resend");
            Some(password)
        } else {
            None
        };

        let phone = user.profile.phone.as_deref().and_then(normalize_phone);
        let preference = self.stored_preference(&user).await;
        let plan = resolve_delivery(command.notify_via, preference, phone.is_some());
        let role = user.role.as_str();
        let (email, sms) = match password.as_deref() {
            Some(secret) => (
                approval_email(role, &user.email, Some(secret)),
                approval_sms(role, &user.email, Some(secret)),
            ),
            None => (
                credentials_reminder_email(role, &user.email),
                credentials_reminder_sms(&user.email),
            ),
        };
        let notifications = deliver(
            self.notifier.as_ref(),
            plan,
            Outgoing {
                email_to: &user.email,
                phone: phone.as_deref(),
                email,
                sms,
            },
        )
        .await;

        self.audit
            .record(
                AuditLogEntry::new(
                    &command.admin,
                    "credentials_resent",
                    ENTITY_USER,
                    Some(user.id.to_string()),
                )
                .with_new(json!({
                    "password_regenerated": command.regenerate_password,
                    "notifications": notifications,
                })),
            )
            .await;

        Ok(ResendOutcome {
            user_id: user.id,
            email: user.email,
            password_regenerated: command.regenerate_password,
            notifications,
        })
    }
}

// --- DTO for the HTTP Request ---

#[derive(Deserialize, Debug)]
pub struct ResendCredentialsDto {
    pub email: String,
    #[serde(default)]
    pub regenerate_password: bool,
    #[serde(default)]
    pub notify_via: Option<NotificationChannel>,
}

// --- Axum Route Handler ---

pub async fn handle_resend_credentials_request(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthenticatedUser>,
    client: ClientContext,
    ApiJson(payload): ApiJson<ResendCredentialsDto>,
) -> Result<impl IntoResponse, ApplicationError> {
    authorize(&ctx, Requirement::AdminOnly)?;

    let handler = ResendCredentialsHandler::new(
        state.registrations.clone(),
        state.users.clone(),
        state.identity.clone(),
        state.notifier.clone(),
        AuditRecorder::new(state.audit.clone()),
    );
    let outcome = handler
        .handle(ResendCredentials {
            email: payload.email.trim().to_lowercase(),
            regenerate_password: payload.regenerate_password,
            notify_via: payload.notify_via,
            admin: actor_for(&ctx, &client),
        })
        .await?;

    Ok(ApiResponse::ok(outcome))
}
