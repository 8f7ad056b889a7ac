use crate::AppState;
use crate::application::audit::{AuditRecorder, ENTITY_USER, anonymous_actor};
use crate::application::devices::{DeviceCheck, DeviceTrustLayer};
use crate::application::gate::AccountGate;
use crate::application::middleware::{AuthenticatedUser, ClientContext, store_session};
use crate::application::{ApiJson, ApiResponse, ApplicationError};
use axum::{extract::State, response::IntoResponse};
use chrono::Utc;
use core_lib::domain::audit::{AuditActor, AuditLogEntry};
use core_lib::domain::device::DeviceTrust;
use core_lib::domain::user::{AccountStatus, User, UserRole};
use core_lib::{
    Cache, Command, CommandHandler, DeletionStore, DeviceStore, IdentityError, IdentityProvider,
    NotificationGateway, TokenPair, UserStore,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

pub struct Login {
    pub email: String,
    pub password: String,
    /// Roles the calling client accepts. `None` or empty accepts any role.
    pub allowed_roles: Option<Vec<UserRole>>,
    pub device_id: Option<String>,
    pub client: ClientContext,
}

impl Command for Login {}

/// Account details returned alongside tokens.
#[derive(Debug, Clone, Serialize)]
pub struct UserSummary {
    pub id: Uuid,
    pub email: String,
    pub role: UserRole,
    pub status: AccountStatus,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub force_password_change: bool,
}

impl From<&User> for UserSummary {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            email: user.email.clone(),
            role: user.role,
            status: user.status,
            name: user.profile.name.clone(),
            phone: user.profile.phone.clone(),
            force_password_change: user.force_password_change,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct LoginOutcome {
    pub requires_device_verification: bool,
    pub device_trust: DeviceTrust,
    pub device_fingerprint: String,
    pub user: UserSummary,
    /// Absent until the device is trusted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<TokenPair>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification_email_sent: Option<bool>,
    pub deletion_cancelled: bool,
    pub suspension_lifted: bool,
    pub message: String,
}

pub struct LoginHandler {
    identity: Arc<dyn IdentityProvider>,
    cache: Arc<dyn Cache>,
    gate: AccountGate,
    devices: DeviceTrustLayer,
    audit: AuditRecorder,
    session_ttl_secs: u64,
}

impl LoginHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        users: Arc<dyn UserStore>,
        deletions: Arc<dyn DeletionStore>,
        devices: Arc<dyn DeviceStore>,
        identity: Arc<dyn IdentityProvider>,
        notifier: Arc<dyn NotificationGateway>,
        cache: Arc<dyn Cache>,
        audit: AuditRecorder,
        session_ttl_secs: u64,
    ) -> Self {
        Self {
            identity,
            cache,
            gate: AccountGate::new(users, deletions, audit.clone()),
            devices: DeviceTrustLayer::new(devices, notifier, audit.clone()),
            audit,
            session_ttl_secs,
        }
    }
}

fn user_actor(user: &User, client: &ClientContext) -> AuditActor {
    AuditActor {
        id: Some(user.id.to_string()),
        email: Some(user.email.clone()),
        role: Some(user.role.as_str().to_string()),
        ip_address: client.ip_address.clone(),
        device_info: client.user_agent.clone(),
    }
}

impl CommandHandler<Login> for LoginHandler {
    type Output = LoginOutcome;
    type Error = ApplicationError;

    async fn handle(&self, command: Login) -> Result<LoginOutcome, ApplicationError> {
        if command.email.trim().is_empty() || command.password.is_empty() {
            return Err(ApplicationError::validation("Email and password are required"));
        }

        let account = match self.identity.authenticate(&command.email, &command.password).await {
            Ok(account) => account,
            Err(e) => {
                warn!(error = %e, "Login rejected by identity provider");
                if e == IdentityError::InvalidCredentials {
                    self.audit
                        .record(AuditLogEntry::new(
                            &anonymous_actor(Some(&command.email), &command.client),
                            "login_failed",
                            ENTITY_USER,
                            None,
                        ))
                        .await;
                }
                return Err(e.into());
            }
        };

        let mut user = self.gate.load_or_create_user(&account).await?;
        if let Some(allowed) = command.allowed_roles.as_deref().filter(|a| !a.is_empty()) {
            if !user.role.satisfies(allowed) {
                warn!(user_id = %user.id, role = %user.role, "Login refused for role");
                return Err(ApplicationError::forbidden(
                    "This account cannot sign in to this application",
                ));
            }
        }

        let now = Utc::now();
        let actor = user_actor(&user, &command.client);
        // Deletion first: a returning user may also be independently suspended.
        let deletion_cancelled = self
            .gate
            .cancel_scheduled_deletion(&mut user, &actor, now)
            .await?
            .is_some();
        let suspension_lifted = self.gate.enforce_suspension(&mut user, &actor, now).await?;

        let signal = command.client.device_signal(command.device_id);
        let check = self.devices.check(&user, &signal, &actor, now).await?;
        let device_trust = check.trust();
        let (fingerprint, email_sent) = match check {
            DeviceCheck::Trusted { fingerprint } => (fingerprint, None),
            DeviceCheck::VerificationSent {
                fingerprint,
                email_sent,
            } => (fingerprint, Some(email_sent)),
        };

        if let Some(email_sent) = email_sent {
            let message = if email_sent {
                "New device detected. Enter the verification code sent to your email."
            } else {
                "New device detected, but the verification email could not be sent. Please try again."
            };
            return Ok(LoginOutcome {
                requires_device_verification: true,
                device_trust,
                device_fingerprint: fingerprint,
                user: UserSummary::from(&user),
                tokens: None,
                verification_email_sent: Some(email_sent),
                deletion_cancelled,
                suspension_lifted,
                message: message.into(),
            });
        }

        let session = AuthenticatedUser {
            user_id: user.id,
            email: user.email.clone(),
            role: user.role,
        };
        store_session(
            self.cache.as_ref(),
            &account.tokens.access_token,
            &session,
            self.session_ttl_secs,
        )
        .await?;
        info!(user_id = %user.id, role = %user.role, "Login succeeded");

        self.audit
            .record(
                AuditLogEntry::new(&actor, "login", ENTITY_USER, Some(user.id.to_string()))
                    .with_new(json!({
                        "deletion_cancelled": deletion_cancelled,
                        "suspension_lifted": suspension_lifted,
                    })),
            )
            .await;

        let message = if deletion_cancelled {
            "Welcome back! Your scheduled account deletion has been cancelled."
        } else if suspension_lifted {
            "Welcome back! Your suspension has ended."
        } else {
            "Login successful"
        };
        Ok(LoginOutcome {
            requires_device_verification: false,
            device_trust,
            device_fingerprint: fingerprint,
            user: UserSummary::from(&user),
            tokens: Some(account.tokens),
            verification_email_sent: None,
            deletion_cancelled,
            suspension_lifted,
            message: message.into(),
        })
    }
}

// --- DTO for the HTTP Request ---

#[derive(Deserialize, Debug)]
pub struct LoginDto {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub allowed_roles: Option<Vec<String>>,
    #[serde(default)]
    pub device_id: Option<String>,
}

// --- Axum Route Handler ---

pub async fn handle_login_request(
    State(state): State<AppState>,
    client: ClientContext,
    ApiJson(payload): ApiJson<LoginDto>,
) -> Result<impl IntoResponse, ApplicationError> {
    let allowed_roles = payload
        .allowed_roles
        .map(|roles| {
            roles
                .iter()
                .map(|r| {
                    UserRole::parse(r)
                        .ok_or_else(|| ApplicationError::validation(format!("Unknown role: {r}")))
                })
                .collect::<Result<Vec<_>, _>>()
        })
        .transpose()?;

    let handler = LoginHandler::new(
        state.users.clone(),
        state.deletions.clone(),
        state.devices.clone(),
        state.identity.clone(),
        state.notifier.clone(),
        state.cache.clone(),
        AuditRecorder::new(state.audit.clone()),
        state.settings.session_ttl_secs,
    );
    let outcome = handler
        .handle(Login {
            email: payload.email.trim().to_lowercase(),
            password: payload.password,
            allowed_roles,
            device_id: payload.device_id,
            client,
        })
        .await?;

    Ok(ApiResponse::ok(outcome))
}
