use crate::AppState;
use crate::application::audit::{AuditRecorder, ENTITY_REGISTRATION, ENTITY_USER, actor_for, anonymous_actor};
use crate::application::middleware::{AuthenticatedUser, ClientContext, resolve_session};
use crate::application::query::PENDING_REGISTRATIONS_CACHE_KEY;
use crate::application::{ApiJson, ApiResponse, ApplicationError, looks_like_email};
use axum::{Json, extract::State, http::{HeaderMap, StatusCode}, response::IntoResponse};
use core_lib::domain::audit::AuditLogEntry;
use core_lib::domain::credentials::acceptable_user_password;
use core_lib::domain::notification::normalize_phone;
use core_lib::domain::registration::{PendingRegistration, RegistrationProfile, RegistrationRole};
use core_lib::domain::user::{User, UserRole};
use core_lib::{
    AccountMetadata, Cache, Command, CommandHandler, CoreError, IdentityProvider,
    RegistrationStore, UserStore,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

const PASSWORD_RULE: &str =
    "Password must be at least 8 characters and contain both letters and numbers";

pub struct SubmitRegistration {
    pub email: String,
    pub password: Option<String>,
    pub role: UserRole,
    pub phone: Option<String>,
    pub profile: RegistrationProfile,
    /// Session of the caller, if any. Needed to create an admin once one exists.
    pub caller: Option<AuthenticatedUser>,
    pub client: ClientContext,
}

impl Command for SubmitRegistration {}

#[derive(Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubmissionOutcome {
    PendingApproval {
        registration_id: Uuid,
        role: RegistrationRole,
        final_role: UserRole,
        message: String,
    },
    AccountCreated {
        user_id: Uuid,
        role: UserRole,
    },
}

pub struct SubmitRegistrationHandler {
    registrations: Arc<dyn RegistrationStore>,
    users: Arc<dyn UserStore>,
    identity: Arc<dyn IdentityProvider>,
    cache: Arc<dyn Cache>,
    audit: AuditRecorder,
}

impl SubmitRegistrationHandler {
    pub fn new(
        registrations: Arc<dyn RegistrationStore>,
        users: Arc<dyn UserStore>,
        identity: Arc<dyn IdentityProvider>,
        cache: Arc<dyn Cache>,
        audit: AuditRecorder,
    ) -> Self {
        Self {
            registrations,
            users,
            identity,
            cache,
            audit,
        }
    }

    async fn submit_for_approval(
        &self,
        role: RegistrationRole,
        command: SubmitRegistration,
    ) -> Result<SubmissionOutcome, ApplicationError> {
        let registration = PendingRegistration::new(
            command.email,
            command.phone,
            role,
            command.password,
            command.profile,
        );
        let registration_id = registration.id;
        let final_role = registration.final_role();
        let email = registration.email.clone();

        self.registrations.insert_registration(registration).await?;
        info!(registration_id = %registration_id, role = role.as_str(), "Registration submitted for approval");

        if let Err(e) = self.cache.delete(PENDING_REGISTRATIONS_CACHE_KEY).await {
            warn!("Failed to invalidate pending registrations cache: {}", e);
        }
        self.audit
            .record(
                AuditLogEntry::new(
                    &anonymous_actor(Some(&email), &command.client),
                    "registration_submitted",
                    ENTITY_REGISTRATION,
                    Some(registration_id.to_string()),
                )
                .with_new(json!({ "status": "pending", "role": role, "final_role": final_role })),
            )
            .await;

        Ok(SubmissionOutcome::PendingApproval {
            registration_id,
            role,
            final_role,
            message: "Registration submitted. You will be notified once an administrator reviews it."
                .into(),
        })
    }

    async fn create_account(
        &self,
        command: SubmitRegistration,
    ) -> Result<SubmissionOutcome, ApplicationError> {
        let role = command.role;
        if role == UserRole::Admin && self.users.any_user_with_role(UserRole::Admin).await? {
            match &command.caller {
                Some(caller) if caller.role == UserRole::Admin => {}
                _ => {
                    return Err(ApplicationError::forbidden(
                        "Only an administrator can create another administrator",
                    ));
                }
            }
        }

        let password = command
            .password
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| ApplicationError::validation("Password is required"))?;
        if self.users.find_user_by_email(&command.email).await?.is_some() {
            return Err(CoreError::Conflict("Email is already registered".into()).into());
        }

        let metadata = AccountMetadata {
            role: Some(role),
            name: command.profile.full_name(),
            phone: command.phone.clone(),
            force_password_change: false,
            extra: Default::default(),
        };
        let account_id = self
            .identity
            .create_account(&command.email, password, &metadata)
            .await
            .map_err(|e| {
                error!(error = %e, "Identity provider refused account creation");
                ApplicationError::Identity(e)
            })?;

        let mut user = User::new(account_id, command.email.clone(), role);
        user.profile.name = metadata.name.clone();
        user.profile.phone = command.phone.clone();
        user.profile.address = command.profile.address.clone();

        if let Err(e) = self.users.insert_user(user).await {
            // The email is held by a pending application; undo the provider account.
            if let Err(undo) = self.identity.delete_account(account_id).await {
                error!(account_id = %account_id, error = %undo, "Failed to remove orphaned account");
            }
            return Err(e.into());
        }
        info!(user_id = %account_id, role = %role, "Account created");

        let actor = match &command.caller {
            Some(caller) => actor_for(caller, &command.client),
            None => anonymous_actor(Some(&command.email), &command.client),
        };
        self.audit
            .record(
                AuditLogEntry::new(&actor, "user_registered", ENTITY_USER, Some(account_id.to_string()))
                    .with_new(json!({ "email": command.email, "role": role })),
            )
            .await;

        Ok(SubmissionOutcome::AccountCreated {
            user_id: account_id,
            role,
        })
    }
}

impl CommandHandler<SubmitRegistration> for SubmitRegistrationHandler {
    type Output = SubmissionOutcome;
    type Error = ApplicationError;

    async fn handle(&self, command: SubmitRegistration) -> Result<SubmissionOutcome, ApplicationError> {
        if !looks_like_email(&command.email) {
            return Err(ApplicationError::validation("Please enter a valid email address"));
        }
        if let Some(password) = command.password.as_deref().filter(|p| !p.trim().is_empty()) {
            if !acceptable_user_password(password) {
                return Err(ApplicationError::validation(PASSWORD_RULE));
            }
        }

        match command.role {
            UserRole::Driver => self.submit_for_approval(RegistrationRole::Driver, command).await,
            UserRole::Owner => self.submit_for_approval(RegistrationRole::Owner, command).await,
            UserRole::Tourist | UserRole::Admin => self.create_account(command).await,
            UserRole::DriverOwner => Err(ApplicationError::validation(
                "Register as a driver or an owner; combined roles are assigned on approval",
            )),
        }
    }
}

// --- DTO for the HTTP Request ---

#[derive(Deserialize, Debug)]
pub struct SubmitRegistrationDto {
    pub email: String,
    #[serde(default)]
    pub password: Option<String>,
    pub role: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub additional_data: RegistrationProfile,
}

// --- Axum Route Handler ---

pub async fn handle_submit_registration_request(
    State(state): State<AppState>,
    headers: HeaderMap,
    client: ClientContext,
    ApiJson(payload): ApiJson<SubmitRegistrationDto>,
) -> Result<impl IntoResponse, ApplicationError> {
    let role = UserRole::parse(payload.role.trim())
        .ok_or_else(|| ApplicationError::validation("Role must be one of: tourist, driver, owner, admin"))?;
    let phone = match payload.phone.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
        Some(raw) => Some(
            normalize_phone(raw)
                .ok_or_else(|| ApplicationError::validation("Please enter a valid phone number"))?,
        ),
        None => None,
    };
    let caller = resolve_session(state.cache.as_ref(), &headers)
        .await
        .unwrap_or_else(|e| {
            warn!("Ignoring session lookup failure during registration: {}", e);
            None
        });

    let handler = SubmitRegistrationHandler::new(
        state.registrations.clone(),
        state.users.clone(),
        state.identity.clone(),
        state.cache.clone(),
        AuditRecorder::new(state.audit.clone()),
    );
    let outcome = handler
        .handle(SubmitRegistration {
            email: payload.email.trim().to_lowercase(),
            password: payload.password,
            role,
            phone,
            profile: payload.additional_data,
            caller,
            client,
        })
        .await?;

    Ok((StatusCode::CREATED, ApiResponse::ok(outcome)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_lib::adapters::in_memory_cache::InMemoryCache;
    use core_lib::adapters::in_memory_identity::InMemoryIdentityProvider;
    use core_lib::adapters::in_memory_store::InMemoryStore;
    use core_lib::domain::registration::RegistrationStatus;

    fn handler(store: &InMemoryStore, idp: &InMemoryIdentityProvider) -> SubmitRegistrationHandler {
        let shared = Arc::new(store.clone());
        SubmitRegistrationHandler::new(
            shared.clone(),
            shared.clone(),
            Arc::new(idp.clone()),
            Arc::new(InMemoryCache::default()),
            AuditRecorder::new(shared),
        )
    }

    fn command(email: &str, role: UserRole, password: Option<&str>) -> SubmitRegistration {
        SubmitRegistration {
            email: email.into(),
            password: password.map(str::to_string),
            role,
            phone: None,
            profile: RegistrationProfile::default(),
            caller: None,
            client: ClientContext::default(),
        }
    }

    #[tokio::test]
    async fn test_driver_goes_to_pending_without_password() {
        let store = InMemoryStore::default();
        let idp = InMemoryIdentityProvider::default();
        let outcome = handler(&store, &idp)
            .handle(command("driver@example.com", UserRole::Driver, None))
            .await
            .unwrap();

        let SubmissionOutcome::PendingApproval { registration_id, .. } = outcome else {
            panic!("expected pending approval");
        };
        let stored = store.get_registration(registration_id).await.unwrap().unwrap();
        assert_eq!(stored.status, RegistrationStatus::Pending);
        assert!(stored.supplied_password().is_none());
        assert_eq!(idp.account_count(), 0);
    }

    #[tokio::test]
    async fn test_tourist_gets_account_immediately() {
        let store = InMemoryStore::default();
        let idp = InMemoryIdentityProvider::default();
        let outcome = handler(&store, &idp)
            .handle(command("tourist@example.com", UserRole::Tourist, Some("beach2025")))
            .await
            .unwrap();
        assert!(matches!(outcome, SubmissionOutcome::AccountCreated { role: UserRole::Tourist, .. }));
        assert_eq!(idp.account_count(), 1);
        assert!(store.find_user_by_email("tourist@example.com").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_tourist_requires_password_and_policy() {
        let store = InMemoryStore::default();
        let idp = InMemoryIdentityProvider::default();
        let h = handler(&store, &idp);
        assert!(h.handle(command("t@example.com", UserRole::Tourist, None)).await.is_err());
        assert!(h.handle(command("t@example.com", UserRole::Tourist, Some("short1"))).await.is_err());
        assert!(h.handle(command("t@example.com", UserRole::Tourist, Some("lettersonly"))).await.is_err());
        assert_eq!(idp.account_count(), 0);
    }

    #[tokio::test]
    async fn test_second_admin_needs_admin_caller() {
        let store = InMemoryStore::default();
        let idp = InMemoryIdentityProvider::default();
        let h = handler(&store, &idp);
        h.handle(command("root@example.com", UserRole::Admin, Some("bootstrap1")))
            .await
            .unwrap();

        let err = h
            .handle(command("second@example.com", UserRole::Admin, Some("bootstrap2")))
            .await
            .unwrap_err();
        assert!(matches!(err, ApplicationError::Core(CoreError::Forbidden(_))));

        let mut by_admin = command("second@example.com", UserRole::Admin, Some("bootstrap2"));
        by_admin.caller = Some(AuthenticatedUser {
            user_id: Uuid::new_v4(),
            email: "root@example.com".into(),
            role: UserRole::Admin,
        });
        assert!(h.handle(by_admin).await.is_ok());
    }

    #[tokio::test]
    async fn test_email_held_by_pending_registration_blocks_tourist() {
        let store = InMemoryStore::default();
        let idp = InMemoryIdentityProvider::default();
        let h = handler(&store, &idp);
        h.handle(command("same@example.com", UserRole::Owner, None)).await.unwrap();

        let err = h
            .handle(command("same@example.com", UserRole::Tourist, Some("beach2025")))
            .await
            .unwrap_err();
        assert!(matches!(err, ApplicationError::Core(CoreError::Conflict(_))));
        // The provider account created before the conflict was detected is removed.
        assert_eq!(idp.account_count(), 0);
    }
}
