use crate::AppState;
use crate::application::audit::{AuditRecorder, ENTITY_USER, actor_for};
use crate::application::middleware::{AuthenticatedUser, ClientContext};
use crate::application::{ApiJson, ApiResponse, ApplicationError};
use axum::{Extension, extract::State, response::IntoResponse};
use chrono::Utc;
use core_lib::domain::audit::AuditLogEntry;
use core_lib::domain::credentials::acceptable_user_password;
use core_lib::{Command, CommandHandler, CoreError, IdentityError, IdentityProvider, UserStore};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

pub struct ChangePassword {
    pub caller: AuthenticatedUser,
    pub current_password: String,
    pub new_password: String,
    pub client: ClientContext,
}

impl Command for ChangePassword {}

pub struct ChangePasswordHandler {
    users: Arc<dyn UserStore>,
    identity: Arc<dyn IdentityProvider>,
    audit: AuditRecorder,
}

impl ChangePasswordHandler {
    pub fn new(
        users: Arc<dyn UserStore>,
        identity: Arc<dyn IdentityProvider>,
        audit: AuditRecorder,
    ) -> Self {
        Self {
            users,
            identity,
            audit,
        }
    }
}

impl CommandHandler<ChangePassword> for ChangePasswordHandler {
    type Output = ();
    type Error = ApplicationError;

    async fn handle(&self, command: ChangePassword) -> Result<(), ApplicationError> {
        if !acceptable_user_password(&command.new_password) {
            return Err(ApplicationError::validation(
                "New password must be at least 8 characters and contain both letters and numbers",
            ));
        }
        if command.new_password == command.current_password {
            return Err(ApplicationError::validation(
                "New password must differ from the current one",
            ));
        }

        let user = self
            .users
            .get_user(command.caller.user_id)
            .await?
            .ok_or_else(|| CoreError::NotFound("User not found".into()))?;

        // Re-check the current password with the provider before rotating.
        match self
            .identity
            .authenticate(&user.email, &command.current_password)
            .await
        {
            Ok(account) if account.account_id == user.id => {}
            Ok(_) => {
                warn!(user_id = %user.id, "Provider account does not match session user");
                return Err(ApplicationError::forbidden("Password change is not allowed"));
            }
            Err(IdentityError::InvalidCredentials) => {
                return Err(ApplicationError::unauthorized("Current password is incorrect"));
            }
            Err(e) => return Err(e.into()),
        }

        self.identity
            .rotate_password(user.id, &command.new_password)
            .await?;

        let was_forced = user.force_password_change;
        self.users
            .set_force_password_change(user.id, false, Utc::now())
            .await?;
        info!(user_id = %user.id, "Password changed");

        self.audit
            .record(
                AuditLogEntry::new(
                    &actor_for(&command.caller, &command.client),
                    "password_changed",
                    ENTITY_USER,
                    Some(user.id.to_string()),
                )
                .with_old(json!({ "force_password_change": was_forced }))
                .with_new(json!({ "force_password_change": false })),
            )
            .await;

        Ok(())
    }
}

// --- DTO for the HTTP Request ---

#[derive(Deserialize, Debug)]
pub struct ChangePasswordDto {
    pub current_password: String,
    pub new_password: String,
}

// --- Axum Route Handler ---

pub async fn handle_change_password_request(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthenticatedUser>,
    client: ClientContext,
    ApiJson(payload): ApiJson<ChangePasswordDto>,
) -> Result<impl IntoResponse, ApplicationError> {
    let handler = ChangePasswordHandler::new(
        state.users.clone(),
        state.identity.clone(),
        AuditRecorder::new(state.audit.clone()),
    );
    handler
        .handle(ChangePassword {
            caller: ctx,
            current_password: payload.current_password,
            new_password: payload.new_password,
            client,
        })
        .await?;

    Ok(ApiResponse::ok(json!({ "message": "Password updated successfully" })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_lib::AccountMetadata;
    use core_lib::adapters::in_memory_identity::InMemoryIdentityProvider;
    use core_lib::adapters::in_memory_store::InMemoryStore;
    use core_lib::domain::user::{User, UserRole};

    async fn setup() -> (InMemoryStore, InMemoryIdentityProvider, AuthenticatedUser) {
        let store = InMemoryStore::default();
        let idp = InMemoryIdentityProvider::default();
        let id = idp
            .create_account("driver@example.com", "Xy7!kd9@Lm2#", &AccountMetadata::default())
            .await
            .unwrap();
        let mut user = User::new(id, "driver@example.com".into(), UserRole::Driver);
        user.force_password_change = true;
        store.insert_user(user).await.unwrap();
        let caller = AuthenticatedUser {
            user_id: id,
            email: "driver@example.com".into(),
            role: UserRole::Driver,
        };
        (store, idp, caller)
    }

    fn handler(store: &InMemoryStore, idp: &InMemoryIdentityProvider) -> ChangePasswordHandler {
        let shared = Arc::new(store.clone());
        ChangePasswordHandler::new(shared.clone(), Arc::new(idp.clone()), AuditRecorder::new(shared))
    }

    fn change(caller: &AuthenticatedUser, current: &str, new: &str) -> ChangePassword {
        ChangePassword {
            caller: caller.clone(),
            current_password: current.into(),
            new_password: new.into(),
            client: ClientContext::default(),
        }
    }

    #[tokio::test]
    async fn test_change_clears_forced_flag() {
        let (store, idp, caller) = setup().await;
        handler(&store, &idp)
            .handle(change(&caller, "Xy7!kd9@Lm2#", "MyChoice2025"))
            .await
            .unwrap();

        let user = store.get_user(caller.user_id).await.unwrap().unwrap();
        assert!(!user.force_password_change);
        assert!(idp.authenticate("driver@example.com", "MyChoice2025").await.is_ok());
        assert!(idp.authenticate("driver@example.com", "Xy7!kd9@Lm2#").await.is_err());
    }

    #[tokio::test]
    async fn test_wrong_current_password() {
        let (store, idp, caller) = setup().await;
        let err = handler(&store, &idp)
            .handle(change(&caller, "Wrong12345", "MyChoice2025"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApplicationError::Core(CoreError::Unauthorized(_))));
        assert!(store.get_user(caller.user_id).await.unwrap().unwrap().force_password_change);
    }

    #[tokio::test]
    async fn test_weak_new_password() {
        let (store, idp, caller) = setup().await;
        let err = handler(&store, &idp)
            .handle(change(&caller, "Xy7!kd9@Lm2#", "letters-only"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApplicationError::Core(CoreError::Validation(_))));
    }
}
