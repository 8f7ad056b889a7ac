use super::login::UserSummary;
use crate::AppState;
use crate::application::audit::{AuditRecorder, actor_for};
use crate::application::gate::AccountGate;
use crate::application::middleware::{AuthenticatedUser, ClientContext, store_session};
use crate::application::{ApiJson, ApiResponse, ApplicationError};
use axum::{extract::State, response::IntoResponse};
use chrono::Utc;
use core_lib::{
    Cache, Command, CommandHandler, DeletionStore, IdentityProvider, TokenPair, UserStore,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct RefreshToken {
    pub refresh_token: String,
    pub client: ClientContext,
}

impl Command for RefreshToken {}

#[derive(Debug, Serialize)]
pub struct RefreshOutcome {
    pub user: UserSummary,
    pub tokens: TokenPair,
}

pub struct RefreshTokenHandler {
    identity: Arc<dyn IdentityProvider>,
    cache: Arc<dyn Cache>,
    gate: AccountGate,
    session_ttl_secs: u64,
}

impl RefreshTokenHandler {
    pub fn new(
        users: Arc<dyn UserStore>,
        deletions: Arc<dyn DeletionStore>,
        identity: Arc<dyn IdentityProvider>,
        cache: Arc<dyn Cache>,
        audit: AuditRecorder,
        session_ttl_secs: u64,
    ) -> Self {
        Self {
            identity,
            cache,
            gate: AccountGate::new(users, deletions, audit),
            session_ttl_secs,
        }
    }
}

impl CommandHandler<RefreshToken> for RefreshTokenHandler {
    type Output = RefreshOutcome;
    type Error = ApplicationError;

    async fn handle(&self, command: RefreshToken) -> Result<RefreshOutcome, ApplicationError> {
        let token = command.refresh_token.trim();
        if token.is_empty() {
            return Err(ApplicationError::validation("Refresh token is required"));
        }

        let account = self.identity.refresh(token).await.map_err(|e| {
            warn!(error = %e, "Token refresh rejected");
            ApplicationError::Identity(e)
        })?;
        let mut user = self.gate.load_or_create_user(&account).await?;

        // A suspension issued after login stops the session here.
        let session = AuthenticatedUser {
            user_id: user.id,
            email: user.email.clone(),
            role: user.role,
        };
        let actor = actor_for(&session, &command.client);
        self.gate.enforce_suspension(&mut user, &actor, Utc::now()).await?;

        store_session(
            self.cache.as_ref(),
            &account.tokens.access_token,
            &session,
            self.session_ttl_secs,
        )
        .await?;
        debug!(user_id = %user.id, "Session refreshed");

        Ok(RefreshOutcome {
            user: UserSummary::from(&user),
            tokens: account.tokens,
        })
    }
}

// --- DTO for the HTTP Request ---

#[derive(Deserialize, Debug)]
pub struct RefreshTokenDto {
    pub refresh_token: String,
}

// --- Axum Route Handler ---

pub async fn handle_refresh_token_request(
    State(state): State<AppState>,
    client: ClientContext,
    ApiJson(payload): ApiJson<RefreshTokenDto>,
) -> Result<impl IntoResponse, ApplicationError> {
    let handler = RefreshTokenHandler::new(
        state.users.clone(),
        state.deletions.clone(),
        state.identity.clone(),
        state.cache.clone(),
        AuditRecorder::new(state.audit.clone()),
        state.settings.session_ttl_secs,
    );
    let outcome = handler
        .handle(RefreshToken {
            refresh_token: payload.refresh_token,
            client,
        })
        .await?;

    Ok(ApiResponse::ok(outcome))
}
