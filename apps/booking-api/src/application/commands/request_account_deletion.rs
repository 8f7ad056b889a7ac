use crate::AppState;
use crate::application::audit::{AuditRecorder, ENTITY_DELETION, actor_for};
use crate::application::middleware::{AuthenticatedUser, ClientContext};
use crate::application::{ApiJson, ApiResponse, ApplicationError};
use axum::{Extension, extract::State, http::StatusCode, response::IntoResponse};
use chrono::{DateTime, Utc};
use core_lib::domain::audit::AuditLogEntry;
use core_lib::domain::deletion::{AccountDeletionRequest, DELETION_GRACE_DAYS, DeletionStatus};
use core_lib::{Command, CommandHandler, CoreError, DeletionStore, UserStore};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

pub struct RequestAccountDeletion {
    pub caller: AuthenticatedUser,
    pub reason: Option<String>,
    pub client: ClientContext,
}

impl Command for RequestAccountDeletion {}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeletionStatusView {
    pub scheduled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<DeletionStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_deletion_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub days_remaining: Option<i64>,
}

impl DeletionStatusView {
    fn of(request: Option<&AccountDeletionRequest>, now: DateTime<Utc>) -> Self {
        match request {
            Some(r) => Self {
                scheduled: r.status == DeletionStatus::Scheduled,
                request_id: Some(r.id),
                status: Some(r.status),
                scheduled_deletion_at: Some(r.scheduled_deletion_at),
                days_remaining: Some(r.days_remaining(now)),
            },
            None => Self {
                scheduled: false,
                request_id: None,
                status: None,
                scheduled_deletion_at: None,
                days_remaining: None,
            },
        }
    }
}

pub struct AccountDeletionHandler {
    users: Arc<dyn UserStore>,
    deletions: Arc<dyn DeletionStore>,
    audit: AuditRecorder,
}

impl AccountDeletionHandler {
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

    pub async fn status(&self, user_id: Uuid) -> Result<DeletionStatusView, ApplicationError> {
        let scheduled = self.deletions.find_scheduled(user_id).await?;
        Ok(DeletionStatusView::of(scheduled.as_ref(), Utc::now()))
    }
}

impl CommandHandler<RequestAccountDeletion> for AccountDeletionHandler {
    type Output = DeletionStatusView;
    type Error = ApplicationError;

    async fn handle(
        &self,
        command: RequestAccountDeletion,
    ) -> Result<DeletionStatusView, ApplicationError> {
        let user = self
            .users
            .get_user(command.caller.user_id)
            .await?
            .ok_or_else(|| CoreError::NotFound("User not found".into()))?;

        let now = Utc::now();
        let reason = command
            .reason
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty());
        let request = AccountDeletionRequest::schedule(user.id, reason, now);
        self.deletions.insert_deletion(request.clone()).await?;

        self.users.set_pending_deletion(user.id, true, now).await?;
        info!(user_id = %user.id, "Account deletion scheduled");

        self.audit
            .record(
                AuditLogEntry::new(
                    &actor_for(&command.caller, &command.client),
                    "account_deletion_requested",
                    ENTITY_DELETION,
                    Some(request.id.to_string()),
                )
                .with_new(json!({
                    "status": "scheduled",
                    "scheduled_deletion_at": request.scheduled_deletion_at,
                    "grace_days": DELETION_GRACE_DAYS,
                })),
            )
            .await;

        Ok(DeletionStatusView::of(Some(&request), now))
    }
}

// --- DTO for the HTTP Request ---

#[derive(Deserialize, Debug, Default)]
pub struct RequestAccountDeletionDto {
    #[serde(default)]
    pub reason: Option<String>,
}

// --- Axum Route Handlers ---

pub async fn handle_request_account_deletion(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthenticatedUser>,
    client: ClientContext,
    ApiJson(payload): ApiJson<RequestAccountDeletionDto>,
) -> Result<impl IntoResponse, ApplicationError> {
    let handler = AccountDeletionHandler::new(
        state.users.clone(),
        state.deletions.clone(),
        AuditRecorder::new(state.audit.clone()),
    );
    let view = handler
        .handle(RequestAccountDeletion {
            caller: ctx,
            reason: payload.reason,
            client,
        })
        .await?;

    Ok((StatusCode::ACCEPTED, ApiResponse::ok(view)))
}

pub async fn handle_account_deletion_status(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthenticatedUser>,
) -> Result<impl IntoResponse, ApplicationError> {
    let handler = AccountDeletionHandler::new(
        state.users.clone(),
        state.deletions.clone(),
        AuditRecorder::new(state.audit.clone()),
    );
    Ok(ApiResponse::ok(handler.status(ctx.user_id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_lib::adapters::in_memory_store::InMemoryStore;
    use core_lib::domain::user::{User, UserRole};

    async fn setup() -> (InMemoryStore, AccountDeletionHandler, AuthenticatedUser) {
        let store = InMemoryStore::default();
        let shared = Arc::new(store.clone());
        let handler =
            AccountDeletionHandler::new(shared.clone(), shared.clone(), AuditRecorder::new(shared));
        let user = User::new(Uuid::new_v4(), "leaving@example.com".into(), UserRole::Tourist);
        store.insert_user(user.clone()).await.unwrap();
        let caller = AuthenticatedUser {
            user_id: user.id,
            email: user.email,
            role: UserRole::Tourist,
        };
        (store, handler, caller)
    }

    fn request(caller: &AuthenticatedUser) -> RequestAccountDeletion {
        RequestAccountDeletion {
            caller: caller.clone(),
            reason: Some("Moving away".into()),
            client: ClientContext::default(),
        }
    }

    #[tokio::test]
    async fn test_schedule_marks_user_and_reports_days() {
        let (store, handler, caller) = setup().await;
        assert!(!handler.status(caller.user_id).await.unwrap().scheduled);

        let view = handler.handle(request(&caller)).await.unwrap();
        assert!(view.scheduled);
        assert_eq!(view.days_remaining, Some(DELETION_GRACE_DAYS));
        assert!(store.get_user(caller.user_id).await.unwrap().unwrap().pending_deletion);

        let status = handler.status(caller.user_id).await.unwrap();
        assert_eq!(status.request_id, view.request_id);
    }

    #[tokio::test]
    async fn test_second_request_conflicts() {
        let (_store, handler, caller) = setup().await;
        handler.handle(request(&caller)).await.unwrap();
        let err = handler.handle(request(&caller)).await.unwrap_err();
        assert!(matches!(err, ApplicationError::Core(CoreError::Conflict(_))));
    }
}
