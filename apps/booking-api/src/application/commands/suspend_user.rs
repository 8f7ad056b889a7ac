use crate::AppState;
use crate::application::audit::{AuditRecorder, ENTITY_USER, actor_for};
use crate::application::authz::{Requirement, authorize};
use crate::application::middleware::{AuthenticatedUser, ClientContext};
use crate::application::query::SuspensionStatus;
use crate::application::{ApiJson, ApiResponse, ApplicationError};
use axum::{
    Extension,
    extract::{Path, State},
    response::IntoResponse,
};
use chrono::{Duration, Utc};
use core_lib::domain::audit::{AuditActor, AuditLogEntry};
use core_lib::domain::user::{AccountStatus, Suspension};
use core_lib::{Command, CommandHandler, CoreError, UserStore};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Upper bound for a time-boxed suspension; anything longer should be permanent.
const MAX_SUSPENSION_DAYS: u32 = 3650;

pub struct SuspendUser {
    pub target_user_id: Uuid,
    pub admin_user_id: Uuid,
    pub admin: AuditActor,
    pub reason: String,
    /// `None` suspends until an admin lifts it.
    pub duration_days: Option<u32>,
}

impl Command for SuspendUser {}

pub struct UnsuspendUser {
    pub target_user_id: Uuid,
    pub admin: AuditActor,
}

impl Command for UnsuspendUser {}

pub struct SuspensionHandler {
    users: Arc<dyn UserStore>,
    audit: AuditRecorder,
}

impl SuspensionHandler {
    pub fn new(users: Arc<dyn UserStore>, audit: AuditRecorder) -> Self {
        Self { users, audit }
    }
}

impl CommandHandler<SuspendUser> for SuspensionHandler {
    type Output = SuspensionStatus;
    type Error = ApplicationError;

    async fn handle(&self, command: SuspendUser) -> Result<SuspensionStatus, ApplicationError> {
        let reason = command.reason.trim().to_string();
        if reason.is_empty() {
            return Err(ApplicationError::validation("Suspension reason is required"));
        }
        if let Some(days) = command.duration_days {
            if days == 0 || days > MAX_SUSPENSION_DAYS {
                return Err(ApplicationError::validation(format!(
                    "Suspension duration must be between 1 and {MAX_SUSPENSION_DAYS} days"
                )));
            }
        }
        if command.target_user_id == command.admin_user_id {
            return Err(ApplicationError::forbidden("You cannot suspend your own account"));
        }

        let mut user = self
            .users
            .get_user(command.target_user_id)
            .await?
            .ok_or_else(|| CoreError::NotFound("User not found".into()))?;
        let previous = SuspensionStatus::of(&user, Utc::now());

        let now = Utc::now();
        let suspension = Suspension {
            reason: reason.clone(),
            suspended_by: command
                .admin
                .email
                .clone()
                .unwrap_or_else(|| "admin".to_string()),
            suspended_at: now,
            suspended_until: command
                .duration_days
                .map(|days| now + Duration::days(i64::from(days))),
        };
        self.users.suspend_user(user.id, &suspension).await?;
        user.suspend(suspension);
        info!(
            user_id = %user.id,
            duration_days = ?command.duration_days,
            "User suspended"
        );

        let status = SuspensionStatus::of(&user, now);
        self.audit
            .record(
                AuditLogEntry::new(
                    &command.admin,
                    "user_suspended",
                    ENTITY_USER,
                    Some(user.id.to_string()),
                )
                .with_old(json!(previous))
                .with_new(json!(status)),
            )
            .await;

        Ok(status)
    }
}

impl CommandHandler<UnsuspendUser> for SuspensionHandler {
    type Output = SuspensionStatus;
    type Error = ApplicationError;

    async fn handle(&self, command: UnsuspendUser) -> Result<SuspensionStatus, ApplicationError> {
        let mut user = self
            .users
            .get_user(command.target_user_id)
            .await?
            .ok_or_else(|| CoreError::NotFound("User not found".into()))?;
        if user.status != AccountStatus::Suspended {
            return Err(CoreError::InvalidState("User is not suspended".into()).into());
        }

        let now = Utc::now();
        let previous = SuspensionStatus::of(&user, now);
        if !self.users.lift_suspension(user.id, now).await? {
            return Err(CoreError::InvalidState("User is not suspended".into()).into());
        }
        user.reactivate(now);
        info!(user_id = %user.id, "User unsuspended");

        let status = SuspensionStatus::of(&user, now);
        self.audit
            .record(
                AuditLogEntry::new(
                    &command.admin,
                    "user_unsuspended",
                    ENTITY_USER,
                    Some(user.id.to_string()),
                )
                .with_old(json!(previous))
                .with_new(json!(status)),
            )
            .await;

        Ok(status)
    }
}

// --- DTO for the HTTP Request ---

#[derive(Deserialize, Debug)]
pub struct SuspendUserDto {
    pub reason: String,
    #[serde(default)]
    pub duration_days: Option<u32>,
}

// --- Axum Route Handlers ---

pub async fn handle_suspend_user_request(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthenticatedUser>,
    Path(user_id): Path<Uuid>,
    client: ClientContext,
    ApiJson(payload): ApiJson<SuspendUserDto>,
) -> Result<impl IntoResponse, ApplicationError> {
    authorize(&ctx, Requirement::AdminOnly)?;

    let handler = SuspensionHandler::new(state.users.clone(), AuditRecorder::new(state.audit.clone()));
    let status = handler
        .handle(SuspendUser {
            target_user_id: user_id,
            admin_user_id: ctx.user_id,
            admin: actor_for(&ctx, &client),
            reason: payload.reason,
            duration_days: payload.duration_days,
        })
        .await?;

    Ok(ApiResponse::ok(status))
}

pub async fn handle_unsuspend_user_request(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthenticatedUser>,
    Path(user_id): Path<Uuid>,
    client: ClientContext,
) -> Result<impl IntoResponse, ApplicationError> {
    authorize(&ctx, Requirement::AdminOnly)?;

    let handler = SuspensionHandler::new(state.users.clone(), AuditRecorder::new(state.audit.clone()));
    let status = handler
        .handle(UnsuspendUser {
            target_user_id: user_id,
            admin: actor_for(&ctx, &client),
        })
        .await?;

    Ok(ApiResponse::ok(status))
}
