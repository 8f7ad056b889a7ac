use axum::{
    extract::{Extension, Path, Query, State},
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use core_lib::domain::registration::{PendingRegistration, RegistrationStatus};
use core_lib::domain::user::{AccountStatus, SuspensionState, User, UserRole};
use core_lib::{CoreError, RegistrationStore};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};
use uuid::Uuid;

use super::authz::{Requirement, authorize};
use super::middleware::AuthenticatedUser;
use super::{ApiResponse, ApplicationError};
use crate::AppState;

pub const PENDING_REGISTRATIONS_CACHE_KEY: &str = "q:v1:registrations:pending";
const TTL_LIST_SECONDS: u64 = 45;
const MAX_LIMIT: u32 = 200;
const DEFAULT_LIMIT: u32 = 50;

#[derive(Debug, Deserialize)]
pub struct Pagination {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

pub fn normalize_pagination(p: &Pagination) -> (u32, u32) {
    let mut limit = p.limit.unwrap_or(DEFAULT_LIMIT);
    if limit == 0 {
        limit = DEFAULT_LIMIT;
    }
    if limit > MAX_LIMIT {
        limit = MAX_LIMIT;
    }
    let offset = p.offset.unwrap_or(0);
    (limit, offset)
}

/// A pending application as an admin sees it, with the role it would get on approval.
#[derive(Debug, Serialize)]
pub struct PendingRegistrationView {
    #[serde(flatten)]
    pub registration: PendingRegistration,
    pub final_role: UserRole,
}

impl From<PendingRegistration> for PendingRegistrationView {
    fn from(registration: PendingRegistration) -> Self {
        let final_role = registration.final_role();
        Self {
            registration,
            final_role,
        }
    }
}

pub async fn load_pending_registrations(
    registrations: &dyn RegistrationStore,
) -> Result<Vec<PendingRegistrationView>, CoreError> {
    Ok(registrations
        .list_registrations(RegistrationStatus::Pending)
        .await?
        .into_iter()
        .map(PendingRegistrationView::from)
        .collect())
}

// GET /api/registrations/pending
pub async fn handle_list_pending_registrations(
    State(app_state): State<AppState>,
    Extension(ctx): Extension<AuthenticatedUser>,
) -> Result<impl IntoResponse, ApplicationError> {
    authorize(&ctx, Requirement::AdminOnly)?;

    if let Ok(Some(bytes)) = app_state.cache.get(PENDING_REGISTRATIONS_CACHE_KEY).await {
        if let Ok(resp) = serde_json::from_slice::<Value>(&bytes) {
            debug!("cache hit key={}", PENDING_REGISTRATIONS_CACHE_KEY);
            return Ok(ApiResponse::ok(resp));
        }
    }

    let views = load_pending_registrations(app_state.registrations.as_ref()).await?;
    let response = json!({
        "registrations": views,
        "count": views.len(),
    });

    if let Ok(bytes) = serde_json::to_vec(&response) {
        if let Err(e) = app_state
            .cache
            .set(PENDING_REGISTRATIONS_CACHE_KEY, &bytes, Some(TTL_LIST_SECONDS))
            .await
        {
            warn!("Failed to cache pending registrations: {}", e);
        }
    }

    Ok(ApiResponse::ok(response))
}

/// Suspension as seen by an operator; evaluated against the current time
/// without changing anything.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SuspensionStatus {
    pub user_id: Uuid,
    pub status: AccountStatus,
    pub suspended: bool,
    pub permanent: bool,
    /// Time box has run out; the next login reactivates the account.
    pub expired: bool,
    pub reason: Option<String>,
    pub suspended_by: Option<String>,
    pub suspended_at: Option<DateTime<Utc>>,
    pub suspended_until: Option<DateTime<Utc>>,
    pub remaining_days: Option<i64>,
}

impl SuspensionStatus {
    pub fn of(user: &User, now: DateTime<Utc>) -> Self {
        let state = user.suspension_state(now);
        let suspension = user.suspension.as_ref();
        Self {
            user_id: user.id,
            status: user.status,
            suspended: matches!(
                state,
                SuspensionState::Permanent | SuspensionState::Temporary { .. }
            ),
            permanent: state == SuspensionState::Permanent,
            expired: state == SuspensionState::Expired,
            reason: suspension.map(|s| s.reason.clone()),
            suspended_by: suspension.map(|s| s.suspended_by.clone()),
            suspended_at: suspension.map(|s| s.suspended_at),
            suspended_until: suspension.and_then(|s| s.suspended_until),
            remaining_days: match state {
                SuspensionState::Temporary { remaining_days } => Some(remaining_days),
                _ => None,
            },
        }
    }
}

// GET /api/users/{user_id}/suspension
pub async fn handle_suspension_status(
    State(app_state): State<AppState>,
    Extension(ctx): Extension<AuthenticatedUser>,
    Path(user_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApplicationError> {
    authorize(
        &ctx,
        Requirement::SelfOrAdmin {
            target_user_id: user_id,
        },
    )?;
    let user = app_state
        .users
        .get_user(user_id)
        .await?
        .ok_or_else(|| CoreError::NotFound("User not found".into()))?;

    Ok(ApiResponse::ok(SuspensionStatus::of(&user, Utc::now())))
}

// GET /api/audit-logs
pub async fn handle_list_audit_logs(
    State(app_state): State<AppState>,
    Extension(ctx): Extension<AuthenticatedUser>,
    Query(p): Query<Pagination>,
) -> Result<impl IntoResponse, ApplicationError> {
    authorize(&ctx, Requirement::AdminOnly)?;

    let (limit, offset) = normalize_pagination(&p);
    let entries = app_state.audit.recent(limit, offset).await?;

    Ok(ApiResponse::ok(json!({
        "entries": entries,
        "pagination": {
            "limit": limit,
            "offset": offset,
            "returned": entries.len()
        }
    })))
}
