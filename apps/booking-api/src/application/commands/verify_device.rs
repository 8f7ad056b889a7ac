use crate::AppState;
use crate::application::audit::AuditRecorder;
use crate::application::devices::DeviceTrustLayer;
use crate::application::middleware::ClientContext;
use crate::application::{ApiJson, ApiResponse, ApplicationError};
use axum::{extract::State, response::IntoResponse};
use chrono::Utc;
use core_lib::domain::audit::AuditActor;
use core_lib::domain::device::DeviceTrust;
use core_lib::{Command, CommandHandler, CoreError, DeviceStore, NotificationGateway, UserStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

pub struct VerifyDevice {
    pub user_id: Uuid,
    pub code: String,
    pub fingerprint: String,
    pub client: ClientContext,
}

impl Command for VerifyDevice {}

#[derive(Debug, Serialize)]
pub struct DeviceVerified {
    pub user_id: Uuid,
    pub device_trust: DeviceTrust,
    pub message: String,
}

pub struct VerifyDeviceHandler {
    users: Arc<dyn UserStore>,
    trust: DeviceTrustLayer,
}

impl VerifyDeviceHandler {
    pub fn new(
        users: Arc<dyn UserStore>,
        devices: Arc<dyn DeviceStore>,
        notifier: Arc<dyn NotificationGateway>,
        audit: AuditRecorder,
    ) -> Self {
        Self {
            users,
            trust: DeviceTrustLayer::new(devices, notifier, audit),
        }
    }
}

impl CommandHandler<VerifyDevice> for VerifyDeviceHandler {
    type Output = DeviceVerified;
    type Error = ApplicationError;

    async fn handle(&self, command: VerifyDevice) -> Result<DeviceVerified, ApplicationError> {
        let code = command.code.trim();
        if code.len() != 6 || !code.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ApplicationError::validation("Verification code must be 6 digits"));
        }
        let user = self
            .users
            .get_user(command.user_id)
            .await?
            .ok_or_else(|| CoreError::NotFound("User not found".into()))?;

        let actor = AuditActor {
            id: Some(user.id.to_string()),
            email: Some(user.email.clone()),
            role: Some(user.role.as_str().to_string()),
            ip_address: command.client.ip_address.clone(),
            device_info: command.client.user_agent.clone(),
        };
        self.trust
            .verify(user.id, &command.fingerprint, code, &actor, Utc::now())
            .await?;

        Ok(DeviceVerified {
            user_id: user.id,
            device_trust: DeviceTrust::Trusted,
            message: "Device verified. Please sign in again to continue.".into(),
        })
    }
}

// --- DTO for the HTTP Request ---

#[derive(Deserialize, Debug)]
pub struct VerifyDeviceDto {
    pub user_id: Uuid,
    pub code: String,
    /// Fingerprint returned by the login that asked for verification.
    #[serde(default)]
    pub device_fingerprint: Option<String>,
    /// Re-derives the fingerprint when the client did not keep it.
    #[serde(default)]
    pub device_id: Option<String>,
}

// --- Axum Route Handler ---

pub async fn handle_verify_device_request(
    State(state): State<AppState>,
    client: ClientContext,
    ApiJson(payload): ApiJson<VerifyDeviceDto>,
) -> Result<impl IntoResponse, ApplicationError> {
    let fingerprint = match payload
        .device_fingerprint
        .map(|f| f.trim().to_ascii_lowercase())
        .filter(|f| !f.is_empty())
    {
        Some(fingerprint) => fingerprint,
        None => client.device_signal(payload.device_id).fingerprint(),
    };

    let handler = VerifyDeviceHandler::new(
        state.users.clone(),
        state.devices.clone(),
        state.notifier.clone(),
        AuditRecorder::new(state.audit.clone()),
    );
    let outcome = handler
        .handle(VerifyDevice {
            user_id: payload.user_id,
            code: payload.code,
            fingerprint,
            client,
        })
        .await?;

    Ok(ApiResponse::ok(outcome))
}
