use axum::{
    Json,
    extract::{FromRequest, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use core_lib::{CoreError, IdentityError};
use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::{error, warn};

// Declare sub-modules within the application layer
pub mod audit;
pub mod authz;
pub mod commands;
pub mod devices;
pub mod gate;
pub mod middleware;
pub mod notify;
pub mod query;

/// Top-level error type for the HTTP layer. Every variant renders as the
/// `{success: false, error, error_type}` envelope.
#[derive(thiserror::Error, Debug)]
pub enum ApplicationError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error("Account is permanently suspended: {reason}")]
    PermanentlySuspended { reason: String },

    #[error("Account is suspended for {remaining_days} more day(s): {reason}")]
    TemporarilySuspended {
        reason: String,
        remaining_days: i64,
        suspended_until: DateTime<Utc>,
    },

    #[error("Invalid verification code")]
    InvalidCode,

    #[error("Verification code has expired")]
    CodeExpired,

    #[error("No device verification is pending")]
    NoVerificationPending,

    #[error("Malformed request body: {0}")]
    MalformedBody(String),
}

impl ApplicationError {
    pub fn validation(message: impl Into<String>) -> Self {
        ApplicationError::Core(CoreError::Validation(message.into()))
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        ApplicationError::Core(CoreError::Forbidden(message.into()))
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        ApplicationError::Core(CoreError::Unauthorized(message.into()))
    }

    /// Status, machine-readable code, and the message that is safe to show a caller.
    fn classify(&self) -> (StatusCode, &'static str, String) {
        use ApplicationError as E;
        match self {
            E::Core(core) => match core {
                CoreError::Validation(m) => (StatusCode::BAD_REQUEST, "validation_error", m.clone()),
                CoreError::NotFound(m) => (StatusCode::NOT_FOUND, "not_found", m.clone()),
                CoreError::Conflict(m) => (StatusCode::CONFLICT, "conflict", m.clone()),
                CoreError::InvalidState(m) => (StatusCode::CONFLICT, "invalid_state", m.clone()),
                CoreError::Unauthorized(m) => (StatusCode::UNAUTHORIZED, "unauthorized", m.clone()),
                CoreError::Forbidden(m) => (StatusCode::FORBIDDEN, "forbidden", m.clone()),
                CoreError::Upstream(_) => (
                    StatusCode::BAD_GATEWAY,
                    "upstream_error",
                    "An external service failed. Please try again later.".into(),
                ),
                CoreError::Configuration(_)
                | CoreError::Infrastructure(_)
                | CoreError::Internal(_) => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "An internal error occurred".into(),
                ),
            },
            E::Identity(identity) => match identity {
                IdentityError::AlreadyExists => (
                    StatusCode::CONFLICT,
                    "already_exists",
                    "An account with this email already exists".into(),
                ),
                IdentityError::InvalidCredentials => (
                    StatusCode::UNAUTHORIZED,
                    "invalid_credentials",
                    "Invalid email or password".into(),
                ),
                IdentityError::EmailUnconfirmed => (
                    StatusCode::FORBIDDEN,
                    "email_unconfirmed",
                    "Please confirm your email address before logging in".into(),
                ),
                IdentityError::WeakPassword(_) => (
                    StatusCode::BAD_REQUEST,
                    "weak_password",
                    "Password does not meet the account security requirements".into(),
                ),
                IdentityError::InvalidInput(_) => (
                    StatusCode::BAD_REQUEST,
                    "identity_provider_error",
                    "The account service rejected the request".into(),
                ),
                IdentityError::InvalidToken => (
                    StatusCode::UNAUTHORIZED,
                    "invalid_token",
                    "Session has expired. Please log in again".into(),
                ),
                IdentityError::NotFound => {
                    (StatusCode::NOT_FOUND, "not_found", "Account not found".into())
                }
                IdentityError::RateLimited => (
                    StatusCode::TOO_MANY_REQUESTS,
                    "rate_limited",
                    "Too many attempts. Please wait a moment and try again".into(),
                ),
                IdentityError::Network(_) => (
                    StatusCode::BAD_GATEWAY,
                    "network_error",
                    "Unable to reach the authentication service. Please try again".into(),
                ),
                IdentityError::Timeout => (
                    StatusCode::GATEWAY_TIMEOUT,
                    "timeout",
                    "The authentication service took too long to respond".into(),
                ),
                IdentityError::Unexpected(_) => (
                    StatusCode::BAD_GATEWAY,
                    "identity_provider_error",
                    "The account service returned an unexpected response".into(),
                ),
            },
            E::PermanentlySuspended { reason } => (
                StatusCode::FORBIDDEN,
                "permanently_suspended",
                format!("Account suspended: {reason}"),
            ),
            E::TemporarilySuspended {
                reason,
                remaining_days,
                ..
            } => (
                StatusCode::FORBIDDEN,
                "temporarily_suspended",
                format!("Account suspended: {reason}. Suspension ends in {remaining_days} day(s)."),
            ),
            E::InvalidCode => (
                StatusCode::BAD_REQUEST,
                "invalid_code",
                "Invalid verification code".into(),
            ),
            E::CodeExpired => (
                StatusCode::BAD_REQUEST,
                "code_expired",
                "Verification code has expired. Please log in again to get a new code".into(),
            ),
            E::NoVerificationPending => (
                StatusCode::BAD_REQUEST,
                "no_verification_pending",
                "No pending verification for this device".into(),
            ),
            E::MalformedBody(m) => (StatusCode::BAD_REQUEST, "validation_error", m.clone()),
        }
    }
}

impl From<JsonRejection> for ApplicationError {
    fn from(rejection: JsonRejection) -> Self {
        ApplicationError::MalformedBody(rejection.body_text())
    }
}

/// Internal error text attached to error responses. Only surfaced when
/// `EXPOSE_ERROR_DETAILS` is on (see `middleware::error_details`).
#[derive(Debug, Clone)]
pub struct ErrorDetail(pub String);

impl IntoResponse for ApplicationError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = self.classify();
        if status.is_server_error() {
            error!(error = %self, error_type, "Request failed");
        } else {
            warn!(error = %self, error_type, "Request rejected");
        }

        let mut body = Map::new();
        body.insert("success".into(), Value::Bool(false));
        body.insert("error".into(), Value::String(message));
        body.insert("error_type".into(), Value::String(error_type.into()));
        match &self {
            ApplicationError::PermanentlySuspended { .. } => {
                body.insert("suspended".into(), Value::Bool(true));
                body.insert("permanent".into(), Value::Bool(true));
            }
            ApplicationError::TemporarilySuspended {
                remaining_days,
                suspended_until,
                ..
            } => {
                body.insert("suspended".into(), Value::Bool(true));
                body.insert("remaining_days".into(), json!(remaining_days));
                body.insert("suspended_until".into(), json!(suspended_until));
            }
            _ => {}
        }

        let mut response = (status, Json(Value::Object(body))).into_response();
        response
            .extensions_mut()
            .insert(ErrorDetail(self.to_string()));
        response
    }
}

/// Success envelope: `{success: true, data}`.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data,
        })
    }
}

/// JSON body extractor whose rejections use the error envelope.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(ApplicationError))]
pub struct ApiJson<T>(pub T);

/// Minimal shape check; the identity provider does the authoritative validation.
pub fn looks_like_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !email.chars().any(char::is_whitespace)
        && domain
            .rsplit_once('.')
            .is_some_and(|(host, tld)| !host.is_empty() && tld.len() >= 2)
}
