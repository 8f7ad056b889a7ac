use axum::{
    Router, middleware,
    response::IntoResponse,
    routing::{get, post},
};
use core_lib::{
    AuditSink, Cache, DeletionStore, DeviceStore, IdentityProvider, NotificationGateway,
    RegistrationStore, UserStore,
};
use serde_json::json;
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

pub mod application;
pub mod config;

use application::ApiResponse;
use application::commands::{
    approve_registration::handle_approve_registration_request,
    change_password::handle_change_password_request,
    login::handle_login_request,
    refresh_token::handle_refresh_token_request,
    reject_registration::handle_reject_registration_request,
    request_account_deletion::{handle_account_deletion_status, handle_request_account_deletion},
    resend_credentials::handle_resend_credentials_request,
    submit_registration::handle_submit_registration_request,
    suspend_user::{handle_suspend_user_request, handle_unsuspend_user_request},
    verify_device::handle_verify_device_request,
};
use application::middleware::{expose_error_details, session_auth};
use application::query::{
    handle_list_audit_logs, handle_list_pending_registrations, handle_suspension_status,
};
use config::ApiSettings;

// Holds shared dependencies
#[derive(Clone)]
pub struct AppState {
    pub registrations: Arc<dyn RegistrationStore>,
    pub users: Arc<dyn UserStore>,
    pub devices: Arc<dyn DeviceStore>,
    pub deletions: Arc<dyn DeletionStore>,
    pub audit: Arc<dyn AuditSink>,
    pub identity: Arc<dyn IdentityProvider>,
    pub notifier: Arc<dyn NotificationGateway>,
    pub cache: Arc<dyn Cache>,
    pub settings: ApiSettings,
}

impl AppState {
    /// Wires every persistence port to the same store.
    pub fn from_store<S>(
        store: S,
        identity: Arc<dyn IdentityProvider>,
        notifier: Arc<dyn NotificationGateway>,
        cache: Arc<dyn Cache>,
        settings: ApiSettings,
    ) -> Self
    where
        S: RegistrationStore + UserStore + DeviceStore + DeletionStore + AuditSink + 'static,
    {
        let store = Arc::new(store);
        Self {
            registrations: store.clone(),
            users: store.clone(),
            devices: store.clone(),
            deletions: store.clone(),
            audit: store,
            identity,
            notifier,
            cache,
            settings,
        }
    }
}

pub async fn health() -> impl IntoResponse {
    ApiResponse::ok(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub fn create_app(app_state: AppState) -> Router {
    // Routes behind a bearer session.
    let authenticated = Router::new()
        .route("/registrations/pending", get(handle_list_pending_registrations))
        .route(
            "/registrations/{registration_id}/approve",
            post(handle_approve_registration_request),
        )
        .route(
            "/registrations/{registration_id}/reject",
            post(handle_reject_registration_request),
        )
        .route(
            "/registrations/resend-credentials",
            post(handle_resend_credentials_request),
        )
        .route("/auth/change-password", post(handle_change_password_request))
        .route("/users/{user_id}/suspend", post(handle_suspend_user_request))
        .route("/users/{user_id}/unsuspend", post(handle_unsuspend_user_request))
        .route("/users/{user_id}/suspension", get(handle_suspension_status))
        .route(
            "/account/deletion",
            post(handle_request_account_deletion).get(handle_account_deletion_status),
        )
        .route("/audit-logs", get(handle_list_audit_logs))
        .route_layer(middleware::from_fn_with_state(app_state.clone(), session_auth));

    let api_routes = Router::new()
        .route("/health", get(health))
        .route("/registrations", post(handle_submit_registration_request))
        .route("/auth/login", post(handle_login_request))
        .route("/auth/refresh", post(handle_refresh_token_request))
        .route("/auth/verify-device", post(handle_verify_device_request))
        .merge(authenticated);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .nest("/api", api_routes)
        .layer(middleware::from_fn_with_state(
            app_state.clone(),
            expose_error_details,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}
