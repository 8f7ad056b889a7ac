#![allow(dead_code)]

use http::{HeaderValue, StatusCode, header};
use axum_test::{TestRequest, TestServer};
use booking_api::application::middleware::{AuthenticatedUser, store_session};
use booking_api::config::ApiSettings;
use booking_api::{AppState, create_app};
use core_lib::adapters::in_memory_notifier::OutboxChannel;
use core_lib::adapters::{InMemoryCache, InMemoryIdentityProvider, InMemoryNotifier, InMemoryStore};
use core_lib::domain::user::{User, UserRole};
use core_lib::{Cache, UserStore};
use serde_json::{Value, json};
use std::sync::Arc;
use uuid::Uuid;

pub const ADMIN_TOKEN: &str = "admin-session-token";
pub const DEVICE_ID: &str = "integration-phone";

/// Server over in-memory adapters, with handles for inspecting side effects.
pub struct TestApp {
    pub server: TestServer,
    pub store: InMemoryStore,
    pub identity: InMemoryIdentityProvider,
    pub notifier: InMemoryNotifier,
    pub cache: Arc<dyn Cache>,
    pub admin: AuthenticatedUser,
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::spawn_with(ApiSettings::default()).await
    }

    pub async fn spawn_with(settings: ApiSettings) -> Self {
        let store = InMemoryStore::default();
        let identity = InMemoryIdentityProvider::default();
        let notifier = InMemoryNotifier::new();
        let cache: Arc<dyn Cache> = Arc::new(InMemoryCache::default());

        let app_state = AppState::from_store(
            store.clone(),
            Arc::new(identity.clone()),
            Arc::new(notifier.clone()),
            cache.clone(),
            settings,
        );

        let admin_user = User::new(Uuid::new_v4(), "admin@tartrack.test".into(), UserRole::Admin);
        store.insert_user(admin_user.clone()).await.unwrap();
        let admin = AuthenticatedUser {
            user_id: admin_user.id,
            email: admin_user.email,
            role: UserRole::Admin,
        };
        store_session(cache.as_ref(), ADMIN_TOKEN, &admin, 3600)
            .await
            .unwrap();

        let server = TestServer::new(create_app(app_state)).expect("Failed to create TestServer");
        Self {
            server,
            store,
            identity,
            notifier,
            cache,
            admin,
        }
    }

    pub fn as_admin(&self, request: TestRequest) -> TestRequest {
        with_bearer(request, ADMIN_TOKEN)
    }

    /// Submits a driver application and returns its registration id.
    pub async fn submit_driver(&self, email: &str, phone: Option<&str>, body: Value) -> Uuid {
        let mut payload = json!({
            "email": email,
            "role": "driver",
            "additional_data": body,
        });
        if let Some(phone) = phone {
            payload["phone"] = json!(phone);
        }
        let res = self.server.post("/api/registrations").json(&payload).await;
        assert_eq!(res.status_code(), StatusCode::CREATED, "{}", res.text());
        let body: Value = res.json();
        assert_eq!(body["data"]["outcome"], "pending_approval");
        body["data"]["registration_id"]
            .as_str()
            .and_then(|id| id.parse().ok())
            .expect("registration id")
    }

    /// Creates a tourist account directly and returns its id.
    pub async fn register_tourist(&self, email: &str, password: &str) -> Uuid {
        let res = self
            .server
            .post("/api/registrations")
            .json(&json!({ "email": email, "password": password, "role": "tourist" }))
            .await;
        assert_eq!(res.status_code(), StatusCode::CREATED, "{}", res.text());
        let body: Value = res.json();
        body["data"]["user_id"]
            .as_str()
            .and_then(|id| id.parse().ok())
            .expect("user id")
    }

    pub async fn login(&self, email: &str, password: &str) -> axum_test::TestResponse {
        self.server
            .post("/api/auth/login")
            .json(&json!({ "email": email, "password": password, "device_id": DEVICE_ID }))
            .await
    }

    /// Runs login, device verification and the second login; returns the access token.
    pub async fn login_trusted(&self, email: &str, password: &str) -> String {
        let first: Value = self.login(email, password).await.json();
        if let Some(token) = first["data"]["tokens"]["access_token"].as_str() {
            return token.to_string();
        }
        assert_eq!(first["data"]["requires_device_verification"], true);

        let code = self.last_verification_code(email);
        let verified = self
            .server
            .post("/api/auth/verify-device")
            .json(&json!({
                "user_id": first["data"]["user"]["id"],
                "code": code,
                "device_fingerprint": first["data"]["device_fingerprint"],
            }))
            .await;
        assert_eq!(verified.status_code(), StatusCode::OK, "{}", verified.text());

        let second: Value = self.login(email, password).await.json();
        second["data"]["tokens"]["access_token"]
            .as_str()
            .expect("access token after device verification")
            .to_string()
    }

    pub fn last_verification_code(&self, email: &str) -> String {
        let messages = self.notifier.sent_to(OutboxChannel::Email, email);
        let body = &messages.last().expect("verification email").body;
        body.split("Your verification code is: ")
            .nth(1)
            .map(|rest| rest.chars().take(6).collect())
            .expect("code in email body")
    }
}

pub fn with_bearer(request: TestRequest, token: &str) -> TestRequest {
    request.add_header(
        header::AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
    )
}
