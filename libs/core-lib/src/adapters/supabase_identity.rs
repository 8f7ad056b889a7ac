use crate::domain::user::UserRole;
use crate::{
    AccountMetadata, AuthenticatedAccount, CoreError, IdentityError, IdentityProvider, TokenPair,
};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SupabaseConfig {
    pub url: String,
    pub anon_key: String,
    pub service_role_key: String,
    pub timeout: Duration,
}

/// Identity provider backed by the Supabase (GoTrue) auth REST API.
/// Admin operations use the service role key; sign-in and refresh use the anon key.
#[derive(Debug, Clone)]
pub struct SupabaseIdentityProvider {
    client: Client,
    base_url: String,
    anon_key: String,
    service_role_key: String,
}

#[derive(Debug, Deserialize)]
struct GoTrueUser {
    id: Uuid,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    user_metadata: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct GoTrueSession {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: u64,
    user: GoTrueUser,
}

impl SupabaseIdentityProvider {
    pub fn new(config: SupabaseConfig) -> Result<Self, CoreError> {
        if config.url.trim().is_empty() || config.service_role_key.trim().is_empty() {
            return Err(CoreError::Configuration(
                "Supabase URL and service role key are required".into(),
            ));
        }
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| CoreError::Configuration(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            anon_key: config.anon_key,
            service_role_key: config.service_role_key,
        })
    }

    fn admin(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.service_role_key)
            .bearer_auth(&self.service_role_key)
    }

    fn public(&self, request: RequestBuilder) -> RequestBuilder {
        let key = if self.anon_key.is_empty() {
            &self.service_role_key
        } else {
            &self.anon_key
        };
        request.header("apikey", key)
    }

    async fn token_grant(
        &self,
        grant_type: &str,
        body: Value,
    ) -> Result<AuthenticatedAccount, IdentityError> {
        let url = format!("{}/auth/v1/token?grant_type={grant_type}", self.base_url);
        let response = self
            .public(self.client.post(url))
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        let session: GoTrueSession = read_json(response).await?;
        Ok(AuthenticatedAccount {
            account_id: session.user.id,
            email: session.user.email.unwrap_or_default(),
            metadata: metadata_from_provider(session.user.user_metadata),
            tokens: TokenPair {
                access_token: session.access_token,
                refresh_token: session.refresh_token,
                expires_in: session.expires_in,
            },
        })
    }
}

fn transport_error(e: reqwest::Error) -> IdentityError {
    if e.is_timeout() {
        IdentityError::Timeout
    } else {
        IdentityError::Network(e.to_string())
    }
}

async fn read_json<T: for<'de> Deserialize<'de>>(response: Response) -> Result<T, IdentityError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(classify_failure(status, &body));
    }
    response
        .json::<T>()
        .await
        .map_err(|e| IdentityError::Unexpected(format!("malformed provider response: {e}")))
}

async fn expect_success(response: Response) -> Result<(), IdentityError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(classify_failure(status, &body))
}

/// Maps a GoTrue error response onto the typed taxonomy. GoTrue has reported
/// errors as `msg`, `message`, `error_description` and `error_code` over its
/// versions, so all of them are inspected.
pub fn classify_failure(status: StatusCode, body: &str) -> IdentityError {
    fn field<'a>(parsed: &'a Value, name: &str) -> &'a str {
        parsed.get(name).and_then(Value::as_str).unwrap_or("")
    }

    let parsed: Value = serde_json::from_str(body).unwrap_or(Value::Null);
    let code = field(&parsed, "error_code").to_ascii_lowercase();
    let message = [
        field(&parsed, "msg"),
        field(&parsed, "message"),
        field(&parsed, "error_description"),
    ]
        .into_iter()
        .find(|m| !m.is_empty())
        .unwrap_or(body)
        .to_string();
    let lower = message.to_ascii_lowercase();

    debug!(status = status.as_u16(), error_code = %code, "Identity provider error response");

    if status == StatusCode::TOO_MANY_REQUESTS
        || code.contains("rate_limit")
        || lower.contains("rate limit")
        || lower.contains("too many requests")
    {
        return IdentityError::RateLimited;
    }
    if status.is_server_error() {
        return IdentityError::Network(format!("provider returned {status}"));
    }
    if code == "email_exists"
        || code == "user_already_exists"
        || lower.contains("already registered")
        || lower.contains("already been registered")
        || lower.contains("already exists")
    {
        return IdentityError::AlreadyExists;
    }
    if code == "email_not_confirmed" || lower.contains("email not confirmed") {
        return IdentityError::EmailUnconfirmed;
    }
    if code == "invalid_credentials" || lower.contains("invalid login credentials") {
        return IdentityError::InvalidCredentials;
    }
    if code == "weak_password" || (lower.contains("password") && lower.contains("at least")) {
        return IdentityError::WeakPassword(message);
    }
    if code == "refresh_token_not_found"
        || code == "refresh_token_already_used"
        || lower.contains("refresh token")
    {
        return IdentityError::InvalidToken;
    }
    match status {
        StatusCode::NOT_FOUND => IdentityError::NotFound,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            warn!(status = status.as_u16(), "Identity provider refused service credentials");
            IdentityError::Unexpected(format!("provider refused credentials ({status})"))
        }
        s if s.is_client_error() => IdentityError::InvalidInput(message),
        _ => IdentityError::Unexpected(format!("unexpected status {status}")),
    }
}

pub fn metadata_to_provider(metadata: &AccountMetadata) -> Value {
    let mut out = metadata.extra.clone();
    if let Some(role) = metadata.role {
        out.insert("role".into(), json!(role.as_str()));
    }
    if let Some(name) = &metadata.name {
        out.insert("name".into(), json!(name));
    }
    if let Some(phone) = &metadata.phone {
        out.insert("phone".into(), json!(phone));
    }
    out.insert(
        "force_password_change".into(),
        json!(metadata.force_password_change),
    );
    Value::Object(out)
}

/// Inverse of [`metadata_to_provider`]. Tolerates roles the platform does not
/// know and string-typed booleans written by older clients.
pub fn metadata_from_provider(mut raw: Map<String, Value>) -> AccountMetadata {
    let take_string = |raw: &mut Map<String, Value>, key: &str| {
        raw.remove(key)
            .and_then(|v| v.as_str().map(str::to_string))
            .filter(|s| !s.trim().is_empty())
    };
    let role = take_string(&mut raw, "role").and_then(|r| UserRole::parse(&r));
    let name = take_string(&mut raw, "name");
    let phone = take_string(&mut raw, "phone");
    let force_password_change = match raw.remove("force_password_change") {
        Some(Value::Bool(b)) => b,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
        _ => false,
    };
    AccountMetadata {
        role,
        name,
        phone,
        force_password_change,
        extra: raw,
    }
}

#[async_trait]
impl IdentityProvider for SupabaseIdentityProvider {
    async fn create_account(
        &self,
        email: &str,
        password: &str,
        metadata: &AccountMetadata,
    ) -> Result<Uuid, IdentityError> {
        let url = format!("{}/auth/v1/admin/users", self.base_url);
        let body = json!({
            "email": email,
            "password": password,
            "email_confirm": true,
            "user_metadata": metadata_to_provider(metadata),
        });
        let response = self
            .admin(self.client.post(url))
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        let user: GoTrueUser = read_json(response).await?;
        Ok(user.id)
    }

    async fn authenticate(
        &self,
        email: &str,
        password: &str,
    ) -> Result<AuthenticatedAccount, IdentityError> {
        self.token_grant("password", json!({ "email": email, "password": password }))
            .await
    }

    async fn rotate_password(
        &self,
        account_id: Uuid,
        new_password: &str,
    ) -> Result<(), IdentityError> {
        let url = format!("{}/auth/v1/admin/users/{account_id}", self.base_url);
        let response = self
            .admin(self.client.put(url))
            .json(&json!({ "password": new_password }))
            .send()
            .await
            .map_err(transport_error)?;
        expect_success(response).await
    }

    async fn account_email(&self, account_id: Uuid) -> Result<String, IdentityError> {
        let url = format!("{}/auth/v1/admin/users/{account_id}", self.base_url);
        let response = self
            .admin(self.client.get(url))
            .send()
            .await
            .map_err(transport_error)?;
        let user: GoTrueUser = read_json(response).await?;
        user.email
            .ok_or_else(|| IdentityError::Unexpected("account has no email".into()))
    }

    async fn refresh(&self, refresh_token: &str) -> Result<AuthenticatedAccount, IdentityError> {
        self.token_grant("refresh_token", json!({ "refresh_token": refresh_token }))
            .await
            .map_err(|e| match e {
                IdentityError::InvalidCredentials | IdentityError::InvalidInput(_) => {
                    IdentityError::InvalidToken
                }
                other => other,
            })
    }

    async fn delete_account(&self, account_id: Uuid) -> Result<(), IdentityError> {
        let url = format!("{}/auth/v1/admin/users/{account_id}", self.base_url);
        let response = self
            .admin(self.client.delete(url))
            .send()
            .await
            .map_err(transport_error)?;
        expect_success(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer, timeout: Duration) -> SupabaseIdentityProvider {
        SupabaseIdentityProvider::new(SupabaseConfig {
            url: server.uri(),
            anon_key: "anon-key".into(),
            service_role_key: "service-key".into(),
            timeout,
        })
        .unwrap()
    }

    fn session_body(id: Uuid) -> Value {
        json!({
            "access_token": "access-1",
            "refresh_token": "refresh-1",
            "expires_in": 3600,
            "token_type": "bearer",
            "user": {
                "id": id,
                "email": "driver@example.com",
                "user_metadata": {
                    "role": "driver-owner",
                    "name": "Juan Dela Cruz",
                    "force_password_change": true,
                    "license_number": "N01-23-456789"
                }
            }
        })
    }

    #[tokio::test]
    async fn test_create_account_sends_admin_request() {
        let server = MockServer::start().await;
        let id = Uuid::new_v4();

        Mock::given(method("POST"))
            .and(path("/auth/v1/admin/users"))
            .and(header("apikey", "service-key"))
            .and(header("authorization", "Bearer service-key"))
            .and(body_partial_json(json!({
                "email": "driver@example.com",
                "email_confirm": true,
                "user_metadata": { "role": "driver-owner", "force_password_change": true }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": id, "email": "driver@example.com" })))
            .expect(1)
            .mount(&server)
            .await;

        let metadata = AccountMetadata {
            role: Some(UserRole::DriverOwner),
            force_password_change: true,
            ..Default::default()
        };
        let created = provider(&server, Duration::from_secs(5))
            .create_account("driver@example.com", "Secret123!", &metadata)
            .await
            .unwrap();
        assert_eq!(created, id);
    }

    #[tokio::test]
    async fn test_create_account_duplicate_email() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/admin/users"))
            .respond_with(ResponseTemplate::new(422).set_body_json(json!({
                "code": 422,
                "error_code": "email_exists",
                "msg": "A user with this email address has already been registered"
            })))
            .mount(&server)
            .await;

        let err = provider(&server, Duration::from_secs(5))
            .create_account("dup@example.com", "Secret123!", &AccountMetadata::default())
            .await
            .unwrap_err();
        assert_eq!(err, IdentityError::AlreadyExists);
    }

    #[tokio::test]
    async fn test_authenticate_parses_session_and_metadata() {
        let server = MockServer::start().await;
        let id = Uuid::new_v4();
        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .and(query_param("grant_type", "password"))
            .and(header("apikey", "anon-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(session_body(id)))
            .mount(&server)
            .await;

        let account = provider(&server, Duration::from_secs(5))
            .authenticate("driver@example.com", "Secret123!")
            .await
            .unwrap();
        assert_eq!(account.account_id, id);
        assert_eq!(account.tokens.access_token, "access-1");
        assert_eq!(account.metadata.role, Some(UserRole::DriverOwner));
        assert_eq!(account.metadata.name.as_deref(), Some("Juan Dela Cruz"));
        assert!(account.metadata.force_password_change);
        assert_eq!(
            account.metadata.extra.get("license_number"),
            Some(&json!("N01-23-456789"))
        );
    }

    #[tokio::test]
    async fn test_authenticate_error_classification() {
        let cases = [
            (
                400u16,
                json!({"error": "invalid_grant", "error_description": "Invalid login credentials"}),
                IdentityError::InvalidCredentials,
            ),
            (
                400,
                json!({"code": 400, "error_code": "email_not_confirmed", "msg": "Email not confirmed"}),
                IdentityError::EmailUnconfirmed,
            ),
            (
                429,
                json!({"msg": "Request rate limit reached"}),
                IdentityError::RateLimited,
            ),
        ];

        for (status, body, expected) in cases {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/auth/v1/token"))
                .respond_with(ResponseTemplate::new(status).set_body_json(body))
                .mount(&server)
                .await;
            let err = provider(&server, Duration::from_secs(5))
                .authenticate("a@example.com", "pw")
                .await
                .unwrap_err();
            assert_eq!(err, expected);
        }
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .respond_with(ResponseTemplate::new(503).set_body_string("upstream unavailable"))
            .mount(&server)
            .await;
        let err = provider(&server, Duration::from_secs(5))
            .authenticate("a@example.com", "pw")
            .await
            .unwrap_err();
        assert!(err.is_transient(), "got {err:?}");
    }

    #[tokio::test]
    async fn test_slow_provider_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(session_body(Uuid::new_v4()))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;
        let err = provider(&server, Duration::from_millis(50))
            .authenticate("a@example.com", "pw")
            .await
            .unwrap_err();
        assert_eq!(err, IdentityError::Timeout);
    }

    #[tokio::test]
    async fn test_refresh_with_bad_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .and(query_param("grant_type", "refresh_token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error_code": "refresh_token_not_found",
                "msg": "Invalid Refresh Token: Refresh Token Not Found"
            })))
            .mount(&server)
            .await;
        let err = provider(&server, Duration::from_secs(5))
            .refresh("stale")
            .await
            .unwrap_err();
        assert_eq!(err, IdentityError::InvalidToken);
    }

    #[tokio::test]
    async fn test_rotate_and_delete() {
        let server = MockServer::start().await;
        let id = Uuid::new_v4();
        Mock::given(method("PUT"))
            .and(path(format!("/auth/v1/admin/users/{id}")))
            .and(body_partial_json(json!({ "password": "NewPass1!" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": id })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path(format!("/auth/v1/admin/users/{id}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let idp = provider(&server, Duration::from_secs(5));
        idp.rotate_password(id, "NewPass1!").await.unwrap();
        idp.delete_account(id).await.unwrap();
    }

    #[tokio::test]
    async fn test_account_email_lookup() {
        let server = MockServer::start().await;
        let id = Uuid::new_v4();
        Mock::given(method("GET"))
            .and(path(format!("/auth/v1/admin/users/{id}")))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "id": id, "email": "driver@example.com" })),
            )
            .mount(&server)
            .await;

        let idp = provider(&server, Duration::from_secs(5));
        assert_eq!(idp.account_email(id).await.unwrap(), "driver@example.com");
        let err = idp.account_email(Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err, IdentityError::NotFound);
    }

    #[test]
    fn test_weak_password_classification() {
        let err = classify_failure(
            StatusCode::UNPROCESSABLE_ENTITY,
            r#"{"error_code":"weak_password","msg":"Password should be at least 6 characters."}"#,
        );
        assert!(matches!(err, IdentityError::WeakPassword(_)));
    }
}
