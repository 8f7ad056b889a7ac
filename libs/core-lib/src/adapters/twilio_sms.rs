use crate::{CoreError, DeliveryReceipt, NotificationError};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{error, info};

pub const TWILIO_API_BASE: &str = "https://api.twilio.com";

#[derive(Debug, Clone)]
pub struct TwilioConfig {
    pub account_sid: String,
    pub auth_token: String,
    pub from_number: String,
    pub base_url: String,
    pub timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct MessageCreated {
    sid: String,
}

#[derive(Debug, Deserialize)]
struct TwilioFault {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    message: Option<String>,
}

/// Sends SMS through the Twilio Messages REST resource.
#[derive(Debug, Clone)]
pub struct TwilioSmsSender {
    client: Client,
    config: TwilioConfig,
}

impl TwilioSmsSender {
    pub fn new(config: TwilioConfig) -> Result<Self, CoreError> {
        if config.account_sid.is_empty() || config.auth_token.is_empty() {
            return Err(CoreError::Configuration(
                "Twilio account SID and auth token are required".into(),
            ));
        }
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| CoreError::Configuration(format!("HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    pub async fn send(&self, to: &str, body: &str) -> Result<DeliveryReceipt, NotificationError> {
        // Twilio rejects a message addressed to its own sender number.
        if to == self.config.from_number {
            return Err(NotificationError::InvalidRecipient(
                "recipient is the sender number".into(),
            ));
        }

        let url = format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.config.base_url.trim_end_matches('/'),
            self.config.account_sid
        );
        let response = self
            .client
            .post(url)
            .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
            .form(&[
                ("To", to),
                ("From", self.config.from_number.as_str()),
                ("Body", body),
            ])
            .send()
            .await
            .map_err(|e| {
                error!(to = %to, error = %e, "Twilio request failed");
                NotificationError::Transport(if e.is_timeout() {
                    "request timed out".to_string()
                } else {
                    e.to_string()
                })
            })?;

        let status = response.status();
        if status.is_success() {
            let created: MessageCreated = response
                .json()
                .await
                .map_err(|e| NotificationError::Transport(format!("malformed response: {e}")))?;
            info!(to = %to, sid = %created.sid, "SMS sent via Twilio");
            return Ok(DeliveryReceipt {
                provider: "twilio",
                message_id: Some(created.sid),
            });
        }

        let fault: TwilioFault = response.json().await.unwrap_or(TwilioFault {
            code: None,
            message: None,
        });
        let detail = format!(
            "{} (code {})",
            fault.message.unwrap_or_else(|| status.to_string()),
            fault.code.map_or_else(|| "n/a".to_string(), |c| c.to_string())
        );
        error!(to = %to, status = status.as_u16(), detail = %detail, "Twilio rejected SMS");
        if status.is_server_error() || status.as_u16() == 429 {
            Err(NotificationError::Transport(detail))
        } else {
            Err(NotificationError::Rejected(detail))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sender(server: &MockServer) -> TwilioSmsSender {
        TwilioSmsSender::new(TwilioConfig {
            account_sid: "AC123".into(),
            auth_token: "secret".into(),
            from_number: "+15005550006".into(),
            base_url: server.uri(),
            timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_send_posts_form() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/2010-04-01/Accounts/AC123/Messages.json"))
            .and(header_exists("authorization"))
            .and(body_string_contains("To=%2B639171234567"))
            .and(body_string_contains("From=%2B15005550006"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "sid": "SM42", "status": "queued" })))
            .expect(1)
            .mount(&server)
            .await;

        let receipt = sender(&server).send("+639171234567", "hello").await.unwrap();
        assert_eq!(receipt.provider, "twilio");
        assert_eq!(receipt.message_id.as_deref(), Some("SM42"));
    }

    #[tokio::test]
    async fn test_invalid_number_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "code": 21211,
                "message": "The 'To' number is not a valid phone number.",
                "status": 400
            })))
            .mount(&server)
            .await;

        let err = sender(&server).send("+630000", "hello").await.unwrap_err();
        match err {
            NotificationError::Rejected(detail) => assert!(detail.contains("21211")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_refuses_own_number_without_calling_provider() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "sid": "SM1" })))
            .expect(0)
            .mount(&server)
            .await;

        assert!(matches!(
            sender(&server).send("+15005550006", "hello").await,
            Err(NotificationError::InvalidRecipient(_))
        ));
    }

    #[tokio::test]
    async fn test_server_error_is_transport_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        assert!(matches!(
            sender(&server).send("+639171234567", "hello").await,
            Err(NotificationError::Transport(_))
        ));
    }
}
