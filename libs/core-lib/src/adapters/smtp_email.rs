use crate::{CoreError, DeliveryReceipt, NotificationError};
use lettre::message::{Mailbox, header::ContentType};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::time::Duration;
use tracing::{error, info};

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from: String,
    /// STARTTLS relay (Gmail) when true; plaintext for local catch-all servers.
    pub starttls: bool,
    pub timeout: Duration,
}

/// Sends plain-text mail through an authenticated SMTP relay.
pub struct SmtpEmailSender {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpEmailSender {
    pub fn new(config: SmtpConfig) -> Result<Self, CoreError> {
        let from: Mailbox = config
            .from
            .parse()
            .map_err(|e| CoreError::Configuration(format!("Invalid SMTP_FROM address: {e}")))?;

        let builder = if config.starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
                .map_err(|e| CoreError::Configuration(format!("SMTP relay: {e}")))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
        };
        let mut builder = builder.port(config.port).timeout(Some(config.timeout));
        if !config.username.is_empty() {
            builder = builder.credentials(Credentials::new(config.username, config.password));
        }

        Ok(Self {
            transport: builder.build(),
            from,
        })
    }

    pub async fn send(
        &self,
        to: &str,
        subject: &str,
        body: &str,
    ) -> Result<DeliveryReceipt, NotificationError> {
        let recipient: Mailbox = to
            .parse()
            .map_err(|_| NotificationError::InvalidRecipient(to.to_string()))?;
        let message = Message::builder()
            .from(self.from.clone())
            .to(recipient)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())
            .map_err(|e| NotificationError::Rejected(format!("could not build message: {e}")))?;

        match self.transport.send(message).await {
            Ok(response) => {
                let detail = response.message().collect::<Vec<_>>().join(" ");
                info!(to = %to, "Email sent via SMTP");
                Ok(DeliveryReceipt {
                    provider: "smtp",
                    message_id: (!detail.is_empty()).then_some(detail),
                })
            }
            Err(e) if e.is_permanent() => {
                error!(to = %to, error = %e, "SMTP server rejected message");
                Err(NotificationError::Rejected(e.to_string()))
            }
            Err(e) => {
                error!(to = %to, error = %e, "SMTP delivery failed");
                Err(NotificationError::Transport(e.to_string()))
            }
        }
    }
}
