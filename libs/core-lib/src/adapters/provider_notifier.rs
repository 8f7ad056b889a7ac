use super::smtp_email::SmtpEmailSender;
use super::twilio_sms::TwilioSmsSender;
use crate::{DeliveryReceipt, NotificationError, NotificationGateway};
use async_trait::async_trait;

/// Production notification gateway. Each channel is optional; sending on an
/// unconfigured channel reports `NotConfigured` rather than failing the caller.
pub struct ProviderNotifier {
    email: Option<SmtpEmailSender>,
    sms: Option<TwilioSmsSender>,
}

impl ProviderNotifier {
    pub fn new(email: Option<SmtpEmailSender>, sms: Option<TwilioSmsSender>) -> Self {
        Self { email, sms }
    }

    pub fn has_any_channel(&self) -> bool {
        self.email.is_some() || self.sms.is_some()
    }
}

#[async_trait]
impl NotificationGateway for ProviderNotifier {
    async fn send_email(
        &self,
        to: &str,
        subject: &str,
        body: &str,
    ) -> Result<DeliveryReceipt, NotificationError> {
        match &self.email {
            Some(sender) => sender.send(to, subject, body).await,
            None => Err(NotificationError::NotConfigured("email")),
        }
    }

    async fn send_sms(&self, to: &str, body: &str) -> Result<DeliveryReceipt, NotificationError> {
        match &self.sms {
            Some(sender) => sender.send(to, body).await,
            None => Err(NotificationError::NotConfigured("sms")),
        }
    }
}
