use core_lib::domain::notification::{DeliveryPlan, EmailMessage};
use core_lib::{NotificationError, NotificationGateway};
use serde::Serialize;
use tracing::{info, warn};

/// Result of one channel. `attempted = false` means the channel was not part
/// of the delivery plan, which is not a failure.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChannelOutcome {
    pub attempted: bool,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NotificationResults {
    pub email: ChannelOutcome,
    pub sms: ChannelOutcome,
}

impl NotificationResults {
    pub fn any_delivered(&self) -> bool {
        self.email.success || self.sms.success
    }
}

/// Content for one notification, rendered for both channels.
pub struct Outgoing<'a> {
    pub email_to: &'a str,
    pub phone: Option<&'a str>,
    pub email: EmailMessage,
    pub sms: String,
}

/// Caller-safe summary; provider detail only goes to the log.
fn describe_failure(err: &NotificationError) -> String {
    match err {
        NotificationError::NotConfigured(channel) => format!("{channel} delivery is not configured"),
        NotificationError::InvalidRecipient(_) => "recipient address was not accepted".into(),
        NotificationError::Rejected(_) => "provider rejected the message".into(),
        NotificationError::Transport(_) => "delivery failed, please retry later".into(),
    }
}

/// Sends on every channel in `plan` independently. Never fails: each channel's
/// outcome is captured in the result.
pub async fn deliver(
    gateway: &dyn NotificationGateway,
    plan: DeliveryPlan,
    outgoing: Outgoing<'_>,
) -> NotificationResults {
    let mut results = NotificationResults::default();

    if plan.email {
        results.email.attempted = true;
        match gateway
            .send_email(outgoing.email_to, &outgoing.email.subject, &outgoing.email.body)
            .await
        {
            Ok(receipt) => {
                info!(provider = receipt.provider, "Email notification delivered");
                results.email.success = true;
            }
            Err(e) => {
                warn!(error = %e, "Email notification failed");
                results.email.error = Some(describe_failure(&e));
            }
        }
    }

    if plan.sms {
        results.sms.attempted = true;
        match outgoing.phone {
            Some(phone) => match gateway.send_sms(phone, &outgoing.sms).await {
                Ok(receipt) => {
                    info!(provider = receipt.provider, "SMS notification delivered");
                    results.sms.success = true;
                }
                Err(e) => {
                    warn!(error = %e, "SMS notification failed");
                    results.sms.error = Some(describe_failure(&e));
                }
            },
            None => results.sms.error = Some("no phone number on file".into()),
        }
    }

    results
}
