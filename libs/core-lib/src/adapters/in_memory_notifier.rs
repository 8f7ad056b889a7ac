use crate::{DeliveryReceipt, NotificationError, NotificationGateway};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, RwLock};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxChannel {
    Email,
    Sms,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub channel: OutboxChannel,
    pub to: String,
    pub subject: Option<String>,
    pub body: String,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Outbox {
    sent: Vec<OutboundMessage>,
    failing_email: bool,
    failing_sms: bool,
}

/// Records messages instead of delivering them. Runs when no provider is
/// configured (messages go to the log) and backs the test suite, which reads
/// codes and credentials back out of the outbox.
#[derive(Debug, Clone, Default)]
pub struct InMemoryNotifier {
    outbox: Arc<RwLock<Outbox>>,
}

impl InMemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every send on `channel` fail with a transport error.
    pub fn fail_channel(&self, channel: OutboxChannel, failing: bool) {
        if let Ok(mut outbox) = self.outbox.write() {
            match channel {
                OutboxChannel::Email => outbox.failing_email = failing,
                OutboxChannel::Sms => outbox.failing_sms = failing,
            }
        }
    }

    pub fn messages(&self) -> Vec<OutboundMessage> {
        self.outbox
            .read()
            .map(|o| o.sent.clone())
            .unwrap_or_default()
    }

    pub fn sent_to(&self, channel: OutboxChannel, to: &str) -> Vec<OutboundMessage> {
        self.messages()
            .into_iter()
            .filter(|m| m.channel == channel && m.to == to)
            .collect()
    }

    fn push(&self, message: OutboundMessage) -> Result<DeliveryReceipt, NotificationError> {
        let mut outbox = self
            .outbox
            .write()
            .map_err(|_| NotificationError::Transport("outbox lock poisoned".into()))?;
        let failing = match message.channel {
            OutboxChannel::Email => outbox.failing_email,
            OutboxChannel::Sms => outbox.failing_sms,
        };
        if failing {
            return Err(NotificationError::Transport("simulated delivery failure".into()));
        }
        info!(
            channel = ?message.channel,
            to = %message.to,
            subject = message.subject.as_deref().unwrap_or(""),
            "Message recorded in outbox"
        );
        outbox.sent.push(message);
        Ok(DeliveryReceipt {
            provider: "outbox",
            message_id: Some(outbox.sent.len().to_string()),
        })
    }
}

#[async_trait]
impl NotificationGateway for InMemoryNotifier {
    async fn send_email(
        &self,
        to: &str,
        subject: &str,
        body: &str,
    ) -> Result<DeliveryReceipt, NotificationError> {
        if !to.contains('@') {
            return Err(NotificationError::InvalidRecipient(to.to_string()));
        }
        self.push(OutboundMessage {
            channel: OutboxChannel::Email,
            to: to.to_string(),
            subject: Some(subject.to_string()),
            body: body.to_string(),
            sent_at: Utc::now(),
        })
    }

    async fn send_sms(&self, to: &str, body: &str) -> Result<DeliveryReceipt, NotificationError> {
        if !to.starts_with('+') {
            return Err(NotificationError::InvalidRecipient(to.to_string()));
        }
        self.push(OutboundMessage {
            channel: OutboxChannel::Sms,
            to: to.to_string(),
            subject: None,
            body: body.to_string(),
            sent_at: Utc::now(),
        })
    }
}
