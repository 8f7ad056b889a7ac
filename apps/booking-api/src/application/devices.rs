//! Per-(user, device) trust: `untrusted -> verification_pending -> trusted`.

use chrono::{DateTime, Utc};
use core_lib::domain::audit::{AuditActor, AuditLogEntry};
use core_lib::domain::credentials::generate_verification_code;
use core_lib::domain::device::{
    DeviceSignal, DeviceTrust, DeviceVerificationRequest, TrustedDevice,
};
use core_lib::domain::notification::device_verification_email;
use core_lib::domain::user::User;
use core_lib::{DeviceStore, NotificationGateway};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use super::ApplicationError;
use super::audit::{AuditRecorder, ENTITY_DEVICE};

/// What a login from a given device is allowed to do next.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCheck {
    Trusted { fingerprint: String },
    VerificationSent { fingerprint: String, email_sent: bool },
}

impl DeviceCheck {
    pub fn trust(&self) -> DeviceTrust {
        match self {
            DeviceCheck::Trusted { .. } => DeviceTrust::Trusted,
            DeviceCheck::VerificationSent { .. } => DeviceTrust::VerificationPending,
        }
    }
}

pub struct DeviceTrustLayer {
    devices: Arc<dyn DeviceStore>,
    notifier: Arc<dyn NotificationGateway>,
    audit: AuditRecorder,
}

impl DeviceTrustLayer {
    pub fn new(
        devices: Arc<dyn DeviceStore>,
        notifier: Arc<dyn NotificationGateway>,
        audit: AuditRecorder,
    ) -> Self {
        Self {
            devices,
            notifier,
            audit,
        }
    }

    /// Trusted devices get `last_seen` bumped. Anything else gets a fresh
    /// emailed code. Store failures propagate, so an unreachable store never
    /// lets an unknown device through.
    pub async fn check(
        &self,
        user: &User,
        signal: &DeviceSignal,
        actor: &AuditActor,
        now: DateTime<Utc>,
    ) -> Result<DeviceCheck, ApplicationError> {
        let fingerprint = signal.fingerprint();
        if self.devices.find_trusted(user.id, &fingerprint).await?.is_some() {
            self.devices.touch_last_seen(user.id, &fingerprint, now).await?;
            return Ok(DeviceCheck::Trusted { fingerprint });
        }

        let code = generate_verification_code();
        let device_info = signal.describe();
        self.devices
            .insert_verification(DeviceVerificationRequest::new(
                user.id,
                fingerprint.clone(),
                code.clone(),
                Some(device_info.clone()),
                now,
            ))
            .await?;

        let message = device_verification_email(&code, &device_info);
        let email_sent = match self
            .notifier
            .send_email(&user.email, &message.subject, &message.body)
            .await
        {
            Ok(_) => true,
            Err(e) => {
                warn!(user_id = %user.id, error = %e, "Device verification email failed");
                false
            }
        };
        info!(user_id = %user.id, email_sent, "Device verification requested");

        self.audit
            .record(
                AuditLogEntry::new(actor, "device_verification_requested", ENTITY_DEVICE, None)
                    .with_new(json!({
                        "user_id": user.id,
                        "device_info": device_info,
                        "email_sent": email_sent,
                    })),
            )
            .await;

        Ok(DeviceCheck::VerificationSent {
            fingerprint,
            email_sent,
        })
    }

    /// Consumes the latest pending code for this device. A wrong or expired
    /// code leaves the request in place so the caller can retry.
    pub async fn verify(
        &self,
        user_id: Uuid,
        fingerprint: &str,
        code: &str,
        actor: &AuditActor,
        now: DateTime<Utc>,
    ) -> Result<TrustedDevice, ApplicationError> {
        let request = self
            .devices
            .latest_pending_verification(user_id, fingerprint)
            .await?
            .ok_or(ApplicationError::NoVerificationPending)?;
        if request.is_expired(now) {
            return Err(ApplicationError::CodeExpired);
        }
        if request.code != code.trim() {
            return Err(ApplicationError::InvalidCode);
        }
        if !self.devices.mark_verification_used(request.id, now).await? {
            return Err(ApplicationError::NoVerificationPending);
        }

        let mut device = TrustedDevice::new(user_id, fingerprint.to_string(), request.device_info);
        device.created_at = now;
        device.last_seen_at = now;
        self.devices.upsert_trusted(device.clone()).await?;
        info!(user_id = %user_id, "Device trusted");

        self.audit
            .record(
                AuditLogEntry::new(
                    actor,
                    "device_verified",
                    ENTITY_DEVICE,
                    Some(device.id.to_string()),
                )
                .with_old(json!({ "state": DeviceTrust::VerificationPending }))
                .with_new(json!({ "state": DeviceTrust::Trusted, "user_id": user_id })),
            )
            .await;

        Ok(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use core_lib::adapters::in_memory_notifier::{InMemoryNotifier, OutboxChannel};
    use core_lib::adapters::in_memory_store::InMemoryStore;
    use core_lib::domain::user::UserRole;

    fn layer(store: &InMemoryStore, notifier: &InMemoryNotifier) -> DeviceTrustLayer {
        let shared = Arc::new(store.clone());
        DeviceTrustLayer::new(
            shared.clone(),
            Arc::new(notifier.clone()),
            AuditRecorder::new(shared),
        )
    }

    fn signal() -> DeviceSignal {
        DeviceSignal {
            device_id: None,
            user_agent: Some("TarTrack/2.1 (Android 14)".into()),
            ip_address: Some("198.51.100.7".into()),
        }
    }

    fn emailed_code(notifier: &InMemoryNotifier, to: &str) -> String {
        let message = notifier
            .sent_to(OutboxChannel::Email, to)
            .pop()
            .expect("verification email");
        message
            .body
            .lines()
            .find_map(|l| l.strip_prefix("Your verification code is: "))
            .expect("code line")
            .to_string()
    }

    #[tokio::test]
    async fn test_unknown_device_then_verified_device() {
        let store = InMemoryStore::default();
        let notifier = InMemoryNotifier::new();
        let layer = layer(&store, &notifier);
        let user = User::new(Uuid::new_v4(), "t@example.com".into(), UserRole::Tourist);
        let actor = AuditActor::default();

        let first = layer.check(&user, &signal(), &actor, Utc::now()).await.unwrap();
        assert_eq!(first.trust(), DeviceTrust::VerificationPending);
        let DeviceCheck::VerificationSent { fingerprint, email_sent } = first else {
            panic!("expected verification");
        };
        assert!(email_sent);

        let code = emailed_code(&notifier, "t@example.com");
        assert_eq!(code.len(), 6);
        layer
            .verify(user.id, &fingerprint, &code, &actor, Utc::now())
            .await
            .unwrap();

        let second = layer.check(&user, &signal(), &actor, Utc::now()).await.unwrap();
        assert_eq!(second, DeviceCheck::Trusted { fingerprint });
        assert_eq!(notifier.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_wrong_code_allows_retry() {
        let store = InMemoryStore::default();
        let notifier = InMemoryNotifier::new();
        let layer = layer(&store, &notifier);
        let user = User::new(Uuid::new_v4(), "r@example.com".into(), UserRole::Driver);
        let actor = AuditActor::default();
        let fingerprint = signal().fingerprint();

        layer.check(&user, &signal(), &actor, Utc::now()).await.unwrap();
        let code = emailed_code(&notifier, "r@example.com");
        let wrong = if code == "123456" { "654321" } else { "123456" };

        assert!(matches!(
            layer.verify(user.id, &fingerprint, wrong, &actor, Utc::now()).await,
            Err(ApplicationError::InvalidCode)
        ));
        assert!(layer.verify(user.id, &fingerprint, &code, &actor, Utc::now()).await.is_ok());
        assert!(matches!(
            layer.verify(user.id, &fingerprint, &code, &actor, Utc::now()).await,
            Err(ApplicationError::NoVerificationPending)
        ));
    }

    #[tokio::test]
    async fn test_expired_code_is_refused() {
        let store = InMemoryStore::default();
        let notifier = InMemoryNotifier::new();
        let layer = layer(&store, &notifier);
        let user = User::new(Uuid::new_v4(), "e@example.com".into(), UserRole::Owner);
        let actor = AuditActor::default();
        let issued = Utc::now() - Duration::minutes(11);

        layer.check(&user, &signal(), &actor, issued).await.unwrap();
        let code = emailed_code(&notifier, "e@example.com");
        assert!(matches!(
            layer
                .verify(user.id, &signal().fingerprint(), &code, &actor, Utc::now())
                .await,
            Err(ApplicationError::CodeExpired)
        ));
        assert!(store.find_trusted(user.id, &signal().fingerprint()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_email_still_records_request() {
        let store = InMemoryStore::default();
        let notifier = InMemoryNotifier::new();
        notifier.fail_channel(OutboxChannel::Email, true);
        let layer = layer(&store, &notifier);
        let user = User::new(Uuid::new_v4(), "f@example.com".into(), UserRole::Tourist);

        let check = layer
            .check(&user, &signal(), &AuditActor::default(), Utc::now())
            .await
            .unwrap();
        assert!(matches!(check, DeviceCheck::VerificationSent { email_sent: false, .. }));
        assert!(
            store
                .latest_pending_verification(user.id, &signal().fingerprint())
                .await
                .unwrap()
                .is_some()
        );
    }
}
