use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// How long an emailed device code stays usable.
pub const VERIFICATION_CODE_TTL_MINUTES: i64 = 10;

/// Signals a client presents at sign-in. A client-supplied `device_id` wins over
/// the user-agent/IP pair when present.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceSignal {
    pub device_id: Option<String>,
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
}

impl DeviceSignal {
    /// Stable SHA-256 hex digest for this device.
    pub fn fingerprint(&self) -> String {
        let material = match self.device_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => format!("device:{id}"),
            _ => format!(
                "{}|{}",
                self.user_agent.as_deref().unwrap_or(""),
                self.ip_address.as_deref().unwrap_or("")
            ),
        };
        hex::encode(Sha256::digest(material.as_bytes()))
    }

    /// Short human label shown in the verification email.
    pub fn describe(&self) -> String {
        self.user_agent
            .as_deref()
            .filter(|ua| !ua.trim().is_empty())
            .unwrap_or("Unknown device")
            .to_string()
    }
}

/// Where a (user, fingerprint) pair stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceTrust {
    Untrusted,
    VerificationPending,
    Trusted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustedDevice {
    pub id: Uuid,
    pub user_id: Uuid,
    pub fingerprint: String,
    pub device_info: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

impl TrustedDevice {
    pub fn new(user_id: Uuid, fingerprint: String, device_info: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            fingerprint,
            device_info,
            created_at: now,
            last_seen_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceVerificationRequest {
    pub id: Uuid,
    pub user_id: Uuid,
    pub fingerprint: String,
    pub code: String,
    pub device_info: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_verified: bool,
    pub verified_at: Option<DateTime<Utc>>,
}

impl DeviceVerificationRequest {
    pub fn new(
        user_id: Uuid,
        fingerprint: String,
        code: String,
        device_info: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            fingerprint,
            code,
            device_info,
            created_at: now,
            expires_at: now + Duration::minutes(VERIFICATION_CODE_TTL_MINUTES),
            is_verified: false,
            verified_at: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_stable_hex() {
        let signal = DeviceSignal {
            device_id: None,
            user_agent: Some("Mozilla/5.0".into()),
            ip_address: Some("10.0.0.1".into()),
        };
        let a = signal.fingerprint();
        let b = signal.clone().fingerprint();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));

        let other = DeviceSignal {
            ip_address: Some("10.0.0.2".into()),
            ..signal
        };
        assert_ne!(a, other.fingerprint());
    }

    #[test]
    fn test_device_id_takes_precedence() {
        let a = DeviceSignal {
            device_id: Some("phone-123".into()),
            user_agent: Some("ua-1".into()),
            ip_address: Some("1.1.1.1".into()),
        };
        let b = DeviceSignal {
            device_id: Some("phone-123".into()),
            user_agent: Some("ua-2".into()),
            ip_address: Some("2.2.2.2".into()),
        };
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_request_expiry_window() {
        let now = Utc::now();
        let req = DeviceVerificationRequest::new(Uuid::new_v4(), "fp".into(), "123456".into(), None, now);
        assert!(!req.is_expired(now + Duration::minutes(9)));
        assert!(req.is_expired(now + Duration::minutes(11)));
    }
}
