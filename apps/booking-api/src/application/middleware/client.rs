use axum::{
    extract::FromRequestParts,
    http::{HeaderMap, header, request::Parts},
};
use core_lib::domain::device::DeviceSignal;
use std::convert::Infallible;

/// Network and user-agent details of the caller, used for device
/// fingerprints and audit entries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientContext {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl ClientContext {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let header_str = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        // First hop of X-Forwarded-For is the original client.
        let ip_address = header_str("x-forwarded-for")
            .and_then(|v| v.split(',').next().map(|ip| ip.trim().to_string()))
            .filter(|ip| !ip.is_empty())
            .or_else(|| header_str("x-real-ip"));
        Self {
            ip_address,
            user_agent: header_str(header::USER_AGENT.as_str()),
        }
    }

    pub fn device_signal(&self, device_id: Option<String>) -> DeviceSignal {
        DeviceSignal {
            device_id,
            user_agent: self.user_agent.clone(),
            ip_address: self.ip_address.clone(),
        }
    }
}

impl<S: Send + Sync> FromRequestParts<S> for ClientContext {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self::from_headers(&parts.headers))
    }
}
