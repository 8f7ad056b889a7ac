use core_lib::AuditSink;
use core_lib::domain::audit::{AuditActor, AuditLogEntry};
use std::sync::Arc;
use tracing::{debug, warn};

use super::middleware::{AuthenticatedUser, ClientContext};

pub const ENTITY_REGISTRATION: &str = "pending_registrations";
pub const ENTITY_USER: &str = "users";
pub const ENTITY_DEVICE: &str = "trusted_devices";
pub const ENTITY_DELETION: &str = "account_deletion_requests";

/// Fire-and-forget front for the audit sink. A failed write is logged and
/// never reaches the caller.
#[derive(Clone)]
pub struct AuditRecorder {
    sink: Arc<dyn AuditSink>,
}

impl AuditRecorder {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink }
    }

    pub async fn record(&self, entry: AuditLogEntry) {
        let action = entry.action.clone();
        match self.sink.record(entry).await {
            Ok(()) => debug!(action = %action, "Audit entry recorded"),
            Err(e) => warn!(action = %action, error = %e, "Failed to record audit entry"),
        }
    }
}

/// Actor for an authenticated caller.
pub fn actor_for(user: &AuthenticatedUser, client: &ClientContext) -> AuditActor {
    AuditActor {
        id: Some(user.user_id.to_string()),
        email: Some(user.email.clone()),
        role: Some(user.role.as_str().to_string()),
        ip_address: client.ip_address.clone(),
        device_info: client.user_agent.clone(),
    }
}

/// Actor for a request made before the caller has a session.
pub fn anonymous_actor(email: Option<&str>, client: &ClientContext) -> AuditActor {
    AuditActor {
        id: None,
        email: email.map(str::to_string),
        role: None,
        ip_address: client.ip_address.clone(),
        device_info: client.user_agent.clone(),
    }
}
