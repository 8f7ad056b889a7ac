use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Who performed an audited action.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditActor {
    pub id: Option<String>,
    pub email: Option<String>,
    pub role: Option<String>,
    pub ip_address: Option<String>,
    pub device_info: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: Uuid,
    pub actor_id: Option<String>,
    pub actor_email: Option<String>,
    pub actor_role: Option<String>,
    pub action: String,
    pub entity_name: String,
    pub entity_id: Option<String>,
    pub old_data: Option<Value>,
    pub new_data: Option<Value>,
    pub ip_address: Option<String>,
    pub device_info: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AuditLogEntry {
    pub fn new(actor: &AuditActor, action: &str, entity_name: &str, entity_id: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            actor_id: actor.id.clone(),
            actor_email: actor.email.clone(),
            actor_role: actor.role.clone(),
            action: action.to_string(),
            entity_name: entity_name.to_string(),
            entity_id,
            old_data: None,
            new_data: None,
            ip_address: actor.ip_address.clone(),
            device_info: actor.device_info.clone(),
            created_at: Utc::now(),
        }
    }

    pub fn with_old(mut self, old: Value) -> Self {
        self.old_data = Some(old);
        self
    }

    pub fn with_new(mut self, new: Value) -> Self {
        self.new_data = Some(new);
        self
    }
}
