//! Identity model - the principal every credential, session and policy hangs off.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::auth_policy::DEFAULT_AUTH_POLICY_ID;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub identity_type: String,
    pub is_admin: bool,
    pub is_default_admin: bool,
    pub external_id: Option<String>,
    pub role_attributes: Vec<String>,
    pub auth_policy_id: String,
    pub disabled: bool,
    pub disabled_at: Option<DateTime<Utc>>,
    pub disabled_until: Option<DateTime<Utc>>,
    pub tags: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Identity {
    pub fn new(name: impl Into<String>, is_admin: bool) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            identity_type: "Default".to_string(),
            is_admin,
            is_default_admin: false,
            external_id: None,
            role_attributes: Vec::new(),
            auth_policy_id: DEFAULT_AUTH_POLICY_ID.to_string(),
            disabled: false,
            disabled_at: None,
            disabled_until: None,
            tags: serde_json::Map::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// A disabled identity stays locked until `disabled_until` passes; with no
    /// end time the lock is indefinite.
    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.disabled && self.disabled_until.map_or(true, |until| until > now)
    }

    pub fn disable(&mut self, until: Option<DateTime<Utc>>) {
        let now = Utc::now();
        self.disabled = true;
        self.disabled_at = Some(now);
        self.disabled_until = until;
        self.updated_at = now;
    }

    pub fn enable(&mut self) {
        self.disabled = false;
        self.disabled_at = None;
        self.disabled_until = None;
        self.updated_at = Utc::now();
    }
}
