//! Service and service policy models, plus role matching.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const ROLE_ALL: &str = "#all";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub id: String,
    pub name: String,
    pub role_attributes: Vec<String>,
    pub tags: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Service {
    pub fn new(name: String, role_attributes: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            role_attributes,
            tags: serde_json::Map::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum PolicyType {
    Dial,
    Bind,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum Semantic {
    #[default]
    AnyOf,
    AllOf,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicePolicy {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub policy_type: PolicyType,
    pub semantic: Semantic,
    pub identity_roles: Vec<String>,
    pub service_roles: Vec<String>,
    pub tags: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ServicePolicy {
    pub fn new(
        name: String,
        policy_type: PolicyType,
        semantic: Semantic,
        identity_roles: Vec<String>,
        service_roles: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            policy_type,
            semantic,
            identity_roles,
            service_roles,
            tags: serde_json::Map::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether this policy grants `policy_type` on the service to the identity.
    pub fn grants(
        &self,
        policy_type: PolicyType,
        identity_id: &str,
        identity_attributes: &[String],
        service_id: &str,
        service_attributes: &[String],
    ) -> bool {
        self.policy_type == policy_type
            && roles_match(&self.identity_roles, self.semantic, identity_id, identity_attributes)
            && roles_match(&self.service_roles, self.semantic, service_id, service_attributes)
    }
}

/// Role expressions: `#all` matches any entity, `#attr` matches an entity
/// carrying role attribute `attr`, `@id` matches the entity with that id.
/// No roles never match.
pub fn roles_match(roles: &[String], semantic: Semantic, entity_id: &str, attributes: &[String]) -> bool {
    if roles.is_empty() {
        return false;
    }

    let matches_one = |role: &String| {
        if role == ROLE_ALL {
            true
        } else if let Some(attr) = role.strip_prefix('#') {
            attributes.iter().any(|a| a == attr)
        } else if let Some(id) = role.strip_prefix('@') {
            id == entity_id
        } else {
            false
        }
    };

    match semantic {
        Semantic::AnyOf => roles.iter().any(matches_one),
        Semantic::AllOf => roles.iter().all(matches_one),
    }
}
