//! Edge session model - a grant to dial or bind one service, owned by an API
//! session.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::service::PolicyType;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeSession {
    pub id: String,
    pub token: String,
    pub api_session_id: String,
    pub identity_id: String,
    pub service_id: String,
    #[serde(rename = "type")]
    pub session_type: PolicyType,
    pub created_at: DateTime<Utc>,
}

impl EdgeSession {
    pub fn new(
        api_session_id: String,
        identity_id: String,
        service_id: String,
        session_type: PolicyType,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            token: Uuid::new_v4().to_string(),
            api_session_id,
            identity_id,
            service_id,
            session_type,
            created_at: Utc::now(),
        }
    }
}
