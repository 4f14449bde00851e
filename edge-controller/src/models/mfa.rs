//! MFA model - an identity's TOTP enrollment and recovery codes.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Mfa {
    pub id: String,
    pub identity_id: String,
    pub is_verified: bool,
    /// Base32 (RFC 4648, unpadded) shared secret.
    #[serde(skip)]
    pub secret: String,
    #[serde(skip)]
    pub recovery_codes: Vec<String>,
    /// Highest 30-second step already consumed; older or equal steps replay.
    #[serde(skip)]
    pub last_used_step: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Mfa {
    pub fn new(identity_id: String, secret: String, recovery_codes: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            identity_id,
            is_verified: false,
            secret,
            recovery_codes,
            last_used_step: None,
            created_at: now,
            updated_at: now,
        }
    }
}
