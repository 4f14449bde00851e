//! External JWT signer model - a third-party issuer trusted for primary,
//! secondary, and enrollment credentials.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_CLAIMS_PROPERTY: &str = "sub";

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum TargetToken {
    #[default]
    #[serde(rename = "ACCESS")]
    Access,
    #[serde(rename = "ID")]
    Id,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalJwtSigner {
    pub id: String,
    pub name: String,
    pub cert_pem: String,
    pub fingerprint: String,
    pub kid: String,
    pub issuer: String,
    pub audience: Option<String>,
    pub enabled: bool,
    pub external_auth_url: Option<String>,
    pub claims_property: String,
    pub use_external_id: bool,
    pub client_id: Option<String>,
    pub scopes: Vec<String>,
    pub target_token: TargetToken,
    pub enroll_to_cert_enabled: bool,
    pub enroll_to_token_enabled: bool,
    pub enroll_name_claims_selector: Option<String>,
    pub enroll_attribute_claims_selector: Option<String>,
    pub enroll_auth_policy_id: Option<String>,
    pub not_after: Option<DateTime<Utc>>,
    pub tags: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExternalJwtSigner {
    pub fn new(name: String, issuer: String, cert_pem: String, fingerprint: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            cert_pem,
            kid: fingerprint.clone(),
            fingerprint,
            issuer,
            audience: None,
            enabled: true,
            external_auth_url: None,
            claims_property: DEFAULT_CLAIMS_PROPERTY.to_string(),
            use_external_id: false,
            client_id: None,
            scopes: Vec::new(),
            target_token: TargetToken::Access,
            enroll_to_cert_enabled: false,
            enroll_to_token_enabled: false,
            enroll_name_claims_selector: None,
            enroll_attribute_claims_selector: None,
            enroll_auth_policy_id: None,
            not_after: None,
            tags: serde_json::Map::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Public projection listed to unauthenticated clients so they can find
    /// an identity provider to log in with.
    pub fn public_view(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "name": self.name,
            "externalAuthUrl": self.external_auth_url,
            "clientId": self.client_id,
            "scopes": self.scopes,
            "targetToken": self.target_token,
            "audience": self.audience,
        })
    }
}
