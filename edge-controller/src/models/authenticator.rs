//! Authenticator model - credential material bound to an identity.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub enum Credential {
    Cert {
        fingerprint: String,
        pem: String,
        /// Certificate issued by an extend call, awaiting extend-verify.
        pending_pem: Option<String>,
        is_extend_requested: bool,
        is_key_roll_requested: bool,
        extend_requested_at: Option<DateTime<Utc>>,
    },
    Updb {
        username: String,
        password_hash: String,
        failed_attempts: u32,
    },
}

#[derive(Debug, Clone)]
pub struct Authenticator {
    pub id: String,
    pub identity_id: String,
    pub credential: Credential,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Authenticator {
    pub fn cert(identity_id: impl Into<String>, fingerprint: String, pem: String) -> Self {
        Self::with_credential(
            identity_id,
            Credential::Cert {
                fingerprint,
                pem,
                pending_pem: None,
                is_extend_requested: false,
                is_key_roll_requested: false,
                extend_requested_at: None,
            },
        )
    }

    pub fn updb(identity_id: impl Into<String>, username: String, password_hash: String) -> Self {
        Self::with_credential(
            identity_id,
            Credential::Updb {
                username,
                password_hash,
                failed_attempts: 0,
            },
        )
    }

    fn with_credential(identity_id: impl Into<String>, credential: Credential) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            identity_id: identity_id.into(),
            credential,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn method(&self) -> &'static str {
        match self.credential {
            Credential::Cert { .. } => "cert",
            Credential::Updb { .. } => "updb",
        }
    }

    pub fn fingerprint(&self) -> Option<&str> {
        match &self.credential {
            Credential::Cert { fingerprint, .. } => Some(fingerprint),
            Credential::Updb { .. } => None,
        }
    }

    pub fn username(&self) -> Option<&str> {
        match &self.credential {
            Credential::Updb { username, .. } => Some(username),
            Credential::Cert { .. } => None,
        }
    }

    pub fn extend_flags(&self) -> (bool, bool) {
        match &self.credential {
            Credential::Cert {
                is_extend_requested,
                is_key_roll_requested,
                ..
            } => (*is_extend_requested, *is_key_roll_requested),
            Credential::Updb { .. } => (false, false),
        }
    }

    pub fn view(&self) -> AuthenticatorView {
        let (is_extend_requested, is_key_roll_requested) = self.extend_flags();
        let (cert_pem, extend_requested_at) = match &self.credential {
            Credential::Cert {
                pem,
                extend_requested_at,
                ..
            } => (Some(pem.clone()), *extend_requested_at),
            Credential::Updb { .. } => (None, None),
        };
        AuthenticatorView {
            id: self.id.clone(),
            identity_id: self.identity_id.clone(),
            method: self.method(),
            username: self.username().map(str::to_string),
            fingerprint: self.fingerprint().map(str::to_string),
            cert_pem,
            is_extend_requested,
            is_key_roll_requested,
            extend_requested_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// API rendering of an authenticator. Never carries password hashes.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatorView {
    pub id: String,
    pub identity_id: String,
    pub method: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert_pem: Option<String>,
    pub is_extend_requested: bool,
    pub is_key_roll_requested: bool,
    pub extend_requested_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
