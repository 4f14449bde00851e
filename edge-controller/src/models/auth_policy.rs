//! Auth policy model - which primary credentials an identity may use and
//! which secondary factors it must add.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_AUTH_POLICY_ID: &str = "default";
pub const DEFAULT_UPDB_MIN_PASSWORD_LENGTH: i64 = 5;
pub const DEFAULT_UPDB_MAX_ATTEMPTS: i64 = 5;
pub const UPDB_INDEFINITE_LOCKOUT: i64 = 0;
pub const UPDB_UNLIMITED_ATTEMPTS_LIMIT: i64 = 0;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthPolicy {
    pub id: String,
    pub name: String,
    pub primary: AuthPolicyPrimary,
    pub secondary: AuthPolicySecondary,
    pub tags: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthPolicyPrimary {
    pub cert: PrimaryCert,
    pub ext_jwt: PrimaryExtJwt,
    pub updb: PrimaryUpdb,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PrimaryCert {
    pub allowed: bool,
    pub allow_expired_certs: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PrimaryExtJwt {
    pub allowed: bool,
    /// Signer ids accepted as a primary credential. Empty admits none.
    #[serde(default)]
    pub allowed_signers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PrimaryUpdb {
    pub allowed: bool,
    pub min_password_length: i64,
    pub require_special_char: bool,
    pub require_number_char: bool,
    pub require_mixed_case: bool,
    pub max_attempts: i64,
    pub lockout_duration_minutes: i64,
}

impl Default for PrimaryUpdb {
    fn default() -> Self {
        Self {
            allowed: false,
            min_password_length: DEFAULT_UPDB_MIN_PASSWORD_LENGTH,
            require_special_char: false,
            require_number_char: false,
            require_mixed_case: false,
            max_attempts: UPDB_UNLIMITED_ATTEMPTS_LIMIT,
            lockout_duration_minutes: UPDB_INDEFINITE_LOCKOUT,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthPolicySecondary {
    pub require_totp: bool,
    /// Signer whose bearer token must accompany every request after primary
    /// authentication. An empty string on input means none.
    #[serde(rename = "requireExtJwtSigner")]
    pub require_ext_jwt_signer: Option<String>,
}

impl AuthPolicy {
    pub fn new(
        name: impl Into<String>,
        primary: AuthPolicyPrimary,
        secondary: AuthPolicySecondary,
    ) -> Self {
        let now = Utc::now();
        let mut policy = Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            primary,
            secondary,
            tags: serde_json::Map::new(),
            created_at: now,
            updated_at: now,
        };
        policy.normalize();
        policy
    }

    /// The system policy assigned to identities that name no other. Every
    /// primary method is allowed; no ext-jwt signer is until one is added.
    pub fn system_default() -> Self {
        let mut policy = Self::new(
            "Default",
            AuthPolicyPrimary {
                cert: PrimaryCert {
                    allowed: true,
                    allow_expired_certs: true,
                },
                ext_jwt: PrimaryExtJwt {
                    allowed: true,
                    allowed_signers: Vec::new(),
                },
                updb: PrimaryUpdb {
                    allowed: true,
                    ..PrimaryUpdb::default()
                },
            },
            AuthPolicySecondary::default(),
        );
        policy.id = DEFAULT_AUTH_POLICY_ID.to_string();
        policy
    }

    pub fn is_default(&self) -> bool {
        self.id == DEFAULT_AUTH_POLICY_ID
    }

    /// Clamps sentinel and out-of-range values to their persisted form.
    pub fn normalize(&mut self) {
        let updb = &mut self.primary.updb;
        if updb.lockout_duration_minutes < 0 {
            updb.lockout_duration_minutes = UPDB_INDEFINITE_LOCKOUT;
        }
        if updb.max_attempts < 0 {
            updb.max_attempts = UPDB_UNLIMITED_ATTEMPTS_LIMIT;
        }
        if updb.min_password_length < DEFAULT_UPDB_MIN_PASSWORD_LENGTH {
            updb.min_password_length = DEFAULT_UPDB_MIN_PASSWORD_LENGTH;
        }

        if matches!(&self.secondary.require_ext_jwt_signer, Some(s) if s.trim().is_empty()) {
            self.secondary.require_ext_jwt_signer = None;
        }

        self.primary.ext_jwt.allowed_signers.sort();
        self.primary.ext_jwt.allowed_signers.dedup();
    }

    /// Every signer id this policy references, primary and secondary.
    pub fn referenced_signers(&self) -> impl Iterator<Item = &str> {
        self.primary
            .ext_jwt
            .allowed_signers
            .iter()
            .map(String::as_str)
            .chain(self.secondary.require_ext_jwt_signer.as_deref())
    }
}
