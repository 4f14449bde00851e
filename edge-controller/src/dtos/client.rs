use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::models::{ApiSession, Identity, PolicyType};
use crate::services::policy::{AuthQuery, AUTH_QUERY_TYPE_MFA, AUTH_QUERY_TYPE_TOTP};

#[derive(Debug, Deserialize, IntoParams)]
pub struct AuthenticateQuery {
    /// `cert`, `updb` (alias `password`) or `ext-jwt`
    pub method: String,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct UpdbCredentials {
    #[serde(default)]
    #[schema(example = "admin")]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct IdentityRef {
    pub id: String,
    pub name: String,
}

/// The caller's API session as returned by `authenticate` and
/// `current-api-session`.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApiSessionDetail {
    pub id: String,
    pub token: String,
    pub identity_id: String,
    pub identity: IdentityRef,
    pub auth_method: String,
    pub is_admin: bool,
    pub auth_queries: Vec<AuthQuery>,
    pub is_mfa_required: bool,
    pub is_mfa_complete: bool,
    pub is_cert_extend_requested: bool,
    pub is_cert_key_roll_requested: bool,
    pub last_activity_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl ApiSessionDetail {
    pub fn new(session: &ApiSession, identity: &Identity, auth_queries: Vec<AuthQuery>) -> Self {
        let is_mfa_required = session.totp_pending
            || auth_queries
                .iter()
                .any(|q| q.type_id == AUTH_QUERY_TYPE_MFA || q.type_id == AUTH_QUERY_TYPE_TOTP);
        Self {
            id: session.id.clone(),
            token: session.token.clone(),
            identity_id: identity.id.clone(),
            identity: IdentityRef {
                id: identity.id.clone(),
                name: identity.name.clone(),
            },
            auth_method: session.auth_method.as_str().to_string(),
            is_admin: session.is_admin,
            auth_queries,
            is_mfa_required,
            is_mfa_complete: !session.totp_pending,
            is_cert_extend_requested: session.is_cert_extend_requested,
            is_cert_key_roll_requested: session.is_cert_key_roll_requested,
            last_activity_at: session.last_activity_at,
            created_at: session.created_at,
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChangePasswordRequest {
    #[serde(default)]
    pub current_password: String,
    pub password: String,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExtendRequest {
    pub client_cert_csr: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExtendVerifyRequest {
    pub client_cert: String,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct IssuedCertResponse {
    pub client_cert: String,
    pub ca: String,
}

// ============================================================================
// Enrollment
// ============================================================================

#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct EnrollQuery {
    pub method: Option<String>,
    pub token: Option<String>,
}

/// JSON body accepted by every enrollment method. PEM bodies carry the CSR
/// alone.
#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EnrollRequest {
    pub token: Option<String>,
    pub csr: Option<String>,
    pub password: Option<String>,
    /// Requested identity name for CA auto-enrollment.
    pub name: Option<String>,
}

// ============================================================================
// Sessions
// ============================================================================

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub service_id: String,
    #[serde(rename = "type", default = "default_session_type")]
    #[schema(value_type = String, example = "Dial")]
    pub session_type: PolicyType,
}

fn default_session_type() -> PolicyType {
    PolicyType::Dial
}
