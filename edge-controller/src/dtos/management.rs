use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use utoipa::ToSchema;
use validator::Validate;

use crate::models::{
    AuthPolicyPrimary, AuthPolicySecondary, ExternalIdClaim, PolicyType, Semantic, TargetToken,
};

type Tags = Map<String, Value>;

// ============================================================================
// Identities
// ============================================================================

/// Enrollments created together with an identity.
#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct IdentityEnrollments {
    #[serde(default)]
    pub ott: bool,
    /// CA id for an OTTCA enrollment.
    pub ottca: Option<String>,
    /// Username for a UPDB enrollment.
    pub updb: Option<String>,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateIdentityRequest {
    #[validate(length(min = 1, message = "name is required"))]
    #[schema(example = "laptop-01")]
    pub name: String,
    #[serde(rename = "type")]
    pub identity_type: Option<String>,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub role_attributes: Vec<String>,
    pub auth_policy_id: Option<String>,
    pub external_id: Option<String>,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub tags: Tags,
    pub enrollment: Option<IdentityEnrollments>,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PatchIdentityRequest {
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub identity_type: Option<String>,
    pub is_admin: Option<bool>,
    pub role_attributes: Option<Vec<String>>,
    pub auth_policy_id: Option<String>,
    pub external_id: Option<String>,
    #[schema(value_type = Option<Object>)]
    pub tags: Option<Tags>,
}

// ============================================================================
// Authenticators
// ============================================================================

#[derive(Debug, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateAuthenticatorRequest {
    #[validate(length(min = 1, message = "identityId is required"))]
    pub identity_id: String,
    #[schema(example = "updb")]
    pub method: String,
    pub cert_pem: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RequestExtendRequest {
    #[serde(default)]
    pub roll_keys: bool,
}

// ============================================================================
// Auth policies
// ============================================================================

#[derive(Debug, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AuthPolicyRequest {
    #[validate(length(min = 1, message = "name is required"))]
    pub name: String,
    #[schema(value_type = Object)]
    pub primary: AuthPolicyPrimary,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub secondary: AuthPolicySecondary,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub tags: Tags,
}

/// Partial update. `primary` and `secondary` are merged field by field.
#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PatchAuthPolicyRequest {
    pub name: Option<String>,
    #[schema(value_type = Option<Object>)]
    pub primary: Option<Value>,
    #[schema(value_type = Option<Object>)]
    pub secondary: Option<Value>,
    #[schema(value_type = Option<Object>)]
    pub tags: Option<Tags>,
}

// ============================================================================
// External JWT signers
// ============================================================================

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExtJwtSignerRequest {
    #[validate(length(min = 1, message = "name is required"))]
    pub name: String,
    #[validate(length(min = 1, message = "certPem is required"))]
    pub cert_pem: String,
    pub kid: Option<String>,
    #[validate(length(min = 1, message = "issuer is required"))]
    pub issuer: String,
    pub audience: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub external_auth_url: Option<String>,
    pub claims_property: Option<String>,
    #[serde(default)]
    pub use_external_id: bool,
    pub client_id: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[schema(value_type = Option<String>)]
    pub target_token: Option<TargetToken>,
    #[serde(default)]
    pub enroll_to_cert_enabled: bool,
    #[serde(default)]
    pub enroll_to_token_enabled: bool,
    pub enroll_name_claims_selector: Option<String>,
    pub enroll_attribute_claims_selector: Option<String>,
    pub enroll_auth_policy_id: Option<String>,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub tags: Tags,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PatchExtJwtSignerRequest {
    pub name: Option<String>,
    pub cert_pem: Option<String>,
    pub kid: Option<String>,
    pub issuer: Option<String>,
    pub audience: Option<String>,
    pub enabled: Option<bool>,
    pub external_auth_url: Option<String>,
    pub claims_property: Option<String>,
    pub use_external_id: Option<bool>,
    pub client_id: Option<String>,
    pub scopes: Option<Vec<String>>,
    #[schema(value_type = Option<String>)]
    pub target_token: Option<TargetToken>,
    pub enroll_to_cert_enabled: Option<bool>,
    pub enroll_to_token_enabled: Option<bool>,
    pub enroll_name_claims_selector: Option<String>,
    pub enroll_attribute_claims_selector: Option<String>,
    pub enroll_auth_policy_id: Option<String>,
    #[schema(value_type = Option<Object>)]
    pub tags: Option<Tags>,
}

// ============================================================================
// Enrollments
// ============================================================================

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateEnrollmentRequest {
    pub identity_id: Option<String>,
    #[schema(example = "ott")]
    pub method: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub ca_id: Option<String>,
    pub username: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RefreshEnrollmentRequest {
    pub expires_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Certificate authorities
// ============================================================================

#[derive(Debug, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateCaRequest {
    #[validate(length(min = 1, message = "name is required"))]
    pub name: String,
    #[validate(length(min = 1, message = "certPem is required"))]
    pub cert_pem: String,
    #[serde(default)]
    pub is_auto_ca_enrollment_enabled: bool,
    #[serde(default)]
    pub is_ott_ca_enrollment_enabled: bool,
    #[serde(default)]
    pub is_auth_enabled: bool,
    #[serde(default)]
    pub identity_roles: Vec<String>,
    pub identity_name_format: Option<String>,
    #[schema(value_type = Option<Object>)]
    pub external_id_claim: Option<ExternalIdClaim>,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub tags: Tags,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PatchCaRequest {
    pub name: Option<String>,
    pub is_auto_ca_enrollment_enabled: Option<bool>,
    pub is_ott_ca_enrollment_enabled: Option<bool>,
    pub is_auth_enabled: Option<bool>,
    pub identity_roles: Option<Vec<String>>,
    pub identity_name_format: Option<String>,
    #[schema(value_type = Option<Object>)]
    pub external_id_claim: Option<ExternalIdClaim>,
    #[schema(value_type = Option<Object>)]
    pub tags: Option<Tags>,
}

// ============================================================================
// Services and service policies
// ============================================================================

#[derive(Debug, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRequest {
    #[validate(length(min = 1, message = "name is required"))]
    pub name: String,
    #[serde(default)]
    pub role_attributes: Vec<String>,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub tags: Tags,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PatchServiceRequest {
    pub name: Option<String>,
    pub role_attributes: Option<Vec<String>>,
    #[schema(value_type = Option<Object>)]
    pub tags: Option<Tags>,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServicePolicyRequest {
    #[validate(length(min = 1, message = "name is required"))]
    pub name: String,
    #[serde(rename = "type")]
    #[schema(value_type = String, example = "Dial")]
    pub policy_type: PolicyType,
    #[serde(default)]
    #[schema(value_type = String, example = "AnyOf")]
    pub semantic: Semantic,
    #[serde(default)]
    pub identity_roles: Vec<String>,
    #[serde(default)]
    pub service_roles: Vec<String>,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub tags: Tags,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PatchServicePolicyRequest {
    pub name: Option<String>,
    #[serde(rename = "type")]
    #[schema(value_type = Option<String>)]
    pub policy_type: Option<PolicyType>,
    #[schema(value_type = Option<String>)]
    pub semantic: Option<Semantic>,
    pub identity_roles: Option<Vec<String>>,
    pub service_roles: Option<Vec<String>>,
    #[schema(value_type = Option<Object>)]
    pub tags: Option<Tags>,
}
