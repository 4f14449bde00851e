//! Auth policy evaluation.
//!
//! Decides which primary credentials an identity's policy admits, checks
//! passwords against its UPDB rules, and composes the auth queries a
//! partially authenticated session still owes.

use serde::Serialize;

use crate::models::{AuthMethod, AuthPolicy, ExternalJwtSigner, Mfa, PrimaryUpdb};

pub const AUTH_QUERY_TYPE_MFA: &str = "MFA";
pub const AUTH_QUERY_TYPE_TOTP: &str = "TOTP";
pub const AUTH_QUERY_TYPE_EXT_JWT: &str = "EXT-JWT";
pub const MFA_PROVIDER_ZITI: &str = "ziti";
pub const EXT_JWT_PROVIDER_URL: &str = "URL";

const SPECIAL_CHARS: &str = "!@#$%^&*()-_=+[]{}|\\;:'\",.<>/?`~";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PasswordPolicyError {
    TooShort { min_length: usize, actual_length: usize },
    MissingMixedCase,
    MissingNumber,
    MissingSpecial,
}

impl std::fmt::Display for PasswordPolicyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PasswordPolicyError::TooShort {
                min_length,
                actual_length,
            } => write!(
                f,
                "password must be at least {} characters (got {})",
                min_length, actual_length
            ),
            PasswordPolicyError::MissingMixedCase => {
                write!(f, "password must contain upper and lower case letters")
            }
            PasswordPolicyError::MissingNumber => {
                write!(f, "password must contain at least one number")
            }
            PasswordPolicyError::MissingSpecial => {
                write!(f, "password must contain at least one special character")
            }
        }
    }
}

impl std::error::Error for PasswordPolicyError {}

/// A factor the client must still supply before its session is usable.
#[derive(Debug, Clone, Serialize, PartialEq, Eq, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AuthQuery {
    pub type_id: String,
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_length: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_length: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_totp_enrolled: Option<bool>,
}

impl AuthQuery {
    fn base(type_id: &str, provider: &str) -> Self {
        Self {
            type_id: type_id.to_string(),
            provider: provider.to_string(),
            id: None,
            http_method: None,
            http_url: None,
            format: None,
            min_length: None,
            max_length: None,
            client_id: None,
            scopes: None,
            is_totp_enrolled: None,
        }
    }

    /// TOTP prompt for legacy sessions, answered at `authenticate/mfa`.
    pub fn mfa() -> Self {
        Self {
            http_method: Some("POST".to_string()),
            http_url: Some("./authenticate/mfa".to_string()),
            format: Some("numeric".to_string()),
            min_length: Some(4),
            max_length: Some(6),
            ..Self::base(AUTH_QUERY_TYPE_MFA, MFA_PROVIDER_ZITI)
        }
    }

    /// TOTP prompt during an OIDC login.
    pub fn totp(is_enrolled: bool) -> Self {
        Self {
            http_method: Some("POST".to_string()),
            http_url: Some("./oidc/login/totp".to_string()),
            format: Some("numeric".to_string()),
            min_length: Some(4),
            max_length: Some(6),
            is_totp_enrolled: Some(is_enrolled),
            ..Self::base(AUTH_QUERY_TYPE_TOTP, MFA_PROVIDER_ZITI)
        }
    }

    pub fn ext_jwt(signer: &ExternalJwtSigner) -> Self {
        Self {
            id: Some(signer.id.clone()),
            http_url: signer.external_auth_url.clone(),
            client_id: signer.client_id.clone(),
            scopes: Some(signer.scopes.clone()),
            ..Self::base(AUTH_QUERY_TYPE_EXT_JWT, EXT_JWT_PROVIDER_URL)
        }
    }
}

/// Auth policy evaluation.
#[derive(Debug, Clone)]
pub struct PolicyService;

impl PolicyService {
    /// Checks a new password against the policy's UPDB rules, returning the
    /// first violation.
    pub fn validate_password(password: &str, updb: &PrimaryUpdb) -> Result<(), PasswordPolicyError> {
        let min_length = usize::try_from(updb.min_password_length).unwrap_or(0);
        let actual_length = password.chars().count();
        if actual_length < min_length {
            return Err(PasswordPolicyError::TooShort {
                min_length,
                actual_length,
            });
        }

        if updb.require_mixed_case
            && !(password.chars().any(|c| c.is_uppercase())
                && password.chars().any(|c| c.is_lowercase()))
        {
            return Err(PasswordPolicyError::MissingMixedCase);
        }

        if updb.require_number_char && !password.chars().any(|c| c.is_ascii_digit()) {
            return Err(PasswordPolicyError::MissingNumber);
        }

        if updb.require_special_char && !password.chars().any(|c| SPECIAL_CHARS.contains(c)) {
            return Err(PasswordPolicyError::MissingSpecial);
        }

        Ok(())
    }

    /// Whether the policy admits this primary method. For ext-jwt the
    /// signer must also be listed; an empty list admits none.
    pub fn primary_allowed(policy: &AuthPolicy, method: AuthMethod, signer_id: Option<&str>) -> bool {
        match method {
            AuthMethod::Cert => policy.primary.cert.allowed,
            AuthMethod::Updb => policy.primary.updb.allowed,
            AuthMethod::ExtJwt => {
                policy.primary.ext_jwt.allowed
                    && signer_id.is_some_and(|id| {
                        policy.primary.ext_jwt.allowed_signers.iter().any(|s| s == id)
                    })
            }
        }
    }

    pub fn allows_expired_certs(policy: &AuthPolicy) -> bool {
        policy.primary.cert.allow_expired_certs
    }

    /// Whether a TOTP code is owed after primary authentication.
    pub fn totp_required(policy: &AuthPolicy, mfa: Option<&Mfa>) -> bool {
        policy.secondary.require_totp || mfa.is_some_and(|m| m.is_verified)
    }

    /// Queries still open for a session. `totp_pending` reflects what the
    /// session has already satisfied; the secondary ext-jwt query is listed
    /// while `ext_jwt_satisfied` is false.
    pub fn auth_queries(
        policy: &AuthPolicy,
        mfa: Option<&Mfa>,
        totp_pending: bool,
        secondary_signer: Option<&ExternalJwtSigner>,
        ext_jwt_satisfied: bool,
        oidc: bool,
    ) -> Vec<AuthQuery> {
        let mut queries = Vec::new();

        if totp_pending {
            if oidc {
                queries.push(AuthQuery::totp(mfa.is_some_and(|m| m.is_verified)));
            } else {
                queries.push(AuthQuery::mfa());
            }
        }

        if !ext_jwt_satisfied && policy.secondary.require_ext_jwt_signer.is_some() {
            if let Some(signer) = secondary_signer {
                queries.push(AuthQuery::ext_jwt(signer));
            }
        }

        queries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AuthPolicyPrimary, AuthPolicySecondary, PrimaryExtJwt};

    fn updb(min: i64) -> PrimaryUpdb {
        PrimaryUpdb {
            allowed: true,
            min_password_length: min,
            ..PrimaryUpdb::default()
        }
    }

    #[test]
    fn password_rules_apply_in_order() {
        let mut rules = updb(8);
        assert!(matches!(
            PolicyService::validate_password("short", &rules),
            Err(PasswordPolicyError::TooShort { min_length: 8, actual_length: 5 })
        ));

        rules.require_mixed_case = true;
        assert_eq!(
            PolicyService::validate_password("alllowercase", &rules),
            Err(PasswordPolicyError::MissingMixedCase)
        );

        rules.require_number_char = true;
        assert_eq!(
            PolicyService::validate_password("MixedCaseOnly", &rules),
            Err(PasswordPolicyError::MissingNumber)
        );

        rules.require_special_char = true;
        assert_eq!(
            PolicyService::validate_password("Mixed1Case", &rules),
            Err(PasswordPolicyError::MissingSpecial)
        );
        assert!(PolicyService::validate_password("Mixed1Case!", &rules).is_ok());
    }

    #[test]
    fn ext_jwt_primary_requires_listed_signer() {
        let mut policy = AuthPolicy::new(
            "p",
            AuthPolicyPrimary {
                ext_jwt: PrimaryExtJwt {
                    allowed: true,
                    allowed_signers: Vec::new(),
                },
                ..AuthPolicyPrimary::default()
            },
            AuthPolicySecondary::default(),
        );
        assert!(!PolicyService::primary_allowed(&policy, AuthMethod::ExtJwt, Some("s1")));

        policy.primary.ext_jwt.allowed_signers = vec!["s1".into()];
        assert!(PolicyService::primary_allowed(&policy, AuthMethod::ExtJwt, Some("s1")));
        assert!(!PolicyService::primary_allowed(&policy, AuthMethod::ExtJwt, Some("s2")));

        policy.primary.ext_jwt.allowed = false;
        assert!(!PolicyService::primary_allowed(&policy, AuthMethod::ExtJwt, Some("s1")));
    }

    #[test]
    fn disabled_primaries_fail_closed() {
        let policy = AuthPolicy::new(
            "closed",
            AuthPolicyPrimary::default(),
            AuthPolicySecondary::default(),
        );
        for method in [AuthMethod::Cert, AuthMethod::Updb, AuthMethod::ExtJwt] {
            assert!(!PolicyService::primary_allowed(&policy, method, Some("s1")));
        }
    }

    #[test]
    fn verified_mfa_requires_totp_even_without_policy() {
        let policy = AuthPolicy::system_default();
        let mut mfa = Mfa::new("i".into(), "SECRET".into(), Vec::new());
        assert!(!PolicyService::totp_required(&policy, Some(&mfa)));
        mfa.is_verified = true;
        assert!(PolicyService::totp_required(&policy, Some(&mfa)));
    }

    #[test]
    fn queries_reflect_outstanding_factors() {
        let mut policy = AuthPolicy::system_default();
        let signer = ExternalJwtSigner::new(
            "idp".into(),
            "https://idp".into(),
            String::new(),
            "fp".into(),
        );
        policy.secondary.require_ext_jwt_signer = Some(signer.id.clone());

        let legacy = PolicyService::auth_queries(&policy, None, true, Some(&signer), false, false);
        assert_eq!(legacy.len(), 2);
        assert_eq!(legacy[0].type_id, AUTH_QUERY_TYPE_MFA);
        assert_eq!(legacy[1].type_id, AUTH_QUERY_TYPE_EXT_JWT);
        assert_eq!(legacy[1].id.as_deref(), Some(signer.id.as_str()));

        let oidc = PolicyService::auth_queries(&policy, None, true, Some(&signer), true, true);
        assert_eq!(oidc, vec![AuthQuery::totp(false)]);

        assert!(PolicyService::auth_queries(&policy, None, false, Some(&signer), true, false).is_empty());
    }
}
