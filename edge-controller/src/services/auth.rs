//! Primary authentication, API session issuance, and the per-request
//! checks that decide whether a session is fully authenticated.

use axum::http::StatusCode;
use chrono::{DateTime, Duration, Utc};
use service_core::error::{ApiError, AppError};

use super::certs::{parse_der, pem_to_ders, verify_chain, CertService};
use super::database::{Database, Tables};
use super::enforcement::{EnforcementEvent, EnforcementHub};
use super::error::ServiceError;
use super::ext_jwt::{self, select_string, ExtJwtError};
use super::jwt::TokenSubject;
use super::metrics::record_authentication;
use super::policy::{AuthQuery, PolicyService};
use crate::models::{
    ApiSession, AuthMethod, AuthPolicy, Credential, ExternalJwtSigner, Identity, SessionKind,
};
use crate::utils::www_authenticate::REALM_PRIMARY_EXT_JWT;
use crate::utils::{verify_password, Challenge, ChallengeError, Password, PasswordHashString};

/// A primary credential as presented to `authenticate`.
pub enum PrimaryCredential {
    Updb { username: String, password: Password },
    /// DER certificates, leaf first, as forwarded by the TLS terminator.
    Cert { chain: Vec<Vec<u8>> },
    ExtJwt {
        token: Option<String>,
        issuer_id: Option<String>,
    },
}

impl PrimaryCredential {
    pub fn method(&self) -> AuthMethod {
        match self {
            PrimaryCredential::Updb { .. } => AuthMethod::Updb,
            PrimaryCredential::Cert { .. } => AuthMethod::Cert,
            PrimaryCredential::ExtJwt { .. } => AuthMethod::ExtJwt,
        }
    }
}

#[derive(Debug)]
pub enum AuthError {
    Service(ServiceError),
    /// A failed primary ext-jwt, reported with the signers that could have
    /// satisfied it.
    ExtJwt {
        error: ChallengeError,
        signers: Vec<(String, String)>,
    },
}

impl From<ServiceError> for AuthError {
    fn from(err: ServiceError) -> Self {
        AuthError::Service(err)
    }
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Service(e) => e.into(),
            AuthError::ExtJwt { error, signers } => {
                let challenge = Challenge::ext_jwt(
                    REALM_PRIMARY_EXT_JWT,
                    error,
                    signers.iter().map(|(id, issuer)| (id.as_str(), issuer.as_str())),
                );
                AppError::Challenge(
                    ApiError::new(
                        StatusCode::UNAUTHORIZED,
                        "INVALID_AUTH",
                        "the external token was not accepted",
                    ),
                    vec![challenge.to_header_value()],
                )
            }
        }
    }
}

/// Outcome of the secondary ext-jwt requirement for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecondaryCheck {
    NotRequired,
    Satisfied,
    Failed {
        error: ChallengeError,
        signer_id: String,
        issuer: String,
    },
}

impl SecondaryCheck {
    pub fn is_satisfied(&self) -> bool {
        !matches!(self, SecondaryCheck::Failed { .. })
    }

    pub fn challenge(&self) -> Option<Challenge> {
        match self {
            SecondaryCheck::Failed {
                error,
                signer_id,
                issuer,
            } => Some(Challenge::ext_jwt(
                crate::utils::www_authenticate::REALM_SECONDARY_EXT_JWT,
                *error,
                [(signer_id.as_str(), issuer.as_str())],
            )),
            _ => None,
        }
    }
}

/// Checks `bearer` against the policy's required secondary signer. The
/// token must verify against that signer and name the same identity.
pub fn check_secondary(
    tables: &Tables,
    identity: &Identity,
    policy: &AuthPolicy,
    bearer: Option<&str>,
    now: DateTime<Utc>,
) -> SecondaryCheck {
    let Some(signer_id) = policy.secondary.require_ext_jwt_signer.as_deref() else {
        return SecondaryCheck::NotRequired;
    };

    let Ok(signer) = tables.signer(signer_id) else {
        return SecondaryCheck::Failed {
            error: ChallengeError::Invalid,
            signer_id: signer_id.to_string(),
            issuer: String::new(),
        };
    };
    let failed = |error: ChallengeError| SecondaryCheck::Failed {
        error,
        signer_id: signer.id.clone(),
        issuer: signer.issuer.clone(),
    };

    let Some(token) = bearer else {
        return failed(ChallengeError::Missing);
    };
    let claims = match ext_jwt::verify(signer, token, now) {
        Ok(claims) => claims,
        Err(e) => return failed(e.challenge_error()),
    };

    let subject_matches = select_string(&claims, &signer.claims_property).is_ok_and(|subject| {
        if signer.use_external_id {
            identity.external_id.as_deref() == Some(subject.as_str())
        } else {
            subject == identity.id
        }
    });
    if subject_matches {
        SecondaryCheck::Satisfied
    } else {
        failed(ChallengeError::Invalid)
    }
}

/// Whether `token` claims the issuer of the policy's secondary signer.
fn addressed_to_secondary(tables: &Tables, policy: &AuthPolicy, token: &str) -> bool {
    let Some(signer) = policy
        .secondary
        .require_ext_jwt_signer
        .as_deref()
        .and_then(|id| tables.ext_jwt_signers.get(id))
    else {
        return false;
    };
    ext_jwt::peek_claims(token).is_some_and(|claims| {
        claims.get("iss").and_then(|iss| iss.as_str()) == Some(signer.issuer.as_str())
    })
}

/// Ids and issuers of every enabled signer, for challenges raised before an
/// identity is known.
fn enabled_signers(tables: &Tables) -> Vec<(String, String)> {
    let mut signers: Vec<&ExternalJwtSigner> =
        tables.ext_jwt_signers.values().filter(|s| s.enabled).collect();
    signers.sort_by(|a, b| a.name.cmp(&b.name));
    signers
        .into_iter()
        .map(|s| (s.id.clone(), s.issuer.clone()))
        .collect()
}

fn policy_signers(tables: &Tables, policy: &AuthPolicy) -> Vec<(String, String)> {
    policy
        .primary
        .ext_jwt
        .allowed_signers
        .iter()
        .filter_map(|id| tables.ext_jwt_signers.get(id))
        .map(|s| (s.id.clone(), s.issuer.clone()))
        .collect()
}

/// Trust anchors for certificate authentication: verified third-party CAs
/// with authentication enabled.
pub fn auth_ca_anchors(tables: &Tables) -> Vec<Vec<u8>> {
    tables
        .cas
        .values()
        .filter(|ca| ca.is_verified && ca.is_auth_enabled)
        .filter_map(|ca| pem_to_ders(&ca.cert_pem).ok()?.into_iter().next())
        .collect()
}

struct PrimaryMatch {
    identity: Identity,
    method: AuthMethod,
    authenticator_id: Option<String>,
    cert_fingerprints: Vec<String>,
    extend_requested: bool,
    key_roll_requested: bool,
}

/// A freshly issued API session and what it still owes.
#[derive(Debug, Clone)]
pub struct AuthOutcome {
    pub session: ApiSession,
    pub identity: Identity,
    pub auth_queries: Vec<AuthQuery>,
    pub secondary: SecondaryCheck,
}

#[derive(Clone)]
pub struct AuthService {
    db: Database,
    certs: CertService,
    hub: EnforcementHub,
    session_timeout: Duration,
}

impl AuthService {
    pub fn new(db: Database, certs: CertService, hub: EnforcementHub, session_timeout_minutes: i64) -> Self {
        Self {
            db,
            certs,
            hub,
            session_timeout: Duration::minutes(session_timeout_minutes),
        }
    }

    /// Runs primary authentication and opens an API session. `bearer` is the
    /// request's Authorization token, checked independently against any
    /// secondary ext-jwt requirement.
    pub async fn authenticate(
        &self,
        credential: PrimaryCredential,
        kind: SessionKind,
        bearer: Option<&str>,
        ip_address: Option<String>,
    ) -> Result<AuthOutcome, AuthError> {
        let method = credential.method();
        let result = self.primary(credential).await;
        record_authentication(method.as_str(), result.is_ok());

        let matched = match result {
            Ok(matched) => matched,
            Err(e) => {
                tracing::warn!(auth_method = method.as_str(), "Authentication failed");
                return Err(e);
            }
        };

        let tables = self.db.read().await;
        let policy = tables.policy_for(&matched.identity)?;
        let mfa = tables.mfas.get(&matched.identity.id);

        let mut session = ApiSession::new(kind, matched.identity.id.clone(), matched.method);
        session.authenticator_id = matched.authenticator_id;
        session.is_admin = matched.identity.is_admin;
        session.cert_fingerprints = matched.cert_fingerprints;
        session.is_cert_extend_requested = matched.extend_requested;
        session.is_cert_key_roll_requested = matched.key_roll_requested;
        session.totp_pending = PolicyService::totp_required(policy, mfa);
        session.ip_address = ip_address;

        // An ext-jwt primary arrives as the bearer; it counts toward the
        // secondary only when addressed to the secondary signer.
        let bearer = bearer.filter(|token| {
            matched.method != AuthMethod::ExtJwt || addressed_to_secondary(&tables, policy, token)
        });
        let secondary = check_secondary(&tables, &matched.identity, policy, bearer, Utc::now());
        let auth_queries = self.queries_with(&tables, &session, &matched.identity, policy, &secondary);

        self.db.insert_api_session(session.clone());
        tracing::info!(
            identity_id = %matched.identity.id,
            api_session_id = %session.id,
            auth_method = method.as_str(),
            policy_id = %policy.id,
            pending_queries = auth_queries.len(),
            "Authentication succeeded"
        );

        Ok(AuthOutcome {
            session,
            identity: matched.identity,
            auth_queries,
            secondary,
        })
    }

    async fn primary(&self, credential: PrimaryCredential) -> Result<PrimaryMatch, AuthError> {
        match credential {
            PrimaryCredential::Updb { username, password } => {
                Ok(self.primary_updb(&username, &password).await?)
            }
            PrimaryCredential::Cert { chain } => Ok(self.primary_cert(&chain).await?),
            PrimaryCredential::ExtJwt { token, issuer_id } => {
                self.primary_ext_jwt(token.as_deref(), issuer_id.as_deref()).await
            }
        }
    }

    async fn primary_updb(&self, username: &str, password: &Password) -> Result<PrimaryMatch, ServiceError> {
        let mut tables = self.db.write().await;
        let now = Utc::now();

        let authenticator = tables
            .authenticator_by_username(username)
            .cloned()
            .ok_or_else(|| ServiceError::invalid_auth("invalid username or password"))?;
        let Credential::Updb { password_hash, .. } = &authenticator.credential else {
            return Err(ServiceError::invalid_auth("invalid username or password"));
        };

        let identity = tables.identity(&authenticator.identity_id)?.clone();
        if identity.is_locked(now) {
            return Err(ServiceError::invalid_auth("the identity is disabled"));
        }
        let updb = tables.policy_for(&identity)?.primary.updb.clone();
        if !updb.allowed {
            return Err(ServiceError::invalid_auth("password authentication is not allowed"));
        }

        let verified = verify_password(password, &PasswordHashString::new(password_hash.clone())).is_ok();

        let attempts = match tables.authenticators.get_mut(&authenticator.id) {
            Some(stored) => match &mut stored.credential {
                Credential::Updb { failed_attempts, .. } => {
                    *failed_attempts = if verified { 0 } else { failed_attempts.saturating_add(1) };
                    *failed_attempts
                }
                Credential::Cert { .. } => 0,
            },
            None => 0,
        };

        if verified {
            return Ok(PrimaryMatch {
                identity,
                method: AuthMethod::Updb,
                authenticator_id: Some(authenticator.id),
                cert_fingerprints: Vec::new(),
                extend_requested: false,
                key_roll_requested: false,
            });
        }

        if updb.max_attempts > 0 && i64::from(attempts) >= updb.max_attempts {
            let until = (updb.lockout_duration_minutes > 0)
                .then(|| now + Duration::minutes(updb.lockout_duration_minutes));
            tables.identity_mut(&identity.id)?.disable(until);
            if let Some(stored) = tables.authenticators.get_mut(&authenticator.id) {
                if let Credential::Updb { failed_attempts, .. } = &mut stored.credential {
                    *failed_attempts = 0;
                }
            }
            tracing::warn!(
                identity_id = %identity.id,
                attempts = attempts,
                until = ?until,
                "Identity locked after repeated password failures"
            );
        }

        Err(ServiceError::invalid_auth("invalid username or password"))
    }

    async fn primary_cert(&self, chain: &[Vec<u8>]) -> Result<PrimaryMatch, ServiceError> {
        let leaf = chain
            .first()
            .ok_or_else(|| ServiceError::invalid_auth("no client certificate was presented"))?;
        let leaf = parse_der(leaf)
            .map_err(|e| ServiceError::invalid_auth(format!("client certificate unreadable: {}", e)))?;

        let tables = self.db.read().await;
        let trusted = self.certs.issued_by_controller(chain)
            || verify_chain(chain, &auth_ca_anchors(&tables)).is_some();
        if !trusted {
            return Err(ServiceError::invalid_auth("client certificate is not trusted"));
        }

        let authenticator = tables
            .authenticator_by_fingerprint(&leaf.fingerprint)
            .ok_or_else(|| ServiceError::invalid_auth("client certificate is not enrolled"))?;
        let identity = tables.identity(&authenticator.identity_id)?;
        if identity.is_locked(Utc::now()) {
            return Err(ServiceError::invalid_auth("the identity is disabled"));
        }

        let policy = tables.policy_for(identity)?;
        if !PolicyService::primary_allowed(policy, AuthMethod::Cert, None) {
            return Err(ServiceError::invalid_auth("certificate authentication is not allowed"));
        }
        if !leaf.is_time_valid(Utc::now()) && !PolicyService::allows_expired_certs(policy) {
            return Err(ServiceError::invalid_auth("client certificate is expired"));
        }

        let (extend_requested, key_roll_requested) = authenticator.extend_flags();
        Ok(PrimaryMatch {
            identity: identity.clone(),
            method: AuthMethod::Cert,
            authenticator_id: Some(authenticator.id.clone()),
            cert_fingerprints: vec![leaf.fingerprint],
            extend_requested,
            key_roll_requested,
        })
    }

    async fn primary_ext_jwt(
        &self,
        token: Option<&str>,
        issuer_id: Option<&str>,
    ) -> Result<PrimaryMatch, AuthError> {
        let tables = self.db.read().await;
        let reject = |error: ExtJwtError, signers: Vec<(String, String)>| AuthError::ExtJwt {
            error: error.challenge_error(),
            signers,
        };

        let Some(token) = token.filter(|t| !t.is_empty()) else {
            return Err(reject(ExtJwtError::Missing, enabled_signers(&tables)));
        };
        let signer = ext_jwt::select_signer(&tables, token, issuer_id)
            .map_err(|e| reject(e, enabled_signers(&tables)))?;
        let claims = ext_jwt::verify(signer, token, Utc::now())
            .map_err(|e| reject(e, enabled_signers(&tables)))?;

        let subject = select_string(&claims, &signer.claims_property)
            .map_err(|_| reject(ExtJwtError::Invalid, enabled_signers(&tables)))?;
        let identity = if signer.use_external_id {
            tables.identity_by_external_id(&subject)
        } else {
            tables.identities.get(&subject)
        }
        .ok_or_else(|| reject(ExtJwtError::Invalid, enabled_signers(&tables)))?;

        let policy = tables.policy_for(identity)?;
        if identity.is_locked(Utc::now())
            || !PolicyService::primary_allowed(policy, AuthMethod::ExtJwt, Some(&signer.id))
        {
            return Err(reject(ExtJwtError::Invalid, policy_signers(&tables, policy)));
        }

        Ok(PrimaryMatch {
            identity: identity.clone(),
            method: AuthMethod::ExtJwt,
            authenticator_id: None,
            cert_fingerprints: Vec::new(),
            extend_requested: false,
            key_roll_requested: false,
        })
    }

    fn queries_with(
        &self,
        tables: &Tables,
        session: &ApiSession,
        identity: &Identity,
        policy: &AuthPolicy,
        secondary: &SecondaryCheck,
    ) -> Vec<AuthQuery> {
        let signer = policy
            .secondary
            .require_ext_jwt_signer
            .as_deref()
            .and_then(|id| tables.ext_jwt_signers.get(id));
        PolicyService::auth_queries(
            policy,
            tables.mfas.get(&identity.id),
            session.totp_pending,
            signer,
            secondary.is_satisfied(),
            session.kind == SessionKind::Oidc,
        )
    }

    /// Outstanding auth queries and the secondary ext-jwt state of a session,
    /// evaluated against the identity's current policy.
    pub async fn evaluate_session(
        &self,
        session: &ApiSession,
        bearer: Option<&str>,
    ) -> Result<(Vec<AuthQuery>, SecondaryCheck), ServiceError> {
        let tables = self.db.read().await;
        let identity = tables.identity(&session.identity_id)?;
        let policy = tables.policy_for(identity)?;
        let secondary = check_secondary(&tables, identity, policy, bearer, Utc::now());
        let queries = self.queries_with(&tables, session, identity, policy, &secondary);
        Ok((queries, secondary))
    }

    /// Resolves a `zt-session` token, refreshing its activity time. Idle
    /// sessions are removed and treated as unknown.
    pub fn touch_legacy_session(&self, token: &str) -> Option<ApiSession> {
        let session = self.db.api_session_by_token(token)?;
        if session.kind != SessionKind::Legacy {
            return None;
        }
        let now = Utc::now();
        if session.is_idle(now, self.session_timeout) {
            self.logout(&session.id);
            tracing::info!(api_session_id = %session.id, "Idle API session expired");
            return None;
        }
        self.db
            .update_api_session(&session.id, |s| s.last_activity_at = now)
    }

    /// The OIDC session named by an access token's `z_asid`.
    pub fn oidc_session(&self, api_session_id: &str) -> Option<ApiSession> {
        let now = Utc::now();
        self.db
            .update_api_session(api_session_id, |s| s.last_activity_at = now)
            .filter(|s| s.kind == SessionKind::Oidc)
    }

    pub fn complete_totp(&self, api_session_id: &str) -> Option<ApiSession> {
        self.db
            .update_api_session(api_session_id, |s| s.totp_pending = false)
    }

    pub fn logout(&self, api_session_id: &str) -> bool {
        let removed = self.db.remove_api_session(api_session_id).is_some();
        if removed {
            self.hub
                .notify(EnforcementEvent::ApiSessionRemoved(api_session_id.to_string()));
        }
        removed
    }

    /// Claims for the OIDC tokens of a session.
    pub async fn token_subject(&self, session: &ApiSession) -> Result<TokenSubject, ServiceError> {
        let tables = self.db.read().await;
        let identity = tables.identity(&session.identity_id)?;
        Ok(TokenSubject {
            identity_id: identity.id.clone(),
            identity_name: identity.name.clone(),
            api_session_id: session.id.clone(),
            is_admin: identity.is_admin,
            external_id: identity.external_id.clone(),
            cert_fingerprints: session.cert_fingerprints.clone(),
            cert_extendable: session.auth_method == AuthMethod::Cert,
            authenticator_id: session.authenticator_id.clone(),
            auth_time: session.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AuthPolicyPrimary, AuthPolicySecondary, Authenticator, PrimaryUpdb};
    use crate::utils::hash_password;

    async fn service_with_user(policy: AuthPolicy) -> (AuthService, Identity) {
        let db = Database::new();
        let certs = CertService::generate(30).unwrap();
        let mut identity = Identity::new("alice", false);
        identity.auth_policy_id = policy.id.clone();
        let hash = hash_password(&Password::new("Secret-123")).unwrap();
        let authenticator = Authenticator::updb(identity.id.clone(), "alice".into(), hash.into_string());
        {
            let mut tables = db.write().await;
            tables.auth_policies.insert(policy.id.clone(), policy);
            tables.authenticators.insert(authenticator.id.clone(), authenticator);
            tables.identities.insert(identity.id.clone(), identity.clone());
        }
        (AuthService::new(db, certs, EnforcementHub::new(), 30), identity)
    }

    fn updb(username: &str, password: &str) -> PrimaryCredential {
        PrimaryCredential::Updb {
            username: username.into(),
            password: Password::new(password),
        }
    }

    fn lockout_policy(max_attempts: i64) -> AuthPolicy {
        AuthPolicy::new(
            "lockout",
            AuthPolicyPrimary {
                updb: PrimaryUpdb {
                    allowed: true,
                    max_attempts,
                    lockout_duration_minutes: 0,
                    ..PrimaryUpdb::default()
                },
                ..AuthPolicyPrimary::default()
            },
            AuthPolicySecondary::default(),
        )
    }

    #[tokio::test]
    async fn password_login_opens_full_session() {
        let (service, identity) = service_with_user(AuthPolicy::system_default()).await;
        let outcome = service
            .authenticate(updb("alice", "Secret-123"), SessionKind::Legacy, None, None)
            .await
            .unwrap();
        assert_eq!(outcome.session.identity_id, identity.id);
        assert!(outcome.auth_queries.is_empty());
        assert_eq!(outcome.secondary, SecondaryCheck::NotRequired);
        assert!(service.touch_legacy_session(&outcome.session.token).is_some());
    }

    #[tokio::test]
    async fn repeated_failures_lock_the_identity() {
        let (service, identity) = service_with_user(lockout_policy(2)).await;
        for _ in 0..2 {
            assert!(service
                .authenticate(updb("alice", "wrong"), SessionKind::Legacy, None, None)
                .await
                .is_err());
        }
        assert!(service
            .authenticate(updb("alice", "Secret-123"), SessionKind::Legacy, None, None)
            .await
            .is_err());
        let tables = service.db.read().await;
        assert!(tables.identity(&identity.id).unwrap().is_locked(Utc::now()));
    }

    #[tokio::test]
    async fn success_resets_failure_count() {
        let (service, identity) = service_with_user(lockout_policy(2)).await;
        let _ = service
            .authenticate(updb("alice", "wrong"), SessionKind::Legacy, None, None)
            .await;
        service
            .authenticate(updb("alice", "Secret-123"), SessionKind::Legacy, None, None)
            .await
            .unwrap();
        let _ = service
            .authenticate(updb("alice", "wrong"), SessionKind::Legacy, None, None)
            .await;
        let tables = service.db.read().await;
        assert!(!tables.identity(&identity.id).unwrap().is_locked(Utc::now()));
    }

    #[tokio::test]
    async fn missing_ext_jwt_lists_enabled_signers() {
        let (service, _) = service_with_user(AuthPolicy::system_default()).await;
        let signer = ExternalJwtSigner::new("idp".into(), "https://idp".into(), String::new(), "fp".into());
        service
            .db
            .write()
            .await
            .ext_jwt_signers
            .insert(signer.id.clone(), signer.clone());

        let err = service
            .authenticate(
                PrimaryCredential::ExtJwt { token: None, issuer_id: None },
                SessionKind::Legacy,
                None,
                None,
            )
            .await
            .unwrap_err();
        match err {
            AuthError::ExtJwt { error, signers } => {
                assert_eq!(error, ChallengeError::Missing);
                assert_eq!(signers, vec![(signer.id, signer.issuer)]);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn logout_invalidates_token() {
        let (service, _) = service_with_user(AuthPolicy::system_default()).await;
        let outcome = service
            .authenticate(updb("alice", "Secret-123"), SessionKind::Legacy, None, None)
            .await
            .unwrap();
        assert!(service.logout(&outcome.session.id));
        assert!(service.touch_legacy_session(&outcome.session.token).is_none());
    }
}
