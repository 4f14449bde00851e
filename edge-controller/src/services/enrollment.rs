//! Enrollment lifecycle: creating and refreshing enrollment tickets,
//! completing them by method, CA auto-enrollment, ext-jwt token exchange,
//! and certificate extension for existing authenticators.

use chrono::{DateTime, Utc};

use super::certs::{der_to_pem, parse_der, pem_to_ders, verify_chain, CertService, IssuedCert};
use super::database::{Database, Tables};
use super::error::ServiceError;
use super::ext_jwt::{self, select_attributes, select_string};
use super::jwt::JwtService;
use super::metrics::record_enrollment;
use super::policy::PolicyService;
use crate::models::{
    AuthMethod, Authenticator, CertificateAuthority, Credential, Enrollment, EnrollmentMethod,
    Identity, DEFAULT_AUTH_POLICY_ID,
};
use crate::utils::{hash_password, Password};

const MAX_NAME_SUFFIX: u32 = 999_999;

/// Fields accepted when creating an enrollment.
#[derive(Debug, Clone, Default)]
pub struct NewEnrollment {
    pub identity_id: Option<String>,
    pub method: Option<EnrollmentMethod>,
    pub expires_at: Option<DateTime<Utc>>,
    pub ca_id: Option<String>,
    pub username: Option<String>,
}

/// Result of exchanging an external JWT.
#[derive(Debug, Clone)]
pub struct TokenEnrollment {
    pub identity: Identity,
    pub cert: Option<IssuedCert>,
}

fn not_allowed(msg: impl Into<String>) -> ServiceError {
    ServiceError::InvalidEnrollmentNotAllowed(msg.into())
}

fn invalid_token(msg: impl Into<String>) -> ServiceError {
    ServiceError::InvalidEnrollmentToken(msg.into())
}

/// Rejects certificates some authenticator already holds.
fn ensure_cert_unused(tables: &Tables, fingerprint: &str) -> Result<(), ServiceError> {
    if tables.authenticator_by_fingerprint(fingerprint).is_some() {
        return Err(ServiceError::CertInUse);
    }
    Ok(())
}

fn ca_anchor(ca: &CertificateAuthority) -> Result<Vec<u8>, ServiceError> {
    pem_to_ders(&ca.cert_pem)
        .map_err(|e| ServiceError::Internal(anyhow::anyhow!("stored CA certificate unreadable: {}", e)))?
        .into_iter()
        .next()
        .ok_or_else(|| ServiceError::Internal(anyhow::anyhow!("stored CA certificate is empty")))
}

/// A CA backs OTTCA enrollments only while verified and enabled for them.
fn ottca_usable(ca: &CertificateAuthority) -> Result<(), String> {
    if !ca.is_verified {
        return Err(format!("ca {} is not verified", ca.id));
    }
    if !ca.is_ott_ca_enrollment_enabled {
        return Err(format!("ca {} does not allow OTTCA enrollment", ca.id));
    }
    Ok(())
}

/// `base`, or `base` with the smallest zero-padded numeric suffix that no
/// other identity uses.
fn unique_identity_name(tables: &Tables, base: &str) -> Result<String, ServiceError> {
    if !tables.identity_name_taken(base, None) {
        return Ok(base.to_string());
    }
    (1..=MAX_NAME_SUFFIX)
        .map(|n| format!("{}{:06}", base, n))
        .find(|candidate| !tables.identity_name_taken(candidate, None))
        .ok_or_else(|| ServiceError::validation(format!("no free identity name for {}", base)))
}

#[derive(Clone)]
pub struct EnrollmentService {
    db: Database,
    jwt: JwtService,
    certs: CertService,
}

impl EnrollmentService {
    pub fn new(db: Database, jwt: JwtService, certs: CertService) -> Self {
        Self { db, jwt, certs }
    }

    fn sign_ticket(&self, enrollment: &mut Enrollment) -> Result<(), ServiceError> {
        enrollment.jwt = self.jwt.issue_enrollment_token(
            &enrollment.identity_id,
            &enrollment.token,
            enrollment.method.as_str(),
            enrollment.expires_at,
        )?;
        Ok(())
    }

    /// Validates and stores a new enrollment inside an existing write lock.
    pub fn create_in(&self, tables: &mut Tables, new: NewEnrollment) -> Result<Enrollment, ServiceError> {
        let identity_id = new
            .identity_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ServiceError::validation("identityId is required"))?;
        if !tables.identities.contains_key(&identity_id) {
            return Err(ServiceError::validation(format!("identity {} does not exist", identity_id)));
        }
        let method = new
            .method
            .ok_or_else(|| ServiceError::validation("method is required"))?;
        let expires_at = new
            .expires_at
            .ok_or_else(|| ServiceError::validation("expiresAt is required"))?;
        if expires_at <= Utc::now() {
            return Err(ServiceError::validation("expiresAt must be in the future"));
        }

        let mut enrollment = Enrollment::new(identity_id, method, expires_at);
        match method {
            EnrollmentMethod::Ottca => {
                let ca_id = new
                    .ca_id
                    .filter(|id| !id.is_empty())
                    .ok_or_else(|| ServiceError::validation("caId is required for ottca enrollments"))?;
                let ca = tables
                    .cas
                    .get(&ca_id)
                    .ok_or_else(|| ServiceError::validation(format!("ca {} does not exist", ca_id)))?;
                ottca_usable(ca).map_err(ServiceError::validation)?;
                enrollment.ca_id = Some(ca_id);
            }
            EnrollmentMethod::Updb => {
                let username = new
                    .username
                    .filter(|u| !u.trim().is_empty())
                    .ok_or_else(|| ServiceError::validation("username is required for updb enrollments"))?;
                if tables.authenticator_by_username(&username).is_some() {
                    return Err(ServiceError::validation(format!("username {} is in use", username)));
                }
                enrollment.username = Some(username);
            }
            EnrollmentMethod::Ott => {}
        }

        let exists = tables
            .enrollments
            .values()
            .any(|e| e.identity_id == enrollment.identity_id && e.method == method);
        if exists {
            return Err(ServiceError::EnrollmentExists);
        }

        self.sign_ticket(&mut enrollment)?;
        tables
            .enrollments
            .insert(enrollment.id.clone(), enrollment.clone());

        tracing::info!(
            enrollment_id = %enrollment.id,
            identity_id = %enrollment.identity_id,
            method = method.as_str(),
            "Enrollment created"
        );
        Ok(enrollment)
    }

    pub async fn create(&self, new: NewEnrollment) -> Result<Enrollment, ServiceError> {
        let mut tables = self.db.write().await;
        self.create_in(&mut tables, new)
    }

    pub async fn get(&self, id: &str) -> Result<Enrollment, ServiceError> {
        self.db
            .read()
            .await
            .enrollments
            .get(id)
            .cloned()
            .ok_or(ServiceError::NotFound("enrollment"))
    }

    pub async fn list(&self) -> Vec<Enrollment> {
        let mut enrollments: Vec<Enrollment> =
            self.db.read().await.enrollments.values().cloned().collect();
        enrollments.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        enrollments
    }

    pub async fn delete(&self, id: &str) -> Result<(), ServiceError> {
        self.db
            .write()
            .await
            .enrollments
            .remove(id)
            .map(|_| ())
            .ok_or(ServiceError::NotFound("enrollment"))
    }

    /// Moves the expiry and rotates the token. The previous token and JWT
    /// stop working.
    pub async fn refresh(&self, id: &str, expires_at: Option<DateTime<Utc>>) -> Result<Enrollment, ServiceError> {
        let expires_at = expires_at
            .filter(|at| *at > Utc::now())
            .ok_or_else(|| ServiceError::validation("expiresAt must be in the future"))?;

        let mut tables = self.db.write().await;
        let enrollment = tables
            .enrollments
            .get_mut(id)
            .ok_or(ServiceError::NotFound("enrollment"))?;
        enrollment.refresh(expires_at);
        let mut refreshed = enrollment.clone();
        self.sign_ticket(&mut refreshed)?;
        enrollment.jwt = refreshed.jwt.clone();

        tracing::info!(enrollment_id = %id, "Enrollment refreshed");
        Ok(refreshed)
    }

    /// The enrollment token carried by `presented`, which is either the raw
    /// token or an enrollment JWT whose `jti` is the token.
    fn token_of(&self, presented: &str) -> Result<String, ServiceError> {
        let presented = presented.trim();
        if presented.is_empty() {
            return Err(invalid_token("an enrollment token is required"));
        }
        if presented.split('.').count() == 3 {
            let claims = self
                .jwt
                .decode_enrollment_token(presented)
                .map_err(|_| invalid_token("the enrollment JWT is not valid"))?;
            return Ok(claims.jti);
        }
        Ok(presented.to_string())
    }

    fn pending(
        &self,
        tables: &Tables,
        presented: &str,
        method: EnrollmentMethod,
    ) -> Result<Enrollment, ServiceError> {
        let token = self.token_of(presented)?;
        let enrollment = tables
            .enrollment_by_token(&token)
            .filter(|e| e.method == method)
            .ok_or_else(|| invalid_token("the enrollment token is not valid"))?;
        if enrollment.is_expired(Utc::now()) {
            return Err(ServiceError::EnrollmentExpired);
        }
        Ok(enrollment.clone())
    }

    fn sign_csr(&self, csr_pem: Option<&str>) -> Result<IssuedCert, ServiceError> {
        let csr_pem = csr_pem
            .map(str::trim)
            .filter(|c| c.contains("CERTIFICATE REQUEST"))
            .ok_or_else(|| ServiceError::MissingOrInvalidCsr("a PEM certificate signing request is required".into()))?;
        self.certs
            .sign_csr(csr_pem)
            .map_err(|e| ServiceError::CouldNotProcessCsr(e.to_string()))
    }

    fn finish(tables: &mut Tables, enrollment: &Enrollment, authenticator: Authenticator) {
        tables
            .authenticators
            .insert(authenticator.id.clone(), authenticator);
        tables.enrollments.remove(&enrollment.id);
        record_enrollment(enrollment.method.as_str());
        tracing::info!(
            enrollment_id = %enrollment.id,
            identity_id = %enrollment.identity_id,
            method = enrollment.method.as_str(),
            "Enrollment completed"
        );
    }

    /// One-time token: signs the client's CSR with the controller CA.
    pub async fn enroll_ott(&self, token: &str, csr_pem: Option<&str>) -> Result<IssuedCert, ServiceError> {
        let mut tables = self.db.write().await;
        let enrollment = self.pending(&tables, token, EnrollmentMethod::Ott)?;
        let issued = self.sign_csr(csr_pem)?;

        let fingerprint = super::certs::fingerprint(&issued.der);
        ensure_cert_unused(&tables, &fingerprint)?;
        let authenticator =
            Authenticator::cert(enrollment.identity_id.clone(), fingerprint, issued.pem.clone());
        Self::finish(&mut tables, &enrollment, authenticator);
        Ok(issued)
    }

    /// One-time token bound to a CA: the presented certificate must chain to
    /// the enrollment's CA.
    pub async fn enroll_ottca(&self, token: &str, chain: &[Vec<u8>]) -> Result<Authenticator, ServiceError> {
        let mut tables = self.db.write().await;
        let enrollment = self.pending(&tables, token, EnrollmentMethod::Ottca)?;
        let leaf = chain
            .first()
            .ok_or_else(|| ServiceError::CertFailedValidation("a client certificate is required".into()))?;
        let parsed = parse_der(leaf).map_err(|e| ServiceError::CertFailedValidation(e.to_string()))?;

        let ca_id = enrollment.ca_id.as_deref().unwrap_or_default();
        let ca = tables
            .ca(ca_id)
            .map_err(|_| ServiceError::CertFailedValidation("the enrollment CA no longer exists".into()))?;
        ottca_usable(ca).map_err(ServiceError::CertFailedValidation)?;
        if verify_chain(chain, &[ca_anchor(ca)?]).is_none() {
            return Err(ServiceError::CertFailedValidation(
                "the client certificate was not issued by the enrollment CA".into(),
            ));
        }
        ensure_cert_unused(&tables, &parsed.fingerprint)?;

        let authenticator = Authenticator::cert(
            enrollment.identity_id.clone(),
            parsed.fingerprint,
            der_to_pem(leaf),
        );
        Self::finish(&mut tables, &enrollment, authenticator.clone());
        Ok(authenticator)
    }

    /// Username/password: the password must satisfy the identity's policy.
    pub async fn enroll_updb(&self, token: &str, password: &str) -> Result<Authenticator, ServiceError> {
        let mut tables = self.db.write().await;
        let enrollment = self.pending(&tables, token, EnrollmentMethod::Updb)?;
        let identity = tables.identity(&enrollment.identity_id)?;
        let policy = tables.policy_for(identity)?;
        PolicyService::validate_password(password, &policy.primary.updb)
            .map_err(|e| ServiceError::validation(e.to_string()))?;

        let username = enrollment.username.clone().unwrap_or_default();
        if tables.authenticator_by_username(&username).is_some() {
            return Err(ServiceError::validation(format!("username {} is in use", username)));
        }
        let hash = hash_password(&Password::new(password))?;
        let authenticator =
            Authenticator::updb(enrollment.identity_id.clone(), username, hash.into_string());
        Self::finish(&mut tables, &enrollment, authenticator.clone());
        Ok(authenticator)
    }

    /// Creates an identity from a certificate issued by a verified CA with
    /// auto-enrollment enabled.
    pub async fn enroll_ca_auto(
        &self,
        chain: &[Vec<u8>],
        requested_name: Option<&str>,
    ) -> Result<Identity, ServiceError> {
        let leaf = chain
            .first()
            .ok_or_else(|| ServiceError::CertFailedValidation("a client certificate is required".into()))?;
        let parsed = parse_der(leaf).map_err(|e| ServiceError::CertFailedValidation(e.to_string()))?;

        let mut tables = self.db.write().await;
        let candidates: Vec<&CertificateAuthority> = tables
            .cas
            .values()
            .filter(|ca| ca.is_verified && ca.is_auto_ca_enrollment_enabled)
            .collect();
        let anchors = candidates
            .iter()
            .map(|ca| ca_anchor(ca))
            .collect::<Result<Vec<_>, _>>()?;
        let ca = verify_chain(chain, &anchors)
            .and_then(|index| candidates.get(index))
            .map(|ca| (*ca).clone())
            .ok_or_else(|| {
                ServiceError::CertFailedValidation(
                    "the client certificate does not chain to an auto-enrollment CA".into(),
                )
            })?;
        ensure_cert_unused(&tables, &parsed.fingerprint)?;

        let external_id = match &ca.external_id_claim {
            Some(claim) => Some(claim.resolve(&parsed.claims).ok_or_else(|| {
                ServiceError::MissingCertClaim("the certificate lacks the configured external id claim".into())
            })?),
            None => None,
        };

        let mut identity = Identity::new(String::new(), false);
        let base = ca.render_identity_name(&parsed.claims.common_name, requested_name, &identity.id);
        identity.name = unique_identity_name(&tables, &base)?;
        identity.role_attributes = ca.identity_roles.clone();
        identity.external_id = external_id;

        let authenticator =
            Authenticator::cert(identity.id.clone(), parsed.fingerprint, der_to_pem(leaf));
        tables
            .authenticators
            .insert(authenticator.id.clone(), authenticator);
        tables.identities.insert(identity.id.clone(), identity.clone());

        record_enrollment("ca");
        tracing::info!(identity_id = %identity.id, ca_id = %ca.id, "CA auto-enrollment completed");
        Ok(identity)
    }

    /// Exchanges an external JWT for a new identity, with a certificate when
    /// a CSR is supplied.
    pub async fn enroll_token(
        &self,
        token: Option<&str>,
        issuer_id: Option<&str>,
        csr_pem: Option<&str>,
    ) -> Result<TokenEnrollment, ServiceError> {
        let token = token
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| invalid_token("a bearer token is required"))?;

        let mut tables = self.db.write().await;
        let signer = ext_jwt::select_signer(&tables, token, issuer_id)
            .map_err(|e| invalid_token(e.to_string()))?;
        let claims = ext_jwt::verify(signer, token, Utc::now()).map_err(|e| invalid_token(e.to_string()))?;

        let external_id =
            select_string(&claims, &signer.claims_property).map_err(|e| invalid_token(e.to_string()))?;
        let name = match signer.enroll_name_claims_selector.as_deref().filter(|s| !s.is_empty()) {
            Some(selector) => select_string(&claims, selector).map_err(|e| invalid_token(e.to_string()))?,
            None => external_id.clone(),
        };
        let role_attributes = match signer
            .enroll_attribute_claims_selector
            .as_deref()
            .filter(|s| !s.is_empty())
        {
            Some(selector) => {
                select_attributes(&claims, selector).map_err(|e| invalid_token(e.to_string()))?
            }
            None => Vec::new(),
        };

        let to_cert = csr_pem.is_some_and(|c| !c.trim().is_empty());
        if to_cert && !signer.enroll_to_cert_enabled {
            return Err(not_allowed("the signer does not allow enrolling to a certificate"));
        }
        if !to_cert && !signer.enroll_to_token_enabled {
            return Err(not_allowed("the signer does not allow enrolling to a token"));
        }

        let policy_id = signer
            .enroll_auth_policy_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| DEFAULT_AUTH_POLICY_ID.to_string());
        let policy = tables.auth_policy(&policy_id)?;
        let permitted = if to_cert {
            PolicyService::primary_allowed(policy, AuthMethod::Cert, None)
        } else {
            PolicyService::primary_allowed(policy, AuthMethod::ExtJwt, Some(&signer.id))
        };
        if !permitted {
            return Err(not_allowed("the enrollment auth policy does not allow the resulting credential"));
        }

        if tables.identity_by_external_id(&external_id).is_some() {
            return Err(ServiceError::AlreadyEnrolled(
                "an identity already exists for this token's subject".into(),
            ));
        }

        let signer_id = signer.id.clone();
        let cert = if to_cert { Some(self.sign_csr(csr_pem)?) } else { None };

        let mut identity = Identity::new(unique_identity_name(&tables, &name)?, false);
        identity.external_id = Some(external_id);
        identity.role_attributes = role_attributes;
        identity.auth_policy_id = policy_id;

        if let Some(issued) = &cert {
            let authenticator = Authenticator::cert(
                identity.id.clone(),
                super::certs::fingerprint(&issued.der),
                issued.pem.clone(),
            );
            tables
                .authenticators
                .insert(authenticator.id.clone(), authenticator);
        }
        tables.identities.insert(identity.id.clone(), identity.clone());

        record_enrollment(if to_cert { "token-cert" } else { "token" });
        tracing::info!(
            identity_id = %identity.id,
            signer_id = %signer_id,
            to_cert = to_cert,
            "Token enrollment completed"
        );
        Ok(TokenEnrollment { identity, cert })
    }

    /// Flags a certificate authenticator so its holder is told to extend.
    pub async fn request_extend(&self, authenticator_id: &str, roll_keys: bool) -> Result<Authenticator, ServiceError> {
        let mut tables = self.db.write().await;
        let authenticator = tables
            .authenticators
            .get_mut(authenticator_id)
            .ok_or(ServiceError::NotFound("authenticator"))?;
        match &mut authenticator.credential {
            Credential::Cert {
                is_extend_requested,
                is_key_roll_requested,
                extend_requested_at,
                ..
            } => {
                *is_extend_requested = true;
                *is_key_roll_requested = roll_keys;
                *extend_requested_at = Some(Utc::now());
            }
            Credential::Updb { .. } => {
                return Err(ServiceError::validation("only certificate authenticators can be extended"))
            }
        }
        authenticator.updated_at = Utc::now();
        Ok(authenticator.clone())
    }

    /// Issues a replacement certificate held pending until extend-verify.
    pub async fn extend(
        &self,
        identity_id: &str,
        authenticator_id: &str,
        csr_pem: Option<&str>,
    ) -> Result<IssuedCert, ServiceError> {
        let mut tables = self.db.write().await;
        let authenticator = tables
            .authenticators
            .get(authenticator_id)
            .filter(|a| a.identity_id == identity_id)
            .ok_or(ServiceError::NotFound("authenticator"))?;
        let Credential::Cert { pem, .. } = &authenticator.credential else {
            return Err(ServiceError::validation("only certificate authenticators can be extended"));
        };
        let current = pem_to_ders(pem).map_err(|e| ServiceError::Internal(anyhow::anyhow!(e.to_string())))?;
        if !self.certs.issued_by_controller(&current) {
            return Err(ServiceError::validation(
                "certificates issued by third-party CAs cannot be extended",
            ));
        }

        let issued = self.sign_csr(csr_pem)?;
        if let Some(stored) = tables.authenticators.get_mut(authenticator_id) {
            if let Credential::Cert { pending_pem, .. } = &mut stored.credential {
                *pending_pem = Some(issued.pem.clone());
            }
            stored.updated_at = Utc::now();
        }
        tracing::info!(authenticator_id = %authenticator_id, "Certificate extension issued");
        Ok(issued)
    }

    /// Swaps in the pending certificate once the client proves it holds it.
    pub async fn extend_verify(
        &self,
        identity_id: &str,
        authenticator_id: &str,
        client_cert_pem: &str,
    ) -> Result<Authenticator, ServiceError> {
        let presented = pem_to_ders(client_cert_pem)
            .map_err(|e| ServiceError::CertFailedValidation(e.to_string()))?;
        let presented_fp = super::certs::fingerprint(&presented[0]);

        let mut tables = self.db.write().await;
        let authenticator = tables
            .authenticators
            .get_mut(authenticator_id)
            .filter(|a| a.identity_id == identity_id)
            .ok_or(ServiceError::NotFound("authenticator"))?;
        let Credential::Cert {
            fingerprint,
            pem,
            pending_pem,
            is_extend_requested,
            is_key_roll_requested,
            extend_requested_at,
        } = &mut authenticator.credential
        else {
            return Err(ServiceError::validation("only certificate authenticators can be extended"));
        };

        let pending = pending_pem
            .as_deref()
            .ok_or_else(|| ServiceError::validation("no certificate extension is pending"))?;
        let pending_der = pem_to_ders(pending)
            .map_err(|e| ServiceError::Internal(anyhow::anyhow!(e.to_string())))?;
        if super::certs::fingerprint(&pending_der[0]) != presented_fp {
            return Err(ServiceError::CertFailedValidation(
                "the presented certificate is not the pending extension".into(),
            ));
        }

        *pem = pending.to_string();
        *fingerprint = presented_fp;
        *pending_pem = None;
        *is_extend_requested = false;
        *is_key_roll_requested = false;
        *extend_requested_at = None;
        authenticator.updated_at = Utc::now();

        tracing::info!(authenticator_id = %authenticator_id, "Certificate extension verified");
        Ok(authenticator.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JwtConfig;
    use chrono::Duration;
    use rcgen::{CertificateParams, DnType, KeyPair};

    fn service() -> EnrollmentService {
        let jwt = JwtService::new(
            &JwtConfig {
                signing_key_path: None,
                access_token_expiry_minutes: 30,
                id_token_expiry_minutes: 30,
                refresh_token_expiry_hours: 24,
            },
            "https://controller.test",
        )
        .unwrap();
        EnrollmentService::new(Database::new(), jwt, CertService::generate(30).unwrap())
    }

    fn csr(cn: &str) -> String {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name.push(DnType::CommonName, cn);
        params.serialize_request(&key).unwrap().pem().unwrap()
    }

    async fn identity(service: &EnrollmentService) -> String {
        let identity = Identity::new("device", false);
        let id = identity.id.clone();
        service.db.write().await.identities.insert(id.clone(), identity);
        id
    }

    fn ott(identity_id: &str) -> NewEnrollment {
        NewEnrollment {
            identity_id: Some(identity_id.to_string()),
            method: Some(EnrollmentMethod::Ott),
            expires_at: Some(Utc::now() + Duration::hours(1)),
            ..NewEnrollment::default()
        }
    }

    #[tokio::test]
    async fn create_validates_inputs() {
        let service = service();
        let id = identity(&service).await;

        let missing = NewEnrollment { identity_id: None, ..ott(&id) };
        assert!(matches!(service.create(missing).await, Err(ServiceError::Validation(_))));

        let past = NewEnrollment {
            expires_at: Some(Utc::now() - Duration::minutes(1)),
            ..ott(&id)
        };
        assert!(matches!(service.create(past).await, Err(ServiceError::Validation(_))));

        let no_ca = NewEnrollment {
            method: Some(EnrollmentMethod::Ottca),
            ..ott(&id)
        };
        assert!(matches!(service.create(no_ca).await, Err(ServiceError::Validation(_))));

        let no_username = NewEnrollment {
            method: Some(EnrollmentMethod::Updb),
            ..ott(&id)
        };
        assert!(matches!(service.create(no_username).await, Err(ServiceError::Validation(_))));
    }

    #[tokio::test]
    async fn second_enrollment_of_same_method_conflicts() {
        let service = service();
        let id = identity(&service).await;
        service.create(ott(&id)).await.unwrap();
        assert!(matches!(service.create(ott(&id)).await, Err(ServiceError::EnrollmentExists)));
    }

    #[tokio::test]
    async fn ott_token_is_single_use() {
        let service = service();
        let id = identity(&service).await;
        let enrollment = service.create(ott(&id)).await.unwrap();

        let issued = service.enroll_ott(&enrollment.jwt, Some(&csr("device"))).await.unwrap();
        assert!(issued.pem.contains("BEGIN CERTIFICATE"));
        assert!(matches!(
            service.enroll_ott(&enrollment.token, Some(&csr("device"))).await,
            Err(ServiceError::InvalidEnrollmentToken(_))
        ));
    }

    #[tokio::test]
    async fn expired_enrollment_is_rejected() {
        let service = service();
        let id = identity(&service).await;
        let enrollment = service.create(ott(&id)).await.unwrap();
        service
            .db
            .write()
            .await
            .enrollments
            .get_mut(&enrollment.id)
            .unwrap()
            .expires_at = Utc::now() - Duration::seconds(1);

        assert!(matches!(
            service.enroll_ott(&enrollment.token, Some(&csr("device"))).await,
            Err(ServiceError::EnrollmentExpired)
        ));
    }

    #[tokio::test]
    async fn refresh_rotates_the_token() {
        let service = service();
        let id = identity(&service).await;
        let enrollment = service.create(ott(&id)).await.unwrap();
        let refreshed = service
            .refresh(&enrollment.id, Some(Utc::now() + Duration::hours(2)))
            .await
            .unwrap();
        assert_ne!(refreshed.token, enrollment.token);
        assert_ne!(refreshed.jwt, enrollment.jwt);
        assert!(matches!(
            service.enroll_ott(&enrollment.token, Some(&csr("device"))).await,
            Err(ServiceError::InvalidEnrollmentToken(_))
        ));
    }

    #[tokio::test]
    async fn ott_requires_a_csr() {
        let service = service();
        let id = identity(&service).await;
        let enrollment = service.create(ott(&id)).await.unwrap();
        assert!(matches!(
            service.enroll_ott(&enrollment.token, None).await,
            Err(ServiceError::MissingOrInvalidCsr(_))
        ));
    }

    #[test]
    fn colliding_names_get_padded_suffix() {
        let mut tables = Tables::default();
        let taken = Identity::new("corp-laptop", false);
        tables.identities.insert(taken.id.clone(), taken);
        assert_eq!(unique_identity_name(&tables, "corp-laptop").unwrap(), "corp-laptop000001");
        assert_eq!(unique_identity_name(&tables, "corp-phone").unwrap(), "corp-phone");
    }
}
