use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{
    decode, decode_header, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header,
    Validation,
};
use rcgen::KeyPair;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use uuid::Uuid;

use crate::config::JwtConfig;

pub const AUDIENCE: &str = "openziti";
pub const CLIENT_ID: &str = "openziti";
pub const TOKEN_TYPE_ACCESS: &str = "a";
pub const TOKEN_TYPE_REFRESH: &str = "r";
pub const TOKEN_TYPE_TOTP: &str = "totp";

/// Why a controller-issued token was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("token is malformed")]
    Malformed,
    #[error("token is invalid")]
    Invalid,
    #[error("token is expired")]
    Expired,
}

impl From<jsonwebtoken::errors::Error> for TokenError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            ErrorKind::ExpiredSignature => TokenError::Expired,
            ErrorKind::InvalidToken
            | ErrorKind::Base64(_)
            | ErrorKind::Json(_)
            | ErrorKind::Utf8(_) => TokenError::Malformed,
            _ => TokenError::Invalid,
        }
    }
}

/// Claims of access and refresh tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeClaims {
    pub iss: String,
    /// Identity id
    pub sub: String,
    pub aud: Vec<String>,
    pub exp: i64,
    pub iat: i64,
    pub jti: String,
    pub client_id: String,
    /// API session id
    pub z_asid: String,
    /// Token type: `a` or `r`
    pub z_t: String,
    /// Admin at issuance
    pub z_ia: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z_eid: Option<String>,
    #[serde(default)]
    pub z_cfs: Vec<String>,
    /// Certificate extendable
    #[serde(default)]
    pub z_ce: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z_aid: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdClaims {
    pub iss: String,
    pub sub: String,
    pub aud: Vec<String>,
    pub exp: i64,
    pub iat: i64,
    pub auth_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    pub name: String,
    pub z_asid: String,
    pub z_ia: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z_eid: Option<String>,
}

/// Proof that the holder of an API session entered a TOTP code. Carries no
/// `exp`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TotpClaims {
    pub iss: String,
    pub sub: String,
    pub aud: Vec<String>,
    pub iat: i64,
    pub jti: String,
    pub z_asid: String,
    pub z_t: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollmentClaims {
    pub iss: String,
    /// Identity id
    pub sub: String,
    /// Enrollment token
    pub jti: String,
    /// Enrollment method
    pub em: String,
    pub exp: i64,
    pub iat: i64,
}

/// What an API session contributes to its tokens.
#[derive(Debug, Clone)]
pub struct TokenSubject {
    pub identity_id: String,
    pub identity_name: String,
    pub api_session_id: String,
    pub is_admin: bool,
    pub external_id: Option<String>,
    pub cert_fingerprints: Vec<String>,
    pub cert_extendable: bool,
    pub authenticator_id: Option<String>,
    pub auth_time: DateTime<Utc>,
}

/// OAuth token response.
#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
    pub refresh_token: String,
    pub refresh_token_expires_in: i64,
    pub id_token: String,
    pub scope: String,
}

/// Issues and verifies the controller's own ES256 tokens.
#[derive(Clone)]
pub struct JwtService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    kid: String,
    jwk: serde_json::Value,
    issuer: String,
    access_token_expiry_minutes: i64,
    id_token_expiry_minutes: i64,
    refresh_token_expiry_hours: i64,
}

impl JwtService {
    /// Loads the P-256 signing key from `signing_key_path`, or generates one.
    pub fn new(config: &JwtConfig, issuer: &str) -> Result<Self, anyhow::Error> {
        let key = match &config.signing_key_path {
            Some(path) => {
                let pem = fs::read_to_string(path).map_err(|e| {
                    anyhow::anyhow!("Failed to read signing key from {}: {}", path, e)
                })?;
                KeyPair::from_pem(&pem)
                    .map_err(|e| anyhow::anyhow!("Failed to parse signing key: {}", e))?
            }
            None => {
                tracing::warn!("No JWT signing key configured, generating an ephemeral key");
                KeyPair::generate()?
            }
        };

        let encoding_key = EncodingKey::from_ec_pem(key.serialize_pem().as_bytes())
            .map_err(|e| anyhow::anyhow!("Failed to load signing key: {}", e))?;
        let decoding_key = DecodingKey::from_ec_pem(key.public_key_pem().as_bytes())
            .map_err(|e| anyhow::anyhow!("Failed to load verification key: {}", e))?;

        let raw = key.public_key_raw();
        if raw.len() != 65 || raw[0] != 0x04 {
            return Err(anyhow::anyhow!("Signing key must be an uncompressed P-256 key"));
        }
        let kid = hex::encode(Sha256::digest(raw));
        let jwk = serde_json::json!({
            "kty": "EC",
            "crv": "P-256",
            "use": "sig",
            "alg": "ES256",
            "kid": kid,
            "x": URL_SAFE_NO_PAD.encode(&raw[1..33]),
            "y": URL_SAFE_NO_PAD.encode(&raw[33..65]),
        });

        tracing::info!(kid = %kid, "JWT service initialized with ES256 key");

        Ok(Self {
            encoding_key,
            decoding_key,
            kid,
            jwk,
            issuer: issuer.to_string(),
            access_token_expiry_minutes: config.access_token_expiry_minutes,
            id_token_expiry_minutes: config.id_token_expiry_minutes,
            refresh_token_expiry_hours: config.refresh_token_expiry_hours,
        })
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }

    pub fn jwks(&self) -> serde_json::Value {
        serde_json::json!({ "keys": [self.jwk] })
    }

    pub fn access_token_expiry_seconds(&self) -> i64 {
        self.access_token_expiry_minutes * 60
    }

    /// Whether the token's header names this service's key.
    pub fn is_own_token(&self, token: &str) -> bool {
        decode_header(token)
            .ok()
            .and_then(|h| h.kid)
            .is_some_and(|kid| kid == self.kid)
    }

    fn sign<T: Serialize>(&self, claims: &T) -> Result<String, anyhow::Error> {
        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(self.kid.clone());
        encode(&header, claims, &self.encoding_key)
            .map_err(|e| anyhow::anyhow!("Failed to encode token: {}", e))
    }

    fn edge_claims(&self, subject: &TokenSubject, token_type: &str, lifetime: Duration) -> EdgeClaims {
        let now = Utc::now();
        EdgeClaims {
            iss: self.issuer.clone(),
            sub: subject.identity_id.clone(),
            aud: vec![AUDIENCE.to_string()],
            exp: (now + lifetime).timestamp(),
            iat: now.timestamp(),
            jti: Uuid::new_v4().to_string(),
            client_id: CLIENT_ID.to_string(),
            z_asid: subject.api_session_id.clone(),
            z_t: token_type.to_string(),
            z_ia: subject.is_admin,
            z_eid: subject.external_id.clone(),
            z_cfs: subject.cert_fingerprints.clone(),
            z_ce: subject.cert_extendable,
            z_aid: subject.authenticator_id.clone(),
        }
    }

    /// Access, refresh and ID tokens for an OIDC API session.
    pub fn issue_tokens(
        &self,
        subject: &TokenSubject,
        nonce: Option<String>,
    ) -> Result<TokenResponse, anyhow::Error> {
        let access_lifetime = Duration::minutes(self.access_token_expiry_minutes);
        let refresh_lifetime = Duration::hours(self.refresh_token_expiry_hours);

        let access = self.edge_claims(subject, TOKEN_TYPE_ACCESS, access_lifetime);
        let refresh = self.edge_claims(subject, TOKEN_TYPE_REFRESH, refresh_lifetime);

        let now = Utc::now();
        let id = IdClaims {
            iss: self.issuer.clone(),
            sub: subject.identity_id.clone(),
            aud: vec![AUDIENCE.to_string()],
            exp: (now + Duration::minutes(self.id_token_expiry_minutes)).timestamp(),
            iat: now.timestamp(),
            auth_time: subject.auth_time.timestamp(),
            nonce,
            name: subject.identity_name.clone(),
            z_asid: subject.api_session_id.clone(),
            z_ia: subject.is_admin,
            z_eid: subject.external_id.clone(),
        };

        Ok(TokenResponse {
            access_token: self.sign(&access)?,
            token_type: "Bearer".to_string(),
            expires_in: access_lifetime.num_seconds(),
            refresh_token: self.sign(&refresh)?,
            refresh_token_expires_in: refresh_lifetime.num_seconds(),
            id_token: self.sign(&id)?,
            scope: "openid offline_access".to_string(),
        })
    }

    pub fn issue_totp_token(
        &self,
        identity_id: &str,
        api_session_id: &str,
    ) -> Result<String, anyhow::Error> {
        self.sign(&TotpClaims {
            iss: self.issuer.clone(),
            sub: identity_id.to_string(),
            aud: vec![AUDIENCE.to_string()],
            iat: Utc::now().timestamp(),
            jti: Uuid::new_v4().to_string(),
            z_asid: api_session_id.to_string(),
            z_t: TOKEN_TYPE_TOTP.to_string(),
        })
    }

    pub fn issue_enrollment_token(
        &self,
        identity_id: &str,
        token: &str,
        method: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<String, anyhow::Error> {
        self.sign(&EnrollmentClaims {
            iss: self.issuer.clone(),
            sub: identity_id.to_string(),
            jti: token.to_string(),
            em: method.to_string(),
            exp: expires_at.timestamp(),
            iat: Utc::now().timestamp(),
        })
    }

    fn validation(&self) -> Validation {
        let mut validation = Validation::new(Algorithm::ES256);
        validation.leeway = 0;
        validation.set_issuer(&[self.issuer.as_str()]);
        validation.set_audience(&[AUDIENCE]);
        validation
    }

    fn verify<T: DeserializeOwned>(&self, token: &str, validation: &Validation) -> Result<T, TokenError> {
        let header = decode_header(token)?;
        if header.kid.as_deref() != Some(self.kid.as_str()) {
            return Err(TokenError::Invalid);
        }
        Ok(decode::<T>(token, &self.decoding_key, validation)?.claims)
    }

    /// Verifies an access (`a`) or refresh (`r`) token.
    pub fn validate_edge_token(&self, token: &str, token_type: &str) -> Result<EdgeClaims, TokenError> {
        let claims: EdgeClaims = self.verify(token, &self.validation())?;
        if claims.z_t != token_type {
            return Err(TokenError::Invalid);
        }
        Ok(claims)
    }

    pub fn validate_totp_token(&self, token: &str) -> Result<TotpClaims, TokenError> {
        let mut validation = self.validation();
        validation.validate_exp = false;
        validation.required_spec_claims.clear();
        let claims: TotpClaims = self.verify(token, &validation)?;
        if claims.z_t != TOKEN_TYPE_TOTP {
            return Err(TokenError::Invalid);
        }
        Ok(claims)
    }

    /// Verifies an enrollment JWT's signature and issuer. Expiry is left to
    /// the enrollment record, which is authoritative.
    pub fn decode_enrollment_token(&self, token: &str) -> Result<EnrollmentClaims, TokenError> {
        let mut validation = Validation::new(Algorithm::ES256);
        validation.leeway = 0;
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();
        validation.set_issuer(&[self.issuer.as_str()]);
        self.verify(token, &validation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> JwtConfig {
        JwtConfig {
            signing_key_path: None,
            access_token_expiry_minutes: 30,
            id_token_expiry_minutes: 30,
            refresh_token_expiry_hours: 24,
        }
    }

    fn subject() -> TokenSubject {
        TokenSubject {
            identity_id: "identity-1".into(),
            identity_name: "alice".into(),
            api_session_id: "session-1".into(),
            is_admin: true,
            external_id: Some("ext-1".into()),
            cert_fingerprints: vec!["abc".into()],
            cert_extendable: true,
            authenticator_id: Some("auth-1".into()),
            auth_time: Utc::now(),
        }
    }

    #[test]
    fn issued_tokens_carry_session_claims() {
        let jwt = JwtService::new(&config(), "https://ctrl.test").unwrap();
        let tokens = jwt.issue_tokens(&subject(), Some("n".into())).unwrap();

        let access = jwt.validate_edge_token(&tokens.access_token, TOKEN_TYPE_ACCESS).unwrap();
        assert_eq!(access.z_asid, "session-1");
        assert!(access.z_ia && access.z_ce);
        assert_eq!(access.z_eid.as_deref(), Some("ext-1"));
        assert_eq!(access.z_aid.as_deref(), Some("auth-1"));
        assert_eq!(access.aud, vec![AUDIENCE.to_string()]);
        assert_eq!(access.exp - access.iat, 30 * 60);

        let refresh = jwt.validate_edge_token(&tokens.refresh_token, TOKEN_TYPE_REFRESH).unwrap();
        assert_eq!(refresh.exp - refresh.iat, 24 * 3600);
        assert!(jwt.is_own_token(&tokens.id_token));
    }

    #[test]
    fn token_type_must_match() {
        let jwt = JwtService::new(&config(), "https://ctrl.test").unwrap();
        let tokens = jwt.issue_tokens(&subject(), None).unwrap();
        assert_eq!(
            jwt.validate_edge_token(&tokens.refresh_token, TOKEN_TYPE_ACCESS).unwrap_err(),
            TokenError::Invalid
        );
    }

    #[test]
    fn expired_access_token_is_classified() {
        let jwt = JwtService::new(&config(), "https://ctrl.test").unwrap();
        let mut claims = jwt.edge_claims(&subject(), TOKEN_TYPE_ACCESS, Duration::minutes(1));
        claims.exp = Utc::now().timestamp() - 10;
        let token = jwt.sign(&claims).unwrap();
        assert_eq!(
            jwt.validate_edge_token(&token, TOKEN_TYPE_ACCESS).unwrap_err(),
            TokenError::Expired
        );
    }

    #[test]
    fn foreign_key_is_invalid_and_garbage_is_malformed() {
        let jwt = JwtService::new(&config(), "https://ctrl.test").unwrap();
        let other = JwtService::new(&config(), "https://ctrl.test").unwrap();
        let tokens = other.issue_tokens(&subject(), None).unwrap();
        assert_eq!(
            jwt.validate_edge_token(&tokens.access_token, TOKEN_TYPE_ACCESS).unwrap_err(),
            TokenError::Invalid
        );
        assert_eq!(
            jwt.validate_edge_token("not-a-jwt", TOKEN_TYPE_ACCESS).unwrap_err(),
            TokenError::Malformed
        );
    }

    #[test]
    fn totp_token_has_no_expiry() {
        let jwt = JwtService::new(&config(), "https://ctrl.test").unwrap();
        let token = jwt.issue_totp_token("identity-1", "session-1").unwrap();

        let payload = token.split('.').nth(1).unwrap();
        let raw: serde_json::Value =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(payload).unwrap()).unwrap();
        assert!(raw.get("exp").is_none());

        let claims = jwt.validate_totp_token(&token).unwrap();
        assert_eq!(claims.z_asid, "session-1");
    }

    #[test]
    fn enrollment_token_round_trip() {
        let jwt = JwtService::new(&config(), "https://ctrl.test").unwrap();
        let expires = Utc::now() + Duration::hours(1);
        let token = jwt.issue_enrollment_token("identity-1", "tok", "ott", expires).unwrap();
        let claims = jwt.decode_enrollment_token(&token).unwrap();
        assert_eq!(claims.jti, "tok");
        assert_eq!(claims.sub, "identity-1");
        assert_eq!(claims.iss, "https://ctrl.test");
        assert_eq!(claims.em, "ott");
    }

    #[test]
    fn jwks_exposes_ec_key() {
        let jwt = JwtService::new(&config(), "https://ctrl.test").unwrap();
        let jwks = jwt.jwks();
        assert_eq!(jwks["keys"][0]["kty"], "EC");
        assert_eq!(jwks["keys"][0]["kid"], jwt.kid());
    }
}
