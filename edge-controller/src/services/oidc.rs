//! State of in-flight OIDC logins: pending auth requests and one-time
//! authorization codes, plus PKCE verification.

use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use uuid::Uuid;

pub const PKCE_METHOD_S256: &str = "S256";
const AUTH_REQUEST_TTL_MINUTES: i64 = 10;
const AUTH_CODE_TTL_SECONDS: i64 = 60;

/// An authorization request between `/oidc/authorize` and the callback.
#[derive(Debug, Clone)]
pub struct AuthRequest {
    pub id: String,
    pub redirect_uri: String,
    pub state: Option<String>,
    pub code_challenge: String,
    pub nonce: Option<String>,
    /// Set once a login has produced an API session.
    pub api_session_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct AuthCode {
    pub api_session_id: String,
    pub redirect_uri: String,
    pub code_challenge: String,
    pub nonce: Option<String>,
    pub expires_at: DateTime<Utc>,
}

/// `BASE64URL(SHA256(verifier)) == challenge`, compared in constant time.
pub fn verify_pkce(verifier: &str, challenge: &str) -> bool {
    let computed = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
    computed.len() == challenge.len() && bool::from(computed.as_bytes().ct_eq(challenge.as_bytes()))
}

fn random_code() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[derive(Clone, Default)]
pub struct OidcStore {
    requests: Arc<DashMap<String, AuthRequest>>,
    codes: Arc<DashMap<String, AuthCode>>,
}

impl OidcStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_request(
        &self,
        redirect_uri: String,
        state: Option<String>,
        code_challenge: String,
        nonce: Option<String>,
    ) -> AuthRequest {
        self.prune();
        let request = AuthRequest {
            id: Uuid::new_v4().to_string(),
            redirect_uri,
            state,
            code_challenge,
            nonce,
            api_session_id: None,
            created_at: Utc::now(),
        };
        self.requests.insert(request.id.clone(), request.clone());
        request
    }

    pub fn request(&self, id: &str) -> Option<AuthRequest> {
        let request = self.requests.get(id)?.value().clone();
        let expired = Utc::now() - request.created_at > Duration::minutes(AUTH_REQUEST_TTL_MINUTES);
        if expired {
            self.requests.remove(id);
            return None;
        }
        Some(request)
    }

    pub fn bind_session(&self, id: &str, api_session_id: &str) -> Option<AuthRequest> {
        let mut entry = self.requests.get_mut(id)?;
        entry.value_mut().api_session_id = Some(api_session_id.to_string());
        Some(entry.value().clone())
    }

    /// Trades a completed request for a one-time authorization code.
    pub fn issue_code(&self, id: &str) -> Option<(String, AuthRequest)> {
        let (_, request) = self.requests.remove(id)?;
        let api_session_id = request.api_session_id.clone()?;
        let code = random_code();
        self.codes.insert(
            code.clone(),
            AuthCode {
                api_session_id,
                redirect_uri: request.redirect_uri.clone(),
                code_challenge: request.code_challenge.clone(),
                nonce: request.nonce.clone(),
                expires_at: Utc::now() + Duration::seconds(AUTH_CODE_TTL_SECONDS),
            },
        );
        Some((code, request))
    }

    /// Removes and returns a code. Expired codes are dropped.
    pub fn redeem_code(&self, code: &str) -> Option<AuthCode> {
        let (_, auth_code) = self.codes.remove(code)?;
        (auth_code.expires_at > Utc::now()).then_some(auth_code)
    }

    fn prune(&self) {
        let now = Utc::now();
        self.requests
            .retain(|_, r| now - r.created_at <= Duration::minutes(AUTH_REQUEST_TTL_MINUTES));
        self.codes.retain(|_, c| c.expires_at > now);
    }
}
