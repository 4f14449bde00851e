//! Verification of JWTs minted by external signers, and the claim selectors
//! used to map them onto identities.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, decode_header, errors::ErrorKind, Algorithm, Validation};
use serde_json::Value;
use thiserror::Error;

use super::certs::{decoding_key_for, KeyFamily};
use super::database::Tables;
use crate::models::ExternalJwtSigner;
use crate::utils::ChallengeError;

/// Header naming the signer explicitly, for issuers shared by several signers.
pub const TOKEN_ISSUER_ID_HEADER: &str = "ziti-token-issuer-id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ExtJwtError {
    #[error("no usable token was presented")]
    Missing,
    #[error("the token failed verification")]
    Invalid,
    #[error("the token is expired")]
    Expired,
}

impl ExtJwtError {
    pub fn challenge_error(self) -> ChallengeError {
        match self {
            ExtJwtError::Missing => ChallengeError::Missing,
            ExtJwtError::Invalid => ChallengeError::Invalid,
            ExtJwtError::Expired => ChallengeError::Expired,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectorError {
    #[error("claim {0} is missing")]
    Missing(String),
    #[error("claim {0} has the wrong type")]
    WrongType(String),
}

/// Decodes the payload without verifying anything. `None` when the token
/// is not three non-empty segments or the payload is not a JSON object.
pub fn peek_claims(token: &str) -> Option<Value> {
    let segments: Vec<&str> = token.split('.').collect();
    if segments.len() != 3 || segments.iter().any(|s| s.is_empty()) {
        return None;
    }
    let payload = URL_SAFE_NO_PAD.decode(segments[1].trim_end_matches('=')).ok()?;
    let claims: Value = serde_json::from_slice(&payload).ok()?;
    claims.is_object().then_some(claims)
}

/// The signer a token is addressed to: the explicit override id when given,
/// otherwise the signer whose issuer equals the token's `iss`.
pub fn select_signer<'a>(
    tables: &'a Tables,
    token: &str,
    override_id: Option<&str>,
) -> Result<&'a ExternalJwtSigner, ExtJwtError> {
    let claims = peek_claims(token).ok_or(ExtJwtError::Missing)?;
    match override_id.filter(|id| !id.is_empty()) {
        Some(id) => tables.signer(id).map_err(|_| ExtJwtError::Invalid),
        None => claims
            .get("iss")
            .and_then(Value::as_str)
            .and_then(|iss| tables.signer_by_issuer(iss))
            .ok_or(ExtJwtError::Invalid),
    }
}

fn alg_family(alg: Algorithm) -> Option<KeyFamily> {
    match alg {
        Algorithm::ES256 | Algorithm::ES384 => Some(KeyFamily::Ec),
        Algorithm::RS256
        | Algorithm::RS384
        | Algorithm::RS512
        | Algorithm::PS256
        | Algorithm::PS384
        | Algorithm::PS512 => Some(KeyFamily::Rsa),
        _ => None,
    }
}

fn audience_matches(claims: &Value, expected: &str) -> bool {
    match claims.get("aud") {
        Some(Value::String(aud)) => aud == expected,
        Some(Value::Array(auds)) => auds.iter().any(|a| a.as_str() == Some(expected)),
        _ => false,
    }
}

/// Verifies `token` against one signer: kid, algorithm family, signature,
/// issuer, audience and expiry. Returns the verified claims.
pub fn verify(
    signer: &ExternalJwtSigner,
    token: &str,
    now: DateTime<Utc>,
) -> Result<Value, ExtJwtError> {
    if peek_claims(token).is_none() {
        return Err(ExtJwtError::Missing);
    }
    let header = decode_header(token).map_err(|_| ExtJwtError::Missing)?;

    if !signer.enabled || signer.not_after.is_some_and(|na| na < now) {
        return Err(ExtJwtError::Invalid);
    }
    if header.kid.as_deref() != Some(signer.kid.as_str()) {
        return Err(ExtJwtError::Invalid);
    }

    let (key, family) = decoding_key_for(&signer.cert_pem).map_err(|e| {
        tracing::warn!(signer_id = %signer.id, error = %e, "Signer certificate unusable");
        ExtJwtError::Invalid
    })?;
    if alg_family(header.alg) != Some(family) {
        return Err(ExtJwtError::Invalid);
    }

    let mut validation = Validation::new(header.alg);
    validation.leeway = 0;
    validation.validate_aud = false;
    validation.set_issuer(&[signer.issuer.as_str()]);

    let claims = decode::<Value>(token, &key, &validation)
        .map_err(|e| match e.kind() {
            ErrorKind::ExpiredSignature => ExtJwtError::Expired,
            _ => ExtJwtError::Invalid,
        })?
        .claims;

    if let Some(expected) = signer.audience.as_deref().filter(|a| !a.is_empty()) {
        if !audience_matches(&claims, expected) {
            return Err(ExtJwtError::Invalid);
        }
    }

    Ok(claims)
}

/// Claim selectors are JSON pointers; a bare name gets a leading `/`.
pub fn to_pointer(selector: &str) -> String {
    if selector.starts_with('/') {
        selector.to_string()
    } else {
        format!("/{}", selector)
    }
}

pub fn select_string(claims: &Value, selector: &str) -> Result<String, SelectorError> {
    let pointer = to_pointer(selector);
    match claims.pointer(&pointer) {
        None | Some(Value::Null) => Err(SelectorError::Missing(pointer)),
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(Value::String(_)) => Err(SelectorError::Missing(pointer)),
        Some(_) => Err(SelectorError::WrongType(pointer)),
    }
}

/// A string yields one attribute (none when empty); an array must hold
/// only strings.
pub fn select_attributes(claims: &Value, selector: &str) -> Result<Vec<String>, SelectorError> {
    let pointer = to_pointer(selector);
    match claims.pointer(&pointer) {
        None | Some(Value::Null) => Err(SelectorError::Missing(pointer)),
        Some(Value::String(s)) if s.is_empty() => Ok(Vec::new()),
        Some(Value::String(s)) => Ok(vec![s.clone()]),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| SelectorError::WrongType(pointer.clone()))
            })
            .collect(),
        Some(_) => Err(SelectorError::WrongType(pointer)),
    }
}
