//! HTTP handlers for the edge client, management and OIDC APIs.

pub mod auth_policies;
pub mod authenticate;
pub mod authenticators;
pub mod cas;
pub mod current;
pub mod enroll;
pub mod enrollments;
pub mod ext_jwt_signers;
pub mod identities;
pub mod metrics;
pub mod mfa;
pub mod oidc;
pub mod services;
pub mod sessions;
pub mod version;

use std::net::SocketAddr;

use axum::{
    extract::ConnectInfo,
    http::{header, HeaderMap, StatusCode},
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use service_core::error::AppError;

/// Caller address for session bookkeeping: the first `x-forwarded-for` hop,
/// else the peer address.
pub(crate) fn request_ip(headers: &HeaderMap, connect: Option<ConnectInfo<SocketAddr>>) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .or_else(|| connect.map(|ConnectInfo(addr)| addr.ip().to_string()))
}

fn content_type(headers: &HeaderMap) -> &str {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

pub(crate) fn is_form(headers: &HeaderMap) -> bool {
    content_type(headers).starts_with("application/x-www-form-urlencoded")
}

pub(crate) fn is_pem(headers: &HeaderMap) -> bool {
    content_type(headers).starts_with(crate::PEM_CONTENT_TYPE)
}

/// Decodes a JSON or form body. An empty body yields the default value.
pub(crate) fn decode_body<T>(headers: &HeaderMap, body: &[u8]) -> Result<T, AppError>
where
    T: DeserializeOwned + Default,
{
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    let parsed = if is_form(headers) {
        serde_urlencoded::from_bytes(body).map_err(|e| e.to_string())
    } else {
        serde_json::from_slice(body).map_err(|e| e.to_string())
    };
    parsed.map_err(|e| {
        AppError::api(
            StatusCode::BAD_REQUEST,
            "COULD_NOT_PARSE_BODY",
            format!("could not parse request body: {}", e),
        )
    })
}

/// JSON merge patch (RFC 7396): objects merge key by key, `null` removes,
/// anything else replaces.
pub(crate) fn merge_json(target: &mut Value, patch: Value) {
    match patch {
        Value::Object(fields) => {
            if !target.is_object() {
                *target = Value::Object(Default::default());
            }
            if let Value::Object(existing) = target {
                for (key, value) in fields {
                    if value.is_null() {
                        existing.remove(&key);
                    } else {
                        merge_json(existing.entry(key).or_insert(Value::Null), value);
                    }
                }
            }
        }
        other => *target = other,
    }
}
