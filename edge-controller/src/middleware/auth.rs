//! Session resolution and access guards.
//!
//! `resolve_auth_middleware` runs on every API request and records what the
//! presented credentials amount to without rejecting anything, so anonymous
//! routes never challenge. The `require_*` guards sit on protected routers
//! and turn an unusable [`RequestAuth`] into a 401 carrying the matching
//! `WWW-Authenticate` challenges.

use axum::{
    extract::{FromRequestParts, Request, State},
    http::{header, request::Parts, HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};
use service_core::error::{ApiError, AppError};

use crate::{
    models::{ApiSession, SessionKind},
    services::{TokenError, TOKEN_TYPE_ACCESS},
    utils::{Challenge, ChallengeError},
    AppState,
};

pub const ZT_SESSION_HEADER: &str = "zt-session";

/// The credentials a request carried and what they resolved to.
#[derive(Debug, Clone)]
pub struct RequestAuth {
    pub session: Option<ApiSession>,
    /// Challenges to answer with if the route needs a session.
    pub challenges: Vec<Challenge>,
    /// Bearer token offered alongside a `zt-session`, for a secondary
    /// ext-jwt requirement.
    pub secondary_bearer: Option<String>,
}

impl RequestAuth {
    fn anonymous() -> Self {
        Self::failed(vec![
            Challenge::bearer(ChallengeError::Missing),
            Challenge::zt_session(ChallengeError::Missing),
        ])
    }

    fn failed(challenges: Vec<Challenge>) -> Self {
        Self {
            session: None,
            challenges,
            secondary_bearer: None,
        }
    }

    fn authenticated(session: ApiSession, secondary_bearer: Option<String>) -> Self {
        Self {
            session: Some(session),
            challenges: Vec::new(),
            secondary_bearer,
        }
    }
}

/// The `Authorization: Bearer` token, if any.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

fn resolve(state: &AppState, headers: &HeaderMap) -> RequestAuth {
    let bearer = bearer_token(headers).map(str::to_string);
    let zt_session = headers
        .get(ZT_SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty());

    if let Some(token) = zt_session {
        return match state.auth.touch_legacy_session(token) {
            Some(session) => RequestAuth::authenticated(session, bearer),
            None => RequestAuth::failed(vec![Challenge::zt_session(ChallengeError::Invalid)]),
        };
    }

    let Some(bearer) = bearer else {
        return RequestAuth::anonymous();
    };
    if !state.jwt.is_own_token(&bearer) {
        return RequestAuth::failed(vec![Challenge::bearer(ChallengeError::Invalid)]);
    }

    match state.jwt.validate_edge_token(&bearer, TOKEN_TYPE_ACCESS) {
        Ok(claims) => match state.auth.oidc_session(&claims.z_asid) {
            Some(session) => RequestAuth::authenticated(session, None),
            None => RequestAuth::failed(vec![Challenge::bearer(ChallengeError::Invalid)]),
        },
        Err(TokenError::Expired) => {
            RequestAuth::failed(vec![Challenge::bearer(ChallengeError::Expired)])
        }
        Err(_) => RequestAuth::failed(vec![Challenge::bearer(ChallengeError::Invalid)]),
    }
}

pub async fn resolve_auth_middleware(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let auth = resolve(&state, req.headers());
    req.extensions_mut().insert(auth);
    next.run(req).await
}

fn unauthorized(message: &str, challenges: &[Challenge]) -> AppError {
    AppError::Challenge(
        ApiError::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message),
        challenges.iter().map(Challenge::to_header_value).collect(),
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    /// Any session, including one with outstanding auth queries.
    Partial,
    Full,
    Admin,
}

async fn authorize(state: &AppState, mut req: Request, next: Next, access: Access) -> Result<Response, AppError> {
    let auth = req
        .extensions()
        .get::<RequestAuth>()
        .cloned()
        .unwrap_or_else(RequestAuth::anonymous);
    let session = auth
        .session
        .ok_or_else(|| unauthorized("a valid session is required", &auth.challenges))?;

    if access != Access::Partial {
        if session.kind == SessionKind::Legacy {
            let (_, secondary) = state
                .auth
                .evaluate_session(&session, auth.secondary_bearer.as_deref())
                .await?;
            if let Some(challenge) = secondary.challenge() {
                return Err(unauthorized("a secondary token is required", &[challenge]));
            }
        }
        if session.totp_pending {
            return Err(unauthorized("MFA is required", &[]));
        }
        if access == Access::Admin && !session.is_admin {
            return Err(unauthorized("administrator access is required", &[]));
        }
    }

    req.extensions_mut().insert(Principal(session));
    Ok(next.run(req).await)
}

pub async fn require_partial_session(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    authorize(&state, req, next, Access::Partial).await
}

pub async fn require_full_session(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    authorize(&state, req, next, Access::Full).await
}

pub async fn require_admin(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    authorize(&state, req, next, Access::Admin).await
}

/// The API session a guard admitted.
#[derive(Debug, Clone)]
pub struct Principal(pub ApiSession);

#[axum::async_trait]
impl<S> FromRequestParts<S> for Principal
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts.extensions.get::<Principal>().cloned().ok_or_else(|| {
            AppError::InternalError(anyhow::anyhow!("Principal missing from request extensions"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn bearer_scheme_is_case_insensitive() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("bearer abc.def.ghi"));
        assert_eq!(bearer_token(&headers), Some("abc.def.ghi"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic dXNlcg=="));
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(bearer_token(&headers), None);
    }
}
