//! OIDC authorization-code login with PKCE.
//!
//! `/oidc/authorize` opens an auth request and sends the user agent to a
//! login endpoint. Each login endpoint authenticates one primary credential
//! into an OIDC API session bound to the request; outstanding TOTP is
//! answered at `/oidc/login/totp`. Once nothing is owed the callback trades
//! the request for a one-time code, which `/oidc/oauth/token` redeems for
//! the access, refresh and ID tokens.

use std::net::SocketAddr;

use axum::{
    body::Bytes,
    extract::{ConnectInfo, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use service_core::error::{ApiError, AppError};
use utoipa::{IntoParams, ToSchema};

use super::{authenticate::primary_credential, decode_body, request_ip};
use crate::{
    dtos,
    middleware::{bearer_token, ClientCert},
    models::{ApiSession, AuthMethod, SessionKind},
    services::{
        oidc::{verify_pkce, AuthRequest, PKCE_METHOD_S256},
        policy::AUTH_QUERY_TYPE_EXT_JWT,
        AuthQuery, MfaProof, ServiceError, TokenError, CLIENT_ID, TOKEN_TYPE_REFRESH,
    },
    AppState,
};

pub const AUTH_REQUEST_ID_HEADER: &str = "auth-request-id";

/// An OAuth 2.0 error response (RFC 6749 §5.2).
#[derive(Debug)]
pub struct OAuthError {
    status: StatusCode,
    error: &'static str,
    description: String,
}

impl OAuthError {
    fn new(error: &'static str, description: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error,
            description: description.into(),
        }
    }

    fn invalid_request(description: impl Into<String>) -> Self {
        Self::new("invalid_request", description)
    }

    fn invalid_grant(description: impl Into<String>) -> Self {
        Self::new("invalid_grant", description)
    }

    fn server_error(description: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            ..Self::new("server_error", description)
        }
    }
}

impl IntoResponse for OAuthError {
    fn into_response(self) -> Response {
        (
            self.status,
            [(header::CACHE_CONTROL, "no-store")],
            Json(json!({
                "error": self.error,
                "error_description": self.description,
            })),
        )
            .into_response()
    }
}

fn found(location: &str) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location.to_string())]).into_response()
}

/// Matches a redirect URI against the configured list. `*` matches any run
/// of characters within one path segment or port.
pub(crate) fn redirect_uri_allowed(allowed: &[String], uri: &str) -> bool {
    fn matches(pattern: &str, value: &str) -> bool {
        match pattern.split_once('*') {
            None => pattern == value,
            Some((prefix, rest)) => {
                let Some(tail) = value.strip_prefix(prefix) else {
                    return false;
                };
                (0..=tail.len())
                    .take_while(|&i| !tail[..i].contains('/'))
                    .filter(|&i| tail.is_char_boundary(i))
                    .any(|i| matches(rest, &tail[i..]))
            }
        }
    }
    allowed.iter().any(|pattern| matches(pattern, uri))
}

// ============================================================================
// Authorize
// ============================================================================

#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct AuthorizeQuery {
    pub client_id: Option<String>,
    pub redirect_uri: Option<String>,
    pub response_type: Option<String>,
    pub scope: Option<String>,
    pub state: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    pub nonce: Option<String>,
}

/// Start an authorization-code login
#[utoipa::path(
    get,
    path = "/oidc/authorize",
    params(AuthorizeQuery),
    responses(
        (status = 302, description = "Redirect to the login endpoint"),
        (status = 400, description = "Invalid authorization request")
    ),
    tag = "OIDC"
)]
pub async fn authorize(
    State(state): State<AppState>,
    Query(query): Query<AuthorizeQuery>,
) -> Result<Response, OAuthError> {
    if query.client_id.as_deref() != Some(CLIENT_ID) {
        return Err(OAuthError::new("invalid_client", "unknown client_id"));
    }
    let redirect_uri = query
        .redirect_uri
        .filter(|uri| redirect_uri_allowed(&state.config.oidc.redirect_uris, uri))
        .ok_or_else(|| OAuthError::invalid_request("redirect_uri is not registered"))?;
    if query.response_type.as_deref() != Some("code") {
        return Err(OAuthError::new("unsupported_response_type", "only response_type=code is supported"));
    }
    let code_challenge = query
        .code_challenge
        .filter(|c| !c.is_empty())
        .ok_or_else(|| OAuthError::invalid_request("code_challenge is required"))?;
    if query.code_challenge_method.as_deref() != Some(PKCE_METHOD_S256) {
        return Err(OAuthError::invalid_request("code_challenge_method must be S256"));
    }

    let request = state
        .oidc
        .create_request(redirect_uri, query.state, code_challenge, query.nonce);
    tracing::debug!(auth_request_id = %request.id, "OIDC auth request created");
    Ok(found(&format!("/oidc/login/username?authRequestID={}", request.id)))
}

// ============================================================================
// Login
// ============================================================================

#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct LoginQuery {
    #[serde(rename = "authRequestID")]
    pub auth_request_id: Option<String>,
    pub id: Option<String>,
}

/// Fields of a login body that identify the auth request.
#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct LoginBody {
    pub id: Option<String>,
    #[serde(rename = "authRequestID")]
    pub auth_request_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub code: Option<String>,
}

fn auth_request_id(headers: &HeaderMap, query: LoginQuery, body: &LoginBody) -> Result<String, AppError> {
    headers
        .get(AUTH_REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or(query.auth_request_id)
        .or(query.id)
        .or_else(|| body.id.clone())
        .or_else(|| body.auth_request_id.clone())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ServiceError::validation("an auth request id is required").into())
}

fn pending_request(state: &AppState, id: &str) -> Result<AuthRequest, AppError> {
    state
        .oidc
        .request(id)
        .ok_or_else(|| ServiceError::NotFound("auth request").into())
}

/// The API session a login bound to the request.
fn bound_session(state: &AppState, request: &AuthRequest) -> Result<ApiSession, AppError> {
    request
        .api_session_id
        .as_deref()
        .and_then(|id| state.db.api_session(id))
        .ok_or_else(|| ServiceError::invalid_auth("no login is in progress for this auth request").into())
}

/// Queries an OIDC login still owes. The secondary ext-jwt is settled at
/// login time, so only TOTP can remain.
async fn login_queries(state: &AppState, session: &ApiSession) -> Result<Vec<AuthQuery>, AppError> {
    let (mut queries, _) = state.auth.evaluate_session(session, None).await?;
    queries.retain(|q| q.type_id != AUTH_QUERY_TYPE_EXT_JWT);
    Ok(queries)
}

fn login_result(request_id: &str, queries: Vec<AuthQuery>) -> Response {
    if queries.is_empty() {
        found(&format!("/oidc/authorize/callback?id={}", request_id))
    } else {
        (StatusCode::OK, Json(json!({ "authQueries": queries }))).into_response()
    }
}

async fn login(
    state: AppState,
    method: AuthMethod,
    query: LoginQuery,
    chain: Option<Vec<Vec<u8>>>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let form: LoginBody = decode_body(&headers, &body)?;
    let request_id = auth_request_id(&headers, query, &form)?;
    let request = pending_request(&state, &request_id)?;

    let credential = primary_credential(method, &headers, chain, &body)?;
    let outcome = state
        .auth
        .authenticate(
            credential,
            SessionKind::Oidc,
            bearer_token(&headers),
            request_ip(&headers, connect),
        )
        .await?;

    if let Some(challenge) = outcome.secondary.challenge() {
        state.auth.logout(&outcome.session.id);
        return Err(AppError::Challenge(
            ApiError::new(
                StatusCode::UNAUTHORIZED,
                "INVALID_AUTH",
                "a token from the required secondary signer is needed",
            ),
            vec![challenge.to_header_value()],
        ));
    }

    if let Some(previous) = request.api_session_id.as_deref() {
        state.auth.logout(previous);
    }
    state.oidc.bind_session(&request_id, &outcome.session.id);

    let queries = login_queries(&state, &outcome.session).await?;
    Ok(login_result(&request_id, queries))
}

/// Log in with username and password
#[utoipa::path(
    post,
    path = "/oidc/login/password",
    params(LoginQuery),
    request_body = LoginBody,
    responses(
        (status = 302, description = "Login complete; continue at the callback"),
        (status = 200, description = "Auth queries outstanding"),
        (status = 401, description = "Credential rejected", body = ErrorResponse)
    ),
    tag = "OIDC"
)]
pub async fn login_password(
    State(state): State<AppState>,
    Query(query): Query<LoginQuery>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    login(state, AuthMethod::Updb, query, None, connect, headers, body).await
}

/// Log in with the forwarded client certificate
#[utoipa::path(
    post,
    path = "/oidc/login/cert",
    params(LoginQuery),
    responses(
        (status = 302, description = "Login complete; continue at the callback"),
        (status = 200, description = "Auth queries outstanding"),
        (status = 401, description = "Credential rejected", body = ErrorResponse)
    ),
    tag = "OIDC"
)]
pub async fn login_cert(
    State(state): State<AppState>,
    Query(query): Query<LoginQuery>,
    ClientCert(chain): ClientCert,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    login(state, AuthMethod::Cert, query, chain, connect, headers, body).await
}

/// Log in with an external JWT bearer token
#[utoipa::path(
    post,
    path = "/oidc/login/ext-jwt",
    params(LoginQuery),
    responses(
        (status = 302, description = "Login complete; continue at the callback"),
        (status = 200, description = "Auth queries outstanding"),
        (status = 401, description = "Token rejected", body = ErrorResponse)
    ),
    tag = "OIDC"
)]
pub async fn login_ext_jwt(
    State(state): State<AppState>,
    Query(query): Query<LoginQuery>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    login(state, AuthMethod::ExtJwt, query, None, connect, headers, body).await
}

async fn request_and_session(
    state: &AppState,
    headers: &HeaderMap,
    query: LoginQuery,
    body: &LoginBody,
) -> Result<(String, ApiSession), AppError> {
    let request_id = auth_request_id(headers, query, body)?;
    let request = pending_request(state, &request_id)?;
    let session = bound_session(state, &request)?;
    Ok((request_id, session))
}

/// Answer the TOTP query of an OIDC login
#[utoipa::path(
    post,
    path = "/oidc/login/totp",
    params(LoginQuery),
    request_body = LoginBody,
    responses(
        (status = 302, description = "Login complete; continue at the callback"),
        (status = 400, description = "Invalid code", body = ErrorResponse)
    ),
    tag = "OIDC"
)]
pub async fn login_totp(
    State(state): State<AppState>,
    Query(query): Query<LoginQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let form: LoginBody = decode_body(&headers, &body)?;
    let (request_id, session) = request_and_session(&state, &headers, query, &form).await?;
    state
        .mfa
        .check(&session.identity_id, form.code.as_deref().unwrap_or_default())
        .await?;
    let session = state.auth.complete_totp(&session.id).unwrap_or(session);
    Ok(login_result(&request_id, login_queries(&state, &session).await?))
}

/// Start TOTP enrollment during an OIDC login
#[utoipa::path(
    post,
    path = "/oidc/login/totp/enroll",
    params(LoginQuery),
    responses(
        (status = 201, description = "Enrollment created"),
        (status = 409, description = "MFA already exists", body = ErrorResponse)
    ),
    tag = "OIDC"
)]
pub async fn login_totp_enroll(
    State(state): State<AppState>,
    Query(query): Query<LoginQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let form: LoginBody = decode_body(&headers, &body)?;
    let (_, session) = request_and_session(&state, &headers, query, &form).await?;
    let mfa = state.mfa.create(&session.identity_id).await?;
    let name = state.db.read().await.identity(&session.identity_id)?.name.clone();
    let provisioning_url = state.mfa.provisioning_url(&mfa, &name)?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "provisioningUrl": provisioning_url,
            "recoveryCodes": mfa.recovery_codes,
        })),
    )
        .into_response())
}

/// Verify TOTP enrollment during an OIDC login
#[utoipa::path(
    post,
    path = "/oidc/login/totp/enroll/verify",
    params(LoginQuery),
    request_body = LoginBody,
    responses(
        (status = 302, description = "Login complete; continue at the callback"),
        (status = 400, description = "Invalid code", body = ErrorResponse)
    ),
    tag = "OIDC"
)]
pub async fn login_totp_enroll_verify(
    State(state): State<AppState>,
    Query(query): Query<LoginQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let form: LoginBody = decode_body(&headers, &body)?;
    let (request_id, session) = request_and_session(&state, &headers, query, &form).await?;
    state
        .mfa
        .verify(&session.identity_id, form.code.as_deref().unwrap_or_default())
        .await?;
    let session = state.auth.complete_totp(&session.id).unwrap_or(session);
    Ok(login_result(&request_id, login_queries(&state, &session).await?))
}

/// Abandon an unverified TOTP enrollment during an OIDC login
#[utoipa::path(
    delete,
    path = "/oidc/login/totp/enroll",
    params(LoginQuery),
    responses(
        (status = 200, description = "Enrollment removed"),
        (status = 404, description = "MFA not enrolled", body = ErrorResponse)
    ),
    tag = "OIDC"
)]
pub async fn login_totp_enroll_delete(
    State(state): State<AppState>,
    Query(query): Query<LoginQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let form: LoginBody = decode_body(&headers, &body)?;
    let (_, session) = request_and_session(&state, &headers, query, &form).await?;
    state
        .mfa
        .delete(&session.identity_id, MfaProof::Code(form.code.as_deref().unwrap_or_default()))
        .await?;
    Ok(dtos::empty().into_response())
}

/// List what the login in progress still owes
#[utoipa::path(
    get,
    path = "/oidc/login/auth-queries",
    params(LoginQuery),
    responses(
        (status = 200, description = "Outstanding auth queries"),
        (status = 404, description = "Unknown auth request", body = ErrorResponse)
    ),
    tag = "OIDC"
)]
pub async fn login_auth_queries(
    State(state): State<AppState>,
    Query(query): Query<LoginQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let (_, session) = request_and_session(&state, &headers, query, &LoginBody::default()).await?;
    let queries = login_queries(&state, &session).await?;
    Ok(Json(json!({ "authQueries": queries })).into_response())
}

// ============================================================================
// Callback and token
// ============================================================================

#[derive(Debug, Deserialize, IntoParams)]
pub struct CallbackQuery {
    pub id: String,
}

/// Trade a completed login for an authorization code
#[utoipa::path(
    get,
    path = "/oidc/authorize/callback",
    params(CallbackQuery),
    responses(
        (status = 302, description = "Redirect to the client with code and state"),
        (status = 400, description = "Login incomplete")
    ),
    tag = "OIDC"
)]
pub async fn callback(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
) -> Result<Response, OAuthError> {
    let request = state
        .oidc
        .request(&query.id)
        .ok_or_else(|| OAuthError::invalid_request("unknown or expired auth request"))?;
    let session = request
        .api_session_id
        .as_deref()
        .and_then(|id| state.db.api_session(id))
        .ok_or_else(|| OAuthError::new("access_denied", "the login has not completed"))?;
    if session.totp_pending {
        return Err(OAuthError::new("access_denied", "MFA has not been completed"));
    }

    let (code, request) = state
        .oidc
        .issue_code(&query.id)
        .ok_or_else(|| OAuthError::new("access_denied", "the login has not completed"))?;

    let separator = if request.redirect_uri.contains('?') { '&' } else { '?' };
    let mut location = format!(
        "{}{}code={}",
        request.redirect_uri,
        separator,
        urlencoding::encode(&code)
    );
    if let Some(client_state) = request.state.as_deref() {
        location.push_str(&format!("&state={}", urlencoding::encode(client_state)));
    }
    Ok(found(&location))
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct TokenRequest {
    pub grant_type: String,
    pub code: Option<String>,
    pub redirect_uri: Option<String>,
    pub code_verifier: Option<String>,
    pub client_id: Option<String>,
    pub refresh_token: Option<String>,
}

async fn issue_for(state: &AppState, session: &ApiSession, nonce: Option<String>) -> Result<Response, OAuthError> {
    let subject = state
        .auth
        .token_subject(session)
        .await
        .map_err(|_| OAuthError::invalid_grant("the session's identity no longer exists"))?;
    let tokens = state.jwt.issue_tokens(&subject, nonce).map_err(|e| {
        tracing::error!(error = %e, "Failed to sign OIDC tokens");
        OAuthError::server_error("could not issue tokens")
    })?;
    Ok(([(header::CACHE_CONTROL, "no-store")], Json(tokens)).into_response())
}

/// Redeem an authorization code or refresh token
#[utoipa::path(
    post,
    path = "/oidc/oauth/token",
    request_body(content = TokenRequest, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 200, description = "Tokens issued", body = TokenResponse),
        (status = 400, description = "OAuth error")
    ),
    tag = "OIDC"
)]
pub async fn token(State(state): State<AppState>, body: Bytes) -> Result<Response, OAuthError> {
    let req: TokenRequest = serde_urlencoded::from_bytes(&body)
        .map_err(|e| OAuthError::invalid_request(format!("malformed token request: {}", e)))?;
    if req.client_id.as_deref().is_some_and(|id| id != CLIENT_ID) {
        return Err(OAuthError::new("invalid_client", "unknown client_id"));
    }

    match req.grant_type.as_str() {
        "authorization_code" => {
            let code = req
                .code
                .ok_or_else(|| OAuthError::invalid_request("code is required"))?;
            let auth_code = state
                .oidc
                .redeem_code(&code)
                .ok_or_else(|| OAuthError::invalid_grant("unknown, used or expired code"))?;
            if req
                .redirect_uri
                .as_deref()
                .is_some_and(|uri| uri != auth_code.redirect_uri)
            {
                return Err(OAuthError::invalid_grant("redirect_uri does not match"));
            }
            let verifier = req.code_verifier.unwrap_or_default();
            if !verify_pkce(&verifier, &auth_code.code_challenge) {
                return Err(OAuthError::invalid_grant("PKCE verification failed"));
            }
            let session = state
                .db
                .api_session(&auth_code.api_session_id)
                .ok_or_else(|| OAuthError::invalid_grant("the session has ended"))?;
            tracing::info!(
                identity_id = %session.identity_id,
                api_session_id = %session.id,
                "OIDC tokens issued"
            );
            issue_for(&state, &session, auth_code.nonce).await
        }
        "refresh_token" => {
            let refresh = req
                .refresh_token
                .ok_or_else(|| OAuthError::invalid_request("refresh_token is required"))?;
            let claims = state
                .jwt
                .validate_edge_token(&refresh, TOKEN_TYPE_REFRESH)
                .map_err(|e| match e {
                    TokenError::Expired => OAuthError::invalid_grant("refresh token expired"),
                    _ => OAuthError::invalid_grant("invalid refresh token"),
                })?;
            let session = state
                .auth
                .oidc_session(&claims.z_asid)
                .ok_or_else(|| OAuthError::invalid_grant("the session has ended"))?;
            issue_for(&state, &session, None).await
        }
        other => Err(OAuthError::new(
            "unsupported_grant_type",
            format!("grant_type {} is not supported", other),
        )),
    }
}

/// JSON Web Key Set of the controller's signing key
#[utoipa::path(get, path = "/oidc/keys", responses((status = 200, description = "JWKS")), tag = "OIDC")]
pub async fn keys(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.jwt.jwks())
}

/// OpenID Provider metadata
#[utoipa::path(
    get,
    path = "/oidc/.well-known/openid-configuration",
    responses((status = 200, description = "Discovery document")),
    tag = "OIDC"
)]
pub async fn discovery(State(state): State<AppState>) -> impl IntoResponse {
    let issuer = state.jwt.issuer().trim_end_matches('/').to_string();
    Json(json!({
        "issuer": issuer,
        "authorization_endpoint": format!("{}/oidc/authorize", issuer),
        "token_endpoint": format!("{}/oidc/oauth/token", issuer),
        "jwks_uri": format!("{}/oidc/keys", issuer),
        "response_types_supported": ["code"],
        "grant_types_supported": ["authorization_code", "refresh_token"],
        "subject_types_supported": ["public"],
        "id_token_signing_alg_values_supported": ["ES256"],
        "code_challenge_methods_supported": [PKCE_METHOD_S256],
        "scopes_supported": ["openid", "offline_access"],
        "token_endpoint_auth_methods_supported": ["none"],
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_redirect_uris() {
        let allowed = vec![
            "http://localhost:*/auth/callback".to_string(),
            "openziti://auth/callback".to_string(),
        ];
        assert!(redirect_uri_allowed(&allowed, "http://localhost:8080/auth/callback"));
        assert!(redirect_uri_allowed(&allowed, "openziti://auth/callback"));
        assert!(!redirect_uri_allowed(&allowed, "http://localhost:8080/evil/auth/callback"));
        assert!(!redirect_uri_allowed(&allowed, "http://evil.example/auth/callback"));
    }
}
