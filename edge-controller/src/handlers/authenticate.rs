use std::net::SocketAddr;

use axum::{
    body::Bytes,
    extract::{ConnectInfo, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use service_core::error::AppError;

use super::{decode_body, request_ip};
use crate::{
    dtos::{
        client::{ApiSessionDetail, AuthenticateQuery, UpdbCredentials},
        CodeRequest, Envelope,
    },
    middleware::{bearer_token, ClientCert, Principal, ZT_SESSION_HEADER},
    models::{AuthMethod, SessionKind},
    services::{ext_jwt::TOKEN_ISSUER_ID_HEADER, PrimaryCredential, ServiceError},
    utils::Password,
    AppState,
};

/// Builds the primary credential for `method` from the request.
pub(crate) fn primary_credential(
    method: AuthMethod,
    headers: &HeaderMap,
    chain: Option<Vec<Vec<u8>>>,
    body: &[u8],
) -> Result<PrimaryCredential, AppError> {
    Ok(match method {
        AuthMethod::Updb => {
            let creds: UpdbCredentials = decode_body(headers, body)?;
            PrimaryCredential::Updb {
                username: creds.username,
                password: Password::new(creds.password),
            }
        }
        AuthMethod::Cert => PrimaryCredential::Cert {
            chain: chain.unwrap_or_default(),
        },
        AuthMethod::ExtJwt => PrimaryCredential::ExtJwt {
            token: bearer_token(headers).map(str::to_string),
            issuer_id: headers
                .get(TOKEN_ISSUER_ID_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
        },
    })
}

/// Authenticate with a primary credential and open a legacy API session
#[utoipa::path(
    post,
    path = "/edge/client/v1/authenticate",
    params(AuthenticateQuery),
    request_body(content = UpdbCredentials, description = "Required for method=updb"),
    responses(
        (status = 200, description = "Session created; pending auth queries are listed", body = ApiSessionDetail),
        (status = 400, description = "Unsupported method", body = ErrorResponse),
        (status = 401, description = "Credential rejected", body = ErrorResponse),
        (status = 429, description = "Rate limited", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
pub async fn authenticate(
    State(state): State<AppState>,
    Query(query): Query<AuthenticateQuery>,
    ClientCert(chain): ClientCert,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let method: AuthMethod = query.method.parse().map_err(ServiceError::InvalidAuthMethod)?;
    let credential = primary_credential(method, &headers, chain, &body)?;
    let bearer = bearer_token(&headers);

    let outcome = state
        .auth
        .authenticate(credential, SessionKind::Legacy, bearer, request_ip(&headers, connect))
        .await?;

    let detail = ApiSessionDetail::new(&outcome.session, &outcome.identity, outcome.auth_queries);
    let mut response = (StatusCode::OK, Envelope::new(detail)).into_response();
    let response_headers = response.headers_mut();
    if let Ok(token) = HeaderValue::from_str(&outcome.session.token) {
        response_headers.insert(ZT_SESSION_HEADER, token);
    }
    if let Some(challenge) = outcome.secondary.challenge() {
        if let Ok(value) = HeaderValue::from_str(&challenge.to_header_value()) {
            response_headers.append(header::WWW_AUTHENTICATE, value);
        }
    }
    Ok(response)
}

/// Answer the TOTP auth query of a legacy session
#[utoipa::path(
    post,
    path = "/edge/client/v1/authenticate/mfa",
    request_body = CodeRequest,
    responses(
        (status = 200, description = "MFA satisfied"),
        (status = 400, description = "Invalid code", body = ErrorResponse),
        (status = 401, description = "No session", body = ErrorResponse),
        (status = 404, description = "MFA not enrolled", body = ErrorResponse)
    ),
    tag = "Authentication",
    security(("zt_session" = []))
)]
pub async fn authenticate_mfa(
    State(state): State<AppState>,
    Principal(session): Principal,
    Json(req): Json<CodeRequest>,
) -> Result<impl IntoResponse, AppError> {
    state.mfa.check(&session.identity_id, &req.code).await?;
    state.auth.complete_totp(&session.id);
    tracing::info!(
        identity_id = %session.identity_id,
        api_session_id = %session.id,
        "MFA code accepted"
    );
    Ok(crate::dtos::empty())
}
