//! The caller's own API session, identity and authenticators.

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Extension, Json,
};
use chrono::Utc;
use serde_json::json;
use service_core::error::AppError;

use crate::{
    dtos::{
        self,
        client::{
            ApiSessionDetail, ChangePasswordRequest, ExtendRequest, ExtendVerifyRequest,
            IssuedCertResponse,
        },
        CodeRequest, Envelope,
    },
    middleware::{Principal, RequestAuth},
    models::{AuthenticatorView, Credential, SessionKind},
    services::{PolicyService, ServiceError},
    utils::{hash_password, verify_password, Password, PasswordHashString},
    AppState,
};

/// Get the current API session with its outstanding auth queries
#[utoipa::path(
    get,
    path = "/edge/client/v1/current-api-session",
    responses(
        (status = 200, description = "Current session", body = ApiSessionDetail),
        (status = 401, description = "No session", body = ErrorResponse)
    ),
    tag = "Current Session",
    security(("zt_session" = []), ("bearer_auth" = []))
)]
pub async fn get_current_api_session(
    State(state): State<AppState>,
    Principal(session): Principal,
    Extension(auth): Extension<RequestAuth>,
) -> Result<impl IntoResponse, AppError> {
    let (queries, _) = state
        .auth
        .evaluate_session(&session, auth.secondary_bearer.as_deref())
        .await?;
    let identity = state.db.read().await.identity(&session.identity_id)?.clone();
    Ok(Envelope::new(ApiSessionDetail::new(&session, &identity, queries)))
}

/// Log out
#[utoipa::path(
    delete,
    path = "/edge/client/v1/current-api-session",
    responses(
        (status = 200, description = "Session removed"),
        (status = 401, description = "No session", body = ErrorResponse)
    ),
    tag = "Current Session",
    security(("zt_session" = []), ("bearer_auth" = []))
)]
pub async fn delete_current_api_session(
    State(state): State<AppState>,
    Principal(session): Principal,
) -> Result<impl IntoResponse, AppError> {
    state.auth.logout(&session.id);
    tracing::info!(identity_id = %session.identity_id, api_session_id = %session.id, "Logged out");
    Ok(dtos::empty())
}

/// Exchange a TOTP code for a TOTP token bound to the OIDC session
#[utoipa::path(
    post,
    path = "/edge/client/v1/current-api-session/totp-token",
    request_body = CodeRequest,
    responses(
        (status = 200, description = "TOTP token issued"),
        (status = 400, description = "Legacy session or invalid code", body = ErrorResponse),
        (status = 404, description = "MFA not enrolled", body = ErrorResponse)
    ),
    tag = "Current Session",
    security(("bearer_auth" = []))
)]
pub async fn create_totp_token(
    State(state): State<AppState>,
    Principal(session): Principal,
    Json(req): Json<CodeRequest>,
) -> Result<impl IntoResponse, AppError> {
    if session.kind == SessionKind::Legacy {
        return Err(ServiceError::InvalidAuthMethod(
            "TOTP tokens are only issued to OIDC sessions".into(),
        )
        .into());
    }
    state.mfa.check(&session.identity_id, &req.code).await?;
    let token = state.jwt.issue_totp_token(&session.identity_id, &session.id)?;
    Ok(Envelope::new(json!({
        "token": token,
        "issuedAt": Utc::now(),
    })))
}

/// Get the caller's identity
#[utoipa::path(
    get,
    path = "/edge/client/v1/current-identity",
    responses(
        (status = 200, description = "Current identity"),
        (status = 401, description = "No fully authenticated session", body = ErrorResponse)
    ),
    tag = "Current Identity",
    security(("zt_session" = []), ("bearer_auth" = []))
)]
pub async fn get_current_identity(
    State(state): State<AppState>,
    Principal(session): Principal,
) -> Result<impl IntoResponse, AppError> {
    let identity = state.db.read().await.identity(&session.identity_id)?.clone();
    Ok(Envelope::new(identity))
}

/// List the caller's authenticators
#[utoipa::path(
    get,
    path = "/edge/client/v1/current-identity/authenticators",
    responses((status = 200, description = "Authenticators")),
    tag = "Current Identity",
    security(("zt_session" = []), ("bearer_auth" = []))
)]
pub async fn list_current_authenticators(
    State(state): State<AppState>,
    Principal(session): Principal,
) -> Result<impl IntoResponse, AppError> {
    let tables = state.db.read().await;
    let mut views: Vec<AuthenticatorView> = tables
        .authenticators_of(&session.identity_id)
        .map(|a| a.view())
        .collect();
    views.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    let total = views.len();
    Ok(Envelope::list(views, total))
}

/// Change the password of one of the caller's UPDB authenticators
#[utoipa::path(
    put,
    path = "/edge/client/v1/current-identity/authenticators/{id}",
    params(("id" = String, Path, description = "Authenticator id")),
    request_body = ChangePasswordRequest,
    responses(
        (status = 200, description = "Password changed"),
        (status = 400, description = "Password violates policy", body = ErrorResponse),
        (status = 401, description = "Current password incorrect", body = ErrorResponse),
        (status = 404, description = "Not found", body = ErrorResponse)
    ),
    tag = "Current Identity",
    security(("zt_session" = []), ("bearer_auth" = []))
)]
pub async fn change_password(
    State(state): State<AppState>,
    Principal(session): Principal,
    Path(id): Path<String>,
    Json(req): Json<ChangePasswordRequest>,
) -> Result<impl IntoResponse, AppError> {
    let mut tables = state.db.write().await;
    let identity = tables.identity(&session.identity_id)?.clone();
    let updb = tables.policy_for(&identity)?.primary.updb.clone();

    let authenticator = tables
        .authenticators
        .get_mut(&id)
        .filter(|a| a.identity_id == session.identity_id)
        .ok_or(ServiceError::NotFound("authenticator"))?;
    let Credential::Updb { password_hash, failed_attempts, .. } = &mut authenticator.credential else {
        return Err(ServiceError::validation("only password authenticators have a password").into());
    };

    verify_password(
        &Password::new(req.current_password),
        &PasswordHashString::new(password_hash.clone()),
    )
    .map_err(|_| ServiceError::invalid_auth("the current password is incorrect"))?;
    PolicyService::validate_password(&req.password, &updb)
        .map_err(|e| ServiceError::validation(e.to_string()))?;

    *password_hash = hash_password(&Password::new(req.password))?.into_string();
    *failed_attempts = 0;
    authenticator.updated_at = Utc::now();

    tracing::info!(identity_id = %identity.id, authenticator_id = %id, "Password changed");
    Ok(dtos::empty())
}

/// Issue a replacement certificate for one of the caller's cert authenticators
#[utoipa::path(
    post,
    path = "/edge/client/v1/current-identity/authenticators/{id}/extend",
    params(("id" = String, Path, description = "Authenticator id")),
    request_body = ExtendRequest,
    responses(
        (status = 200, description = "Certificate issued, pending verification", body = IssuedCertResponse),
        (status = 400, description = "Invalid CSR", body = ErrorResponse),
        (status = 404, description = "Not found", body = ErrorResponse)
    ),
    tag = "Current Identity",
    security(("zt_session" = []), ("bearer_auth" = []))
)]
pub async fn extend_authenticator(
    State(state): State<AppState>,
    Principal(session): Principal,
    Path(id): Path<String>,
    Json(req): Json<ExtendRequest>,
) -> Result<impl IntoResponse, AppError> {
    let issued = state
        .enrollment
        .extend(&session.identity_id, &id, req.client_cert_csr.as_deref())
        .await?;
    Ok(Envelope::new(IssuedCertResponse {
        client_cert: issued.pem,
        ca: state.certs.ca_pem().to_string(),
    }))
}

/// Prove possession of the extended certificate and make it current
#[utoipa::path(
    post,
    path = "/edge/client/v1/current-identity/authenticators/{id}/extend-verify",
    params(("id" = String, Path, description = "Authenticator id")),
    request_body = ExtendVerifyRequest,
    responses(
        (status = 200, description = "Extension completed"),
        (status = 400, description = "Certificate does not match", body = ErrorResponse),
        (status = 404, description = "Not found", body = ErrorResponse)
    ),
    tag = "Current Identity",
    security(("zt_session" = []), ("bearer_auth" = []))
)]
pub async fn extend_verify_authenticator(
    State(state): State<AppState>,
    Principal(session): Principal,
    Path(id): Path<String>,
    Json(req): Json<ExtendVerifyRequest>,
) -> Result<impl IntoResponse, AppError> {
    state
        .enrollment
        .extend_verify(&session.identity_id, &id, &req.client_cert)
        .await?;
    Ok(dtos::empty())
}
