use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, HeaderMap},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use utoipa::{IntoParams, ToSchema};

use super::decode_body;
use crate::{
    dtos::{self, CodeRequest, Envelope},
    middleware::Principal,
    models::{ApiSession, Mfa},
    services::MfaProof,
    AppState,
};

/// Header carrying a TOTP code, recovery code or TOTP token on bodiless calls.
pub const MFA_CODE_HEADER: &str = "mfa-validation-code";

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MfaDetail {
    pub id: String,
    pub is_verified: bool,
    /// Present until the enrollment is verified.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provisioning_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovery_codes: Option<Vec<String>>,
    #[schema(value_type = String)]
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct CodeQuery {
    pub code: Option<String>,
}

async fn detail(state: &AppState, identity_id: &str, mfa: Mfa) -> Result<MfaDetail, AppError> {
    let (provisioning_url, recovery_codes) = if mfa.is_verified {
        (None, None)
    } else {
        let name = state.db.read().await.identity(identity_id)?.name.clone();
        (
            Some(state.mfa.provisioning_url(&mfa, &name)?),
            Some(mfa.recovery_codes.clone()),
        )
    };
    Ok(MfaDetail {
        id: mfa.id,
        is_verified: mfa.is_verified,
        provisioning_url,
        recovery_codes,
        created_at: mfa.created_at,
    })
}

fn presented_code(headers: &HeaderMap, query: Option<String>, body: &[u8]) -> Result<Option<String>, AppError> {
    if let Some(code) = headers.get(MFA_CODE_HEADER).and_then(|v| v.to_str().ok()) {
        return Ok(Some(code.to_string()));
    }
    if query.is_some() {
        return Ok(query);
    }
    let req: CodeRequest = decode_body(headers, body)?;
    Ok(Some(req.code).filter(|c| !c.is_empty()))
}

/// A TOTP token issued to this very API session stands in for a code.
fn proof_of<'a>(state: &AppState, session: &ApiSession, presented: &'a str) -> MfaProof<'a> {
    match state.jwt.validate_totp_token(presented) {
        Ok(claims) if claims.z_asid == session.id && claims.sub == session.identity_id => {
            MfaProof::TotpToken
        }
        _ => MfaProof::Code(presented),
    }
}

/// Start MFA enrollment
#[utoipa::path(
    post,
    path = "/edge/client/v1/current-identity/mfa",
    responses(
        (status = 201, description = "Enrollment created; verify it with a code", body = MfaDetail),
        (status = 409, description = "MFA already exists", body = ErrorResponse)
    ),
    tag = "MFA",
    security(("zt_session" = []), ("bearer_auth" = []))
)]
pub async fn create_mfa(
    State(state): State<AppState>,
    Principal(session): Principal,
) -> Result<impl IntoResponse, AppError> {
    let mfa = state.mfa.create(&session.identity_id).await?;
    let body = detail(&state, &session.identity_id, mfa).await?;
    Ok((axum::http::StatusCode::CREATED, Envelope::new(body)))
}

/// Get the caller's MFA enrollment
#[utoipa::path(
    get,
    path = "/edge/client/v1/current-identity/mfa",
    responses(
        (status = 200, description = "MFA enrollment", body = MfaDetail),
        (status = 404, description = "MFA not enrolled", body = ErrorResponse)
    ),
    tag = "MFA",
    security(("zt_session" = []), ("bearer_auth" = []))
)]
pub async fn get_mfa(
    State(state): State<AppState>,
    Principal(session): Principal,
) -> Result<impl IntoResponse, AppError> {
    let mfa = state.mfa.get(&session.identity_id).await?;
    Ok(Envelope::new(detail(&state, &session.identity_id, mfa).await?))
}

/// Verify MFA enrollment with a TOTP code
#[utoipa::path(
    post,
    path = "/edge/client/v1/current-identity/mfa/verify",
    request_body = CodeRequest,
    responses(
        (status = 200, description = "MFA verified"),
        (status = 400, description = "Invalid code or already verified", body = ErrorResponse),
        (status = 404, description = "MFA not enrolled", body = ErrorResponse)
    ),
    tag = "MFA",
    security(("zt_session" = []), ("bearer_auth" = []))
)]
pub async fn verify_mfa(
    State(state): State<AppState>,
    Principal(session): Principal,
    Json(req): Json<CodeRequest>,
) -> Result<impl IntoResponse, AppError> {
    state.mfa.verify(&session.identity_id, &req.code).await?;
    state.auth.complete_totp(&session.id);
    Ok(dtos::empty())
}

/// Remove the caller's MFA enrollment
#[utoipa::path(
    delete,
    path = "/edge/client/v1/current-identity/mfa",
    params(CodeQuery),
    responses(
        (status = 200, description = "MFA removed"),
        (status = 400, description = "A valid code is required", body = ErrorResponse),
        (status = 404, description = "MFA not enrolled", body = ErrorResponse)
    ),
    tag = "MFA",
    security(("zt_session" = []), ("bearer_auth" = []))
)]
pub async fn delete_mfa(
    State(state): State<AppState>,
    Principal(session): Principal,
    Query(query): Query<CodeQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let code = presented_code(&headers, query.code, &body)?.unwrap_or_default();
    state
        .mfa
        .delete(&session.identity_id, proof_of(&state, &session, &code))
        .await?;
    Ok(dtos::empty())
}

/// Provisioning QR code of an unverified enrollment
#[utoipa::path(
    get,
    path = "/edge/client/v1/current-identity/mfa/qr-code",
    responses(
        (status = 200, description = "PNG image", content_type = "image/png"),
        (status = 404, description = "No unverified enrollment", body = ErrorResponse)
    ),
    tag = "MFA",
    security(("zt_session" = []), ("bearer_auth" = []))
)]
pub async fn mfa_qr_code(
    State(state): State<AppState>,
    Principal(session): Principal,
) -> Result<impl IntoResponse, AppError> {
    let name = state.db.read().await.identity(&session.identity_id)?.name.clone();
    let png = state.mfa.qr_png(&session.identity_id, &name).await?;
    Ok(([(header::CONTENT_TYPE, "image/png")], png))
}

/// List recovery codes
#[utoipa::path(
    get,
    path = "/edge/client/v1/current-identity/mfa/recovery-codes",
    params(CodeQuery),
    responses(
        (status = 200, description = "Recovery codes"),
        (status = 400, description = "Invalid code", body = ErrorResponse),
        (status = 404, description = "MFA not enrolled", body = ErrorResponse)
    ),
    tag = "MFA",
    security(("zt_session" = []), ("bearer_auth" = []))
)]
pub async fn get_recovery_codes(
    State(state): State<AppState>,
    Principal(session): Principal,
    Query(query): Query<CodeQuery>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    let code = presented_code(&headers, query.code, &[])?.unwrap_or_default();
    let codes = state
        .mfa
        .recovery_codes(&session.identity_id, proof_of(&state, &session, &code))
        .await?;
    Ok(Envelope::new(serde_json::json!({ "recoveryCodes": codes })))
}

/// Regenerate recovery codes
#[utoipa::path(
    post,
    path = "/edge/client/v1/current-identity/mfa/recovery-codes",
    request_body = CodeRequest,
    responses(
        (status = 200, description = "New recovery codes"),
        (status = 400, description = "Invalid code", body = ErrorResponse),
        (status = 404, description = "MFA not enrolled", body = ErrorResponse)
    ),
    tag = "MFA",
    security(("zt_session" = []), ("bearer_auth" = []))
)]
pub async fn regenerate_recovery_codes(
    State(state): State<AppState>,
    Principal(session): Principal,
    Json(req): Json<CodeRequest>,
) -> Result<impl IntoResponse, AppError> {
    let codes = state
        .mfa
        .regenerate_recovery_codes(&session.identity_id, proof_of(&state, &session, &req.code))
        .await?;
    Ok(Envelope::new(serde_json::json!({ "recoveryCodes": codes })))
}
