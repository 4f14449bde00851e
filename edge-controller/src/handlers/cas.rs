//! Third-party certificate authorities.
//!
//! A CA starts unverified. Its owner proves possession of the key by
//! signing a certificate whose common name is the CA's verification token;
//! only verified CAs are trusted for authentication and enrollment.

use axum::{
    body::Bytes,
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use service_core::error::AppError;

use crate::{
    dtos::{
        self,
        management::{CreateCaRequest, PatchCaRequest},
        Envelope,
    },
    models::{ca::DEFAULT_IDENTITY_NAME_FORMAT, CertificateAuthority},
    services::{
        certs::{is_issued_by, parse_pem},
        ServiceError,
    },
    utils::ValidatedJson,
    AppState,
};

/// Create a certificate authority
#[utoipa::path(
    post,
    path = "/edge/management/v1/cas",
    request_body = CreateCaRequest,
    responses(
        (status = 201, description = "CA created, unverified"),
        (status = 400, description = "Invalid certificate", body = ErrorResponse),
        (status = 409, description = "CA already registered", body = ErrorResponse)
    ),
    tag = "Certificate Authorities",
    security(("zt_session" = []), ("bearer_auth" = []))
)]
pub async fn create_ca(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<CreateCaRequest>,
) -> Result<impl IntoResponse, AppError> {
    let parsed = parse_pem(&req.cert_pem).map_err(|e| ServiceError::CertFailedValidation(e.to_string()))?;
    if !parsed.is_ca {
        return Err(ServiceError::CertFailedValidation("the certificate is not a CA certificate".into()).into());
    }

    let mut tables = state.db.write().await;
    if tables.cas.values().any(|ca| ca.fingerprint == parsed.fingerprint) {
        return Err(ServiceError::CertInUse.into());
    }
    if tables.cas.values().any(|ca| ca.name == req.name) {
        return Err(ServiceError::validation(format!("CA name {} is in use", req.name)).into());
    }

    let mut ca = CertificateAuthority::new(req.name, req.cert_pem, parsed.fingerprint);
    ca.is_auto_ca_enrollment_enabled = req.is_auto_ca_enrollment_enabled;
    ca.is_ott_ca_enrollment_enabled = req.is_ott_ca_enrollment_enabled;
    ca.is_auth_enabled = req.is_auth_enabled;
    ca.identity_roles = req.identity_roles;
    ca.identity_name_format = req
        .identity_name_format
        .filter(|f| !f.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_IDENTITY_NAME_FORMAT.to_string());
    ca.external_id_claim = req.external_id_claim;
    ca.tags = req.tags;
    tables.cas.insert(ca.id.clone(), ca.clone());

    tracing::info!(ca_id = %ca.id, name = %ca.name, "Certificate authority created");
    Ok(dtos::created(&ca.id))
}

/// List certificate authorities
#[utoipa::path(
    get,
    path = "/edge/management/v1/cas",
    responses((status = 200, description = "Certificate authorities")),
    tag = "Certificate Authorities",
    security(("zt_session" = []), ("bearer_auth" = []))
)]
pub async fn list_cas(State(state): State<AppState>) -> impl IntoResponse {
    let tables = state.db.read().await;
    let mut cas: Vec<CertificateAuthority> = tables.cas.values().cloned().collect();
    cas.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    let total = cas.len();
    Envelope::list(cas, total)
}

/// Get a certificate authority
#[utoipa::path(
    get,
    path = "/edge/management/v1/cas/{id}",
    params(("id" = String, Path, description = "CA id")),
    responses(
        (status = 200, description = "Certificate authority"),
        (status = 404, description = "Not found", body = ErrorResponse)
    ),
    tag = "Certificate Authorities",
    security(("zt_session" = []), ("bearer_auth" = []))
)]
pub async fn get_ca(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let tables = state.db.read().await;
    Ok(Envelope::new(tables.ca(&id)?.clone()))
}

/// Update selected fields of a certificate authority
#[utoipa::path(
    patch,
    path = "/edge/management/v1/cas/{id}",
    params(("id" = String, Path, description = "CA id")),
    request_body = PatchCaRequest,
    responses(
        (status = 200, description = "CA updated"),
        (status = 404, description = "Not found", body = ErrorResponse)
    ),
    tag = "Certificate Authorities",
    security(("zt_session" = []), ("bearer_auth" = []))
)]
pub async fn patch_ca(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<PatchCaRequest>,
) -> Result<impl IntoResponse, AppError> {
    let mut tables = state.db.write().await;
    tables.ca(&id)?;
    if let Some(name) = patch.name.as_deref() {
        if name.trim().is_empty() {
            return Err(ServiceError::validation("name is required").into());
        }
        if tables.cas.values().any(|ca| ca.id != id && ca.name == name) {
            return Err(ServiceError::validation(format!("CA name {} is in use", name)).into());
        }
    }

    let ca = tables
        .cas
        .get_mut(&id)
        .ok_or(ServiceError::NotFound("certificate authority"))?;
    if let Some(name) = patch.name {
        ca.name = name;
    }
    if let Some(v) = patch.is_auto_ca_enrollment_enabled {
        ca.is_auto_ca_enrollment_enabled = v;
    }
    if let Some(v) = patch.is_ott_ca_enrollment_enabled {
        ca.is_ott_ca_enrollment_enabled = v;
    }
    if let Some(v) = patch.is_auth_enabled {
        ca.is_auth_enabled = v;
    }
    if let Some(roles) = patch.identity_roles {
        ca.identity_roles = roles;
    }
    if let Some(format) = patch.identity_name_format {
        ca.identity_name_format = if format.trim().is_empty() {
            DEFAULT_IDENTITY_NAME_FORMAT.to_string()
        } else {
            format
        };
    }
    if let Some(claim) = patch.external_id_claim {
        ca.external_id_claim = Some(claim);
    }
    if let Some(tags) = patch.tags {
        ca.tags = tags;
    }
    ca.updated_at = Utc::now();

    tracing::info!(ca_id = %id, "Certificate authority updated");
    Ok(dtos::empty())
}

/// Delete a certificate authority and its pending OTTCA enrollments
#[utoipa::path(
    delete,
    path = "/edge/management/v1/cas/{id}",
    params(("id" = String, Path, description = "CA id")),
    responses(
        (status = 200, description = "CA deleted"),
        (status = 404, description = "Not found", body = ErrorResponse)
    ),
    tag = "Certificate Authorities",
    security(("zt_session" = []), ("bearer_auth" = []))
)]
pub async fn delete_ca(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let mut tables = state.db.write().await;
    tables
        .cas
        .remove(&id)
        .ok_or(ServiceError::NotFound("certificate authority"))?;
    tables
        .enrollments
        .retain(|_, e| e.ca_id.as_deref() != Some(id.as_str()));

    tracing::info!(ca_id = %id, "Certificate authority deleted");
    Ok(dtos::empty())
}

/// Prove possession of the CA key with a certificate named after the
/// verification token
#[utoipa::path(
    post,
    path = "/edge/management/v1/cas/{id}/verify",
    params(("id" = String, Path, description = "CA id")),
    request_body(content = String, content_type = "text/plain", description = "PEM certificate signed by the CA"),
    responses(
        (status = 200, description = "CA verified"),
        (status = 400, description = "Certificate does not prove possession", body = ErrorResponse),
        (status = 404, description = "Not found", body = ErrorResponse),
        (status = 409, description = "Already verified", body = ErrorResponse)
    ),
    tag = "Certificate Authorities",
    security(("zt_session" = []), ("bearer_auth" = []))
)]
pub async fn verify_ca(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let pem = std::str::from_utf8(&body)
        .map_err(|_| ServiceError::CertFailedValidation("the certificate is not valid UTF-8".into()))?;
    let presented = parse_pem(pem).map_err(|e| ServiceError::CertFailedValidation(e.to_string()))?;

    let mut tables = state.db.write().await;
    let ca = tables
        .cas
        .get_mut(&id)
        .ok_or(ServiceError::NotFound("certificate authority"))?;
    if ca.is_verified {
        return Err(ServiceError::CaAlreadyVerified.into());
    }

    let ca_der = parse_pem(&ca.cert_pem)
        .map_err(|e| ServiceError::Internal(anyhow::anyhow!("stored CA certificate unreadable: {}", e)))?
        .der;
    if ca.verification_token.as_deref() != Some(presented.claims.common_name.as_str()) {
        return Err(ServiceError::CertFailedValidation(
            "the certificate common name does not match the verification token".into(),
        )
        .into());
    }
    if !is_issued_by(&presented.der, &ca_der) {
        return Err(ServiceError::CertFailedValidation("the certificate was not signed by the CA".into()).into());
    }

    ca.is_verified = true;
    ca.verification_token = None;
    ca.updated_at = Utc::now();

    tracing::info!(ca_id = %id, "Certificate authority verified");
    Ok(dtos::empty())
}
