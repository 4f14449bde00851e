use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use service_core::error::AppError;

use crate::{
    dtos::{
        self,
        management::{ExtJwtSignerRequest, PatchExtJwtSignerRequest},
        Envelope,
    },
    models::{ext_jwt_signer::DEFAULT_CLAIMS_PROPERTY, ExternalJwtSigner},
    services::{certs::parse_pem, ServiceError, Tables},
    utils::ValidatedJson,
    AppState,
};

/// Parses the signing certificate, returning its fingerprint and expiry.
fn inspect_cert(pem: &str) -> Result<(String, chrono::DateTime<Utc>), ServiceError> {
    let parsed = parse_pem(pem).map_err(|e| ServiceError::CertFailedValidation(e.to_string()))?;
    Ok((parsed.fingerprint, parsed.not_after))
}

fn check_signer(tables: &Tables, signer: &ExternalJwtSigner) -> Result<(), ServiceError> {
    if tables
        .ext_jwt_signers
        .values()
        .any(|s| s.id != signer.id && s.issuer == signer.issuer && s.kid == signer.kid)
    {
        return Err(ServiceError::validation(format!(
            "a signer with issuer {} and kid {} already exists",
            signer.issuer, signer.kid
        )));
    }
    if tables
        .ext_jwt_signers
        .values()
        .any(|s| s.id != signer.id && s.name == signer.name)
    {
        return Err(ServiceError::validation(format!("signer name {} is in use", signer.name)));
    }
    if let Some(policy_id) = signer.enroll_auth_policy_id.as_deref() {
        if !tables.auth_policies.contains_key(policy_id) {
            return Err(ServiceError::ReferencedNotFound(format!(
                "auth policy {} does not exist",
                policy_id
            )));
        }
    }
    Ok(())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Create an external JWT signer
#[utoipa::path(
    post,
    path = "/edge/management/v1/external-jwt-signers",
    request_body = ExtJwtSignerRequest,
    responses(
        (status = 201, description = "Signer created"),
        (status = 400, description = "Invalid request", body = ErrorResponse)
    ),
    tag = "External JWT Signers",
    security(("zt_session" = []), ("bearer_auth" = []))
)]
pub async fn create_signer(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<ExtJwtSignerRequest>,
) -> Result<impl IntoResponse, AppError> {
    let (fingerprint, not_after) = inspect_cert(&req.cert_pem)?;
    let mut signer = ExternalJwtSigner::new(req.name, req.issuer, req.cert_pem, fingerprint);
    if let Some(kid) = non_empty(req.kid) {
        signer.kid = kid;
    }
    signer.not_after = Some(not_after);
    signer.audience = non_empty(req.audience);
    signer.enabled = req.enabled;
    signer.external_auth_url = non_empty(req.external_auth_url);
    signer.claims_property =
        non_empty(req.claims_property).unwrap_or_else(|| DEFAULT_CLAIMS_PROPERTY.to_string());
    signer.use_external_id = req.use_external_id;
    signer.client_id = non_empty(req.client_id);
    signer.scopes = req.scopes;
    signer.target_token = req.target_token.unwrap_or_default();
    signer.enroll_to_cert_enabled = req.enroll_to_cert_enabled;
    signer.enroll_to_token_enabled = req.enroll_to_token_enabled;
    signer.enroll_name_claims_selector = non_empty(req.enroll_name_claims_selector);
    signer.enroll_attribute_claims_selector = non_empty(req.enroll_attribute_claims_selector);
    signer.enroll_auth_policy_id = non_empty(req.enroll_auth_policy_id);
    signer.tags = req.tags;

    let mut tables = state.db.write().await;
    check_signer(&tables, &signer)?;
    tables.ext_jwt_signers.insert(signer.id.clone(), signer.clone());

    tracing::info!(signer_id = %signer.id, issuer = %signer.issuer, "External JWT signer created");
    Ok(dtos::created(&signer.id))
}

/// List external JWT signers
#[utoipa::path(
    get,
    path = "/edge/management/v1/external-jwt-signers",
    responses((status = 200, description = "Signers")),
    tag = "External JWT Signers",
    security(("zt_session" = []), ("bearer_auth" = []))
)]
pub async fn list_signers(State(state): State<AppState>) -> impl IntoResponse {
    let tables = state.db.read().await;
    let mut signers: Vec<ExternalJwtSigner> = tables.ext_jwt_signers.values().cloned().collect();
    signers.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    let total = signers.len();
    Envelope::list(signers, total)
}

/// Signers a client may log in with, listed without authentication
#[utoipa::path(
    get,
    path = "/edge/client/v1/external-jwt-signers",
    responses((status = 200, description = "Enabled signers")),
    tag = "External JWT Signers"
)]
pub async fn list_public_signers(State(state): State<AppState>) -> impl IntoResponse {
    let tables = state.db.read().await;
    let mut signers: Vec<&ExternalJwtSigner> =
        tables.ext_jwt_signers.values().filter(|s| s.enabled).collect();
    signers.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    let views: Vec<serde_json::Value> = signers.iter().map(|s| s.public_view()).collect();
    let total = views.len();
    Envelope::list(views, total)
}

/// Get an external JWT signer
#[utoipa::path(
    get,
    path = "/edge/management/v1/external-jwt-signers/{id}",
    params(("id" = String, Path, description = "Signer id")),
    responses(
        (status = 200, description = "Signer"),
        (status = 404, description = "Not found", body = ErrorResponse)
    ),
    tag = "External JWT Signers",
    security(("zt_session" = []), ("bearer_auth" = []))
)]
pub async fn get_signer(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let tables = state.db.read().await;
    Ok(Envelope::new(tables.signer(&id)?.clone()))
}

async fn apply_patch(state: &AppState, id: &str, patch: PatchExtJwtSignerRequest) -> Result<(), AppError> {
    let mut tables = state.db.write().await;
    let mut signer = tables.signer(id)?.clone();

    if let Some(pem) = patch.cert_pem {
        let (fingerprint, not_after) = inspect_cert(&pem)?;
        if signer.kid == signer.fingerprint {
            signer.kid = fingerprint.clone();
        }
        signer.cert_pem = pem;
        signer.fingerprint = fingerprint;
        signer.not_after = Some(not_after);
    }
    if let Some(name) = patch.name {
        if name.trim().is_empty() {
            return Err(ServiceError::validation("name is required").into());
        }
        signer.name = name;
    }
    if let Some(issuer) = patch.issuer {
        if issuer.trim().is_empty() {
            return Err(ServiceError::validation("issuer is required").into());
        }
        signer.issuer = issuer;
    }
    if let Some(kid) = non_empty(patch.kid) {
        signer.kid = kid;
    }
    if let Some(audience) = patch.audience {
        signer.audience = non_empty(Some(audience));
    }
    if let Some(enabled) = patch.enabled {
        signer.enabled = enabled;
    }
    if let Some(url) = patch.external_auth_url {
        signer.external_auth_url = non_empty(Some(url));
    }
    if let Some(property) = patch.claims_property {
        signer.claims_property =
            non_empty(Some(property)).unwrap_or_else(|| DEFAULT_CLAIMS_PROPERTY.to_string());
    }
    if let Some(use_external_id) = patch.use_external_id {
        signer.use_external_id = use_external_id;
    }
    if let Some(client_id) = patch.client_id {
        signer.client_id = non_empty(Some(client_id));
    }
    if let Some(scopes) = patch.scopes {
        signer.scopes = scopes;
    }
    if let Some(target) = patch.target_token {
        signer.target_token = target;
    }
    if let Some(v) = patch.enroll_to_cert_enabled {
        signer.enroll_to_cert_enabled = v;
    }
    if let Some(v) = patch.enroll_to_token_enabled {
        signer.enroll_to_token_enabled = v;
    }
    if let Some(selector) = patch.enroll_name_claims_selector {
        signer.enroll_name_claims_selector = non_empty(Some(selector));
    }
    if let Some(selector) = patch.enroll_attribute_claims_selector {
        signer.enroll_attribute_claims_selector = non_empty(Some(selector));
    }
    if let Some(policy_id) = patch.enroll_auth_policy_id {
        signer.enroll_auth_policy_id = non_empty(Some(policy_id));
    }
    if let Some(tags) = patch.tags {
        signer.tags = tags;
    }

    check_signer(&tables, &signer)?;
    signer.updated_at = Utc::now();
    tables.ext_jwt_signers.insert(id.to_string(), signer);
    tracing::info!(signer_id = %id, "External JWT signer updated");
    Ok(())
}

/// Replace an external JWT signer
#[utoipa::path(
    put,
    path = "/edge/management/v1/external-jwt-signers/{id}",
    params(("id" = String, Path, description = "Signer id")),
    request_body = ExtJwtSignerRequest,
    responses(
        (status = 200, description = "Signer updated"),
        (status = 400, description = "Invalid request", body = ErrorResponse),
        (status = 404, description = "Not found", body = ErrorResponse)
    ),
    tag = "External JWT Signers",
    security(("zt_session" = []), ("bearer_auth" = []))
)]
pub async fn update_signer(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ValidatedJson(req): ValidatedJson<ExtJwtSignerRequest>,
) -> Result<impl IntoResponse, AppError> {
    let patch = PatchExtJwtSignerRequest {
        name: Some(req.name),
        cert_pem: Some(req.cert_pem),
        kid: req.kid,
        issuer: Some(req.issuer),
        audience: Some(req.audience.unwrap_or_default()),
        enabled: Some(req.enabled),
        external_auth_url: Some(req.external_auth_url.unwrap_or_default()),
        claims_property: Some(req.claims_property.unwrap_or_default()),
        use_external_id: Some(req.use_external_id),
        client_id: Some(req.client_id.unwrap_or_default()),
        scopes: Some(req.scopes),
        target_token: Some(req.target_token.unwrap_or_default()),
        enroll_to_cert_enabled: Some(req.enroll_to_cert_enabled),
        enroll_to_token_enabled: Some(req.enroll_to_token_enabled),
        enroll_name_claims_selector: Some(req.enroll_name_claims_selector.unwrap_or_default()),
        enroll_attribute_claims_selector: Some(req.enroll_attribute_claims_selector.unwrap_or_default()),
        enroll_auth_policy_id: Some(req.enroll_auth_policy_id.unwrap_or_default()),
        tags: Some(req.tags),
    };
    apply_patch(&state, &id, patch).await?;
    Ok(dtos::empty())
}

/// Update selected fields of an external JWT signer
#[utoipa::path(
    patch,
    path = "/edge/management/v1/external-jwt-signers/{id}",
    params(("id" = String, Path, description = "Signer id")),
    request_body = PatchExtJwtSignerRequest,
    responses(
        (status = 200, description = "Signer updated"),
        (status = 400, description = "Invalid request", body = ErrorResponse),
        (status = 404, description = "Not found", body = ErrorResponse)
    ),
    tag = "External JWT Signers",
    security(("zt_session" = []), ("bearer_auth" = []))
)]
pub async fn patch_signer(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<PatchExtJwtSignerRequest>,
) -> Result<impl IntoResponse, AppError> {
    apply_patch(&state, &id, patch).await?;
    Ok(dtos::empty())
}

/// Delete an external JWT signer no auth policy references
#[utoipa::path(
    delete,
    path = "/edge/management/v1/external-jwt-signers/{id}",
    params(("id" = String, Path, description = "Signer id")),
    responses(
        (status = 200, description = "Signer deleted"),
        (status = 404, description = "Not found", body = ErrorResponse),
        (status = 409, description = "Referenced by an auth policy", body = ErrorResponse)
    ),
    tag = "External JWT Signers",
    security(("zt_session" = []), ("bearer_auth" = []))
)]
pub async fn delete_signer(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let mut tables = state.db.write().await;
    tables.signer(&id)?;
    let referencing = tables
        .auth_policies
        .values()
        .find(|p| p.referenced_signers().any(|s| s == id))
        .map(|p| p.id.clone());
    if let Some(policy_id) = referencing {
        return Err(ServiceError::CannotDeleteReferenced(format!(
            "external jwt signer {} is referenced by auth policy {}",
            id, policy_id
        ))
        .into());
    }
    tables.ext_jwt_signers.remove(&id);
    tracing::info!(signer_id = %id, "External JWT signer deleted");
    Ok(dtos::empty())
}
