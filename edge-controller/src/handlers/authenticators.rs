use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use service_core::error::AppError;

use crate::{
    dtos::{
        self,
        management::{CreateAuthenticatorRequest, RequestExtendRequest},
        Envelope,
    },
    models::{AuthMethod, Authenticator, AuthenticatorView},
    services::{certs::parse_pem, PolicyService, ServiceError},
    utils::{hash_password, Password, ValidatedJson},
    AppState,
};

/// Create a certificate or password authenticator for an identity
#[utoipa::path(
    post,
    path = "/edge/management/v1/authenticators",
    request_body = CreateAuthenticatorRequest,
    responses(
        (status = 201, description = "Authenticator created"),
        (status = 400, description = "Invalid request", body = ErrorResponse),
        (status = 409, description = "Certificate in use", body = ErrorResponse)
    ),
    tag = "Authenticators",
    security(("zt_session" = []), ("bearer_auth" = []))
)]
pub async fn create_authenticator(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<CreateAuthenticatorRequest>,
) -> Result<impl IntoResponse, AppError> {
    let method: AuthMethod = req.method.parse().map_err(ServiceError::InvalidAuthMethod)?;

    let mut tables = state.db.write().await;
    let identity = tables
        .identities
        .get(&req.identity_id)
        .cloned()
        .ok_or_else(|| ServiceError::ReferencedNotFound(format!("identity {} does not exist", req.identity_id)))?;

    let authenticator = match method {
        AuthMethod::Cert => {
            let pem = req
                .cert_pem
                .filter(|p| !p.trim().is_empty())
                .ok_or_else(|| ServiceError::validation("certPem is required for cert authenticators"))?;
            let parsed = parse_pem(&pem).map_err(|e| ServiceError::CertFailedValidation(e.to_string()))?;
            if tables.authenticator_by_fingerprint(&parsed.fingerprint).is_some() {
                return Err(ServiceError::CertInUse.into());
            }
            Authenticator::cert(identity.id.clone(), parsed.fingerprint, pem)
        }
        AuthMethod::Updb => {
            let username = req
                .username
                .filter(|u| !u.trim().is_empty())
                .ok_or_else(|| ServiceError::validation("username is required for updb authenticators"))?;
            let password = req.password.unwrap_or_default();
            if tables.authenticator_by_username(&username).is_some() {
                return Err(ServiceError::validation(format!("username {} is in use", username)).into());
            }
            if tables.authenticators_of(&identity.id).any(|a| a.username().is_some()) {
                return Err(ServiceError::validation("the identity already has a password authenticator").into());
            }
            let updb = &tables.policy_for(&identity)?.primary.updb;
            PolicyService::validate_password(&password, updb)
                .map_err(|e| ServiceError::validation(e.to_string()))?;
            let hash = hash_password(&Password::new(password))?;
            Authenticator::updb(identity.id.clone(), username, hash.into_string())
        }
        AuthMethod::ExtJwt => {
            return Err(ServiceError::InvalidAuthMethod(
                "ext-jwt credentials are configured through external JWT signers".into(),
            )
            .into())
        }
    };

    let id = authenticator.id.clone();
    tables.authenticators.insert(id.clone(), authenticator);
    tracing::info!(identity_id = %identity.id, authenticator_id = %id, method = method.as_str(), "Authenticator created");
    Ok(dtos::created(&id))
}

/// List authenticators
#[utoipa::path(
    get,
    path = "/edge/management/v1/authenticators",
    responses((status = 200, description = "Authenticators")),
    tag = "Authenticators",
    security(("zt_session" = []), ("bearer_auth" = []))
)]
pub async fn list_authenticators(State(state): State<AppState>) -> impl IntoResponse {
    let tables = state.db.read().await;
    let mut views: Vec<AuthenticatorView> = tables.authenticators.values().map(|a| a.view()).collect();
    views.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    let total = views.len();
    Envelope::list(views, total)
}

/// Get an authenticator
#[utoipa::path(
    get,
    path = "/edge/management/v1/authenticators/{id}",
    params(("id" = String, Path, description = "Authenticator id")),
    responses(
        (status = 200, description = "Authenticator"),
        (status = 404, description = "Not found", body = ErrorResponse)
    ),
    tag = "Authenticators",
    security(("zt_session" = []), ("bearer_auth" = []))
)]
pub async fn get_authenticator(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let tables = state.db.read().await;
    Ok(Envelope::new(tables.authenticator(&id)?.view()))
}

/// Delete an authenticator
#[utoipa::path(
    delete,
    path = "/edge/management/v1/authenticators/{id}",
    params(("id" = String, Path, description = "Authenticator id")),
    responses(
        (status = 200, description = "Authenticator deleted"),
        (status = 404, description = "Not found", body = ErrorResponse)
    ),
    tag = "Authenticators",
    security(("zt_session" = []), ("bearer_auth" = []))
)]
pub async fn delete_authenticator(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    state
        .db
        .write()
        .await
        .authenticators
        .remove(&id)
        .ok_or(ServiceError::NotFound("authenticator"))?;
    tracing::info!(authenticator_id = %id, "Authenticator deleted");
    Ok(dtos::empty())
}

/// Ask the holder of a certificate authenticator to extend it
#[utoipa::path(
    post,
    path = "/edge/management/v1/authenticators/{id}/request-extend",
    params(("id" = String, Path, description = "Authenticator id")),
    request_body = RequestExtendRequest,
    responses(
        (status = 200, description = "Extension requested"),
        (status = 400, description = "Not a certificate authenticator", body = ErrorResponse),
        (status = 404, description = "Not found", body = ErrorResponse)
    ),
    tag = "Authenticators",
    security(("zt_session" = []), ("bearer_auth" = []))
)]
pub async fn request_extend(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<RequestExtendRequest>>,
) -> Result<impl IntoResponse, AppError> {
    let roll_keys = body.map(|Json(req)| req.roll_keys).unwrap_or(false);
    let authenticator = state.enrollment.request_extend(&id, roll_keys).await?;
    tracing::info!(authenticator_id = %id, roll_keys = roll_keys, "Certificate extension requested");
    Ok(Envelope::new(authenticator.view()))
}
