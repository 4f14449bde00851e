use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::{Duration, Utc};
use service_core::error::AppError;

use crate::{
    dtos::{
        self,
        management::{CreateIdentityRequest, PatchIdentityRequest},
        Envelope,
    },
    models::{EnrollmentMethod, Identity, DEFAULT_AUTH_POLICY_ID},
    services::{EnforcementEvent, NewEnrollment, ServiceError, Tables},
    utils::ValidatedJson,
    AppState,
};

fn check_name(tables: &Tables, name: &str, except: Option<&str>) -> Result<(), ServiceError> {
    if name.trim().is_empty() {
        return Err(ServiceError::validation("name is required"));
    }
    if tables.identity_name_taken(name, except) {
        return Err(ServiceError::validation(format!("identity name {} is in use", name)));
    }
    Ok(())
}

fn check_policy(tables: &Tables, policy_id: &str) -> Result<(), ServiceError> {
    if tables.auth_policies.contains_key(policy_id) {
        Ok(())
    } else {
        Err(ServiceError::ReferencedNotFound(format!("auth policy {} does not exist", policy_id)))
    }
}

/// Create an identity, optionally with enrollments
#[utoipa::path(
    post,
    path = "/edge/management/v1/identities",
    request_body = CreateIdentityRequest,
    responses(
        (status = 201, description = "Identity created"),
        (status = 400, description = "Invalid request", body = ErrorResponse),
        (status = 404, description = "Referenced auth policy not found", body = ErrorResponse)
    ),
    tag = "Identities",
    security(("zt_session" = []), ("bearer_auth" = []))
)]
pub async fn create_identity(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<CreateIdentityRequest>,
) -> Result<impl IntoResponse, AppError> {
    let mut tables = state.db.write().await;
    check_name(&tables, &req.name, None)?;
    let policy_id = req
        .auth_policy_id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| DEFAULT_AUTH_POLICY_ID.to_string());
    check_policy(&tables, &policy_id)?;

    let mut identity = Identity::new(req.name, req.is_admin);
    if let Some(kind) = req.identity_type {
        identity.identity_type = kind;
    }
    identity.role_attributes = req.role_attributes;
    identity.auth_policy_id = policy_id;
    identity.external_id = req.external_id.filter(|id| !id.is_empty());
    identity.tags = req.tags;
    tables.identities.insert(identity.id.clone(), identity.clone());

    // Enrollments are created under the same lock; any failure rolls the
    // identity back.
    if let Some(enrollment) = req.enrollment {
        let expires_at = Some(Utc::now() + Duration::minutes(state.config.enrollment.duration_minutes));
        let mut requested = Vec::new();
        if enrollment.ott {
            requested.push((EnrollmentMethod::Ott, None, None));
        }
        if let Some(ca_id) = enrollment.ottca {
            requested.push((EnrollmentMethod::Ottca, Some(ca_id), None));
        }
        if let Some(username) = enrollment.updb {
            requested.push((EnrollmentMethod::Updb, None, Some(username)));
        }
        for (method, ca_id, username) in requested {
            let created = state.enrollment.create_in(
                &mut tables,
                NewEnrollment {
                    identity_id: Some(identity.id.clone()),
                    method: Some(method),
                    expires_at,
                    ca_id,
                    username,
                },
            );
            if let Err(e) = created {
                tables.remove_identity_cascade(&identity.id);
                return Err(e.into());
            }
        }
    }

    tracing::info!(identity_id = %identity.id, name = %identity.name, "Identity created");
    Ok(dtos::created(&identity.id))
}

/// List identities
#[utoipa::path(
    get,
    path = "/edge/management/v1/identities",
    responses((status = 200, description = "Identities")),
    tag = "Identities",
    security(("zt_session" = []), ("bearer_auth" = []))
)]
pub async fn list_identities(State(state): State<AppState>) -> impl IntoResponse {
    let tables = state.db.read().await;
    let mut identities: Vec<Identity> = tables.identities.values().cloned().collect();
    identities.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    let total = identities.len();
    Envelope::list(identities, total)
}

/// Get an identity
#[utoipa::path(
    get,
    path = "/edge/management/v1/identities/{id}",
    params(("id" = String, Path, description = "Identity id")),
    responses(
        (status = 200, description = "Identity"),
        (status = 404, description = "Not found", body = ErrorResponse)
    ),
    tag = "Identities",
    security(("zt_session" = []), ("bearer_auth" = []))
)]
pub async fn get_identity(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let tables = state.db.read().await;
    let identity = tables.identity(&id)?.clone();
    let has_mfa = tables.mfas.get(&id).is_some_and(|m| m.is_verified);
    let mut body = serde_json::to_value(&identity).map_err(anyhow::Error::from)?;
    body["isMfaEnabled"] = serde_json::Value::Bool(has_mfa);
    Ok(Envelope::new(body))
}

async fn apply_update(
    state: &AppState,
    id: &str,
    patch: PatchIdentityRequest,
) -> Result<(), AppError> {
    let mut tables = state.db.write().await;
    if tables.identity(id)?.is_default_admin && patch.is_admin == Some(false) {
        return Err(ServiceError::validation("the default administrator cannot be demoted").into());
    }
    if let Some(name) = patch.name.as_deref() {
        check_name(&tables, name, Some(id))?;
    }
    if let Some(policy_id) = patch.auth_policy_id.as_deref().filter(|p| !p.is_empty()) {
        check_policy(&tables, policy_id)?;
    }

    let identity = tables.identity_mut(id)?;
    let roles_changed = patch
        .role_attributes
        .as_ref()
        .is_some_and(|roles| *roles != identity.role_attributes);

    if let Some(name) = patch.name {
        identity.name = name;
    }
    if let Some(kind) = patch.identity_type {
        identity.identity_type = kind;
    }
    if let Some(is_admin) = patch.is_admin {
        identity.is_admin = is_admin;
    }
    if let Some(roles) = patch.role_attributes {
        identity.role_attributes = roles;
    }
    if let Some(policy_id) = patch.auth_policy_id {
        identity.auth_policy_id = if policy_id.is_empty() {
            DEFAULT_AUTH_POLICY_ID.to_string()
        } else {
            policy_id
        };
    }
    if let Some(external_id) = patch.external_id {
        identity.external_id = Some(external_id).filter(|e| !e.is_empty());
    }
    if let Some(tags) = patch.tags {
        identity.tags = tags;
    }
    identity.updated_at = Utc::now();
    drop(tables);

    if roles_changed {
        state.hub.notify(EnforcementEvent::IdentityChanged(id.to_string()));
    }
    tracing::info!(identity_id = %id, "Identity updated");
    Ok(())
}

/// Replace an identity
#[utoipa::path(
    put,
    path = "/edge/management/v1/identities/{id}",
    params(("id" = String, Path, description = "Identity id")),
    request_body = CreateIdentityRequest,
    responses(
        (status = 200, description = "Identity updated"),
        (status = 400, description = "Invalid request", body = ErrorResponse),
        (status = 404, description = "Not found", body = ErrorResponse)
    ),
    tag = "Identities",
    security(("zt_session" = []), ("bearer_auth" = []))
)]
pub async fn update_identity(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ValidatedJson(req): ValidatedJson<CreateIdentityRequest>,
) -> Result<impl IntoResponse, AppError> {
    let patch = PatchIdentityRequest {
        name: Some(req.name),
        identity_type: Some(req.identity_type.unwrap_or_else(|| "Default".to_string())),
        is_admin: Some(req.is_admin),
        role_attributes: Some(req.role_attributes),
        auth_policy_id: Some(req.auth_policy_id.unwrap_or_default()),
        external_id: Some(req.external_id.unwrap_or_default()),
        tags: Some(req.tags),
    };
    apply_update(&state, &id, patch).await?;
    Ok(dtos::empty())
}

/// Update selected fields of an identity
#[utoipa::path(
    patch,
    path = "/edge/management/v1/identities/{id}",
    params(("id" = String, Path, description = "Identity id")),
    request_body = PatchIdentityRequest,
    responses(
        (status = 200, description = "Identity updated"),
        (status = 400, description = "Invalid request", body = ErrorResponse),
        (status = 404, description = "Not found", body = ErrorResponse)
    ),
    tag = "Identities",
    security(("zt_session" = []), ("bearer_auth" = []))
)]
pub async fn patch_identity(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<PatchIdentityRequest>,
) -> Result<impl IntoResponse, AppError> {
    apply_update(&state, &id, patch).await?;
    Ok(dtos::empty())
}

/// Delete an identity with its authenticators, enrollments and sessions
#[utoipa::path(
    delete,
    path = "/edge/management/v1/identities/{id}",
    params(("id" = String, Path, description = "Identity id")),
    responses(
        (status = 200, description = "Identity deleted"),
        (status = 404, description = "Not found", body = ErrorResponse),
        (status = 409, description = "The default admin cannot be deleted", body = ErrorResponse)
    ),
    tag = "Identities",
    security(("zt_session" = []), ("bearer_auth" = []))
)]
pub async fn delete_identity(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let dropped = {
        let mut tables = state.db.write().await;
        if tables.identity(&id)?.is_default_admin {
            return Err(ServiceError::CannotDeleteReferenced("the default admin cannot be deleted".into()).into());
        }
        tables.remove_identity_cascade(&id)
    };
    state.db.remove_api_sessions_of(&id);
    state.hub.notify(EnforcementEvent::SessionsRemoved(dropped));

    tracing::info!(identity_id = %id, "Identity deleted");
    Ok(dtos::empty())
}

/// Lift a lockout
#[utoipa::path(
    post,
    path = "/edge/management/v1/identities/{id}/enable",
    params(("id" = String, Path, description = "Identity id")),
    responses(
        (status = 200, description = "Identity enabled"),
        (status = 404, description = "Not found", body = ErrorResponse)
    ),
    tag = "Identities",
    security(("zt_session" = []), ("bearer_auth" = []))
)]
pub async fn enable_identity(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let mut tables = state.db.write().await;
    let identity = tables.identity_mut(&id)?;
    identity.enable();
    for authenticator in tables.authenticators.values_mut().filter(|a| a.identity_id == id) {
        if let crate::models::Credential::Updb { failed_attempts, .. } = &mut authenticator.credential {
            *failed_attempts = 0;
        }
    }
    tracing::info!(identity_id = %id, "Identity enabled");
    Ok((StatusCode::OK, dtos::empty()))
}

/// Remove an identity's MFA enrollment
#[utoipa::path(
    delete,
    path = "/edge/management/v1/identities/{id}/mfa",
    params(("id" = String, Path, description = "Identity id")),
    responses(
        (status = 200, description = "MFA removed"),
        (status = 404, description = "Not found", body = ErrorResponse)
    ),
    tag = "Identities",
    security(("zt_session" = []), ("bearer_auth" = []))
)]
pub async fn delete_identity_mfa(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    state.db.read().await.identity(&id)?;
    state.mfa.admin_delete(&id).await?;
    Ok(dtos::empty())
}
