use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use service_core::error::AppError;

use super::merge_json;
use crate::{
    dtos::{
        self,
        management::{AuthPolicyRequest, PatchAuthPolicyRequest},
        Envelope,
    },
    models::AuthPolicy,
    services::{ServiceError, Tables},
    utils::ValidatedJson,
    AppState,
};

/// Every signer the policy names must exist.
fn check_signers(tables: &Tables, policy: &AuthPolicy) -> Result<(), ServiceError> {
    match policy
        .referenced_signers()
        .find(|id| !tables.ext_jwt_signers.contains_key(*id))
    {
        Some(missing) => Err(ServiceError::ReferencedNotFound(format!(
            "external jwt signer {} does not exist",
            missing
        ))),
        None => Ok(()),
    }
}

fn invalid_module(field: &str, e: serde_json::Error) -> ServiceError {
    ServiceError::validation(format!("invalid {}: {}", field, e))
}

/// Create an auth policy
#[utoipa::path(
    post,
    path = "/edge/management/v1/auth-policies",
    request_body = AuthPolicyRequest,
    responses(
        (status = 201, description = "Auth policy created"),
        (status = 400, description = "Invalid request", body = ErrorResponse),
        (status = 404, description = "Referenced signer not found", body = ErrorResponse)
    ),
    tag = "Auth Policies",
    security(("zt_session" = []), ("bearer_auth" = []))
)]
pub async fn create_auth_policy(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<AuthPolicyRequest>,
) -> Result<impl IntoResponse, AppError> {
    let mut policy = AuthPolicy::new(req.name, req.primary, req.secondary);
    policy.tags = req.tags;

    let mut tables = state.db.write().await;
    check_signers(&tables, &policy)?;
    tables.auth_policies.insert(policy.id.clone(), policy.clone());

    tracing::info!(policy_id = %policy.id, name = %policy.name, "Auth policy created");
    Ok(dtos::created(&policy.id))
}

/// List auth policies
#[utoipa::path(
    get,
    path = "/edge/management/v1/auth-policies",
    responses((status = 200, description = "Auth policies")),
    tag = "Auth Policies",
    security(("zt_session" = []), ("bearer_auth" = []))
)]
pub async fn list_auth_policies(State(state): State<AppState>) -> impl IntoResponse {
    let tables = state.db.read().await;
    let mut policies: Vec<AuthPolicy> = tables.auth_policies.values().cloned().collect();
    policies.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    let total = policies.len();
    Envelope::list(policies, total)
}

/// Get an auth policy
#[utoipa::path(
    get,
    path = "/edge/management/v1/auth-policies/{id}",
    params(("id" = String, Path, description = "Auth policy id")),
    responses(
        (status = 200, description = "Auth policy"),
        (status = 404, description = "Not found", body = ErrorResponse)
    ),
    tag = "Auth Policies",
    security(("zt_session" = []), ("bearer_auth" = []))
)]
pub async fn get_auth_policy(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let tables = state.db.read().await;
    Ok(Envelope::new(tables.auth_policy(&id)?.clone()))
}

/// Replace an auth policy
#[utoipa::path(
    put,
    path = "/edge/management/v1/auth-policies/{id}",
    params(("id" = String, Path, description = "Auth policy id")),
    request_body = AuthPolicyRequest,
    responses(
        (status = 200, description = "Auth policy updated"),
        (status = 400, description = "Invalid request", body = ErrorResponse),
        (status = 404, description = "Not found", body = ErrorResponse)
    ),
    tag = "Auth Policies",
    security(("zt_session" = []), ("bearer_auth" = []))
)]
pub async fn update_auth_policy(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ValidatedJson(req): ValidatedJson<AuthPolicyRequest>,
) -> Result<impl IntoResponse, AppError> {
    let mut tables = state.db.write().await;
    let mut policy = tables.auth_policy(&id)?.clone();
    policy.name = req.name;
    policy.primary = req.primary;
    policy.secondary = req.secondary;
    policy.tags = req.tags;
    policy.normalize();
    check_signers(&tables, &policy)?;

    policy.updated_at = Utc::now();
    tables.auth_policies.insert(id.clone(), policy);
    tracing::info!(policy_id = %id, "Auth policy updated");
    Ok(dtos::empty())
}

/// Update selected fields of an auth policy
#[utoipa::path(
    patch,
    path = "/edge/management/v1/auth-policies/{id}",
    params(("id" = String, Path, description = "Auth policy id")),
    request_body = PatchAuthPolicyRequest,
    responses(
        (status = 200, description = "Auth policy updated"),
        (status = 400, description = "Invalid request", body = ErrorResponse),
        (status = 404, description = "Not found", body = ErrorResponse)
    ),
    tag = "Auth Policies",
    security(("zt_session" = []), ("bearer_auth" = []))
)]
pub async fn patch_auth_policy(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<PatchAuthPolicyRequest>,
) -> Result<impl IntoResponse, AppError> {
    let mut tables = state.db.write().await;
    let mut policy = tables.auth_policy(&id)?.clone();

    if let Some(name) = patch.name {
        if name.trim().is_empty() {
            return Err(ServiceError::validation("name is required").into());
        }
        policy.name = name;
    }
    if let Some(primary) = patch.primary {
        let mut merged = serde_json::to_value(&policy.primary).map_err(anyhow::Error::from)?;
        merge_json(&mut merged, primary);
        policy.primary = serde_json::from_value(merged).map_err(|e| invalid_module("primary", e))?;
    }
    if let Some(secondary) = patch.secondary {
        let mut merged = serde_json::to_value(&policy.secondary).map_err(anyhow::Error::from)?;
        merge_json(&mut merged, secondary);
        policy.secondary = serde_json::from_value(merged).map_err(|e| invalid_module("secondary", e))?;
    }
    if let Some(tags) = patch.tags {
        policy.tags = tags;
    }
    policy.normalize();
    check_signers(&tables, &policy)?;

    policy.updated_at = Utc::now();
    tables.auth_policies.insert(id.clone(), policy);
    tracing::info!(policy_id = %id, "Auth policy patched");
    Ok(dtos::empty())
}

/// Delete an auth policy no identity uses
#[utoipa::path(
    delete,
    path = "/edge/management/v1/auth-policies/{id}",
    params(("id" = String, Path, description = "Auth policy id")),
    responses(
        (status = 200, description = "Auth policy deleted"),
        (status = 404, description = "Not found", body = ErrorResponse),
        (status = 409, description = "Default policy or still assigned", body = ErrorResponse)
    ),
    tag = "Auth Policies",
    security(("zt_session" = []), ("bearer_auth" = []))
)]
pub async fn delete_auth_policy(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let mut tables = state.db.write().await;
    if tables.auth_policy(&id)?.is_default() {
        return Err(ServiceError::CannotDeleteReferenced("the default auth policy cannot be deleted".into()).into());
    }
    if tables.identities.values().any(|i| i.auth_policy_id == id) {
        return Err(ServiceError::CannotDeleteReferenced(format!(
            "auth policy {} is assigned to identities",
            id
        ))
        .into());
    }
    if tables
        .ext_jwt_signers
        .values()
        .any(|s| s.enroll_auth_policy_id.as_deref() == Some(id.as_str()))
    {
        return Err(ServiceError::CannotDeleteReferenced(format!(
            "auth policy {} is referenced by an external jwt signer",
            id
        ))
        .into());
    }
    tables.auth_policies.remove(&id);

    tracing::info!(policy_id = %id, "Auth policy deleted");
    Ok(dtos::empty())
}
