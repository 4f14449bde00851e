//! Services, service policies, and the client's view of permitted services.

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde_json::json;
use service_core::error::AppError;

use crate::{
    dtos::{
        self,
        management::{PatchServicePolicyRequest, PatchServiceRequest, ServicePolicyRequest, ServiceRequest},
        Envelope,
    },
    middleware::Principal,
    models::{PolicyType, Service, ServicePolicy},
    services::{enforcement::is_permitted, EnforcementEvent, ServiceError, Tables},
    utils::ValidatedJson,
    AppState,
};

fn check_service_name(tables: &Tables, name: &str, except: Option<&str>) -> Result<(), ServiceError> {
    if name.trim().is_empty() {
        return Err(ServiceError::validation("name is required"));
    }
    if tables
        .services
        .values()
        .any(|s| s.name == name && Some(s.id.as_str()) != except)
    {
        return Err(ServiceError::validation(format!("service name {} is in use", name)));
    }
    Ok(())
}

// ============================================================================
// Services
// ============================================================================

/// Create a service
#[utoipa::path(
    post,
    path = "/edge/management/v1/services",
    request_body = ServiceRequest,
    responses(
        (status = 201, description = "Service created"),
        (status = 400, description = "Invalid request", body = ErrorResponse)
    ),
    tag = "Services",
    security(("zt_session" = []), ("bearer_auth" = []))
)]
pub async fn create_service(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<ServiceRequest>,
) -> Result<impl IntoResponse, AppError> {
    let mut tables = state.db.write().await;
    check_service_name(&tables, &req.name, None)?;
    let mut service = Service::new(req.name, req.role_attributes);
    service.tags = req.tags;
    tables.services.insert(service.id.clone(), service.clone());

    tracing::info!(service_id = %service.id, name = %service.name, "Service created");
    Ok(dtos::created(&service.id))
}

/// List services
#[utoipa::path(
    get,
    path = "/edge/management/v1/services",
    responses((status = 200, description = "Services")),
    tag = "Services",
    security(("zt_session" = []), ("bearer_auth" = []))
)]
pub async fn list_services(State(state): State<AppState>) -> impl IntoResponse {
    let tables = state.db.read().await;
    let mut services: Vec<Service> = tables.services.values().cloned().collect();
    services.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    let total = services.len();
    Envelope::list(services, total)
}

/// Get a service
#[utoipa::path(
    get,
    path = "/edge/management/v1/services/{id}",
    params(("id" = String, Path, description = "Service id")),
    responses(
        (status = 200, description = "Service"),
        (status = 404, description = "Not found", body = ErrorResponse)
    ),
    tag = "Services",
    security(("zt_session" = []), ("bearer_auth" = []))
)]
pub async fn get_service(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let tables = state.db.read().await;
    Ok(Envelope::new(tables.service(&id)?.clone()))
}

async fn apply_service_patch(state: &AppState, id: &str, patch: PatchServiceRequest) -> Result<(), AppError> {
    let mut tables = state.db.write().await;
    tables.service(id)?;
    if let Some(name) = patch.name.as_deref() {
        check_service_name(&tables, name, Some(id))?;
    }
    let service = tables
        .services
        .get_mut(id)
        .ok_or(ServiceError::NotFound("service"))?;
    let roles_changed = patch
        .role_attributes
        .as_ref()
        .is_some_and(|roles| *roles != service.role_attributes);

    if let Some(name) = patch.name {
        service.name = name;
    }
    if let Some(roles) = patch.role_attributes {
        service.role_attributes = roles;
    }
    if let Some(tags) = patch.tags {
        service.tags = tags;
    }
    service.updated_at = Utc::now();
    drop(tables);

    if roles_changed {
        state.hub.notify(EnforcementEvent::ServiceChanged(id.to_string()));
    }
    tracing::info!(service_id = %id, "Service updated");
    Ok(())
}

/// Replace a service
#[utoipa::path(
    put,
    path = "/edge/management/v1/services/{id}",
    params(("id" = String, Path, description = "Service id")),
    request_body = ServiceRequest,
    responses(
        (status = 200, description = "Service updated"),
        (status = 404, description = "Not found", body = ErrorResponse)
    ),
    tag = "Services",
    security(("zt_session" = []), ("bearer_auth" = []))
)]
pub async fn update_service(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ValidatedJson(req): ValidatedJson<ServiceRequest>,
) -> Result<impl IntoResponse, AppError> {
    let patch = PatchServiceRequest {
        name: Some(req.name),
        role_attributes: Some(req.role_attributes),
        tags: Some(req.tags),
    };
    apply_service_patch(&state, &id, patch).await?;
    Ok(dtos::empty())
}

/// Update selected fields of a service
#[utoipa::path(
    patch,
    path = "/edge/management/v1/services/{id}",
    params(("id" = String, Path, description = "Service id")),
    request_body = PatchServiceRequest,
    responses(
        (status = 200, description = "Service updated"),
        (status = 404, description = "Not found", body = ErrorResponse)
    ),
    tag = "Services",
    security(("zt_session" = []), ("bearer_auth" = []))
)]
pub async fn patch_service(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<PatchServiceRequest>,
) -> Result<impl IntoResponse, AppError> {
    apply_service_patch(&state, &id, patch).await?;
    Ok(dtos::empty())
}

/// Delete a service and revoke its sessions
#[utoipa::path(
    delete,
    path = "/edge/management/v1/services/{id}",
    params(("id" = String, Path, description = "Service id")),
    responses(
        (status = 200, description = "Service deleted"),
        (status = 404, description = "Not found", body = ErrorResponse)
    ),
    tag = "Services",
    security(("zt_session" = []), ("bearer_auth" = []))
)]
pub async fn delete_service(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let dropped = {
        let mut tables = state.db.write().await;
        tables
            .services
            .remove(&id)
            .ok_or(ServiceError::NotFound("service"))?;
        let dropped: Vec<String> = tables
            .edge_sessions
            .values()
            .filter(|s| s.service_id == id)
            .map(|s| s.id.clone())
            .collect();
        for session_id in &dropped {
            tables.edge_sessions.remove(session_id);
        }
        dropped
    };
    state.hub.notify(EnforcementEvent::SessionsRemoved(dropped));

    tracing::info!(service_id = %id, "Service deleted");
    Ok(dtos::empty())
}

// ============================================================================
// Service policies
// ============================================================================

/// Create a service policy
#[utoipa::path(
    post,
    path = "/edge/management/v1/service-policies",
    request_body = ServicePolicyRequest,
    responses(
        (status = 201, description = "Service policy created"),
        (status = 400, description = "Invalid request", body = ErrorResponse)
    ),
    tag = "Service Policies",
    security(("zt_session" = []), ("bearer_auth" = []))
)]
pub async fn create_service_policy(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<ServicePolicyRequest>,
) -> Result<impl IntoResponse, AppError> {
    let mut policy = ServicePolicy::new(
        req.name,
        req.policy_type,
        req.semantic,
        req.identity_roles,
        req.service_roles,
    );
    policy.tags = req.tags;
    state
        .db
        .write()
        .await
        .service_policies
        .insert(policy.id.clone(), policy.clone());

    tracing::info!(policy_id = %policy.id, policy_type = ?policy.policy_type, "Service policy created");
    Ok(dtos::created(&policy.id))
}

/// List service policies
#[utoipa::path(
    get,
    path = "/edge/management/v1/service-policies",
    responses((status = 200, description = "Service policies")),
    tag = "Service Policies",
    security(("zt_session" = []), ("bearer_auth" = []))
)]
pub async fn list_service_policies(State(state): State<AppState>) -> impl IntoResponse {
    let tables = state.db.read().await;
    let mut policies: Vec<ServicePolicy> = tables.service_policies.values().cloned().collect();
    policies.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    let total = policies.len();
    Envelope::list(policies, total)
}

/// Get a service policy
#[utoipa::path(
    get,
    path = "/edge/management/v1/service-policies/{id}",
    params(("id" = String, Path, description = "Service policy id")),
    responses(
        (status = 200, description = "Service policy"),
        (status = 404, description = "Not found", body = ErrorResponse)
    ),
    tag = "Service Policies",
    security(("zt_session" = []), ("bearer_auth" = []))
)]
pub async fn get_service_policy(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let tables = state.db.read().await;
    let policy = tables
        .service_policies
        .get(&id)
        .cloned()
        .ok_or(ServiceError::NotFound("service policy"))?;
    Ok(Envelope::new(policy))
}

async fn apply_policy_patch(state: &AppState, id: &str, patch: PatchServicePolicyRequest) -> Result<(), AppError> {
    {
        let mut tables = state.db.write().await;
        let policy = tables
            .service_policies
            .get_mut(id)
            .ok_or(ServiceError::NotFound("service policy"))?;
        if let Some(name) = patch.name {
            if name.trim().is_empty() {
                return Err(ServiceError::validation("name is required").into());
            }
            policy.name = name;
        }
        if let Some(policy_type) = patch.policy_type {
            policy.policy_type = policy_type;
        }
        if let Some(semantic) = patch.semantic {
            policy.semantic = semantic;
        }
        if let Some(roles) = patch.identity_roles {
            policy.identity_roles = roles;
        }
        if let Some(roles) = patch.service_roles {
            policy.service_roles = roles;
        }
        if let Some(tags) = patch.tags {
            policy.tags = tags;
        }
        policy.updated_at = Utc::now();
    }
    state.hub.notify(EnforcementEvent::PoliciesChanged);
    tracing::info!(policy_id = %id, "Service policy updated");
    Ok(())
}

/// Replace a service policy
#[utoipa::path(
    put,
    path = "/edge/management/v1/service-policies/{id}",
    params(("id" = String, Path, description = "Service policy id")),
    request_body = ServicePolicyRequest,
    responses(
        (status = 200, description = "Service policy updated"),
        (status = 404, description = "Not found", body = ErrorResponse)
    ),
    tag = "Service Policies",
    security(("zt_session" = []), ("bearer_auth" = []))
)]
pub async fn update_service_policy(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ValidatedJson(req): ValidatedJson<ServicePolicyRequest>,
) -> Result<impl IntoResponse, AppError> {
    let patch = PatchServicePolicyRequest {
        name: Some(req.name),
        policy_type: Some(req.policy_type),
        semantic: Some(req.semantic),
        identity_roles: Some(req.identity_roles),
        service_roles: Some(req.service_roles),
        tags: Some(req.tags),
    };
    apply_policy_patch(&state, &id, patch).await?;
    Ok(dtos::empty())
}

/// Update selected fields of a service policy
#[utoipa::path(
    patch,
    path = "/edge/management/v1/service-policies/{id}",
    params(("id" = String, Path, description = "Service policy id")),
    request_body = PatchServicePolicyRequest,
    responses(
        (status = 200, description = "Service policy updated"),
        (status = 404, description = "Not found", body = ErrorResponse)
    ),
    tag = "Service Policies",
    security(("zt_session" = []), ("bearer_auth" = []))
)]
pub async fn patch_service_policy(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<PatchServicePolicyRequest>,
) -> Result<impl IntoResponse, AppError> {
    apply_policy_patch(&state, &id, patch).await?;
    Ok(dtos::empty())
}

/// Delete a service policy; sessions it alone granted are revoked
#[utoipa::path(
    delete,
    path = "/edge/management/v1/service-policies/{id}",
    params(("id" = String, Path, description = "Service policy id")),
    responses(
        (status = 200, description = "Service policy deleted"),
        (status = 404, description = "Not found", body = ErrorResponse)
    ),
    tag = "Service Policies",
    security(("zt_session" = []), ("bearer_auth" = []))
)]
pub async fn delete_service_policy(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    state
        .db
        .write()
        .await
        .service_policies
        .remove(&id)
        .ok_or(ServiceError::NotFound("service policy"))?;
    state.hub.notify(EnforcementEvent::PoliciesChanged);

    tracing::info!(policy_id = %id, "Service policy deleted");
    Ok(dtos::empty())
}

// ============================================================================
// Client view
// ============================================================================

fn permissions(tables: &Tables, identity_id: &str, service_id: &str) -> Vec<PolicyType> {
    [PolicyType::Dial, PolicyType::Bind]
        .into_iter()
        .filter(|kind| is_permitted(tables, identity_id, service_id, *kind))
        .collect()
}

/// Services the caller may dial or bind
#[utoipa::path(
    get,
    path = "/edge/client/v1/services",
    responses((status = 200, description = "Permitted services")),
    tag = "Client Services",
    security(("zt_session" = []), ("bearer_auth" = []))
)]
pub async fn list_permitted_services(
    State(state): State<AppState>,
    Principal(session): Principal,
) -> impl IntoResponse {
    let tables = state.db.read().await;
    let mut services: Vec<&Service> = tables.services.values().collect();
    services.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    let permitted: Vec<serde_json::Value> = services
        .into_iter()
        .filter_map(|service| {
            let perms = permissions(&tables, &session.identity_id, &service.id);
            (!perms.is_empty()).then(|| {
                json!({
                    "id": service.id,
                    "name": service.name,
                    "roleAttributes": service.role_attributes,
                    "permissions": perms,
                })
            })
        })
        .collect();
    let total = permitted.len();
    Envelope::list(permitted, total)
}

/// A service the caller may dial or bind
#[utoipa::path(
    get,
    path = "/edge/client/v1/services/{id}",
    params(("id" = String, Path, description = "Service id")),
    responses(
        (status = 200, description = "Service"),
        (status = 404, description = "Not found or not permitted", body = ErrorResponse)
    ),
    tag = "Client Services",
    security(("zt_session" = []), ("bearer_auth" = []))
)]
pub async fn get_permitted_service(
    State(state): State<AppState>,
    Principal(session): Principal,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let tables = state.db.read().await;
    let service = tables.service(&id)?;
    let perms = permissions(&tables, &session.identity_id, &service.id);
    if perms.is_empty() {
        return Err(ServiceError::NotFound("service").into());
    }
    Ok(Envelope::new(json!({
        "id": service.id,
        "name": service.name,
        "roleAttributes": service.role_attributes,
        "permissions": perms,
    })))
}
