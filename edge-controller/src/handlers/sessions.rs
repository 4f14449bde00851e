use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use service_core::error::AppError;

use crate::{
    dtos::{self, client::CreateSessionRequest, Envelope},
    middleware::Principal,
    models::EdgeSession,
    services::{enforcement::is_permitted, ServiceError},
    AppState,
};

/// The caller's edge sessions
#[utoipa::path(
    get,
    path = "/edge/client/v1/sessions",
    responses((status = 200, description = "Edge sessions")),
    tag = "Sessions",
    security(("zt_session" = []), ("bearer_auth" = []))
)]
pub async fn list_sessions(
    State(state): State<AppState>,
    Principal(session): Principal,
) -> impl IntoResponse {
    let tables = state.db.read().await;
    let mut sessions: Vec<EdgeSession> = tables
        .edge_sessions
        .values()
        .filter(|s| s.api_session_id == session.id)
        .cloned()
        .collect();
    sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    let total = sessions.len();
    Envelope::list(sessions, total)
}

/// Open a dial or bind session on a service
#[utoipa::path(
    post,
    path = "/edge/client/v1/sessions",
    request_body = CreateSessionRequest,
    responses(
        (status = 201, description = "Session created"),
        (status = 403, description = "No policy grants the access", body = ErrorResponse),
        (status = 404, description = "Service not found", body = ErrorResponse)
    ),
    tag = "Sessions",
    security(("zt_session" = []), ("bearer_auth" = []))
)]
pub async fn create_session(
    State(state): State<AppState>,
    Principal(session): Principal,
    Json(req): Json<CreateSessionRequest>,
) -> Result<impl IntoResponse, AppError> {
    let edge_session = {
        let mut tables = state.db.write().await;
        // A logout racing this request may already have swept the API
        // session's edge sessions.
        if state.db.api_session(&session.id).is_none() {
            return Err(ServiceError::NotFound("api session").into());
        }
        tables.service(&req.service_id)?;
        if !is_permitted(&tables, &session.identity_id, &req.service_id, req.session_type) {
            return Err(AppError::api(
                StatusCode::FORBIDDEN,
                "UNAUTHORIZED",
                format!("no service policy grants {:?} on service {}", req.session_type, req.service_id),
            ));
        }
        let edge_session = EdgeSession::new(
            session.id.clone(),
            session.identity_id.clone(),
            req.service_id,
            req.session_type,
        );
        tables
            .edge_sessions
            .insert(edge_session.id.clone(), edge_session.clone());
        // Revocation takes the same lock, so it cannot miss the token.
        state.hub.register(&edge_session);
        edge_session
    };

    tracing::info!(
        identity_id = %session.identity_id,
        edge_session_id = %edge_session.id,
        service_id = %edge_session.service_id,
        session_type = ?edge_session.session_type,
        "Edge session created"
    );
    Ok((StatusCode::CREATED, Envelope::new(edge_session)))
}

/// Get one of the caller's edge sessions
#[utoipa::path(
    get,
    path = "/edge/client/v1/sessions/{id}",
    params(("id" = String, Path, description = "Edge session id")),
    responses(
        (status = 200, description = "Edge session"),
        (status = 404, description = "Not found", body = ErrorResponse)
    ),
    tag = "Sessions",
    security(("zt_session" = []), ("bearer_auth" = []))
)]
pub async fn get_session(
    State(state): State<AppState>,
    Principal(session): Principal,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let tables = state.db.read().await;
    let edge_session = tables
        .edge_sessions
        .get(&id)
        .filter(|s| s.api_session_id == session.id)
        .cloned()
        .ok_or(ServiceError::NotFound("session"))?;
    Ok(Envelope::new(edge_session))
}

/// Close one of the caller's edge sessions
#[utoipa::path(
    delete,
    path = "/edge/client/v1/sessions/{id}",
    params(("id" = String, Path, description = "Edge session id")),
    responses(
        (status = 200, description = "Session closed"),
        (status = 404, description = "Not found", body = ErrorResponse)
    ),
    tag = "Sessions",
    security(("zt_session" = []), ("bearer_auth" = []))
)]
pub async fn delete_session(
    State(state): State<AppState>,
    Principal(session): Principal,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    {
        let mut tables = state.db.write().await;
        let owned = tables
            .edge_sessions
            .get(&id)
            .is_some_and(|s| s.api_session_id == session.id);
        if !owned {
            return Err(ServiceError::NotFound("session").into());
        }
        tables.edge_sessions.remove(&id);
    }
    state.hub.revoke(&id);
    Ok(dtos::empty())
}
