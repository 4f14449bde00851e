use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use service_core::error::AppError;

use crate::{
    dtos::{
        self,
        management::{CreateEnrollmentRequest, RefreshEnrollmentRequest},
        Envelope,
    },
    models::EnrollmentMethod,
    services::{NewEnrollment, ServiceError},
    AppState,
};

/// Create an enrollment for an existing identity
#[utoipa::path(
    post,
    path = "/edge/management/v1/enrollments",
    request_body = CreateEnrollmentRequest,
    responses(
        (status = 201, description = "Enrollment created"),
        (status = 400, description = "Invalid request", body = ErrorResponse),
        (status = 409, description = "An enrollment of this method exists", body = ErrorResponse)
    ),
    tag = "Enrollments",
    security(("zt_session" = []), ("bearer_auth" = []))
)]
pub async fn create_enrollment(
    State(state): State<AppState>,
    Json(req): Json<CreateEnrollmentRequest>,
) -> Result<impl IntoResponse, AppError> {
    let method = req
        .method
        .as_deref()
        .map(str::parse::<EnrollmentMethod>)
        .transpose()
        .map_err(ServiceError::Validation)?;
    let enrollment = state
        .enrollment
        .create(NewEnrollment {
            identity_id: req.identity_id,
            method,
            expires_at: req.expires_at,
            ca_id: req.ca_id,
            username: req.username,
        })
        .await?;
    Ok(dtos::created(&enrollment.id))
}

/// List enrollments
#[utoipa::path(
    get,
    path = "/edge/management/v1/enrollments",
    responses((status = 200, description = "Enrollments")),
    tag = "Enrollments",
    security(("zt_session" = []), ("bearer_auth" = []))
)]
pub async fn list_enrollments(State(state): State<AppState>) -> impl IntoResponse {
    let enrollments = state.enrollment.list().await;
    let total = enrollments.len();
    Envelope::list(enrollments, total)
}

/// Get an enrollment
#[utoipa::path(
    get,
    path = "/edge/management/v1/enrollments/{id}",
    params(("id" = String, Path, description = "Enrollment id")),
    responses(
        (status = 200, description = "Enrollment"),
        (status = 404, description = "Not found", body = ErrorResponse)
    ),
    tag = "Enrollments",
    security(("zt_session" = []), ("bearer_auth" = []))
)]
pub async fn get_enrollment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Envelope::new(state.enrollment.get(&id).await?))
}

/// Delete an enrollment
#[utoipa::path(
    delete,
    path = "/edge/management/v1/enrollments/{id}",
    params(("id" = String, Path, description = "Enrollment id")),
    responses(
        (status = 200, description = "Enrollment deleted"),
        (status = 404, description = "Not found", body = ErrorResponse)
    ),
    tag = "Enrollments",
    security(("zt_session" = []), ("bearer_auth" = []))
)]
pub async fn delete_enrollment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    state.enrollment.delete(&id).await?;
    Ok(dtos::empty())
}

/// Extend an enrollment and rotate its token
#[utoipa::path(
    post,
    path = "/edge/management/v1/enrollments/{id}/refresh",
    params(("id" = String, Path, description = "Enrollment id")),
    request_body = RefreshEnrollmentRequest,
    responses(
        (status = 200, description = "Enrollment refreshed"),
        (status = 400, description = "expiresAt is not in the future", body = ErrorResponse),
        (status = 404, description = "Not found", body = ErrorResponse)
    ),
    tag = "Enrollments",
    security(("zt_session" = []), ("bearer_auth" = []))
)]
pub async fn refresh_enrollment(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<RefreshEnrollmentRequest>,
) -> Result<impl IntoResponse, AppError> {
    let enrollment = state.enrollment.refresh(&id, req.expires_at).await?;
    Ok(Envelope::new(enrollment))
}
