use axum::{extract::State, response::IntoResponse};
use serde::Serialize;
use utoipa::ToSchema;

use crate::{dtos::Envelope, AppState};

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    pub version: String,
    pub issuer: String,
    /// API name to base path.
    #[schema(value_type = Object)]
    pub api_versions: serde_json::Value,
}

/// Controller version and API base paths
#[utoipa::path(
    get,
    path = "/edge/client/v1/version",
    responses((status = 200, description = "Version information", body = VersionInfo)),
    tag = "Well-Known"
)]
pub async fn version(State(state): State<AppState>) -> impl IntoResponse {
    Envelope::new(VersionInfo {
        version: state.config.service_version.clone(),
        issuer: state.config.issuer.clone(),
        api_versions: serde_json::json!({
            "edge-client": { "v1": { "path": "/edge/client/v1" } },
            "edge-management": { "v1": { "path": "/edge/management/v1" } },
            "oidc": { "v1": { "path": "/oidc" } },
        }),
    })
}
