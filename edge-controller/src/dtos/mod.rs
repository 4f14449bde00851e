pub mod client;
pub mod management;

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use utoipa::ToSchema;

/// Every successful body is `{"data": ..., "meta": {...}}`.
#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub data: T,
    pub meta: Value,
}

impl<T: Serialize> Envelope<T> {
    pub fn new(data: T) -> Json<Self> {
        Json(Self {
            data,
            meta: json!({}),
        })
    }

    pub fn list(data: T, total: usize) -> Json<Self> {
        Json(Self {
            data,
            meta: json!({ "pagination": { "totalCount": total } }),
        })
    }
}

/// 201 with the new entity's id.
pub fn created(id: &str) -> impl IntoResponse {
    (StatusCode::CREATED, Envelope::new(json!({ "id": id })))
}

/// 200 with an empty data object.
pub fn empty() -> Json<Envelope<Value>> {
    Envelope::new(json!({}))
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorBody {
    #[schema(example = "INVALID_AUTH")]
    pub code: String,
    #[schema(example = "invalid username or password")]
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub error: ErrorBody,
    #[schema(value_type = Object)]
    pub meta: Value,
}

/// Body of code-bearing MFA calls.
#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct CodeRequest {
    #[serde(default)]
    #[schema(example = "123456")]
    pub code: String,
}
