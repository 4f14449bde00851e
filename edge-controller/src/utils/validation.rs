use axum::{
    extract::{FromRequest, Request},
    http::StatusCode,
    Json,
};
use serde::de::DeserializeOwned;
use service_core::error::AppError;
use validator::Validate;

/// JSON body extractor that runs `validator` rules before the handler sees
/// the value. Parse failures are 400 `COULD_NOT_PARSE_BODY`; rule failures
/// are 400 `COULD_NOT_VALIDATE`.
pub struct ValidatedJson<T>(pub T);

#[axum::async_trait]
impl<T, S> FromRequest<S> for ValidatedJson<T>
where
    T: DeserializeOwned + Validate + 'static,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await.map_err(|e| {
            AppError::api(
                StatusCode::BAD_REQUEST,
                "COULD_NOT_PARSE_BODY",
                format!("Json parse error: {}", e.body_text()),
            )
        })?;

        value.validate()?;

        Ok(ValidatedJson(value))
    }
}
