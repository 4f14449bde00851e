use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// A coded API error. `code` is the stable machine-readable identifier
/// clients switch on; `message` is for humans.
#[derive(Debug, Clone)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub cause: Option<String>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    ValidationError(#[from] validator::ValidationErrors),

    #[error("Bad request: {0}")]
    BadRequest(anyhow::Error),

    #[error("Not found: {0}")]
    NotFound(anyhow::Error),

    #[error("Unauthorized: {0}")]
    Unauthorized(anyhow::Error),

    #[error("Forbidden: {0}")]
    Forbidden(anyhow::Error),

    #[error("Authentication error: {0}")]
    AuthError(anyhow::Error),

    #[error("Conflict: {0}")]
    Conflict(anyhow::Error),

    #[error("Too many requests: {0}")]
    TooManyRequests(String, Option<u64>),

    #[error("Internal server error: {0}")]
    InternalError(#[from] anyhow::Error),

    #[error("Service Unavailable")]
    ServiceUnavailable,

    #[error("Invalid token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),

    #[error("Configuration error: {0}")]
    ConfigError(anyhow::Error),

    #[error("{0}")]
    Api(ApiError),

    /// An unauthorized response carrying one `WWW-Authenticate` value per
    /// challenged credential. An empty list emits no challenge headers.
    #[error("{0}")]
    Challenge(ApiError, Vec<String>),
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(anyhow::Error::new(err))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::InternalError(anyhow::Error::new(err))
    }
}

impl From<ApiError> for AppError {
    fn from(err: ApiError) -> Self {
        AppError::Api(err)
    }
}

impl AppError {
    /// Shorthand for a coded error.
    pub fn api(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        AppError::Api(ApiError::new(status, code, message))
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::ValidationError(_) | AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Unauthorized(_) | AppError::AuthError(_) | AppError::InvalidToken(_) => {
                StatusCode::UNAUTHORIZED
            }
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::TooManyRequests(..) => StatusCode::TOO_MANY_REQUESTS,
            AppError::InternalError(_) | AppError::ConfigError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            AppError::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Api(err) | AppError::Challenge(err, _) => err.status,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AppError::ValidationError(_) => "COULD_NOT_VALIDATE",
            AppError::BadRequest(_) => "BAD_REQUEST",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Unauthorized(_) | AppError::AuthError(_) => "UNAUTHORIZED",
            AppError::Forbidden(_) => "FORBIDDEN",
            AppError::Conflict(_) => "CONFLICT",
            AppError::TooManyRequests(..) => "RATE_LIMITED",
            AppError::InternalError(_) | AppError::ConfigError(_) => "UNHANDLED",
            AppError::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            AppError::InvalidToken(_) => "INVALID_AUTH",
            AppError::Api(err) | AppError::Challenge(err, _) => err.code,
        }
    }
}

#[derive(Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
    meta: serde_json::Value,
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    cause: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();

        let (message, cause, retry_after, challenges) = match self {
            AppError::ValidationError(err) => (
                "Validation error".to_string(),
                Some(err.to_string()),
                None,
                Vec::new(),
            ),
            AppError::BadRequest(err)
            | AppError::NotFound(err)
            | AppError::Unauthorized(err)
            | AppError::Forbidden(err)
            | AppError::AuthError(err)
            | AppError::Conflict(err) => (err.to_string(), None, None, Vec::new()),
            AppError::TooManyRequests(msg, retry) => (msg, None, retry, Vec::new()),
            AppError::InternalError(err) => {
                tracing::error!(error = ?err, "Internal server error");
                ("Internal server error".to_string(), None, None, Vec::new())
            }
            AppError::ServiceUnavailable => {
                ("Service unavailable".to_string(), None, None, Vec::new())
            }
            AppError::InvalidToken(err) => (
                "Invalid token".to_string(),
                Some(err.to_string()),
                None,
                Vec::new(),
            ),
            AppError::ConfigError(err) => {
                tracing::error!(error = %err, "Configuration error");
                ("Configuration error".to_string(), None, None, Vec::new())
            }
            AppError::Api(err) => (err.message, err.cause, None, Vec::new()),
            AppError::Challenge(err, challenges) => (err.message, err.cause, None, challenges),
        };

        let mut res = (
            status,
            Json(ErrorEnvelope {
                error: ErrorBody {
                    code,
                    message,
                    cause,
                },
                meta: serde_json::json!({}),
            }),
        )
            .into_response();

        if let Some(retry) = retry_after {
            res.headers_mut().insert(header::RETRY_AFTER, retry.into());
        }

        for challenge in challenges {
            match HeaderValue::from_str(&challenge) {
                Ok(value) => {
                    res.headers_mut().append(header::WWW_AUTHENTICATE, value);
                }
                Err(e) => tracing::warn!(error = %e, "Dropping unencodable challenge header"),
            }
        }

        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn body_json(res: Response) -> serde_json::Value {
        let bytes = res.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn coded_error_renders_envelope() {
        let res = AppError::api(StatusCode::CONFLICT, "MFA_EXISTS", "mfa already exists")
            .into_response();
        assert_eq!(res.status(), StatusCode::CONFLICT);
        let body = body_json(res).await;
        assert_eq!(body["error"]["code"], "MFA_EXISTS");
        assert_eq!(body["error"]["message"], "mfa already exists");
        assert!(body["meta"].is_object());
    }

    #[tokio::test]
    async fn challenge_appends_one_header_per_value() {
        let err = AppError::Challenge(
            ApiError::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", "missing credentials"),
            vec![
                r#"Bearer error="missing""#.to_string(),
                r#"zt-session error="missing""#.to_string(),
            ],
        );
        let res = err.into_response();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(res.headers().get_all(header::WWW_AUTHENTICATE).iter().count(), 2);
    }

    #[tokio::test]
    async fn rate_limited_sets_retry_after() {
        let res = AppError::TooManyRequests("slow down".into(), Some(7)).into_response();
        assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(res.headers().get(header::RETRY_AFTER).unwrap(), "7");
        let body = body_json(res).await;
        assert_eq!(body["error"]["code"], "RATE_LIMITED");
    }
}
