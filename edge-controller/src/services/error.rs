use axum::http::StatusCode;
use service_core::error::{ApiError, AppError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("{0}")]
    ReferencedNotFound(String),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    InvalidAuth(String),

    #[error("{0}")]
    InvalidAuthMethod(String),

    #[error("{0}")]
    CannotDeleteReferenced(String),

    #[error("an MFA enrollment already exists")]
    MfaExists,

    #[error("the provided MFA code is invalid")]
    MfaInvalidToken,

    #[error("MFA is not enrolled")]
    MfaNotEnrolled,

    #[error("the enrollment has expired")]
    EnrollmentExpired,

    #[error("{0}")]
    InvalidEnrollmentToken(String),

    #[error("{0}")]
    MissingOrInvalidCsr(String),

    #[error("{0}")]
    CouldNotProcessCsr(String),

    #[error("{0}")]
    CertFailedValidation(String),

    #[error("{0}")]
    InvalidEnrollmentNotAllowed(String),

    #[error("an enrollment of this method already exists for the identity")]
    EnrollmentExists,

    #[error("{0}")]
    AlreadyEnrolled(String),

    #[error("the certificate is already in use")]
    CertInUse,

    #[error("{0}")]
    MissingCertClaim(String),

    #[error("the certificate authority is already verified")]
    CaAlreadyVerified,
}

impl ServiceError {
    pub fn validation(msg: impl Into<String>) -> Self {
        ServiceError::Validation(msg.into())
    }

    pub fn invalid_auth(msg: impl Into<String>) -> Self {
        ServiceError::InvalidAuth(msg.into())
    }

    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::Internal(_) => "UNHANDLED",
            ServiceError::NotFound(_) | ServiceError::ReferencedNotFound(_) => "NOT_FOUND",
            ServiceError::Validation(_) => "COULD_NOT_VALIDATE",
            ServiceError::InvalidAuth(_) => "INVALID_AUTH",
            ServiceError::InvalidAuthMethod(_) => "INVALID_AUTH_METHOD",
            ServiceError::CannotDeleteReferenced(_) => "CAN_NOT_DELETE_REFERENCED_ENTITY",
            ServiceError::MfaExists => "MFA_EXISTS",
            ServiceError::MfaInvalidToken => "MFA_INVALID_TOKEN",
            ServiceError::MfaNotEnrolled => "MFA_NOT_ENROLLED",
            ServiceError::EnrollmentExpired => "ENROLLMENT_EXPIRED",
            ServiceError::InvalidEnrollmentToken(_) => "INVALID_ENROLLMENT_TOKEN",
            ServiceError::MissingOrInvalidCsr(_) => "MISSING_OR_INVALID_CSR",
            ServiceError::CouldNotProcessCsr(_) => "COULD_NOT_PROCESS_CSR",
            ServiceError::CertFailedValidation(_) => "CERT_FAILED_VALIDATION",
            ServiceError::InvalidEnrollmentNotAllowed(_) => "INVALID_ENROLLMENT_NOT_ALLOWED",
            ServiceError::EnrollmentExists => "ENROLLMENT_EXISTS",
            ServiceError::AlreadyEnrolled(_) => "ENROLLMENT_IDENTITY_ALREADY_ENROLLED",
            ServiceError::CertInUse => "CERT_IN_USE",
            ServiceError::MissingCertClaim(_) => "MISSING_CERT_CLAIM",
            ServiceError::CaAlreadyVerified => "CA_ALREADY_VERIFIED",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::NotFound(_)
            | ServiceError::ReferencedNotFound(_)
            | ServiceError::MfaNotEnrolled => StatusCode::NOT_FOUND,
            ServiceError::InvalidAuth(_) => StatusCode::UNAUTHORIZED,
            ServiceError::CannotDeleteReferenced(_)
            | ServiceError::MfaExists
            | ServiceError::EnrollmentExists
            | ServiceError::AlreadyEnrolled(_)
            | ServiceError::CertInUse
            | ServiceError::CaAlreadyVerified => StatusCode::CONFLICT,
            ServiceError::Validation(_)
            | ServiceError::InvalidAuthMethod(_)
            | ServiceError::MfaInvalidToken
            | ServiceError::EnrollmentExpired
            | ServiceError::InvalidEnrollmentToken(_)
            | ServiceError::MissingOrInvalidCsr(_)
            | ServiceError::CouldNotProcessCsr(_)
            | ServiceError::CertFailedValidation(_)
            | ServiceError::InvalidEnrollmentNotAllowed(_)
            | ServiceError::MissingCertClaim(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Internal(e) => AppError::InternalError(e),
            other => AppError::Api(ApiError::new(other.status(), other.code(), other.to_string())),
        }
    }
}
