//! Client enrollment endpoints.
//!
//! Certificate-issuing methods negotiate `application/x-pem-file`: a caller
//! that sends or accepts PEM gets the bare certificate back, and on failure
//! an empty body whose status carries the error.

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, HeaderMap},
    response::{IntoResponse, Response},
};
use serde_json::json;
use service_core::error::AppError;

use super::{decode_body, is_pem};
use crate::{
    dtos::{
        client::{EnrollQuery, EnrollRequest},
        Envelope,
    },
    middleware::{bearer_token, ClientCert},
    models::EnrollmentMethod,
    services::{ext_jwt::TOKEN_ISSUER_ID_HEADER, IssuedCert, ServiceError},
    AppState, PEM_CONTENT_TYPE,
};

fn wants_pem(headers: &HeaderMap) -> bool {
    is_pem(headers)
        || headers
            .get(header::ACCEPT)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|accept| accept.contains(PEM_CONTENT_TYPE))
}

/// The request body: a bare PEM CSR or a JSON/form [`EnrollRequest`].
fn enroll_body(headers: &HeaderMap, body: &[u8]) -> Result<EnrollRequest, AppError> {
    if is_pem(headers) {
        let csr = String::from_utf8(body.to_vec())
            .map_err(|_| ServiceError::MissingOrInvalidCsr("the CSR is not valid UTF-8".into()))?;
        return Ok(EnrollRequest {
            csr: Some(csr).filter(|c| !c.trim().is_empty()),
            ..EnrollRequest::default()
        });
    }
    decode_body(headers, body)
}

fn enrollment_token(query: &EnrollQuery, body: &EnrollRequest) -> Result<String, AppError> {
    query
        .token
        .clone()
        .or_else(|| body.token.clone())
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ServiceError::InvalidEnrollmentToken("an enrollment token is required".into()).into())
}

fn cert_response(state: &AppState, headers: &HeaderMap, issued: Result<IssuedCert, AppError>) -> Response {
    let pem = wants_pem(headers);
    match issued {
        Ok(cert) if pem => ([(header::CONTENT_TYPE, PEM_CONTENT_TYPE)], cert.pem).into_response(),
        Ok(cert) => Envelope::new(json!({
            "cert": cert.pem,
            "ca": state.certs.ca_pem(),
        }))
        .into_response(),
        Err(err) if pem => {
            tracing::warn!(status = %err.status(), code = err.code(), error = %err, "Enrollment failed");
            (err.status(), [(header::CONTENT_TYPE, PEM_CONTENT_TYPE)]).into_response()
        }
        Err(err) => err.into_response(),
    }
}

async fn ott(state: &AppState, query: &EnrollQuery, headers: &HeaderMap, body: &[u8]) -> Response {
    let issued = async {
        let req = enroll_body(headers, body)?;
        let token = enrollment_token(query, &req)?;
        Ok::<_, AppError>(state.enrollment.enroll_ott(&token, req.csr.as_deref()).await?)
    }
    .await;
    cert_response(state, headers, issued)
}

async fn ottca(
    state: &AppState,
    query: &EnrollQuery,
    chain: Option<Vec<Vec<u8>>>,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Response, AppError> {
    let req = enroll_body(headers, body)?;
    let token = enrollment_token(query, &req)?;
    let authenticator = state
        .enrollment
        .enroll_ottca(&token, &chain.unwrap_or_default())
        .await?;
    Ok(Envelope::new(json!({ "authenticatorId": authenticator.id })).into_response())
}

async fn updb(state: &AppState, query: &EnrollQuery, headers: &HeaderMap, body: &[u8]) -> Result<Response, AppError> {
    let req = enroll_body(headers, body)?;
    let token = enrollment_token(query, &req)?;
    let authenticator = state
        .enrollment
        .enroll_updb(&token, req.password.as_deref().unwrap_or_default())
        .await?;
    Ok(Envelope::new(json!({ "authenticatorId": authenticator.id })).into_response())
}

async fn ca(
    state: &AppState,
    chain: Option<Vec<Vec<u8>>>,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Response, AppError> {
    let req = enroll_body(headers, body)?;
    let identity = state
        .enrollment
        .enroll_ca_auto(&chain.unwrap_or_default(), req.name.as_deref())
        .await?;
    Ok(Envelope::new(json!({ "identityId": identity.id, "name": identity.name })).into_response())
}

/// Enroll with the method named in the query
#[utoipa::path(
    post,
    path = "/edge/client/v1/enroll",
    params(EnrollQuery),
    request_body = EnrollRequest,
    responses(
        (status = 200, description = "Enrolled"),
        (status = 400, description = "Invalid token, CSR or method", body = ErrorResponse),
        (status = 409, description = "Already enrolled", body = ErrorResponse)
    ),
    tag = "Enrollment"
)]
pub async fn enroll(
    State(state): State<AppState>,
    Query(query): Query<EnrollQuery>,
    ClientCert(chain): ClientCert,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let method = query.method.clone().unwrap_or_else(|| "ott".to_string());
    if method.eq_ignore_ascii_case("ca") {
        return ca(&state, chain, &headers, &body).await;
    }
    match method.parse::<EnrollmentMethod>() {
        Ok(EnrollmentMethod::Ott) => Ok(ott(&state, &query, &headers, &body).await),
        Ok(EnrollmentMethod::Ottca) => ottca(&state, &query, chain, &headers, &body).await,
        Ok(EnrollmentMethod::Updb) => updb(&state, &query, &headers, &body).await,
        Err(e) => Err(ServiceError::validation(e).into()),
    }
}

/// Enroll with a one-time token and receive a client certificate
#[utoipa::path(
    post,
    path = "/edge/client/v1/enroll/ott",
    params(EnrollQuery),
    request_body(content = String, content_type = "application/x-pem-file", description = "PKCS#10 CSR"),
    responses(
        (status = 200, description = "Signed client certificate", content_type = "application/x-pem-file"),
        (status = 400, description = "Invalid token or CSR"),
        (status = 409, description = "Already enrolled")
    ),
    tag = "Enrollment"
)]
pub async fn enroll_ott(
    State(state): State<AppState>,
    Query(query): Query<EnrollQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    ott(&state, &query, &headers, &body).await
}

/// Enroll a certificate issued by a verified third-party CA
#[utoipa::path(
    post,
    path = "/edge/client/v1/enroll/ottca",
    params(EnrollQuery),
    responses(
        (status = 200, description = "Authenticator created"),
        (status = 400, description = "Invalid token or certificate", body = ErrorResponse)
    ),
    tag = "Enrollment"
)]
pub async fn enroll_ottca(
    State(state): State<AppState>,
    Query(query): Query<EnrollQuery>,
    ClientCert(chain): ClientCert,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    ottca(&state, &query, chain, &headers, &body).await
}

/// Set the password of a UPDB enrollment
#[utoipa::path(
    post,
    path = "/edge/client/v1/enroll/updb",
    params(EnrollQuery),
    request_body = EnrollRequest,
    responses(
        (status = 200, description = "Authenticator created"),
        (status = 400, description = "Invalid token or password", body = ErrorResponse)
    ),
    tag = "Enrollment"
)]
pub async fn enroll_updb(
    State(state): State<AppState>,
    Query(query): Query<EnrollQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    updb(&state, &query, &headers, &body).await
}

/// Create an identity from a certificate of an auto-enrollment CA
#[utoipa::path(
    post,
    path = "/edge/client/v1/enroll/ca",
    request_body = EnrollRequest,
    responses(
        (status = 200, description = "Identity created"),
        (status = 400, description = "Certificate rejected", body = ErrorResponse),
        (status = 409, description = "Certificate in use", body = ErrorResponse)
    ),
    tag = "Enrollment"
)]
pub async fn enroll_ca(
    State(state): State<AppState>,
    ClientCert(chain): ClientCert,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    ca(&state, chain, &headers, &body).await
}

/// Exchange an external JWT for a new identity
#[utoipa::path(
    post,
    path = "/edge/client/v1/enroll/token",
    request_body(content = String, content_type = "application/x-pem-file", description = "Optional CSR"),
    responses(
        (status = 200, description = "Identity created, with a certificate when a CSR was sent"),
        (status = 400, description = "Token rejected", body = ErrorResponse),
        (status = 409, description = "Already enrolled", body = ErrorResponse)
    ),
    tag = "Enrollment",
    security(("bearer_auth" = []))
)]
pub async fn enroll_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let result = async {
        let req = enroll_body(&headers, &body)?;
        let issuer_id = headers.get(TOKEN_ISSUER_ID_HEADER).and_then(|v| v.to_str().ok());
        Ok::<_, AppError>(
            state
                .enrollment
                .enroll_token(bearer_token(&headers), issuer_id, req.csr.as_deref())
                .await?,
        )
    }
    .await;

    match result {
        Ok(enrolled) => match enrolled.cert {
            Some(cert) => cert_response(&state, &headers, Ok(cert)),
            None => Envelope::new(json!({
                "identityId": enrolled.identity.id,
                "name": enrolled.identity.name,
            }))
            .into_response(),
        },
        Err(err) => cert_response(&state, &headers, Err(err)),
    }
}
