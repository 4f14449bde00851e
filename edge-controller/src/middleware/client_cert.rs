use axum::{
    extract::{FromRequestParts, Request, State},
    http::{request::Parts, HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};

use crate::{services::certs::pem_to_ders, AppState};

/// DER chain (leaf first) forwarded by the TLS terminator, if any.
#[derive(Debug, Clone, Default)]
pub struct ClientCert(pub Option<Vec<Vec<u8>>>);

/// Reads the URL-encoded PEM chain from `header`.
pub fn chain_from_headers(headers: &HeaderMap, header: &str) -> Option<Vec<Vec<u8>>> {
    let raw = headers.get(header)?.to_str().ok()?;
    let pem = urlencoding::decode(raw).ok()?;
    match pem_to_ders(&pem) {
        Ok(chain) => Some(chain),
        Err(e) => {
            tracing::debug!(error = %e, "Ignoring unreadable client certificate header");
            None
        }
    }
}

pub async fn client_cert_middleware(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let chain = chain_from_headers(req.headers(), &state.config.security.client_cert_header);
    req.extensions_mut().insert(ClientCert(chain));
    next.run(req).await
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for ClientCert
where
    S: Send + Sync,
{
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts.extensions.get::<ClientCert>().cloned().unwrap_or_default())
    }
}
