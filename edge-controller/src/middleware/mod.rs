pub mod auth;
pub mod client_cert;

pub use auth::{
    bearer_token, require_admin, require_full_session, require_partial_session,
    resolve_auth_middleware, Principal, RequestAuth, ZT_SESSION_HEADER,
};
pub use client_cert::{chain_from_headers, client_cert_middleware, ClientCert};
