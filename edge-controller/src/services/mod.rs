//! Services layer for the edge controller.
//!
//! Business logic for authentication, enrollment, MFA, certificates and
//! live enforcement of service policies.

pub mod auth;
pub mod certs;
mod database;
pub mod enforcement;
pub mod enrollment;
pub mod error;
pub mod ext_jwt;
mod jwt;
pub mod metrics;
pub mod oidc;
pub mod policy;
pub mod totp;

pub use auth::{AuthError, AuthOutcome, AuthService, PrimaryCredential, SecondaryCheck};
pub use certs::{CertService, IssuedCert};
pub use database::{Database, Tables};
pub use enforcement::{Circuit, EnforcementEvent, EnforcementHub, Listener};
pub use enrollment::{EnrollmentService, NewEnrollment, TokenEnrollment};
pub use error::ServiceError;
pub use jwt::{
    EdgeClaims, JwtService, TokenError, TokenResponse, TokenSubject, AUDIENCE, CLIENT_ID,
    TOKEN_TYPE_ACCESS, TOKEN_TYPE_REFRESH, TOKEN_TYPE_TOTP,
};
pub use oidc::OidcStore;
pub use policy::{AuthQuery, PolicyService};
pub use totp::{MfaProof, MfaService};
