pub mod api_session;
pub mod auth_policy;
pub mod authenticator;
pub mod ca;
pub mod edge_session;
pub mod enrollment;
pub mod ext_jwt_signer;
pub mod identity;
pub mod mfa;
pub mod service;

pub use api_session::{ApiSession, AuthMethod, SessionKind};
pub use auth_policy::{
    AuthPolicy, AuthPolicyPrimary, AuthPolicySecondary, PrimaryCert, PrimaryExtJwt, PrimaryUpdb,
    DEFAULT_AUTH_POLICY_ID,
};
pub use authenticator::{Authenticator, AuthenticatorView, Credential};
pub use ca::{
    CertClaims, CertificateAuthority, ClaimLocation, ClaimMatcher, ClaimParser, ExternalIdClaim,
};
pub use edge_session::EdgeSession;
pub use enrollment::{Enrollment, EnrollmentMethod};
pub use ext_jwt_signer::{ExternalJwtSigner, TargetToken};
pub use identity::Identity;
pub use mfa::Mfa;
pub use service::{PolicyType, Semantic, Service, ServicePolicy};
