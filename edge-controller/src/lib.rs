pub mod config;
pub mod dtos;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod utils;

use axum::{
    extract::State,
    http::{header, HeaderName, HeaderValue, Method},
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post, put},
    Json, Router,
};
use service_core::error::AppError;
use service_core::middleware::{
    metrics::metrics_middleware,
    rate_limit::{create_ip_rate_limiter, ip_rate_limit_middleware, IpRateLimiter},
    security_headers::security_headers_middleware,
    tracing::request_id_middleware,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utoipa::{
    openapi::security::{ApiKey, ApiKeyValue, HttpAuthScheme, HttpBuilder, SecurityScheme},
    Modify, OpenApi,
};
use utoipa_swagger_ui::SwaggerUi;

use crate::config::ControllerConfig;
use crate::handlers::{
    auth_policies, authenticate, authenticators, cas, current, enroll, enrollments, ext_jwt_signers,
    identities, mfa, oidc, services as service_handlers, sessions, version,
};
use crate::middleware::{
    client_cert_middleware, require_admin, require_full_session, require_partial_session,
    resolve_auth_middleware, ZT_SESSION_HEADER,
};
use crate::services::{
    certs::parse_der, ext_jwt::TOKEN_ISSUER_ID_HEADER, AuthService, CertService, Database, EnforcementHub,
    EnrollmentService, JwtService, MfaService, OidcStore,
};

/// Content type of PEM certificate and CSR bodies.
pub const PEM_CONTENT_TYPE: &str = "application/x-pem-file";

#[derive(OpenApi)]
#[openapi(
    paths(
        health_check,
        handlers::metrics::metrics,
        version::version,
        authenticate::authenticate,
        authenticate::authenticate_mfa,
        current::get_current_api_session,
        current::delete_current_api_session,
        current::create_totp_token,
        current::get_current_identity,
        current::list_current_authenticators,
        current::change_password,
        current::extend_authenticator,
        current::extend_verify_authenticator,
        mfa::create_mfa,
        mfa::get_mfa,
        mfa::verify_mfa,
        mfa::delete_mfa,
        mfa::mfa_qr_code,
        mfa::get_recovery_codes,
        mfa::regenerate_recovery_codes,
        enroll::enroll,
        enroll::enroll_ott,
        enroll::enroll_ottca,
        enroll::enroll_updb,
        enroll::enroll_ca,
        enroll::enroll_token,
        service_handlers::list_permitted_services,
        service_handlers::get_permitted_service,
        sessions::list_sessions,
        sessions::create_session,
        sessions::get_session,
        sessions::delete_session,
        ext_jwt_signers::list_public_signers,
        identities::create_identity,
        identities::list_identities,
        identities::get_identity,
        identities::update_identity,
        identities::patch_identity,
        identities::delete_identity,
        identities::enable_identity,
        identities::delete_identity_mfa,
        authenticators::create_authenticator,
        authenticators::list_authenticators,
        authenticators::get_authenticator,
        authenticators::delete_authenticator,
        authenticators::request_extend,
        auth_policies::create_auth_policy,
        auth_policies::list_auth_policies,
        auth_policies::get_auth_policy,
        auth_policies::update_auth_policy,
        auth_policies::patch_auth_policy,
        auth_policies::delete_auth_policy,
        ext_jwt_signers::create_signer,
        ext_jwt_signers::list_signers,
        ext_jwt_signers::get_signer,
        ext_jwt_signers::update_signer,
        ext_jwt_signers::patch_signer,
        ext_jwt_signers::delete_signer,
        enrollments::create_enrollment,
        enrollments::list_enrollments,
        enrollments::get_enrollment,
        enrollments::delete_enrollment,
        enrollments::refresh_enrollment,
        cas::create_ca,
        cas::list_cas,
        cas::get_ca,
        cas::patch_ca,
        cas::delete_ca,
        cas::verify_ca,
        service_handlers::create_service,
        service_handlers::list_services,
        service_handlers::get_service,
        service_handlers::update_service,
        service_handlers::patch_service,
        service_handlers::delete_service,
        service_handlers::create_service_policy,
        service_handlers::list_service_policies,
        service_handlers::get_service_policy,
        service_handlers::update_service_policy,
        service_handlers::patch_service_policy,
        service_handlers::delete_service_policy,
        oidc::authorize,
        oidc::login_password,
        oidc::login_cert,
        oidc::login_ext_jwt,
        oidc::login_totp,
        oidc::login_totp_enroll,
        oidc::login_totp_enroll_verify,
        oidc::login_totp_enroll_delete,
        oidc::login_auth_queries,
        oidc::callback,
        oidc::token,
        oidc::keys,
        oidc::discovery,
    ),
    components(
        schemas(
            dtos::ErrorResponse,
            dtos::ErrorBody,
            dtos::CodeRequest,
            dtos::client::UpdbCredentials,
            dtos::client::IdentityRef,
            dtos::client::ApiSessionDetail,
            dtos::client::ChangePasswordRequest,
            dtos::client::ExtendRequest,
            dtos::client::ExtendVerifyRequest,
            dtos::client::IssuedCertResponse,
            dtos::client::EnrollRequest,
            dtos::client::CreateSessionRequest,
            dtos::management::IdentityEnrollments,
            dtos::management::CreateIdentityRequest,
            dtos::management::PatchIdentityRequest,
            dtos::management::CreateAuthenticatorRequest,
            dtos::management::RequestExtendRequest,
            dtos::management::AuthPolicyRequest,
            dtos::management::PatchAuthPolicyRequest,
            dtos::management::ExtJwtSignerRequest,
            dtos::management::PatchExtJwtSignerRequest,
            dtos::management::CreateEnrollmentRequest,
            dtos::management::RefreshEnrollmentRequest,
            dtos::management::CreateCaRequest,
            dtos::management::PatchCaRequest,
            dtos::management::ServiceRequest,
            dtos::management::PatchServiceRequest,
            dtos::management::ServicePolicyRequest,
            dtos::management::PatchServicePolicyRequest,
            services::AuthQuery,
            services::TokenResponse,
            mfa::MfaDetail,
            oidc::LoginBody,
            oidc::TokenRequest,
            version::VersionInfo,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Authentication", description = "Primary and secondary authentication, API sessions"),
        (name = "Current Session", description = "The caller's API session"),
        (name = "Current Identity", description = "The authenticated identity's own resources"),
        (name = "MFA", description = "TOTP enrollment and recovery codes"),
        (name = "Enrollment", description = "Certificate, password and token enrollment"),
        (name = "Client Services", description = "Services the caller may dial or bind"),
        (name = "Services", description = "Service administration"),
        (name = "Service Policies", description = "Policies granting identities access to services"),
        (name = "Sessions", description = "Dial and bind sessions on services"),
        (name = "Identities", description = "Identity administration"),
        (name = "Authenticators", description = "Authenticator administration"),
        (name = "Auth Policies", description = "Authentication policy administration"),
        (name = "External JWT Signers", description = "Trusted third-party token issuers"),
        (name = "Enrollments", description = "Enrollment administration"),
        (name = "Certificate Authorities", description = "Third-party CA administration"),
        (name = "OIDC", description = "OpenID Connect provider"),
        (name = "Well-Known", description = "Public controller metadata"),
        (name = "Observability", description = "Service health and monitoring"),
    )
)]
pub struct ApiDoc;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
            components.add_security_scheme(
                "zt_session",
                SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::new(ZT_SESSION_HEADER))),
            );
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: ControllerConfig,
    pub db: Database,
    pub jwt: JwtService,
    pub certs: CertService,
    pub mfa: MfaService,
    pub auth: AuthService,
    pub enrollment: EnrollmentService,
    pub hub: EnforcementHub,
    pub oidc: OidcStore,
    pub auth_rate_limiter: IpRateLimiter,
    pub ip_rate_limiter: IpRateLimiter,
}

impl AppState {
    /// Wire up the controller's services, create the default administrator
    /// and start the enforcement loop. Must run inside a tokio runtime.
    pub async fn new(config: ControllerConfig) -> Result<Self, AppError> {
        let db = Database::new();
        let certs = CertService::new(&config.pki)?;
        tracing::info!("Controller CA initialized");

        let jwt = JwtService::new(&config.jwt, &config.issuer)?;
        tracing::info!("JWT service initialized");

        let hub = EnforcementHub::new();
        let mfa = MfaService::new(db.clone(), config.mfa.issuer.clone());
        let auth = AuthService::new(db.clone(), certs.clone(), hub.clone(), config.session.timeout_minutes);
        let enrollment = EnrollmentService::new(db.clone(), jwt.clone(), certs.clone());

        let admin = db.bootstrap_admin(&config.bootstrap).await?;
        tracing::info!(identity_id = %admin.id, "Default administrator ready");

        hub.start(db.clone());

        let auth_rate_limiter =
            create_ip_rate_limiter(config.rate_limit.auth_attempts, config.rate_limit.auth_window_seconds);
        let ip_rate_limiter = create_ip_rate_limiter(
            config.rate_limit.global_ip_limit,
            config.rate_limit.global_ip_window_seconds,
        );
        tracing::info!("Rate limiters initialized: Authentication and Global IP");

        Ok(Self {
            config,
            db,
            jwt,
            certs,
            mfa,
            auth,
            enrollment,
            hub,
            oidc: OidcStore::new(),
            auth_rate_limiter,
            ip_rate_limiter,
        })
    }
}

fn client_api(state: &AppState) -> Router<AppState> {
    let auth_limiter = state.auth_rate_limiter.clone();
    let public = Router::new()
        .route("/authenticate", post(authenticate::authenticate))
        .route("/enroll", post(enroll::enroll))
        .route("/enroll/ott", post(enroll::enroll_ott))
        .route("/enroll/ottca", post(enroll::enroll_ottca))
        .route("/enroll/updb", post(enroll::enroll_updb))
        .route("/enroll/ca", post(enroll::enroll_ca))
        .route("/enroll/token", post(enroll::enroll_token))
        .route_layer(from_fn_with_state(auth_limiter, ip_rate_limit_middleware))
        .route("/external-jwt-signers", get(ext_jwt_signers::list_public_signers))
        .route("/version", get(version::version));

    // Reachable while auth queries are still outstanding.
    let partial = Router::new()
        .route("/authenticate/mfa", post(authenticate::authenticate_mfa))
        .route(
            "/current-api-session",
            get(current::get_current_api_session).delete(current::delete_current_api_session),
        )
        .route("/current-api-session/totp-token", post(current::create_totp_token))
        .route(
            "/current-identity/mfa",
            get(mfa::get_mfa).post(mfa::create_mfa).delete(mfa::delete_mfa),
        )
        .route("/current-identity/mfa/verify", post(mfa::verify_mfa))
        .route("/current-identity/mfa/qr-code", get(mfa::mfa_qr_code))
        .route(
            "/current-identity/mfa/recovery-codes",
            get(mfa::get_recovery_codes).post(mfa::regenerate_recovery_codes),
        )
        .route_layer(from_fn_with_state(state.clone(), require_partial_session));

    let full = Router::new()
        .route("/current-identity", get(current::get_current_identity))
        .route("/current-identity/authenticators", get(current::list_current_authenticators))
        .route("/current-identity/authenticators/:id", put(current::change_password))
        .route(
            "/current-identity/authenticators/:id/extend",
            post(current::extend_authenticator),
        )
        .route(
            "/current-identity/authenticators/:id/extend-verify",
            post(current::extend_verify_authenticator),
        )
        .route("/services", get(service_handlers::list_permitted_services))
        .route("/services/:id", get(service_handlers::get_permitted_service))
        .route("/sessions", get(sessions::list_sessions).post(sessions::create_session))
        .route(
            "/sessions/:id",
            get(sessions::get_session).delete(sessions::delete_session),
        )
        .route_layer(from_fn_with_state(state.clone(), require_full_session));

    public.merge(partial).merge(full)
}

fn management_api(state: &AppState) -> Router<AppState> {
    let auth_limiter = state.auth_rate_limiter.clone();
    let public = Router::new()
        .route("/authenticate", post(authenticate::authenticate))
        .route_layer(from_fn_with_state(auth_limiter, ip_rate_limit_middleware))
        .route("/version", get(version::version));

    let partial = Router::new()
        .route("/authenticate/mfa", post(authenticate::authenticate_mfa))
        .route(
            "/current-api-session",
            get(current::get_current_api_session).delete(current::delete_current_api_session),
        )
        .route_layer(from_fn_with_state(state.clone(), require_partial_session));

    let admin = Router::new()
        .route(
            "/identities",
            get(identities::list_identities).post(identities::create_identity),
        )
        .route(
            "/identities/:id",
            get(identities::get_identity)
                .put(identities::update_identity)
                .patch(identities::patch_identity)
                .delete(identities::delete_identity),
        )
        .route("/identities/:id/enable", post(identities::enable_identity))
        .route(
            "/identities/:id/mfa",
            axum::routing::delete(identities::delete_identity_mfa),
        )
        .route(
            "/authenticators",
            get(authenticators::list_authenticators).post(authenticators::create_authenticator),
        )
        .route(
            "/authenticators/:id",
            get(authenticators::get_authenticator).delete(authenticators::delete_authenticator),
        )
        .route(
            "/authenticators/:id/request-extend",
            post(authenticators::request_extend),
        )
        .route(
            "/auth-policies",
            get(auth_policies::list_auth_policies).post(auth_policies::create_auth_policy),
        )
        .route(
            "/auth-policies/:id",
            get(auth_policies::get_auth_policy)
                .put(auth_policies::update_auth_policy)
                .patch(auth_policies::patch_auth_policy)
                .delete(auth_policies::delete_auth_policy),
        )
        .route(
            "/external-jwt-signers",
            get(ext_jwt_signers::list_signers).post(ext_jwt_signers::create_signer),
        )
        .route(
            "/external-jwt-signers/:id",
            get(ext_jwt_signers::get_signer)
                .put(ext_jwt_signers::update_signer)
                .patch(ext_jwt_signers::patch_signer)
                .delete(ext_jwt_signers::delete_signer),
        )
        .route(
            "/enrollments",
            get(enrollments::list_enrollments).post(enrollments::create_enrollment),
        )
        .route(
            "/enrollments/:id",
            get(enrollments::get_enrollment).delete(enrollments::delete_enrollment),
        )
        .route("/enrollments/:id/refresh", post(enrollments::refresh_enrollment))
        .route("/cas", get(cas::list_cas).post(cas::create_ca))
        .route(
            "/cas/:id",
            get(cas::get_ca).patch(cas::patch_ca).delete(cas::delete_ca),
        )
        .route("/cas/:id/verify", post(cas::verify_ca))
        .route(
            "/services",
            get(service_handlers::list_services).post(service_handlers::create_service),
        )
        .route(
            "/services/:id",
            get(service_handlers::get_service)
                .put(service_handlers::update_service)
                .patch(service_handlers::patch_service)
                .delete(service_handlers::delete_service),
        )
        .route(
            "/service-policies",
            get(service_handlers::list_service_policies).post(service_handlers::create_service_policy),
        )
        .route(
            "/service-policies/:id",
            get(service_handlers::get_service_policy)
                .put(service_handlers::update_service_policy)
                .patch(service_handlers::patch_service_policy)
                .delete(service_handlers::delete_service_policy),
        )
        .route_layer(from_fn_with_state(state.clone(), require_admin));

    public.merge(partial).merge(admin)
}

fn oidc_api(state: &AppState) -> Router<AppState> {
    let auth_limiter = state.auth_rate_limiter.clone();
    let login = Router::new()
        .route("/login/username", post(oidc::login_password))
        .route("/login/password", post(oidc::login_password))
        .route("/login/cert", post(oidc::login_cert))
        .route("/login/ext-jwt", post(oidc::login_ext_jwt))
        .route("/login/totp", post(oidc::login_totp))
        .route(
            "/login/totp/enroll",
            post(oidc::login_totp_enroll).delete(oidc::login_totp_enroll_delete),
        )
        .route("/login/totp/enroll/verify", post(oidc::login_totp_enroll_verify))
        .route("/oauth/token", post(oidc::token))
        .route_layer(from_fn_with_state(auth_limiter, ip_rate_limit_middleware));

    Router::new()
        .route("/authorize", get(oidc::authorize))
        .route("/authorize/callback", get(oidc::callback))
        .route("/login/auth-queries", get(oidc::login_auth_queries))
        .route("/keys", get(oidc::keys))
        .route("/.well-known/openid-configuration", get(oidc::discovery))
        .merge(login)
}

pub async fn build_router(state: AppState) -> Result<Router, AppError> {
    // Session and certificate resolution run ahead of the per-route guards.
    let edge_apis = Router::new()
        .nest("/edge/client/v1", client_api(&state))
        .nest("/edge/management/v1", management_api(&state))
        .nest("/oidc", oidc_api(&state))
        .layer(from_fn_with_state(state.clone(), resolve_auth_middleware))
        .layer(from_fn_with_state(state.clone(), client_cert_middleware));

    let ip_limiter = state.ip_rate_limiter.clone();

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(handlers::metrics::metrics))
        .route("/version", get(version::version))
        .merge(SwaggerUi::new("/docs").url("/.well-known/openapi.json", ApiDoc::openapi()))
        .merge(edge_apis)
        .with_state(state.clone())
        .layer(from_fn_with_state(ip_limiter, ip_rate_limit_middleware))
        .layer(from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http().make_span_with(
            |request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri(),
                    version = ?request.version(),
                )
            },
        ))
        .layer(from_fn(request_id_middleware))
        .layer(from_fn(security_headers_middleware))
        .layer(
            CorsLayer::new()
                .allow_origin(
                    state
                        .config
                        .security
                        .allowed_origins
                        .iter()
                        .map(|o| {
                            o.parse::<HeaderValue>().unwrap_or_else(|e| {
                                tracing::error!("Invalid CORS origin '{}': {}. Using fallback.", o, e);
                                HeaderValue::from_static("*")
                            })
                        })
                        .collect::<Vec<HeaderValue>>(),
                )
                .allow_methods([
                    Method::GET,
                    Method::POST,
                    Method::PUT,
                    Method::PATCH,
                    Method::DELETE,
                    Method::OPTIONS,
                ])
                .allow_headers([
                    header::AUTHORIZATION,
                    header::CONTENT_TYPE,
                    HeaderName::from_static(ZT_SESSION_HEADER),
                    HeaderName::from_static("mfa-validation-code"),
                    HeaderName::from_static(oidc::AUTH_REQUEST_ID_HEADER),
                    HeaderName::from_static(TOKEN_ISSUER_ID_HEADER),
                ]),
        );

    Ok(app)
}

/// Service health check
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy"),
        (status = 503, description = "Service is unhealthy")
    ),
    tag = "Observability"
)]
pub async fn health_check(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    state.db.health_check().await.map_err(|e| {
        tracing::error!(error = %e, "Store health check failed");
        e
    })?;

    let ca_not_after = parse_der(state.certs.ca_der()).ok().map(|ca| ca.not_after);
    Ok(Json(serde_json::json!({
        "status": "healthy",
        "service": state.config.service_name,
        "version": state.config.service_version,
        "environment": format!("{:?}", state.config.environment),
        "checks": {
            "store": "up",
            "enforcement": if state.hub.is_running() { "up" } else { "down" },
        },
        "controllerCaExpiresAt": ca_not_after,
    })))
}
