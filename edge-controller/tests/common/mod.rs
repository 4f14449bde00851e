#![allow(dead_code)]

use axum::{
    body::Body,
    http::{header, HeaderMap, Method, Request, StatusCode},
    Router,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{Duration, Utc};
use edge_controller::{
    build_router,
    config::ControllerConfig,
    models::{ApiSession, SessionKind},
    services::{PrimaryCredential, TokenResponse},
    utils::Password,
    AppState,
};
use http_body_util::BodyExt;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use rcgen::{BasicConstraints, Certificate, CertificateParams, DnType, IsCa, KeyPair, KeyUsagePurpose};
use serde_json::{json, Value};
use tower::util::ServiceExt;

pub const CLIENT: &str = "/edge/client/v1";
pub const MANAGEMENT: &str = "/edge/management/v1";
pub const ADMIN_USERNAME: &str = "admin";
pub const ADMIN_PASSWORD: &str = "admin-password";

pub struct TestApp {
    pub router: Router,
    pub state: AppState,
}

pub struct Reply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
    pub text: String,
}

impl Reply {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

pub async fn spawn_app() -> TestApp {
    spawn_app_with(|_| {}).await
}

/// Like [`spawn_app`], with a chance to adjust the configuration first.
pub async fn spawn_app_with(adjust: impl FnOnce(&mut ControllerConfig)) -> TestApp {
    let mut config = ControllerConfig::from_env().expect("Failed to load test configuration");
    config.log_level = "error".to_string();
    config.bootstrap.admin_username = ADMIN_USERNAME.to_string();
    config.bootstrap.admin_password = ADMIN_PASSWORD.to_string();
    config.rate_limit.auth_attempts = 1000;
    config.rate_limit.global_ip_limit = 10_000;
    adjust(&mut config);

    let state = AppState::new(config).await.expect("Failed to build state");
    let router = build_router(state.clone()).await.expect("Failed to build router");
    TestApp { router, state }
}

/// A request under construction; `send` runs it through the router.
pub struct Call {
    builder: axum::http::request::Builder,
    body: Body,
}

impl Call {
    pub fn new(method: Method, uri: &str) -> Self {
        Self {
            builder: Request::builder().method(method).uri(uri),
            body: Body::empty(),
        }
    }

    pub fn get(uri: &str) -> Self {
        Self::new(Method::GET, uri)
    }

    pub fn post(uri: &str) -> Self {
        Self::new(Method::POST, uri)
    }

    pub fn patch(uri: &str) -> Self {
        Self::new(Method::PATCH, uri)
    }

    pub fn delete(uri: &str) -> Self {
        Self::new(Method::DELETE, uri)
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.builder = self.builder.header(name, value);
        self
    }

    pub fn session(self, token: &str) -> Self {
        self.header("zt-session", token)
    }

    pub fn bearer(self, token: &str) -> Self {
        self.header(header::AUTHORIZATION.as_str(), &format!("Bearer {}", token))
    }

    pub fn json(mut self, body: Value) -> Self {
        self.builder = self.builder.header(header::CONTENT_TYPE, "application/json");
        self.body = Body::from(body.to_string());
        self
    }

    pub fn pem(mut self, pem: &str) -> Self {
        self.builder = self
            .builder
            .header(header::CONTENT_TYPE, "application/x-pem-file");
        self.body = Body::from(pem.to_string());
        self
    }

    pub fn form(mut self, form: &[(&str, &str)]) -> Self {
        self.builder = self
            .builder
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded");
        self.body = Body::from(serde_urlencoded::to_string(form).expect("form encodes"));
        self
    }

    pub fn client_cert(self, chain_pem: &str) -> Self {
        let encoded = urlencoding::encode(chain_pem).into_owned();
        self.header("x-client-cert", &encoded)
    }

    pub async fn send(self, app: &TestApp) -> Reply {
        let request = self.builder.body(self.body).expect("request builds");
        let response = app
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("router is infallible");
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body collects")
            .to_bytes();
        let text = String::from_utf8_lossy(&bytes).into_owned();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        Reply {
            status,
            headers,
            body,
            text,
        }
    }
}

/// Password login; returns the `zt-session` token.
pub async fn login(app: &TestApp, api: &str, username: &str, password: &str) -> Reply {
    Call::post(&format!("{}/authenticate?method=password", api))
        .json(json!({ "username": username, "password": password }))
        .send(app)
        .await
}

pub async fn admin_session(app: &TestApp) -> String {
    let reply = login(app, MANAGEMENT, ADMIN_USERNAME, ADMIN_PASSWORD).await;
    assert_eq!(reply.status, StatusCode::OK, "admin login failed: {}", reply.text);
    reply.body["data"]["token"]
        .as_str()
        .expect("session token")
        .to_string()
}

/// Creates an identity and returns its id.
pub async fn create_identity(app: &TestApp, admin: &str, body: Value) -> String {
    let reply = Call::post(&format!("{}/identities", MANAGEMENT))
        .session(admin)
        .json(body)
        .send(app)
        .await;
    assert_eq!(reply.status, StatusCode::CREATED, "create identity failed: {}", reply.text);
    reply.body["data"]["id"].as_str().expect("identity id").to_string()
}

/// Creates an identity with a password authenticator.
pub async fn create_user(app: &TestApp, admin: &str, name: &str, password: &str, extra: Value) -> String {
    let mut body = json!({ "name": name });
    if let (Some(fields), Value::Object(extra)) = (body.as_object_mut(), extra) {
        fields.extend(extra);
    }
    let identity_id = create_identity(app, admin, body).await;

    let reply = Call::post(&format!("{}/authenticators", MANAGEMENT))
        .session(admin)
        .json(json!({
            "identityId": identity_id,
            "method": "updb",
            "username": name,
            "password": password,
        }))
        .send(app)
        .await;
    assert_eq!(reply.status, StatusCode::CREATED, "create authenticator failed: {}", reply.text);
    identity_id
}

pub async fn create(app: &TestApp, admin: &str, path: &str, body: Value) -> String {
    let reply = Call::post(&format!("{}{}", MANAGEMENT, path))
        .session(admin)
        .json(body)
        .send(app)
        .await;
    assert_eq!(reply.status, StatusCode::CREATED, "POST {} failed: {}", path, reply.text);
    reply.body["data"]["id"].as_str().expect("entity id").to_string()
}

/// The first enrollment of `method` for the identity.
pub async fn enrollment_of(app: &TestApp, admin: &str, identity_id: &str, method: &str) -> Value {
    let reply = Call::get(&format!("{}/enrollments", MANAGEMENT))
        .session(admin)
        .send(app)
        .await;
    assert_eq!(reply.status, StatusCode::OK);
    reply.body["data"]
        .as_array()
        .expect("enrollment list")
        .iter()
        .find(|e| e["identityId"] == identity_id && e["method"] == method)
        .cloned()
        .expect("enrollment exists")
}

/// Opens an OIDC API session by password, skipping the browser flow, and
/// mints its tokens.
pub async fn oidc_tokens(app: &TestApp, username: &str, password: &str) -> (ApiSession, TokenResponse) {
    let outcome = app
        .state
        .auth
        .authenticate(
            PrimaryCredential::Updb {
                username: username.to_string(),
                password: Password::new(password),
            },
            SessionKind::Oidc,
            None,
            None,
        )
        .await
        .expect("OIDC login succeeds");
    let subject = app
        .state
        .auth
        .token_subject(&outcome.session)
        .await
        .expect("token subject");
    let tokens = app.state.jwt.issue_tokens(&subject, None).expect("tokens issue");
    (outcome.session, tokens)
}

/// The unverified payload of a JWT.
pub fn jwt_payload(token: &str) -> Value {
    let payload = token.split('.').nth(1).expect("three segments");
    let bytes = URL_SAFE_NO_PAD.decode(payload).expect("base64url payload");
    serde_json::from_slice(&bytes).expect("JSON payload")
}

/// Every `WWW-Authenticate` value of a reply.
pub fn challenges(reply: &Reply) -> Vec<String> {
    reply
        .headers
        .get_all(header::WWW_AUTHENTICATE)
        .iter()
        .filter_map(|v| v.to_str().ok().map(str::to_string))
        .collect()
}

/// The value of query parameter `name` in a redirect location.
pub fn query_param(location: &str, name: &str) -> Option<String> {
    let query = location.split_once('?')?.1;
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name).then(|| urlencoding::decode(value).map(|v| v.into_owned()).unwrap_or_default())
    })
}

/// Registers `ca` with every enrollment and auth flag on, merged with `extra`.
pub async fn register_ca(app: &TestApp, admin: &str, ca: &TestCa, name: &str, extra: Value) -> String {
    let mut body = json!({
        "name": name,
        "certPem": ca.pem(),
        "isAutoCaEnrollmentEnabled": true,
        "isOttCaEnrollmentEnabled": true,
        "isAuthEnabled": true,
        "identityRoles": ["devices"],
    });
    if let (Some(fields), Value::Object(extra)) = (body.as_object_mut(), extra) {
        fields.extend(extra);
    }
    create(app, admin, "/cas", body).await
}

/// Proves possession of `ca` with a leaf named after its verification token.
pub async fn verify_ca(app: &TestApp, admin: &str, ca: &TestCa, ca_id: &str) {
    let detail = Call::get(&format!("{}/cas/{}", MANAGEMENT, ca_id))
        .session(admin)
        .send(app)
        .await;
    assert_eq!(detail.body["data"]["isVerified"], false);
    let token = detail.body["data"]["verificationToken"]
        .as_str()
        .expect("verification token");

    let proof = ca.issue(token);
    let verified = Call::post(&format!("{}/cas/{}/verify", MANAGEMENT, ca_id))
        .session(admin)
        .pem(&proof.pem())
        .send(app)
        .await;
    assert_eq!(verified.status, StatusCode::OK, "{}", verified.text);
}

// ============================================================================
// Certificate fixtures
// ============================================================================

pub struct TestCa {
    pub cert: Certificate,
    pub key: KeyPair,
}

impl TestCa {
    pub fn new(common_name: &str) -> Self {
        let key = KeyPair::generate().expect("key generates");
        let mut params = CertificateParams::new(Vec::<String>::new()).expect("params");
        params.distinguished_name.push(DnType::CommonName, common_name);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let cert = params.self_signed(&key).expect("CA self-signs");
        Self { cert, key }
    }

    pub fn pem(&self) -> String {
        self.cert.pem()
    }

    /// A client leaf signed by this CA.
    pub fn issue(&self, common_name: &str) -> Certificate {
        let key = KeyPair::generate().expect("key generates");
        let mut params = CertificateParams::new(Vec::<String>::new()).expect("params");
        params.distinguished_name.push(DnType::CommonName, common_name);
        params.is_ca = IsCa::ExplicitNoCa;
        params
            .signed_by(&key, &self.cert, &self.key)
            .expect("leaf signs")
    }
}

/// A fresh key pair and a PEM CSR for it.
pub fn csr(common_name: &str) -> String {
    let key = KeyPair::generate().expect("key generates");
    let mut params = CertificateParams::new(Vec::<String>::new()).expect("params");
    params.distinguished_name.push(DnType::CommonName, common_name);
    params
        .serialize_request(&key)
        .expect("CSR serializes")
        .pem()
        .expect("CSR encodes")
}

// ============================================================================
// External identity provider
// ============================================================================

pub const IDP_ISSUER: &str = "https://idp.example.test";
pub const IDP_KID: &str = "idp-key-1";

/// An ES256 token issuer registered as an external JWT signer.
pub struct Idp {
    pub issuer: String,
    pub kid: String,
    pub cert_pem: String,
    key: KeyPair,
}

impl Idp {
    pub fn new() -> Self {
        Self::named(IDP_ISSUER, IDP_KID)
    }

    pub fn named(issuer: &str, kid: &str) -> Self {
        let key = KeyPair::generate().expect("key generates");
        let mut params = CertificateParams::new(Vec::<String>::new()).expect("params");
        params.distinguished_name.push(DnType::CommonName, "idp signer");
        let cert = params.self_signed(&key).expect("signer self-signs");
        Self {
            issuer: issuer.to_string(),
            kid: kid.to_string(),
            cert_pem: cert.pem(),
            key,
        }
    }

    pub fn token(&self, claims: Value) -> String {
        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(self.kid.clone());
        let key = EncodingKey::from_ec_pem(self.key.serialize_pem().as_bytes()).expect("EC key");
        encode(&header, &claims, &key).expect("token encodes")
    }

    fn token_expiring(&self, subject: &str, exp: i64) -> String {
        self.token(json!({
            "iss": self.issuer,
            "sub": subject,
            "exp": exp,
            "groups": ["engineering", "oncall"],
        }))
    }

    pub fn token_for(&self, subject: &str) -> String {
        self.token_expiring(subject, (Utc::now() + Duration::minutes(5)).timestamp())
    }

    pub fn expired_token_for(&self, subject: &str) -> String {
        self.token_expiring(subject, (Utc::now() - Duration::minutes(5)).timestamp())
    }
}

/// Registers `idp` as a signer matching identities by external id.
pub async fn create_signer(app: &TestApp, admin: &str, idp: &Idp, extra: Value) -> String {
    let mut body = json!({
        "name": format!("idp {}", idp.kid),
        "certPem": idp.cert_pem,
        "kid": idp.kid,
        "issuer": idp.issuer,
        "useExternalId": true,
    });
    if let (Some(fields), Value::Object(extra)) = (body.as_object_mut(), extra) {
        fields.extend(extra);
    }
    create(app, admin, "/external-jwt-signers", body).await
}
