mod common;

use axum::http::StatusCode;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use common::{admin_session, create_user, query_param, spawn_app, Call, TestApp, ADMIN_PASSWORD, ADMIN_USERNAME, CLIENT, MANAGEMENT};
use serde_json::json;
use sha2::{Digest, Sha256};

const REDIRECT_URI: &str = "http://localhost:8080/auth/callback";
const VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";

fn challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

async fn start(app: &TestApp, redirect_uri: &str) -> String {
    let uri = format!(
        "/oidc/authorize?client_id=openziti&response_type=code&redirect_uri={}&code_challenge={}&code_challenge_method=S256&state=xyz",
        urlencoding::encode(redirect_uri),
        challenge(VERIFIER),
    );
    let reply = Call::get(&uri).send(app).await;
    assert_eq!(reply.status, StatusCode::FOUND, "{}", reply.text);
    let location = reply.header("location").unwrap();
    assert!(location.starts_with("/oidc/login/username"));
    query_param(location, "authRequestID").unwrap()
}

/// Runs authorize, password login and callback; returns the code.
async fn authorization_code(app: &TestApp, username: &str, password: &str) -> String {
    let request_id = start(app, REDIRECT_URI).await;

    let login = Call::post(&format!("/oidc/login/password?authRequestID={}", request_id))
        .json(json!({ "username": username, "password": password }))
        .send(app)
        .await;
    assert_eq!(login.status, StatusCode::FOUND, "{}", login.text);
    let callback = login.header("location").unwrap().to_string();
    assert_eq!(callback, format!("/oidc/authorize/callback?id={}", request_id));

    let redirect = Call::get(&callback).send(app).await;
    assert_eq!(redirect.status, StatusCode::FOUND, "{}", redirect.text);
    let location = redirect.header("location").unwrap();
    assert!(location.starts_with(REDIRECT_URI));
    assert_eq!(query_param(location, "state").as_deref(), Some("xyz"));
    query_param(location, "code").unwrap()
}

async fn redeem(app: &TestApp, code: &str, verifier: &str) -> common::Reply {
    Call::post("/oidc/oauth/token")
        .form(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", REDIRECT_URI),
            ("code_verifier", verifier),
            ("client_id", "openziti"),
        ])
        .send(app)
        .await
}

#[tokio::test]
async fn authorization_code_flow_issues_usable_tokens() {
    let app = spawn_app().await;
    let code = authorization_code(&app, ADMIN_USERNAME, ADMIN_PASSWORD).await;

    let tokens = redeem(&app, &code, VERIFIER).await;
    assert_eq!(tokens.status, StatusCode::OK, "{}", tokens.text);
    assert_eq!(tokens.header("cache-control"), Some("no-store"));
    assert_eq!(tokens.body["token_type"], "Bearer");
    assert!(tokens.body["expires_in"].as_i64().unwrap() > 0);
    assert!(tokens.body["id_token"].as_str().is_some_and(|t| t.split('.').count() == 3));
    let access = tokens.body["access_token"].as_str().unwrap();

    let identity = Call::get(&format!("{}/current-identity", CLIENT)).bearer(access).send(&app).await;
    assert_eq!(identity.status, StatusCode::OK, "{}", identity.text);
    assert_eq!(identity.body["data"]["name"], "Default Admin");

    let identities = Call::get(&format!("{}/identities", MANAGEMENT)).bearer(access).send(&app).await;
    assert_eq!(identities.status, StatusCode::OK);

    // Codes are single use.
    let reused = redeem(&app, &code, VERIFIER).await;
    assert_eq!(reused.status, StatusCode::BAD_REQUEST);
    assert_eq!(reused.body["error"], "invalid_grant");
}

#[tokio::test]
async fn refresh_token_yields_new_tokens() {
    let app = spawn_app().await;
    let code = authorization_code(&app, ADMIN_USERNAME, ADMIN_PASSWORD).await;
    let tokens = redeem(&app, &code, VERIFIER).await;
    let refresh = tokens.body["refresh_token"].as_str().unwrap();

    let refreshed = Call::post("/oidc/oauth/token")
        .form(&[("grant_type", "refresh_token"), ("refresh_token", refresh)])
        .send(&app)
        .await;
    assert_eq!(refreshed.status, StatusCode::OK, "{}", refreshed.text);
    assert!(refreshed.body["access_token"].is_string());

    // An access token is not a refresh token.
    let access = tokens.body["access_token"].as_str().unwrap();
    let wrong_type = Call::post("/oidc/oauth/token")
        .form(&[("grant_type", "refresh_token"), ("refresh_token", access)])
        .send(&app)
        .await;
    assert_eq!(wrong_type.status, StatusCode::BAD_REQUEST);
    assert_eq!(wrong_type.body["error"], "invalid_grant");
}

#[tokio::test]
async fn wrong_verifier_is_rejected() {
    let app = spawn_app().await;
    let code = authorization_code(&app, ADMIN_USERNAME, ADMIN_PASSWORD).await;

    let reply = redeem(&app, &code, "not-the-verifier-that-made-the-challenge").await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert_eq!(reply.body["error"], "invalid_grant");
}

#[tokio::test]
async fn authorize_validates_the_request() {
    let app = spawn_app().await;

    let unregistered = Call::get(&format!(
        "/oidc/authorize?client_id=openziti&response_type=code&redirect_uri={}&code_challenge={}&code_challenge_method=S256",
        urlencoding::encode("https://evil.example/callback"),
        challenge(VERIFIER),
    ))
    .send(&app)
    .await;
    assert_eq!(unregistered.status, StatusCode::BAD_REQUEST);
    assert_eq!(unregistered.body["error"], "invalid_request");

    let plain = Call::get(&format!(
        "/oidc/authorize?client_id=openziti&response_type=code&redirect_uri={}&code_challenge={}&code_challenge_method=plain",
        urlencoding::encode(REDIRECT_URI),
        VERIFIER,
    ))
    .send(&app)
    .await;
    assert_eq!(plain.status, StatusCode::BAD_REQUEST);

    // Any port matches the wildcard.
    start(&app, "http://localhost:53123/auth/callback").await;
}

#[tokio::test]
async fn bad_password_and_incomplete_login_do_not_yield_a_code() {
    let app = spawn_app().await;
    let admin = admin_session(&app).await;
    create_user(&app, &admin, "lena", "lena-password", json!({})).await;
    let request_id = start(&app, REDIRECT_URI).await;

    let early = Call::get(&format!("/oidc/authorize/callback?id={}", request_id)).send(&app).await;
    assert_eq!(early.status, StatusCode::BAD_REQUEST);
    assert_eq!(early.body["error"], "access_denied");

    let rejected = Call::post(&format!("/oidc/login/password?authRequestID={}", request_id))
        .json(json!({ "username": "lena", "password": "wrong-password" }))
        .send(&app)
        .await;
    assert_eq!(rejected.status, StatusCode::UNAUTHORIZED);

    let accepted = Call::post("/oidc/login/password")
        .header("auth-request-id", &request_id)
        .json(json!({ "username": "lena", "password": "lena-password" }))
        .send(&app)
        .await;
    assert_eq!(accepted.status, StatusCode::FOUND, "{}", accepted.text);
}

#[tokio::test]
async fn discovery_and_keys_are_published() {
    let app = spawn_app().await;

    let discovery = Call::get("/oidc/.well-known/openid-configuration").send(&app).await;
    assert_eq!(discovery.status, StatusCode::OK);
    assert_eq!(discovery.body["issuer"], app.state.jwt.issuer().trim_end_matches('/'));
    assert!(discovery.body["token_endpoint"].as_str().unwrap().ends_with("/oidc/oauth/token"));
    assert!(discovery.body["code_challenge_methods_supported"]
        .as_array()
        .unwrap()
        .iter()
        .any(|m| m == "S256"));

    let keys = Call::get("/oidc/keys").send(&app).await;
    assert_eq!(keys.status, StatusCode::OK);
    assert_eq!(keys.body["keys"][0]["kty"], "EC");
}
