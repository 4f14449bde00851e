mod common;

use axum::http::StatusCode;
use common::{
    admin_session, challenges, create_user, jwt_payload, login, oidc_tokens, spawn_app, spawn_app_with, Call,
    ADMIN_PASSWORD, ADMIN_USERNAME, CLIENT, MANAGEMENT,
};
use edge_controller::{config::JwtConfig, services::JwtService};
use rcgen::KeyPair;
use serde_json::json;
use std::io::Write;

#[tokio::test]
async fn anonymous_request_is_challenged_for_both_schemes() {
    let app = spawn_app().await;

    let reply = Call::get(&format!("{}/current-identity", CLIENT)).send(&app).await;

    assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
    let challenges: Vec<String> = reply
        .headers
        .get_all("www-authenticate")
        .iter()
        .filter_map(|v| v.to_str().ok().map(str::to_string))
        .collect();
    assert!(challenges.iter().any(|c| c.starts_with("Bearer") && c.contains(r#"error="missing""#)));
    assert!(challenges.iter().any(|c| c.starts_with("zt-session") && c.contains(r#"error="missing""#)));
    assert_eq!(reply.body["error"]["code"], "UNAUTHORIZED");
}

#[tokio::test]
async fn unknown_session_token_is_invalid() {
    let app = spawn_app().await;

    let reply = Call::get(&format!("{}/current-identity", CLIENT))
        .session("not-a-session")
        .send(&app)
        .await;

    assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
    let challenge = reply.header("www-authenticate").unwrap_or_default();
    assert!(challenge.starts_with("zt-session"));
    assert!(challenge.contains(r#"error="invalid""#));
}

#[tokio::test]
async fn authenticate_returns_session_header_and_body() {
    let app = spawn_app().await;

    let reply = login(&app, CLIENT, "admin", "admin-password").await;

    assert_eq!(reply.status, StatusCode::OK);
    let token = reply.body["data"]["token"].as_str().unwrap();
    assert_eq!(reply.header("zt-session"), Some(token));
    assert_eq!(reply.header("cache-control"), Some("no-store"));
    assert_eq!(reply.body["data"]["authMethod"], "password");
    assert_eq!(reply.body["data"]["isAdmin"], true);
    assert_eq!(reply.body["data"]["authQueries"], json!([]));

    let current = Call::get(&format!("{}/current-identity", CLIENT))
        .session(token)
        .send(&app)
        .await;
    assert_eq!(current.status, StatusCode::OK);
    assert_eq!(current.body["data"]["name"], "Default Admin");
}

#[tokio::test]
async fn wrong_password_is_invalid_auth() {
    let app = spawn_app().await;

    let reply = login(&app, CLIENT, "admin", "nope").await;

    assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
    assert_eq!(reply.body["error"]["code"], "INVALID_AUTH");
}

#[tokio::test]
async fn unsupported_method_is_rejected() {
    let app = spawn_app().await;

    let reply = Call::post(&format!("{}/authenticate?method=kerberos", CLIENT))
        .json(json!({}))
        .send(&app)
        .await;

    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert_eq!(reply.body["error"]["code"], "INVALID_AUTH_METHOD");
}

#[tokio::test]
async fn management_api_requires_an_administrator() {
    let app = spawn_app().await;
    let admin = admin_session(&app).await;
    create_user(&app, &admin, "operator", "operator-pass", json!({})).await;

    let user = login(&app, MANAGEMENT, "operator", "operator-pass").await;
    assert_eq!(user.status, StatusCode::OK);
    let token = user.body["data"]["token"].as_str().unwrap();

    let denied = Call::get(&format!("{}/identities", MANAGEMENT))
        .session(token)
        .send(&app)
        .await;
    assert_eq!(denied.status, StatusCode::UNAUTHORIZED);

    let allowed = Call::get(&format!("{}/identities", MANAGEMENT))
        .session(&admin)
        .send(&app)
        .await;
    assert_eq!(allowed.status, StatusCode::OK);
    assert_eq!(allowed.body["meta"]["pagination"]["totalCount"], 2);
}

#[tokio::test]
async fn logout_ends_the_session() {
    let app = spawn_app().await;
    let admin = admin_session(&app).await;

    let reply = Call::delete(&format!("{}/current-api-session", CLIENT))
        .session(&admin)
        .send(&app)
        .await;
    assert_eq!(reply.status, StatusCode::OK);

    let after = Call::get(&format!("{}/current-api-session", CLIENT))
        .session(&admin)
        .send(&app)
        .await;
    assert_eq!(after.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn unusable_bearer_only_challenges_on_protected_routes() {
    let app = spawn_app().await;

    let open = Call::get(&format!("{}/version", CLIENT)).bearer("invalid").send(&app).await;
    assert_eq!(open.status, StatusCode::OK);
    assert!(open.header("www-authenticate").is_none());

    let protected = Call::get(&format!("{}/current-identity", CLIENT))
        .bearer("invalid")
        .send(&app)
        .await;
    assert_eq!(protected.status, StatusCode::UNAUTHORIZED);
    let challenges: Vec<&str> = protected
        .headers
        .get_all("www-authenticate")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    assert_eq!(challenges.len(), 1);
    assert!(challenges[0].starts_with("Bearer"));
    assert!(challenges[0].contains(r#"error="invalid""#));
}

#[tokio::test]
async fn controller_tokens_other_than_access_tokens_are_invalid_bearers() {
    let app = spawn_app().await;
    let (_, tokens) = oidc_tokens(&app, ADMIN_USERNAME, ADMIN_PASSWORD).await;
    assert_eq!(jwt_payload(&tokens.refresh_token)["z_t"], "r");

    for token in [&tokens.refresh_token, &tokens.id_token] {
        let reply = Call::get(&format!("{}/current-identity", CLIENT))
            .bearer(token)
            .send(&app)
            .await;
        assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
        assert_eq!(challenges(&reply), vec![r#"Bearer error="invalid""#.to_string()]);
    }

    let reply = Call::get(&format!("{}/current-identity", CLIENT))
        .bearer(&tokens.access_token)
        .send(&app)
        .await;
    assert_eq!(reply.status, StatusCode::OK, "{}", reply.text);
}

#[tokio::test]
async fn expired_access_token_is_challenged_as_expired() {
    let mut key_file = tempfile::NamedTempFile::new().unwrap();
    key_file.write_all(KeyPair::generate().unwrap().serialize_pem().as_bytes()).unwrap();
    let key_path = key_file.path().to_string_lossy().to_string();

    let app = spawn_app_with(|config| config.jwt.signing_key_path = Some(key_path.clone())).await;
    let (session, _) = oidc_tokens(&app, ADMIN_USERNAME, ADMIN_PASSWORD).await;

    // Same key and issuer, with access tokens that are already past expiry.
    let stale = JwtService::new(
        &JwtConfig {
            signing_key_path: Some(key_path.clone()),
            access_token_expiry_minutes: -1,
            id_token_expiry_minutes: 30,
            refresh_token_expiry_hours: 24,
        },
        app.state.jwt.issuer(),
    )
    .unwrap();
    assert_eq!(stale.kid(), app.state.jwt.kid());
    let subject = app.state.auth.token_subject(&session).await.unwrap();
    let tokens = stale.issue_tokens(&subject, None).unwrap();

    let reply = Call::get(&format!("{}/current-identity", CLIENT))
        .bearer(&tokens.access_token)
        .send(&app)
        .await;
    assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
    assert_eq!(challenges(&reply), vec![r#"Bearer error="expired""#.to_string()]);
}
