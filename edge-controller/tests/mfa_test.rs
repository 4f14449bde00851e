mod common;

use axum::http::StatusCode;
use chrono::Utc;
use common::{
    admin_session, create_user, jwt_payload, login, oidc_tokens, query_param, spawn_app, Call, TestApp, CLIENT, MANAGEMENT,
};
use edge_controller::services::totp::generate_code;
use serde_json::json;

const MFA: &str = "/edge/client/v1/current-identity/mfa";

fn now() -> u64 {
    u64::try_from(Utc::now().timestamp()).unwrap_or(0)
}

async fn session_for(app: &TestApp, username: &str, password: &str) -> (String, serde_json::Value) {
    let reply = login(app, CLIENT, username, password).await;
    assert_eq!(reply.status, StatusCode::OK, "{}", reply.text);
    let token = reply.body["data"]["token"].as_str().unwrap().to_string();
    (token, reply.body["data"].clone())
}

/// Enrolls and verifies TOTP for the session's identity; returns the secret
/// and the recovery codes.
async fn enroll_mfa(app: &TestApp, session: &str) -> (String, Vec<String>) {
    let created = Call::post(MFA).session(session).send(app).await;
    assert_eq!(created.status, StatusCode::CREATED, "{}", created.text);
    let url = created.body["data"]["provisioningUrl"].as_str().unwrap();
    assert!(url.starts_with("otpauth://totp/"));
    let secret = query_param(url, "secret").expect("secret in provisioning url");
    let codes: Vec<String> = created.body["data"]["recoveryCodes"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c.as_str().unwrap().to_string())
        .collect();

    let code = generate_code(&secret, now()).unwrap();
    let verified = Call::post(&format!("{}/verify", MFA))
        .session(session)
        .json(json!({ "code": code }))
        .send(app)
        .await;
    assert_eq!(verified.status, StatusCode::OK, "{}", verified.text);
    (secret, codes)
}

#[tokio::test]
async fn enrollment_requires_a_valid_code_and_is_unique() {
    let app = spawn_app().await;
    let admin = admin_session(&app).await;
    create_user(&app, &admin, "erin", "erin-password", json!({})).await;
    let (session, _) = session_for(&app, "erin", "erin-password").await;

    let created = Call::post(MFA).session(&session).send(&app).await;
    assert_eq!(created.status, StatusCode::CREATED);
    assert_eq!(created.body["data"]["isVerified"], false);
    assert_eq!(created.body["data"]["recoveryCodes"].as_array().unwrap().len(), 20);

    let again = Call::post(MFA).session(&session).send(&app).await;
    assert_eq!(again.status, StatusCode::CONFLICT);
    assert_eq!(again.body["error"]["code"], "MFA_EXISTS");

    let bad = Call::post(&format!("{}/verify", MFA))
        .session(&session)
        .json(json!({ "code": "abcdef" }))
        .send(&app)
        .await;
    assert_eq!(bad.status, StatusCode::BAD_REQUEST);
    assert_eq!(bad.body["error"]["code"], "MFA_INVALID_TOKEN");

    let qr = Call::get(&format!("{}/qr-code", MFA)).session(&session).send(&app).await;
    assert_eq!(qr.status, StatusCode::OK);
    assert_eq!(qr.header("content-type"), Some("image/png"));
}

#[tokio::test]
async fn verified_mfa_gates_full_access_until_answered() {
    let app = spawn_app().await;
    let admin = admin_session(&app).await;
    create_user(&app, &admin, "frank", "frank-password", json!({})).await;
    let (first, _) = session_for(&app, "frank", "frank-password").await;
    let (_, recovery) = enroll_mfa(&app, &first).await;

    let (second, detail) = session_for(&app, "frank", "frank-password").await;
    assert_eq!(detail["isMfaRequired"], true);
    assert_eq!(detail["isMfaComplete"], false);
    assert!(!detail["authQueries"].as_array().unwrap().is_empty());

    let blocked = Call::get(&format!("{}/current-identity", CLIENT)).session(&second).send(&app).await;
    assert_eq!(blocked.status, StatusCode::UNAUTHORIZED);
    let partial = Call::get(&format!("{}/current-api-session", CLIENT)).session(&second).send(&app).await;
    assert_eq!(partial.status, StatusCode::OK);

    let answered = Call::post(&format!("{}/authenticate/mfa", CLIENT))
        .session(&second)
        .json(json!({ "code": recovery[0] }))
        .send(&app)
        .await;
    assert_eq!(answered.status, StatusCode::OK, "{}", answered.text);

    let allowed = Call::get(&format!("{}/current-identity", CLIENT)).session(&second).send(&app).await;
    assert_eq!(allowed.status, StatusCode::OK);

    // Recovery codes are single use.
    let (third, _) = session_for(&app, "frank", "frank-password").await;
    let reused = Call::post(&format!("{}/authenticate/mfa", CLIENT))
        .session(&third)
        .json(json!({ "code": recovery[0] }))
        .send(&app)
        .await;
    assert_eq!(reused.status, StatusCode::BAD_REQUEST);
    assert_eq!(reused.body["error"]["code"], "MFA_INVALID_TOKEN");
}

#[tokio::test]
async fn recovery_codes_can_be_listed_and_regenerated() {
    let app = spawn_app().await;
    let admin = admin_session(&app).await;
    create_user(&app, &admin, "gina", "gina-password", json!({})).await;
    let (session, _) = session_for(&app, "gina", "gina-password").await;
    let (_, recovery) = enroll_mfa(&app, &session).await;

    let listed = Call::get(&format!("{}/recovery-codes", MFA))
        .session(&session)
        .header("mfa-validation-code", &recovery[0])
        .send(&app)
        .await;
    assert_eq!(listed.status, StatusCode::OK, "{}", listed.text);
    assert_eq!(listed.body["data"]["recoveryCodes"].as_array().unwrap().len(), 19);

    let regenerated = Call::post(&format!("{}/recovery-codes", MFA))
        .session(&session)
        .json(json!({ "code": recovery[1] }))
        .send(&app)
        .await;
    assert_eq!(regenerated.status, StatusCode::OK);
    let fresh = regenerated.body["data"]["recoveryCodes"].as_array().unwrap();
    assert_eq!(fresh.len(), 20);
    assert!(!fresh.iter().any(|c| c == recovery[2].as_str()));
}

#[tokio::test]
async fn administrator_can_remove_mfa() {
    let app = spawn_app().await;
    let admin = admin_session(&app).await;
    let identity_id = create_user(&app, &admin, "hank", "hank-password", json!({})).await;
    let (session, _) = session_for(&app, "hank", "hank-password").await;
    enroll_mfa(&app, &session).await;

    let identity = Call::get(&format!("{}/identities/{}", MANAGEMENT, identity_id))
        .session(&admin)
        .send(&app)
        .await;
    assert_eq!(identity.body["data"]["isMfaEnabled"], true);

    let removed = Call::delete(&format!("{}/identities/{}/mfa", MANAGEMENT, identity_id))
        .session(&admin)
        .send(&app)
        .await;
    assert_eq!(removed.status, StatusCode::OK);

    let (_, detail) = session_for(&app, "hank", "hank-password").await;
    assert_eq!(detail["isMfaRequired"], false);
    assert_eq!(detail["authQueries"], json!([]));
}

#[tokio::test]
async fn totp_token_is_bound_to_its_oidc_session_and_never_expires() {
    let app = spawn_app().await;
    let admin = admin_session(&app).await;
    create_user(&app, &admin, "lena", "lena-password", json!({})).await;
    let (legacy, _) = session_for(&app, "lena", "lena-password").await;
    let (secret, _) = enroll_mfa(&app, &legacy).await;

    let refused = Call::post(&format!("{}/current-api-session/totp-token", CLIENT))
        .session(&legacy)
        .json(json!({ "code": generate_code(&secret, now() + 30).unwrap() }))
        .send(&app)
        .await;
    assert_eq!(refused.status, StatusCode::BAD_REQUEST);
    assert_eq!(refused.body["error"]["code"], "INVALID_AUTH_METHOD");

    let (session, tokens) = oidc_tokens(&app, "lena", "lena-password").await;
    let issued = Call::post(&format!("{}/current-api-session/totp-token", CLIENT))
        .bearer(&tokens.access_token)
        .json(json!({ "code": generate_code(&secret, now() + 30).unwrap() }))
        .send(&app)
        .await;
    assert_eq!(issued.status, StatusCode::OK, "{}", issued.text);

    let totp_token = issued.body["data"]["token"].as_str().unwrap().to_string();
    let claims = jwt_payload(&totp_token);
    assert!(claims.get("exp").is_none());
    assert_eq!(claims["z_asid"], session.id.as_str());
    assert_eq!(claims["z_t"], "totp");
    assert_eq!(claims["sub"], session.identity_id.as_str());

    // The TOTP token stands in for a code on the same session only.
    let listed = Call::get(&format!("{}/recovery-codes", MFA))
        .bearer(&tokens.access_token)
        .header("mfa-validation-code", &totp_token)
        .send(&app)
        .await;
    assert_eq!(listed.status, StatusCode::OK, "{}", listed.text);
    assert_eq!(listed.body["data"]["recoveryCodes"].as_array().unwrap().len(), 20);

    let elsewhere = Call::get(&format!("{}/recovery-codes", MFA))
        .session(&legacy)
        .header("mfa-validation-code", &totp_token)
        .send(&app)
        .await;
    assert_eq!(elsewhere.status, StatusCode::BAD_REQUEST);
}
