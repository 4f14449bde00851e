mod common;

use axum::http::StatusCode;
use chrono::{Duration, Utc};
use common::{
    admin_session, create, create_identity, csr, enrollment_of, login, register_ca, spawn_app, verify_ca, Call, TestCa,
    CLIENT, MANAGEMENT,
};
use serde_json::json;

#[tokio::test]
async fn ott_enrollment_issues_a_certificate_once() {
    let app = spawn_app().await;
    let admin = admin_session(&app).await;
    let identity_id = create_identity(&app, &admin, json!({ "name": "router-01", "enrollment": { "ott": true } })).await;
    let enrollment = enrollment_of(&app, &admin, &identity_id, "ott").await;
    let token = enrollment["token"].as_str().unwrap();
    assert!(!enrollment["jwt"].as_str().unwrap().is_empty());

    let enrolled = Call::post(&format!("{}/enroll/ott?token={}", CLIENT, token))
        .pem(&csr("router-01"))
        .send(&app)
        .await;
    assert_eq!(enrolled.status, StatusCode::OK, "{}", enrolled.text);
    assert_eq!(enrolled.header("content-type"), Some("application/x-pem-file"));
    assert!(enrolled.text.contains("BEGIN CERTIFICATE"));

    // The token is spent: a PEM client gets the status and nothing else.
    let again = Call::post(&format!("{}/enroll/ott?token={}", CLIENT, token))
        .pem(&csr("router-01"))
        .send(&app)
        .await;
    assert_eq!(again.status, StatusCode::BAD_REQUEST);
    assert!(again.text.is_empty());

    // The issued certificate authenticates the identity.
    let session = Call::post(&format!("{}/authenticate?method=cert", CLIENT))
        .client_cert(&enrolled.text)
        .send(&app)
        .await;
    assert_eq!(session.status, StatusCode::OK, "{}", session.text);
    assert_eq!(session.body["data"]["identityId"], identity_id.as_str());
    assert_eq!(session.body["data"]["authMethod"], "cert");
}

#[tokio::test]
async fn ott_enrollment_accepts_the_jwt_and_returns_json() {
    let app = spawn_app().await;
    let admin = admin_session(&app).await;
    let identity_id = create_identity(&app, &admin, json!({ "name": "laptop-02", "enrollment": { "ott": true } })).await;
    let enrollment = enrollment_of(&app, &admin, &identity_id, "ott").await;
    let jwt = enrollment["jwt"].as_str().unwrap();

    let enrolled = Call::post(&format!("{}/enroll?method=ott", CLIENT))
        .json(json!({ "token": jwt, "csr": csr("laptop-02") }))
        .send(&app)
        .await;
    assert_eq!(enrolled.status, StatusCode::OK, "{}", enrolled.text);
    assert!(enrolled.body["data"]["cert"].as_str().unwrap().contains("BEGIN CERTIFICATE"));
    assert!(enrolled.body["data"]["ca"].as_str().unwrap().contains("BEGIN CERTIFICATE"));
}

#[tokio::test]
async fn ott_enrollment_without_csr_is_rejected() {
    let app = spawn_app().await;
    let admin = admin_session(&app).await;
    let identity_id = create_identity(&app, &admin, json!({ "name": "no-csr", "enrollment": { "ott": true } })).await;
    let token = enrollment_of(&app, &admin, &identity_id, "ott").await["token"]
        .as_str()
        .unwrap()
        .to_string();

    let reply = Call::post(&format!("{}/enroll/ott", CLIENT))
        .json(json!({ "token": token }))
        .send(&app)
        .await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert_eq!(reply.body["error"]["code"], "MISSING_OR_INVALID_CSR");

    // A failed attempt leaves the enrollment usable.
    enrollment_of(&app, &admin, &identity_id, "ott").await;
}

#[tokio::test]
async fn updb_enrollment_sets_the_password() {
    let app = spawn_app().await;
    let admin = admin_session(&app).await;
    let identity_id = create_identity(&app, &admin, json!({ "name": "ivy", "enrollment": { "updb": "ivy" } })).await;
    let token = enrollment_of(&app, &admin, &identity_id, "updb").await["token"]
        .as_str()
        .unwrap()
        .to_string();

    let short = Call::post(&format!("{}/enroll/updb?token={}", CLIENT, token))
        .json(json!({ "password": "abc" }))
        .send(&app)
        .await;
    assert_eq!(short.status, StatusCode::BAD_REQUEST);
    assert_eq!(short.body["error"]["code"], "COULD_NOT_VALIDATE");

    let enrolled = Call::post(&format!("{}/enroll/updb", CLIENT))
        .json(json!({ "token": token, "password": "ivy-password" }))
        .send(&app)
        .await;
    assert_eq!(enrolled.status, StatusCode::OK, "{}", enrolled.text);
    assert!(enrolled.body["data"]["authenticatorId"].is_string());

    let session = login(&app, CLIENT, "ivy", "ivy-password").await;
    assert_eq!(session.status, StatusCode::OK);
    assert_eq!(session.body["data"]["identityId"], identity_id.as_str());
}

#[tokio::test]
async fn refresh_rotates_the_token() {
    let app = spawn_app().await;
    let admin = admin_session(&app).await;
    let identity_id = create_identity(&app, &admin, json!({ "name": "jack", "enrollment": { "ott": true } })).await;
    let before = enrollment_of(&app, &admin, &identity_id, "ott").await;
    let id = before["id"].as_str().unwrap();

    let past = Call::post(&format!("{}/enrollments/{}/refresh", MANAGEMENT, id))
        .session(&admin)
        .json(json!({ "expiresAt": Utc::now() - Duration::minutes(1) }))
        .send(&app)
        .await;
    assert_eq!(past.status, StatusCode::BAD_REQUEST);

    let refreshed = Call::post(&format!("{}/enrollments/{}/refresh", MANAGEMENT, id))
        .session(&admin)
        .json(json!({ "expiresAt": Utc::now() + Duration::hours(2) }))
        .send(&app)
        .await;
    assert_eq!(refreshed.status, StatusCode::OK, "{}", refreshed.text);
    assert_ne!(refreshed.body["data"]["token"], before["token"]);
    assert_ne!(refreshed.body["data"]["jwt"], before["jwt"]);

    let stale = Call::post(&format!("{}/enroll/ott?token={}", CLIENT, before["token"].as_str().unwrap()))
        .json(json!({ "csr": csr("jack") }))
        .send(&app)
        .await;
    assert_eq!(stale.status, StatusCode::BAD_REQUEST);
    assert_eq!(stale.body["error"]["code"], "INVALID_ENROLLMENT_TOKEN");
}

#[tokio::test]
async fn one_enrollment_per_method_and_identity() {
    let app = spawn_app().await;
    let admin = admin_session(&app).await;
    let identity_id = create_identity(&app, &admin, json!({ "name": "kim" })).await;
    let expires_at = Utc::now() + Duration::hours(1);

    create(
        &app,
        &admin,
        "/enrollments",
        json!({ "identityId": identity_id, "method": "ott", "expiresAt": expires_at }),
    )
    .await;

    let duplicate = Call::post(&format!("{}/enrollments", MANAGEMENT))
        .session(&admin)
        .json(json!({ "identityId": identity_id, "method": "ott", "expiresAt": expires_at }))
        .send(&app)
        .await;
    assert_eq!(duplicate.status, StatusCode::CONFLICT);
    assert_eq!(duplicate.body["error"]["code"], "ENROLLMENT_EXISTS");

    let missing_username = Call::post(&format!("{}/enrollments", MANAGEMENT))
        .session(&admin)
        .json(json!({ "identityId": identity_id, "method": "updb", "expiresAt": expires_at }))
        .send(&app)
        .await;
    assert_eq!(missing_username.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn ottca_enrollment_requires_a_verified_ca() {
    let app = spawn_app().await;
    let admin = admin_session(&app).await;
    let ca = TestCa::new("Unproven CA");
    let ca_id = register_ca(&app, &admin, &ca, "unproven", json!({})).await;
    let identity_id = create_identity(&app, &admin, json!({ "name": "camera-3" })).await;

    let refused = Call::post(&format!("{}/enrollments", MANAGEMENT))
        .session(&admin)
        .json(json!({
            "identityId": identity_id,
            "method": "ottca",
            "caId": ca_id,
            "expiresAt": Utc::now() + Duration::hours(1),
        }))
        .send(&app)
        .await;
    assert_eq!(refused.status, StatusCode::BAD_REQUEST);
    assert_eq!(refused.body["error"]["code"], "COULD_NOT_VALIDATE");

    let inline = Call::post(&format!("{}/identities", MANAGEMENT))
        .session(&admin)
        .json(json!({ "name": "camera-4", "enrollment": { "ottca": ca_id } }))
        .send(&app)
        .await;
    assert_eq!(inline.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn ottca_enrollment_stops_once_the_ca_disables_it() {
    let app = spawn_app().await;
    let admin = admin_session(&app).await;
    let ca = TestCa::new("Fleet CA");
    let ca_id = register_ca(&app, &admin, &ca, "fleet", json!({})).await;
    verify_ca(&app, &admin, &ca, &ca_id).await;

    let identity_id = create_identity(&app, &admin, json!({ "name": "truck-9", "enrollment": { "ottca": ca_id } })).await;
    let token = enrollment_of(&app, &admin, &identity_id, "ottca").await["token"]
        .as_str()
        .unwrap()
        .to_string();

    let disabled = Call::patch(&format!("{}/cas/{}", MANAGEMENT, ca_id))
        .session(&admin)
        .json(json!({ "isOttCaEnrollmentEnabled": false }))
        .send(&app)
        .await;
    assert_eq!(disabled.status, StatusCode::OK, "{}", disabled.text);

    let refused = Call::post(&format!("{}/enroll/ottca?token={}", CLIENT, token))
        .client_cert(&ca.issue("truck-9").pem())
        .send(&app)
        .await;
    assert_eq!(refused.status, StatusCode::BAD_REQUEST);
    assert_eq!(refused.body["error"]["code"], "CERT_FAILED_VALIDATION");

    let other = create_identity(&app, &admin, json!({ "name": "truck-10" })).await;
    let create_refused = Call::post(&format!("{}/enrollments", MANAGEMENT))
        .session(&admin)
        .json(json!({
            "identityId": other,
            "method": "ottca",
            "caId": ca_id,
            "expiresAt": Utc::now() + Duration::hours(1),
        }))
        .send(&app)
        .await;
    assert_eq!(create_refused.status, StatusCode::BAD_REQUEST);
    assert_eq!(create_refused.body["error"]["code"], "COULD_NOT_VALIDATE");
}
