mod common;

use std::time::Duration;

use axum::{extract::State, http::StatusCode, Json};
use common::{admin_session, create, create_user, login, spawn_app, Call, TestApp, CLIENT, MANAGEMENT};
use edge_controller::{
    dtos::client::CreateSessionRequest, handlers::sessions, middleware::Principal, models::PolicyType,
};
use serde_json::json;

const REVOCATION_DEADLINE: Duration = Duration::from_secs(5);

struct Fixture {
    admin: String,
    identity_id: String,
    session: String,
    service_id: String,
    policy_id: String,
}

/// An identity with `#web` allowed to dial a `#web` service.
async fn fixture(app: &TestApp) -> Fixture {
    let admin = admin_session(app).await;
    let identity_id = create_user(app, &admin, "mona", "mona-password", json!({ "roleAttributes": ["web"] })).await;
    let service_id = create(app, &admin, "/services", json!({ "name": "intranet", "roleAttributes": ["web"] })).await;
    let policy_id = create(
        app,
        &admin,
        "/service-policies",
        json!({
            "name": "web dial",
            "type": "Dial",
            "semantic": "AnyOf",
            "identityRoles": ["#web"],
            "serviceRoles": ["#web"],
        }),
    )
    .await;

    let reply = login(app, CLIENT, "mona", "mona-password").await;
    let session = reply.body["data"]["token"].as_str().unwrap().to_string();
    Fixture {
        admin,
        identity_id,
        session,
        service_id,
        policy_id,
    }
}

async fn open_session(app: &TestApp, fx: &Fixture, kind: &str) -> String {
    let reply = Call::post(&format!("{}/sessions", CLIENT))
        .session(&fx.session)
        .json(json!({ "serviceId": fx.service_id, "type": kind }))
        .send(app)
        .await;
    assert_eq!(reply.status, StatusCode::CREATED, "{}", reply.text);
    reply.body["data"]["id"].as_str().unwrap().to_string()
}

async fn dial(app: &TestApp, fx: &Fixture) -> String {
    open_session(app, fx, "Dial").await
}

#[tokio::test]
async fn permitted_services_are_listed() {
    let app = spawn_app().await;
    let fx = fixture(&app).await;

    let services = Call::get(&format!("{}/services", CLIENT)).session(&fx.session).send(&app).await;
    assert_eq!(services.status, StatusCode::OK);
    assert_eq!(services.body["data"][0]["id"], fx.service_id.as_str());
    assert_eq!(services.body["data"][0]["permissions"], json!(["Dial"]));

    let bind = Call::post(&format!("{}/sessions", CLIENT))
        .session(&fx.session)
        .json(json!({ "serviceId": fx.service_id, "type": "Bind" }))
        .send(&app)
        .await;
    assert_eq!(bind.status, StatusCode::FORBIDDEN);
    assert_eq!(bind.body["error"]["code"], "UNAUTHORIZED");
}

#[tokio::test]
async fn deleting_the_policy_closes_open_circuits() {
    let app = spawn_app().await;
    let fx = fixture(&app).await;
    let edge_session_id = dial(&app, &fx).await;

    let circuit = app
        .state
        .hub
        .open_circuit(&app.state.db, &edge_session_id)
        .await
        .expect("circuit opens");
    assert!(!circuit.is_closed());
    assert!(app.state.hub.open_listener(&app.state.db, &edge_session_id).await.is_err());

    let deleted = Call::delete(&format!("{}/service-policies/{}", MANAGEMENT, fx.policy_id))
        .session(&fx.admin)
        .send(&app)
        .await;
    assert_eq!(deleted.status, StatusCode::OK);

    tokio::time::timeout(REVOCATION_DEADLINE, circuit.closed())
        .await
        .expect("circuit closed after the grant was withdrawn");
    assert!(!app.state.hub.is_active(&edge_session_id));

    let gone = Call::get(&format!("{}/sessions/{}", CLIENT, edge_session_id))
        .session(&fx.session)
        .send(&app)
        .await;
    assert_eq!(gone.status, StatusCode::NOT_FOUND);

    let refused = Call::post(&format!("{}/sessions", CLIENT))
        .session(&fx.session)
        .json(json!({ "serviceId": fx.service_id, "type": "Dial" }))
        .send(&app)
        .await;
    assert_eq!(refused.status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn losing_a_role_attribute_closes_open_circuits() {
    let app = spawn_app().await;
    let fx = fixture(&app).await;
    let edge_session_id = dial(&app, &fx).await;
    let circuit = app
        .state
        .hub
        .open_circuit(&app.state.db, &edge_session_id)
        .await
        .expect("circuit opens");

    let patched = Call::patch(&format!("{}/identities/{}", MANAGEMENT, fx.identity_id))
        .session(&fx.admin)
        .json(json!({ "roleAttributes": [] }))
        .send(&app)
        .await;
    assert_eq!(patched.status, StatusCode::OK, "{}", patched.text);

    tokio::time::timeout(REVOCATION_DEADLINE, circuit.closed())
        .await
        .expect("circuit closed after the role was removed");
}

#[tokio::test]
async fn unrelated_changes_keep_circuits_open() {
    let app = spawn_app().await;
    let fx = fixture(&app).await;
    let edge_session_id = dial(&app, &fx).await;
    let circuit = app
        .state
        .hub
        .open_circuit(&app.state.db, &edge_session_id)
        .await
        .expect("circuit opens");

    create(
        &app,
        &fx.admin,
        "/service-policies",
        json!({ "name": "other", "type": "Bind", "identityRoles": ["#all"], "serviceRoles": ["#all"] }),
    )
    .await;
    // Give the worker a chance to process the event.
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(!circuit.is_closed());
    assert!(app.state.hub.is_active(&edge_session_id));
}

#[tokio::test]
async fn logout_closes_the_callers_circuits() {
    let app = spawn_app().await;
    let fx = fixture(&app).await;
    let edge_session_id = dial(&app, &fx).await;
    let circuit = app
        .state
        .hub
        .open_circuit(&app.state.db, &edge_session_id)
        .await
        .expect("circuit opens");

    let logout = Call::delete(&format!("{}/current-api-session", CLIENT))
        .session(&fx.session)
        .send(&app)
        .await;
    assert_eq!(logout.status, StatusCode::OK);

    tokio::time::timeout(REVOCATION_DEADLINE, circuit.closed())
        .await
        .expect("circuit closed after logout");
}

#[tokio::test]
async fn deleting_a_bind_policy_closes_listeners_but_not_circuits() {
    let app = spawn_app().await;
    let fx = fixture(&app).await;
    let bind_policy = create(
        &app,
        &fx.admin,
        "/service-policies",
        json!({
            "name": "web bind",
            "type": "Bind",
            "semantic": "AnyOf",
            "identityRoles": ["#web"],
            "serviceRoles": ["#web"],
        }),
    )
    .await;

    let bind_session = open_session(&app, &fx, "Bind").await;
    let listener = app
        .state
        .hub
        .open_listener(&app.state.db, &bind_session)
        .await
        .expect("listener opens");
    let dial_session = dial(&app, &fx).await;
    let circuit = app
        .state
        .hub
        .open_circuit(&app.state.db, &dial_session)
        .await
        .expect("circuit opens");

    let deleted = Call::delete(&format!("{}/service-policies/{}", MANAGEMENT, bind_policy))
        .session(&fx.admin)
        .send(&app)
        .await;
    assert_eq!(deleted.status, StatusCode::OK);

    tokio::time::timeout(REVOCATION_DEADLINE, listener.closed())
        .await
        .expect("listener closed after the bind grant was withdrawn");
    assert!(!app.state.hub.is_active(&bind_session));
    assert!(!circuit.is_closed());
    assert!(app.state.hub.is_active(&dial_session));

    let refused = Call::post(&format!("{}/sessions", CLIENT))
        .session(&fx.session)
        .json(json!({ "serviceId": fx.service_id, "type": "Bind" }))
        .send(&app)
        .await;
    assert_eq!(refused.status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn ended_api_session_cannot_open_edge_sessions() {
    let app = spawn_app().await;
    let fx = fixture(&app).await;
    let api_session = app
        .state
        .db
        .api_session_by_token(&fx.session)
        .expect("api session exists");
    assert!(app.state.auth.logout(&api_session.id));

    // The request was admitted before the logout landed.
    let created = sessions::create_session(
        State(app.state.clone()),
        Principal(api_session),
        Json(CreateSessionRequest {
            service_id: fx.service_id.clone(),
            session_type: PolicyType::Dial,
        }),
    )
    .await;
    assert!(created.is_err());
    assert!(app.state.db.read().await.edge_sessions.is_empty());
}
