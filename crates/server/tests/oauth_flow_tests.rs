//! Federated login tests against a mock identity provider.

mod common;

use agent_portal::AppResources;
use agent_portal::entity::user_account;
use common::*;
use sea_orm::{ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter};
use serde_json::{Value, json};
use std::future::IntoFuture;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn login_unconfigured_is_configuration_error_without_redirect() {
    let (server, _) = test_server(local_config()).await;

    let response = server.get("/api/auth/oauth/login").await;

    assert_eq!(response.status_code(), 500);
    assert!(response.headers().get("location").is_none());
    assert_eq!(response.json::<Value>()["error"], "configuration_error");
}

#[tokio::test]
async fn login_redirects_to_provider_with_state() {
    let provider = MockServer::start().await;
    let (server, _) = test_server(federated_config(&provider.uri())).await;

    let response = server.get("/api/auth/oauth/login").await;

    assert_eq!(response.status_code(), 302);
    let location = location(&response);
    assert!(location.starts_with(&format!("{}/oauth2/authorize?", provider.uri())));
    assert_eq!(query_param(&location, "response_type").as_deref(), Some("code"));
    assert_eq!(query_param(&location, "client_id").as_deref(), Some("agent-portal"));
    let state = query_param(&location, "state").unwrap();
    assert!(state.len() >= 22, "state must carry at least 128 bits");
}

#[tokio::test]
async fn status_reports_configuration() {
    let (server, _) = test_server(local_config()).await;
    let body = server.get("/api/auth/oauth/status").await.json::<Value>();
    assert_eq!(body["configured"], false);

    let provider = MockServer::start().await;
    let (server, _) = test_server(federated_config(&provider.uri())).await;
    let body = server.get("/api/auth/oauth/status").await.json::<Value>();
    assert_eq!(body, json!({ "configured": true, "provider_url": provider.uri() }));
}

#[tokio::test]
async fn successful_callback_issues_federated_session() {
    let provider = MockServer::start().await;
    mount_provider(&provider, "fed-1", ADMIN_EMAIL, Some("openid profile agent:view")).await;
    let (server, resources) = test_server(federated_config(&provider.uri())).await;

    let token = federated_login(&server).await;

    let me = server
        .get("/api/auth/me")
        .authorization_bearer(&token)
        .await
        .json::<Value>();
    assert_eq!(me["origin"], "federated");
    assert_eq!(me["username"], "federated:fed-1");
    assert_eq!(me["email"], ADMIN_EMAIL);
    assert_eq!(me["scopes"], json!(["agent:view", "openid", "profile"]));

    let accounts = user_account::Entity::find()
        .all(resources.db.as_ref())
        .await
        .unwrap();
    let federated: Vec<_> = accounts
        .iter()
        .filter(|a| a.external_subject.as_deref() == Some("fed-1"))
        .collect();
    assert_eq!(federated.len(), 1);
    assert!(federated[0].password_hash.is_none());
    assert!(federated[0].last_login_at.is_some());
}

#[tokio::test]
async fn provider_error_is_surfaced_without_state_lookup() {
    let provider = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&provider)
        .await;
    let (server, _) = test_server(federated_config(&provider.uri())).await;

    let response = server
        .get("/api/auth/oauth/callback?error=access_denied&error_description=user+cancelled")
        .await;

    assert_eq!(response.status_code(), 302);
    let location = location(&response);
    assert!(location.starts_with(APP_ROOT));
    assert_eq!(query_param(&location, "error").as_deref(), Some("oauth_error"));
    assert_eq!(
        query_param(&location, "error_description").as_deref(),
        Some("user cancelled")
    );
    assert!(query_param(&location, "token").is_none());
}

#[tokio::test]
async fn callback_without_code_is_rejected() {
    let provider = MockServer::start().await;
    let (server, _) = test_server(federated_config(&provider.uri())).await;

    let response = server
        .get("/api/auth/oauth/callback")
        .add_query_param("state", "whatever")
        .await;

    let location = location(&response);
    assert_eq!(
        query_param(&location, "error").as_deref(),
        Some("missing_parameters")
    );
}

#[tokio::test]
async fn unknown_state_is_csrf_failure_without_exchange() {
    let provider = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&provider)
        .await;
    let (server, _) = test_server(federated_config(&provider.uri())).await;

    let response = server
        .get("/api/auth/oauth/callback")
        .add_query_param("code", "auth-code")
        .add_query_param("state", "forged-state")
        .await;

    let location = location(&response);
    assert_eq!(query_param(&location, "error").as_deref(), Some("invalid_state"));
    assert!(query_param(&location, "token").is_none());
}

#[tokio::test]
async fn consumed_state_cannot_be_replayed() {
    let provider = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "upstream-at",
            "token_type": "Bearer"
        })))
        .expect(1)
        .mount(&provider)
        .await;
    Mock::given(method("GET"))
        .and(path("/oauth2/userinfo"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "sub": "fed-1",
            "email": ADMIN_EMAIL
        })))
        .mount(&provider)
        .await;
    let (server, _) = test_server(federated_config(&provider.uri())).await;

    let login = server.get("/api/auth/oauth/login").await;
    let state = query_param(&location(&login), "state").unwrap();

    let first = server
        .get("/api/auth/oauth/callback")
        .add_query_param("code", "auth-code")
        .add_query_param("state", &state)
        .await;
    assert!(query_param(&location(&first), "token").is_some());

    let replay = server
        .get("/api/auth/oauth/callback")
        .add_query_param("code", "auth-code")
        .add_query_param("state", &state)
        .await;
    let replay_location = location(&replay);
    assert_eq!(
        query_param(&replay_location, "error").as_deref(),
        Some("invalid_state")
    );
    assert!(query_param(&replay_location, "token").is_none());
}

#[tokio::test]
async fn concurrent_replayed_callbacks_issue_one_session() {
    let provider = MockServer::start().await;
    mount_provider(&provider, "fed-1", ADMIN_EMAIL, None).await;
    let (server, _) = test_server(federated_config(&provider.uri())).await;

    let login = server.get("/api/auth/oauth/login").await;
    let state = query_param(&location(&login), "state").unwrap();

    let callback = || {
        server
            .get("/api/auth/oauth/callback")
            .add_query_param("code", "auth-code")
            .add_query_param("state", &state)
    };
    let (a, b) = tokio::join!(callback().into_future(), callback().into_future());

    let tokens = [a, b]
        .iter()
        .filter(|r| query_param(&location(r), "token").is_some())
        .count();
    assert_eq!(tokens, 1);
}

#[tokio::test]
async fn email_outside_allow_list_creates_no_account() {
    let provider = MockServer::start().await;
    mount_provider(&provider, "intruder", "intruder@example.com", None).await;
    let (server, resources) = test_server(federated_config(&provider.uri())).await;
    let accounts_before = user_account::Entity::find()
        .count(resources.db.as_ref())
        .await
        .unwrap();

    let login = server.get("/api/auth/oauth/login").await;
    let state = query_param(&location(&login), "state").unwrap();
    let response = server
        .get("/api/auth/oauth/callback")
        .add_query_param("code", "auth-code")
        .add_query_param("state", &state)
        .await;

    let location = location(&response);
    assert_eq!(query_param(&location, "error").as_deref(), Some("access_denied"));
    assert!(query_param(&location, "token").is_none());
    let accounts_after = user_account::Entity::find()
        .count(resources.db.as_ref())
        .await
        .unwrap();
    assert_eq!(accounts_before, accounts_after);
}

#[tokio::test]
async fn failed_code_exchange_redirects_with_opaque_error() {
    let provider = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .respond_with(ResponseTemplate::new(400).set_body_string("invalid_grant: secret detail"))
        .mount(&provider)
        .await;
    let (server, _) = test_server(federated_config(&provider.uri())).await;

    let login = server.get("/api/auth/oauth/login").await;
    let state = query_param(&location(&login), "state").unwrap();
    let response = server
        .get("/api/auth/oauth/callback")
        .add_query_param("code", "bad-code")
        .add_query_param("state", &state)
        .await;

    let location = location(&response);
    assert_eq!(
        query_param(&location, "error").as_deref(),
        Some("token_exchange_failed")
    );
    assert!(!location.contains("secret"));
}

#[tokio::test]
async fn failed_profile_fetch_redirects_with_error() {
    let provider = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "upstream-at",
            "token_type": "Bearer"
        })))
        .mount(&provider)
        .await;
    Mock::given(method("GET"))
        .and(path("/oauth2/userinfo"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&provider)
        .await;
    let (server, _) = test_server(federated_config(&provider.uri())).await;

    let login = server.get("/api/auth/oauth/login").await;
    let state = query_param(&location(&login), "state").unwrap();
    let response = server
        .get("/api/auth/oauth/callback")
        .add_query_param("code", "auth-code")
        .add_query_param("state", &state)
        .await;

    assert_eq!(
        query_param(&location(&response), "error").as_deref(),
        Some("profile_fetch_failed")
    );
}

#[tokio::test]
async fn federated_token_without_control_scope_is_forbidden() {
    let provider = MockServer::start().await;
    mount_provider(&provider, "fed-1", ADMIN_EMAIL, Some("openid profile")).await;
    let (server, _) = test_server_with_collaborators(federated_config(&provider.uri())).await;
    let token = federated_login(&server).await;

    let submit = server
        .post("/api/tasks")
        .authorization_bearer(&token)
        .json(&json!({ "agent_id": "agent-1", "instruction": "restart" }))
        .await;
    assert_eq!(submit.status_code(), 403);
    assert_eq!(submit.json::<Value>()["error"], "insufficient_scope");

    let list = server.get("/api/agents").authorization_bearer(&token).await;
    assert_eq!(list.status_code(), 403);
}

#[tokio::test]
async fn federated_token_with_scopes_reaches_collaborators() {
    let provider = MockServer::start().await;
    mount_provider(
        &provider,
        "fed-1",
        ADMIN_EMAIL,
        Some("openid agent:view agent:control"),
    )
    .await;
    let (server, _) = test_server_with_collaborators(federated_config(&provider.uri())).await;
    let token = federated_login(&server).await;

    let agents = server.get("/api/agents").authorization_bearer(&token).await;
    agents.assert_status_ok();
    assert_eq!(agents.json::<Value>()[0]["id"], "agent-1");

    let submit = server
        .post("/api/tasks")
        .authorization_bearer(&token)
        .json(&json!({ "agent_id": "agent-1", "instruction": "restart" }))
        .await;
    assert_eq!(submit.status_code(), 201);
}

#[tokio::test]
async fn logout_revokes_stored_upstream_token() {
    let provider = MockServer::start().await;
    mount_provider(&provider, "fed-1", ADMIN_EMAIL, None).await;
    Mock::given(method("POST"))
        .and(path("/oauth2/revoke"))
        .and(wiremock::matchers::body_string_contains("token=upstream-fed-1"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&provider)
        .await;
    let (server, _) = test_server(federated_config(&provider.uri())).await;
    let token = federated_login(&server).await;

    let response = server.post("/api/auth/logout").authorization_bearer(&token).await;

    response.assert_status_ok();
    assert_eq!(response.json::<Value>()["status"], "logged_out");
}

#[tokio::test]
async fn logout_succeeds_when_revocation_fails() {
    let provider = MockServer::start().await;
    mount_provider(&provider, "fed-1", ADMIN_EMAIL, None).await;
    Mock::given(method("POST"))
        .and(path("/oauth2/revoke"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&provider)
        .await;
    let (server, _) = test_server(federated_config(&provider.uri())).await;
    let token = federated_login(&server).await;

    let response = server.post("/api/auth/logout").authorization_bearer(&token).await;
    response.assert_status_ok();
}

#[tokio::test]
async fn allow_listed_email_links_to_local_account() {
    let provider = MockServer::start().await;
    mount_provider(&provider, "fed-1", ADMIN_EMAIL, None).await;
    let mut config = federated_config(&provider.uri());
    config.oauth.link_local_emails = vec![ADMIN_EMAIL.to_string()];
    let (server, _) = test_server(config).await;

    let token = federated_login(&server).await;
    let me = server
        .get("/api/auth/me")
        .authorization_bearer(&token)
        .await
        .json::<Value>();

    assert_eq!(me["username"], ADMIN_USERNAME);
    assert_eq!(me["origin"], "federated");
}

#[tokio::test]
async fn enabling_linking_after_first_login_keeps_identity_usable() {
    let provider = MockServer::start().await;
    mount_provider(&provider, "fed-1", ADMIN_EMAIL, None).await;
    let (server, resources) = test_server(federated_config(&provider.uri())).await;
    federated_login(&server).await;

    let mut config = federated_config(&provider.uri());
    config.oauth.link_local_emails = vec![ADMIN_EMAIL.to_string()];
    let relinked = AppResources::build(config, resources.db.clone())
        .await
        .expect("rebuild resources");
    let server = server_for(relinked);

    let token = federated_login(&server).await;
    let me = server
        .get("/api/auth/me")
        .authorization_bearer(&token)
        .await
        .json::<Value>();
    assert_eq!(me["username"], "federated:fed-1");

    let admin = user_account::Entity::find()
        .filter(user_account::Column::Username.eq(ADMIN_USERNAME))
        .one(resources.db.as_ref())
        .await
        .unwrap()
        .unwrap();
    assert!(admin.external_subject.is_none());
}

#[tokio::test]
async fn logout_only_revokes_provider_issued_tokens() {
    let provider = MockServer::start().await;
    mount_provider(&provider, "fed-1", ADMIN_EMAIL, None).await;
    Mock::given(method("POST"))
        .and(path("/oauth2/revoke"))
        .and(wiremock::matchers::body_string_contains("token=upstream-fed-1"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&provider)
        .await;
    Mock::given(method("POST"))
        .and(path("/oauth2/revoke"))
        .and(wiremock::matchers::body_string_contains("token=garbage"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&provider)
        .await;
    let (server, _) = test_server(federated_config(&provider.uri())).await;
    let token = federated_login(&server).await;

    server
        .post("/api/auth/logout")
        .authorization_bearer("garbage")
        .await
        .assert_status_ok();
    // The first logout spends the stored upstream token; the second has
    // nothing left to send and must not forward the session token itself.
    for _ in 0..2 {
        server
            .post("/api/auth/logout")
            .authorization_bearer(&token)
            .await
            .assert_status_ok();
    }

    let revocations = provider
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.url.path() == "/oauth2/revoke")
        .collect::<Vec<_>>();
    assert_eq!(revocations.len(), 1);
    assert!(!String::from_utf8_lossy(&revocations[0].body).contains(&token));
}
