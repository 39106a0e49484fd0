//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use agent_portal::AppResources;
use agent_portal::collaborators::{
    AgentDirectory, AgentInfo, CollaboratorError, LogStream, QueueStats, TaskQueue, TaskRecord,
    TaskSpec, TaskStatus,
};
use agent_portal::config::{AppConfig, BootstrapAdmin};
use async_trait::async_trait;
use axum_test::TestServer;
use sea_orm::{ConnectionTrait, Database, DatabaseConnection, DbBackend, Statement};
use serde_json::json;
use time::OffsetDateTime;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const APP_ROOT: &str = "http://app.local/";
pub const ADMIN_EMAIL: &str = "admin@localhost";
pub const ADMIN_USERNAME: &str = "admin";
pub const ADMIN_PASSWORD: &str = "correct horse battery staple";

/// In-memory database with the same tables the migrations create.
pub async fn setup_db() -> Arc<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await.expect("connect");

    db.execute(Statement::from_string(
        DbBackend::Sqlite,
        r#"CREATE TABLE user_account (
            id TEXT PRIMARY KEY,
            username TEXT NOT NULL UNIQUE,
            password_hash TEXT NULL,
            email TEXT NULL,
            display_name TEXT NULL,
            identity_provider TEXT NOT NULL DEFAULT 'local',
            external_subject TEXT NULL UNIQUE,
            upstream_access_token TEXT NULL,
            created_at TEXT NOT NULL,
            last_login_at TEXT NULL
        );"#,
    ))
    .await
    .expect("create user_account table");

    db.execute(Statement::from_string(
        DbBackend::Sqlite,
        r#"CREATE TABLE oauth_state (
            token TEXT PRIMARY KEY,
            created_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL
        );"#,
    ))
    .await
    .expect("create oauth_state table");

    Arc::new(db)
}

/// Development config with a bootstrap admin and no federated provider.
pub fn local_config() -> AppConfig {
    let mut config = AppConfig {
        app_root_url: APP_ROOT.to_string(),
        ..AppConfig::default()
    };
    config.session.signing_secret = Some("integration-test-signing-secret-0123456789".into());
    config.local.bootstrap_admin = Some(BootstrapAdmin {
        username: ADMIN_USERNAME.into(),
        password: ADMIN_PASSWORD.into(),
        email: Some(ADMIN_EMAIL.into()),
    });
    config
}

/// Config pointing the federated client at `provider_url`.
pub fn federated_config(provider_url: &str) -> AppConfig {
    let mut config = local_config();
    config.oauth.provider_url = provider_url.to_string();
    config.oauth.client_id = Some("agent-portal".into());
    config.oauth.client_secret = Some("client-secret".into());
    config.oauth.redirect_uri = "http://app.local/api/auth/oauth/callback".into();
    config
}

pub async fn build_resources(config: AppConfig) -> AppResources {
    AppResources::build(config, setup_db().await)
        .await
        .expect("build resources")
}

pub fn server_for(resources: AppResources) -> TestServer {
    TestServer::new(agent_portal::api::router(resources)).expect("create test server")
}

pub async fn test_server(config: AppConfig) -> (TestServer, AppResources) {
    let resources = build_resources(config).await;
    (server_for(resources.clone()), resources)
}

/// Value of query parameter `name` in a redirect `location`.
pub fn query_param(location: &str, name: &str) -> Option<String> {
    let url = url::Url::parse(location).expect("absolute redirect location");
    url.query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}

pub fn location(response: &axum_test::TestResponse) -> String {
    response
        .headers()
        .get("location")
        .expect("location header")
        .to_str()
        .expect("ascii location")
        .to_string()
}

/// Mount token and userinfo endpoints for one subject.
pub async fn mount_provider(server: &MockServer, subject: &str, email: &str, scope: Option<&str>) {
    let mut token = json!({
        "access_token": format!("upstream-{subject}"),
        "token_type": "Bearer",
        "expires_in": 3600,
    });
    if let Some(scope) = scope {
        token["scope"] = json!(scope);
    }
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/oauth2/userinfo"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "sub": subject,
            "email": email,
            "name": "Federated User",
        })))
        .mount(server)
        .await;
}

/// Run the full federated login and return the session token.
pub async fn federated_login(server: &TestServer) -> String {
    let login = server.get("/api/auth/oauth/login").await;
    assert_eq!(login.status_code(), 302);
    let state = query_param(&location(&login), "state").expect("state in authorize URL");

    let callback = server
        .get("/api/auth/oauth/callback")
        .add_query_param("code", "auth-code")
        .add_query_param("state", &state)
        .await;
    assert_eq!(callback.status_code(), 302);
    let location = location(&callback);
    query_param(&location, "token").unwrap_or_else(|| panic!("no token in {location}"))
}

pub async fn local_login(server: &TestServer, username: &str, password: &str) -> String {
    let response = server
        .post("/api/auth/login")
        .json(&json!({ "username": username, "password": password }))
        .await;
    response.assert_status_ok();
    response.json::<serde_json::Value>()["access_token"]
        .as_str()
        .expect("access_token")
        .to_string()
}

pub struct FakeAgents;

#[async_trait]
impl AgentDirectory for FakeAgents {
    async fn list_agents(&self) -> Result<Vec<AgentInfo>, CollaboratorError> {
        Ok(vec![agent("agent-1")])
    }

    async fn get_agent(&self, id: &str) -> Result<AgentInfo, CollaboratorError> {
        if id == "agent-1" {
            Ok(agent(id))
        } else {
            Err(CollaboratorError::NotFound(format!("agent {id}")))
        }
    }

    async fn stream_logs(
        &self,
        _id: &str,
        _container: Option<&str>,
        lines: u32,
    ) -> Result<LogStream, CollaboratorError> {
        let lines: Vec<Result<String, CollaboratorError>> =
            (0..lines.min(3)).map(|i| Ok(format!("line {i}"))).collect();
        Ok(Box::pin(futures::stream::iter(lines)))
    }
}

fn agent(id: &str) -> AgentInfo {
    AgentInfo {
        id: id.to_string(),
        name: format!("{id}-name"),
        status: "running".into(),
        containers: vec!["main".into()],
        labels: Default::default(),
    }
}

#[derive(Default)]
pub struct FakeTasks {
    tasks: Mutex<Vec<TaskRecord>>,
}

#[async_trait]
impl TaskQueue for FakeTasks {
    async fn submit(&self, spec: TaskSpec, user_id: &str) -> Result<TaskRecord, CollaboratorError> {
        let mut tasks = self.tasks.lock().unwrap();
        let record = TaskRecord {
            id: format!("task-{}", tasks.len() + 1),
            user_id: user_id.to_string(),
            spec,
            status: TaskStatus::Queued,
            created_at: OffsetDateTime::now_utc(),
        };
        tasks.push(record.clone());
        Ok(record)
    }

    async fn get(&self, task_id: &str) -> Result<TaskRecord, CollaboratorError> {
        self.tasks
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.id == task_id)
            .cloned()
            .ok_or_else(|| CollaboratorError::NotFound(format!("task {task_id}")))
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<TaskRecord>, CollaboratorError> {
        Ok(self
            .tasks
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn cancel(&self, task_id: &str, user_id: &str) -> Result<(), CollaboratorError> {
        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks
            .iter_mut()
            .find(|t| t.id == task_id && t.user_id == user_id)
            .ok_or_else(|| CollaboratorError::NotFound(format!("task {task_id}")))?;
        task.status = TaskStatus::Cancelled;
        Ok(())
    }

    async fn stats(&self) -> Result<QueueStats, CollaboratorError> {
        let tasks = self.tasks.lock().unwrap();
        Ok(QueueStats {
            queued: tasks.iter().filter(|t| t.status == TaskStatus::Queued).count() as u64,
            ..QueueStats::default()
        })
    }
}

/// Test server with in-memory collaborators behind the protected routes.
pub async fn test_server_with_collaborators(config: AppConfig) -> (TestServer, AppResources) {
    let resources = build_resources(config)
        .await
        .with_collaborators(Arc::new(FakeAgents), Arc::new(FakeTasks::default()));
    (server_for(resources.clone()), resources)
}
