//! Authentication core of the agent portal.
//!
//! Signs users in either through an external OAuth2/OIDC identity provider or
//! with a local username and password, issues one kind of session token for
//! both, and guards the agent and task endpoints with scope checks.

use std::sync::Arc;
use std::time::Duration;

use sea_orm::DatabaseConnection;

use crate::auth::credentials::CredentialStore;
use crate::auth::federated::FederatedClient;
use crate::auth::middleware::{AuthGate, AuthMode, AuthenticatedUser};
use crate::auth::orchestrator::AuthOrchestrator;
use crate::auth::session::{ScopeGrant, SessionCodec, SessionOrigin};
use crate::auth::state::{StateStore, spawn_sweeper, state_store_from_config};
use crate::collaborators::{AgentDirectory, Disabled, TaskQueue};
use crate::config::AppConfig;
use crate::error::StartupError;

pub mod api;
pub mod auth;
pub mod collaborators;
pub mod config;
pub mod entity;
pub mod error;

#[derive(Clone)]
pub struct AppResources {
    pub config: Arc<AppConfig>,
    pub db: Arc<DatabaseConnection>,
    pub auth: Arc<AuthOrchestrator>,
    pub gate: Arc<AuthGate>,
    pub codec: Arc<SessionCodec>,
    pub states: Arc<dyn StateStore>,
    pub agents: Arc<dyn AgentDirectory>,
    pub tasks: Arc<dyn TaskQueue>,
}

impl AppResources {
    /// Assemble the auth components from validated configuration.
    ///
    /// Creates the bootstrap administrator and the platform account when
    /// configured. Collaborators start out [`Disabled`].
    pub async fn build(
        config: AppConfig,
        db: Arc<DatabaseConnection>,
    ) -> Result<Self, StartupError> {
        config.validate()?;
        let codec = Arc::new(SessionCodec::from_config(&config)?);
        let credentials = CredentialStore::new(db.clone());
        let states = state_store_from_config(&config.state, db.clone());
        let federated = FederatedClient::new(&config.oauth)
            .map_err(|e| StartupError::HttpClient(e.to_string()))?;

        if !federated.is_configured() {
            tracing::info!("OAuth2 client credentials not set; federated login disabled");
        }

        if let Some(admin) = &config.local.bootstrap_admin {
            let account = credentials
                .ensure_local(&admin.username, Some(&admin.password), admin.email.as_deref())
                .await?;
            tracing::info!(user_id = %account.id, username = %account.username, "Bootstrap administrator ready");
        }

        let mode = resolve_auth_mode(&config, &credentials).await?;
        let gate = Arc::new(AuthGate::new(mode, codec.clone(), credentials.clone()));
        let auth = Arc::new(AuthOrchestrator::new(
            &config,
            federated,
            states.clone(),
            credentials,
            codec.clone(),
        ));

        Ok(Self {
            config: Arc::new(config),
            db,
            auth,
            gate,
            codec,
            states,
            agents: Arc::new(Disabled),
            tasks: Arc::new(Disabled),
        })
    }

    pub fn with_collaborators(
        mut self,
        agents: Arc<dyn AgentDirectory>,
        tasks: Arc<dyn TaskQueue>,
    ) -> Self {
        self.agents = agents;
        self.tasks = tasks;
        self
    }

    /// Start the expiry sweeper for handshake states and the token denylist.
    pub fn spawn_sweeper(&self) -> tokio::task::JoinHandle<()> {
        spawn_sweeper(
            self.states.clone(),
            self.codec.clone(),
            Duration::from_secs(self.config.state.sweep_interval_secs.max(1)),
        )
    }
}

async fn resolve_auth_mode(
    config: &AppConfig,
    credentials: &CredentialStore,
) -> Result<AuthMode, StartupError> {
    if !config.platform_mode.enabled {
        return Ok(AuthMode::Session);
    }

    let account = credentials
        .ensure_local(&config.platform_mode.username, None, None)
        .await?;
    tracing::warn!(
        username = %account.username,
        "Platform mode enabled: requests are not authenticated and act as a single account"
    );
    Ok(AuthMode::Platform(AuthenticatedUser {
        user_id: account.id,
        username: account.username,
        email: account.email,
        origin: SessionOrigin::Local,
        grant: ScopeGrant::Unrestricted,
    }))
}
