use serde::Deserialize;
use thiserror::Error;

/// Signing secret used when no `session.signing_secret` is configured outside
/// production. Tokens signed with it must never be trusted by a deployed system.
pub const DEVELOPMENT_SIGNING_SECRET: &str =
    "agent-portal-development-signing-secret-not-for-production";

/// Minimum length of a production signing secret, in bytes.
pub const MIN_SIGNING_SECRET_LEN: usize = 32;

/// Longest accepted session token lifetime (30 days).
pub const MAX_SESSION_LIFETIME_SECS: u64 = 30 * 24 * 60 * 60;

/// Longest accepted handshake state TTL (one day).
pub const MAX_STATE_TTL_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration build error: {0}")]
    Build(#[from] config::ConfigError),
    #[error("Invalid configuration: {0}")]
    Validation(String),
}

/// Deployment posture. Production refuses insecure fallbacks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Production,
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct OAuthConfig {
    /// Base URL of the identity provider, e.g. `https://id.example.com`.
    pub provider_url: String,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    /// Callback URL registered with the provider.
    pub redirect_uri: String,
    /// Scopes requested on every authorization request.
    pub scopes: Vec<String>,
    pub authorize_path: String,
    pub token_path: String,
    pub userinfo_path: String,
    pub revoke_path: String,
    /// Federated identities are only admitted when their email is listed here.
    pub allowed_emails: Vec<String>,
    /// Emails whose federated identity may be linked onto an existing local
    /// account with the same email. Anything not listed gets its own account.
    pub link_local_emails: Vec<String>,
    pub request_timeout_secs: u64,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            provider_url: String::new(),
            client_id: None,
            client_secret: None,
            redirect_uri: String::new(),
            scopes: ["openid", "profile", "email", "agent:view", "agent:control"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            authorize_path: "/oauth2/authorize".into(),
            token_path: "/oauth2/token".into(),
            userinfo_path: "/oauth2/userinfo".into(),
            revoke_path: "/oauth2/revoke".into(),
            allowed_emails: vec!["admin@localhost".into()],
            link_local_emails: Vec::new(),
            request_timeout_secs: 10,
        }
    }
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub signing_secret: Option<String>,
    /// Lifetime of issued session tokens. Matches the provider's own session
    /// lifetime so local sessions never outlive upstream trust.
    pub lifetime_secs: u64,
    /// Record logged-out token ids until they expire and reject them.
    pub denylist_enabled: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            signing_secret: None,
            lifetime_secs: 8 * 60 * 60,
            denylist_enabled: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Process-local map. Only correct with a single server instance.
    #[default]
    Memory,
    /// Shared `oauth_state` table, safe across instances.
    Database,
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub backend: StateBackend,
    pub ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            backend: StateBackend::Memory,
            ttl_secs: 600,
            sweep_interval_secs: 60,
        }
    }
}

#[derive(Clone, Deserialize)]
pub struct BootstrapAdmin {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct LocalAuthConfig {
    pub registration_enabled: bool,
    pub bootstrap_admin: Option<BootstrapAdmin>,
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct PlatformModeConfig {
    /// Skip per-request authentication and bind every request to one account.
    pub enabled: bool,
    pub username: String,
    pub allow_in_production: bool,
}

impl Default for PlatformModeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            username: "platform".into(),
            allow_in_production: false,
        }
    }
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub environment: Environment,
    pub listen_addr: String,
    pub database_url: String,
    /// Where the OAuth2 callback sends the browser afterwards.
    pub app_root_url: String,
    pub oauth: OAuthConfig,
    pub session: SessionConfig,
    pub state: StateConfig,
    pub local: LocalAuthConfig,
    pub platform_mode: PlatformModeConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            environment: Environment::Development,
            listen_addr: "0.0.0.0:8080".into(),
            database_url: "sqlite://agent-portal.db?mode=rwc".into(),
            app_root_url: "/".into(),
            oauth: OAuthConfig::default(),
            session: SessionConfig::default(),
            state: StateConfig::default(),
            local: LocalAuthConfig::default(),
            platform_mode: PlatformModeConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn is_production(&self) -> bool {
        self.environment == Environment::Production
    }

    /// Returns the secret session tokens are signed with.
    ///
    /// Production requires an explicit secret of at least
    /// [`MIN_SIGNING_SECRET_LEN`] bytes; other environments fall back to
    /// [`DEVELOPMENT_SIGNING_SECRET`].
    pub fn signing_secret(&self) -> Result<&str, ConfigError> {
        match self.session.signing_secret.as_deref().filter(|s| !s.is_empty()) {
            Some(secret) if self.is_production() && secret.len() < MIN_SIGNING_SECRET_LEN => {
                Err(ConfigError::Validation(format!(
                    "session.signing_secret must be at least {MIN_SIGNING_SECRET_LEN} bytes in production"
                )))
            }
            Some(secret) => Ok(secret),
            None if self.is_production() => Err(ConfigError::Validation(
                "session.signing_secret is required in production".into(),
            )),
            None => Ok(DEVELOPMENT_SIGNING_SECRET),
        }
    }

    /// Check cross-field invariants. Called by [`load_config`]; tests that
    /// build an `AppConfig` by hand should call it too.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.signing_secret()?;

        if !(1..=MAX_SESSION_LIFETIME_SECS).contains(&self.session.lifetime_secs) {
            return Err(ConfigError::Validation(format!(
                "session.lifetime_secs must be between 1 and {MAX_SESSION_LIFETIME_SECS}"
            )));
        }
        if !(1..=MAX_STATE_TTL_SECS).contains(&self.state.ttl_secs) {
            return Err(ConfigError::Validation(format!(
                "state.ttl_secs must be between 1 and {MAX_STATE_TTL_SECS}"
            )));
        }
        if self.platform_mode.enabled {
            if self.platform_mode.username.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "platform_mode.username must not be empty".into(),
                ));
            }
            if self.is_production() && !self.platform_mode.allow_in_production {
                return Err(ConfigError::Validation(
                    "platform_mode is enabled in production without platform_mode.allow_in_production"
                        .into(),
                ));
            }
        }
        Ok(())
    }
}

/// Load application configuration from `config.yaml` + environment overrides.
///
/// Environment variables use double underscores as the path separator
/// (`OAUTH__CLIENT_ID`, `SESSION__SIGNING_SECRET`). List values such as
/// `OAUTH__ALLOWED_EMAILS` are comma separated. The YAML file is optional.
pub fn load_config() -> Result<AppConfig, ConfigError> {
    use config::{Config, Environment as EnvSource, File};
    let cfg = Config::builder()
        .add_source(File::with_name("config.yaml").required(false))
        .add_source(
            EnvSource::default()
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("oauth.scopes")
                .with_list_parse_key("oauth.allowed_emails")
                .with_list_parse_key("oauth.link_local_emails")
                .try_parsing(true),
        )
        .build()?;

    let app: AppConfig = cfg.try_deserialize()?;
    app.validate()?;
    Ok(app)
}

/// Convenience helper for binaries wanting panic-on-error behaviour.
pub fn load_config_or_panic() -> AppConfig {
    match load_config() {
        Ok(c) => c,
        Err(e) => panic!("Failed to load configuration: {e}"),
    }
}
