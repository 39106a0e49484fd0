//! Auth orchestrator: the login state machine tying the auth components together.
//!
//! Federated flow: `begin_login` issues a handshake state and returns the
//! provider URL; `complete_callback` consumes the state, exchanges the code,
//! applies the email allow-list, reconciles the account by subject and issues
//! a session token. Every callback failure becomes a [`Rejection`] that the
//! HTTP layer turns into a redirect carrying only a machine-readable code.
//!
//! Local flow: `login_local` and `register_local` against the credential store.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Deserialize;
use url::Url;
use utoipa::IntoParams;

use crate::auth::credentials::{
    CredentialStore, FEDERATED_USERNAME_PREFIX, FederatedAccount, NewLocalAccount,
};
use crate::auth::federated::FederatedClient;
use crate::auth::password::verify_password;
use crate::auth::session::{IssuedSession, ScopeGrant, SessionCodec, SessionOrigin};
use crate::auth::state::StateStore;
use crate::config::AppConfig;
use crate::entity::user_account;
use crate::error::AuthError;

const MAX_PROVIDER_DESCRIPTION: usize = 200;
const MAX_USERNAME_LEN: usize = 64;
const MIN_PASSWORD_LEN: usize = 8;

/// Query parameters the provider sends to the callback.
#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct CallbackParams {
    /// Authorization code
    pub code: Option<String>,
    /// State issued at login initiation
    pub state: Option<String>,
    /// Error code, when the provider refused the request
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// Why a callback did not produce a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionKind {
    ProviderError,
    MissingParameters,
    InvalidState,
    TokenExchangeFailed,
    ProfileFetchFailed,
    AccessDenied,
    ServerError,
}

impl RejectionKind {
    pub fn code(self) -> &'static str {
        match self {
            RejectionKind::ProviderError => "oauth_error",
            RejectionKind::MissingParameters => "missing_parameters",
            RejectionKind::InvalidState => "invalid_state",
            RejectionKind::TokenExchangeFailed => "token_exchange_failed",
            RejectionKind::ProfileFetchFailed => "profile_fetch_failed",
            RejectionKind::AccessDenied => "access_denied",
            RejectionKind::ServerError => "server_error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub kind: RejectionKind,
    /// Only set for provider-supplied denials.
    pub description: Option<String>,
}

impl From<RejectionKind> for Rejection {
    fn from(kind: RejectionKind) -> Self {
        Rejection {
            kind,
            description: None,
        }
    }
}

/// Callback-stage errors that have no more specific rejection become
/// `server_error`; upstream failures are classified where they happen.
impl From<AuthError> for Rejection {
    fn from(error: AuthError) -> Self {
        match error {
            AuthError::Csrf => RejectionKind::InvalidState,
            AuthError::AccessDenied(_) => RejectionKind::AccessDenied,
            _ => RejectionKind::ServerError,
        }
        .into()
    }
}

#[derive(Debug)]
pub enum CallbackOutcome {
    Authenticated(IssuedSession),
    Rejected(Rejection),
}

/// Whether federated login is available, and against which provider.
#[derive(Debug, Clone)]
pub struct FederatedStatus {
    pub configured: bool,
    pub provider_url: String,
}

pub struct AuthOrchestrator {
    federated: FederatedClient,
    states: Arc<dyn StateStore>,
    credentials: CredentialStore,
    codec: Arc<SessionCodec>,
    allowed_emails: HashSet<String>,
    link_local_emails: HashSet<String>,
    default_scopes: Vec<String>,
    app_root_url: String,
    registration_enabled: bool,
}

fn lowercase_set(emails: &[String]) -> HashSet<String> {
    emails
        .iter()
        .map(|e| e.trim().to_lowercase())
        .filter(|e| !e.is_empty())
        .collect()
}

impl AuthOrchestrator {
    pub fn new(
        config: &AppConfig,
        federated: FederatedClient,
        states: Arc<dyn StateStore>,
        credentials: CredentialStore,
        codec: Arc<SessionCodec>,
    ) -> Self {
        Self {
            federated,
            states,
            credentials,
            codec,
            allowed_emails: lowercase_set(&config.oauth.allowed_emails),
            link_local_emails: lowercase_set(&config.oauth.link_local_emails),
            default_scopes: config.oauth.scopes.clone(),
            app_root_url: config.app_root_url.clone(),
            registration_enabled: config.local.registration_enabled,
        }
    }

    pub fn status(&self) -> FederatedStatus {
        FederatedStatus {
            configured: self.federated.is_configured(),
            provider_url: self.federated.provider_url().to_string(),
        }
    }

    /// Idle -> AwaitingCallback. Fails with `Configuration` before any state
    /// is issued when federated login is not configured.
    #[tracing::instrument(skip(self))]
    pub async fn begin_login(&self) -> Result<Url, AuthError> {
        if !self.federated.is_configured() {
            return Err(AuthError::Configuration(
                "OAuth2 is not configured".into(),
            ));
        }
        let state = self.states.issue().await?;
        Ok(self.federated.build_authorization_request(&state)?)
    }

    /// AwaitingCallback -> Authenticated | Rejected.
    #[tracing::instrument(skip_all)]
    pub async fn complete_callback(&self, params: CallbackParams) -> CallbackOutcome {
        match self.try_complete_callback(params).await {
            Ok(session) => CallbackOutcome::Authenticated(session),
            Err(rejection) => {
                tracing::info!(reason = rejection.kind.code(), "OAuth2 callback rejected");
                CallbackOutcome::Rejected(rejection)
            }
        }
    }

    async fn try_complete_callback(
        &self,
        params: CallbackParams,
    ) -> Result<IssuedSession, Rejection> {
        if let Some(error) = params.error {
            let description = params
                .error_description
                .filter(|d| !d.trim().is_empty())
                .unwrap_or(error);
            return Err(Rejection {
                kind: RejectionKind::ProviderError,
                description: Some(sanitize_description(&description)),
            });
        }

        let (Some(code), Some(state)) = (
            params.code.filter(|c| !c.is_empty()),
            params.state.filter(|s| !s.is_empty()),
        ) else {
            return Err(RejectionKind::MissingParameters.into());
        };

        match self.states.consume(&state).await {
            Ok(true) => {}
            Ok(false) => return Err(AuthError::Csrf.into()),
            Err(e) => {
                tracing::error!(error = %e, "State store failure");
                return Err(e.into());
            }
        }

        let exchange = self.federated.exchange_code(&code).await.map_err(|e| {
            tracing::warn!(error = %e, "OAuth2 code exchange failed");
            Rejection::from(RejectionKind::TokenExchangeFailed)
        })?;

        let profile = self
            .federated
            .fetch_profile(&exchange.access_token)
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, "OAuth2 profile fetch failed");
                Rejection::from(RejectionKind::ProfileFetchFailed)
            })?;

        let email = profile.email.as_deref().map(str::to_lowercase);
        let Some(email) = email.filter(|e| self.allowed_emails.contains(e)) else {
            tracing::warn!(subject = %profile.subject, "Federated identity not on the allow-list");
            return Err(AuthError::AccessDenied(profile.subject).into());
        };

        let account = self
            .reconcile(&profile.subject, &email, profile.name.as_deref(), &exchange.access_token)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to reconcile federated account");
                Rejection::from(e)
            })?;

        let grant = ScopeGrant::granted(
            exchange
                .granted_scopes()
                .unwrap_or_else(|| self.default_scopes.clone()),
        );
        let session = self.codec.issue(&account, &grant).map_err(|e| {
            tracing::error!(error = %e, "Failed to issue session token");
            Rejection::from(RejectionKind::ServerError)
        })?;

        tracing::info!(user_id = %account.id, "Federated login succeeded");
        Ok(session)
    }

    async fn reconcile(
        &self,
        subject: &str,
        email: &str,
        name: Option<&str>,
        upstream_access_token: &str,
    ) -> Result<user_account::Model, AuthError> {
        if self.link_local_emails.contains(email) {
            self.credentials.link_local_account(email, subject).await?;
        }
        self.credentials
            .upsert_federated(FederatedAccount {
                subject,
                email: Some(email),
                display_name: name,
                upstream_access_token: Some(upstream_access_token),
            })
            .await
    }

    /// Where the callback redirects the browser for `outcome`.
    pub fn redirect_location(&self, outcome: &CallbackOutcome) -> String {
        let mut query = url::form_urlencoded::Serializer::new(String::new());
        match outcome {
            CallbackOutcome::Authenticated(session) => {
                query.append_pair("token", &session.token);
            }
            CallbackOutcome::Rejected(rejection) => {
                query.append_pair("error", rejection.kind.code());
                if let Some(description) = &rejection.description {
                    query.append_pair("error_description", description);
                }
            }
        }
        let separator = if self.app_root_url.contains('?') { '&' } else { '?' };
        format!("{}{separator}{}", self.app_root_url, query.finish())
    }

    #[tracing::instrument(skip(self, password))]
    pub async fn login_local(
        &self,
        username: &str,
        password: &str,
    ) -> Result<IssuedSession, AuthError> {
        let account = self
            .credentials
            .find_by_username(username)
            .await?
            .ok_or(AuthError::InvalidCredentials)?;

        let Some(hash) = account.password_hash.as_deref().filter(|h| !h.is_empty()) else {
            tracing::debug!("Password login attempted on a federated-only account");
            return Err(AuthError::InvalidCredentials);
        };
        if !verify_password(password, hash) {
            return Err(AuthError::InvalidCredentials);
        }

        self.credentials.record_login(&account.id).await?;
        let session = self
            .codec
            .issue(&account, &ScopeGrant::Unrestricted)
            .map_err(|e| AuthError::Internal(e.to_string()))?;
        tracing::info!(user_id = %account.id, "Local login succeeded");
        Ok(session)
    }

    #[tracing::instrument(skip(self, password))]
    pub async fn register_local(
        &self,
        username: &str,
        password: &str,
        email: Option<&str>,
    ) -> Result<user_account::Model, AuthError> {
        if !self.registration_enabled {
            return Err(AuthError::Forbidden(
                "Local registration is disabled".into(),
            ));
        }
        let username = username.trim();
        if username.is_empty() || username.len() > MAX_USERNAME_LEN {
            return Err(AuthError::BadRequest(format!(
                "username must be 1-{MAX_USERNAME_LEN} characters"
            )));
        }
        if username.starts_with(FEDERATED_USERNAME_PREFIX) || username.contains(char::is_whitespace)
        {
            return Err(AuthError::BadRequest("username is not allowed".into()));
        }
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(AuthError::BadRequest(format!(
                "password must be at least {MIN_PASSWORD_LEN} characters"
            )));
        }

        self.credentials
            .create_local(NewLocalAccount {
                username,
                password,
                email: email.map(str::trim).filter(|e| !e.is_empty()),
                display_name: None,
            })
            .await
    }

    /// Best-effort logout. Never fails: local invalidation is limited to the
    /// optional denylist and upstream revocation errors are only logged.
    ///
    /// Only the provider access token stored at login is sent upstream; the
    /// bearer itself is our own session token and never leaves the service.
    #[tracing::instrument(skip_all)]
    pub async fn logout(&self, bearer: Option<&str>) {
        let Some(token) = bearer else {
            return;
        };

        let claims = match self.codec.verify(token) {
            Ok(claims) => claims,
            Err(e) => {
                tracing::debug!(error = %e, "Logout with unverifiable token");
                return;
            }
        };

        if self.codec.revoke(&claims) {
            tracing::debug!(user_id = %claims.sub, "Session token added to denylist");
        }

        if claims.origin == SessionOrigin::Federated {
            match self.credentials.take_upstream_token(&claims.sub).await {
                Ok(Some(upstream)) => self.federated.revoke(&upstream).await,
                Ok(None) => tracing::debug!("No upstream token left to revoke"),
                Err(e) => {
                    tracing::warn!(error = %e, "Could not load upstream token for revocation")
                }
            }
        }
        tracing::info!(user_id = %claims.sub, "Logged out");
    }
}

/// Provider text shown back to the browser: control characters dropped,
/// length capped.
fn sanitize_description(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_control())
        .take(MAX_PROVIDER_DESCRIPTION)
        .collect()
}
