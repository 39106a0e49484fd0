//! Client for the upstream OAuth2/OIDC identity provider.
//!
//! Covers the relying-party half of the authorization code flow: building
//! the authorization redirect, exchanging the code, fetching the profile and
//! revoking provider tokens on logout. None of these calls are retried; an
//! authorization code is single-use upstream, so a retry can only fail.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::config::OAuthConfig;
use crate::error::AuthError;

#[derive(Debug, Error)]
pub enum FederatedError {
    #[error("OAuth2 client credentials are not configured")]
    NotConfigured,
    #[error("identity provider returned {status}: {body}")]
    Upstream { status: u16, body: String },
    #[error("request to identity provider failed: {0}")]
    Transport(String),
    #[error("unexpected response from identity provider: {0}")]
    InvalidResponse(String),
    #[error("invalid identity provider URL: {0}")]
    InvalidUrl(String),
}

impl From<reqwest::Error> for FederatedError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => FederatedError::Upstream {
                status: status.as_u16(),
                body: e.to_string(),
            },
            None => FederatedError::Transport(e.to_string()),
        }
    }
}

impl From<FederatedError> for AuthError {
    fn from(e: FederatedError) -> Self {
        match e {
            FederatedError::NotConfigured | FederatedError::InvalidUrl(_) => {
                AuthError::Configuration(e.to_string())
            }
            FederatedError::Upstream { status, body } => AuthError::Upstream {
                status: Some(status),
                body,
            },
            FederatedError::Transport(body) | FederatedError::InvalidResponse(body) => {
                AuthError::Upstream { status: None, body }
            }
        }
    }
}

/// Result of a successful code exchange.
#[derive(Debug, Clone)]
pub struct TokenExchange {
    pub access_token: String,
    /// The provider's token response as received (`id_token`, `scope`,
    /// `expires_in` and any vendor fields).
    pub raw_claims: Value,
}

impl TokenExchange {
    fn from_response(raw_claims: Value) -> Result<Self, FederatedError> {
        let access_token = raw_claims
            .get("access_token")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| FederatedError::InvalidResponse("missing access_token".into()))?
            .to_string();
        Ok(Self {
            access_token,
            raw_claims,
        })
    }

    /// Scopes the provider actually granted, when its response says.
    pub fn granted_scopes(&self) -> Option<Vec<String>> {
        self.raw_claims
            .get("scope")
            .and_then(Value::as_str)
            .map(|s| s.split_whitespace().map(String::from).collect())
    }
}

/// Identity reported by the provider's userinfo endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FederatedProfile {
    pub subject: String,
    pub email: Option<String>,
    pub name: Option<String>,
}

impl FederatedProfile {
    fn from_userinfo(info: &Value) -> Result<Self, FederatedError> {
        let subject = ["sub", "id"]
            .iter()
            .find_map(|key| match info.get(key) {
                Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
                Some(Value::Number(n)) => Some(n.to_string()),
                _ => None,
            })
            .ok_or_else(|| FederatedError::InvalidResponse("userinfo has no subject".into()))?;

        let text = |key: &str| {
            info.get(key)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(String::from)
        };

        Ok(Self {
            subject,
            email: text("email"),
            name: text("name").or_else(|| text("preferred_username")),
        })
    }
}

pub struct FederatedClient {
    http: reqwest::Client,
    settings: OAuthConfig,
}

impl FederatedClient {
    pub fn new(settings: &OAuthConfig) -> Result<Self, FederatedError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .user_agent(concat!("agent-portal/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FederatedError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            settings: settings.clone(),
        })
    }

    /// Both the client id and secret are present and non-empty.
    pub fn is_configured(&self) -> bool {
        self.credentials().is_some()
    }

    pub fn provider_url(&self) -> &str {
        &self.settings.provider_url
    }

    fn credentials(&self) -> Option<(&str, &str)> {
        let id = self.settings.client_id.as_deref().filter(|s| !s.is_empty())?;
        let secret = self
            .settings
            .client_secret
            .as_deref()
            .filter(|s| !s.is_empty())?;
        Some((id, secret))
    }

    fn require_credentials(&self) -> Result<(&str, &str), FederatedError> {
        self.credentials().ok_or(FederatedError::NotConfigured)
    }

    fn endpoint(&self, path: &str) -> Result<Url, FederatedError> {
        let base = self.settings.provider_url.trim_end_matches('/');
        Url::parse(&format!("{base}{path}"))
            .map_err(|e| FederatedError::InvalidUrl(format!("{base}{path}: {e}")))
    }

    /// URL to send the browser to, carrying `state`.
    pub fn build_authorization_request(&self, state: &str) -> Result<Url, FederatedError> {
        let (client_id, _) = self.require_credentials()?;
        let mut url = self.endpoint(&self.settings.authorize_path)?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", client_id)
            .append_pair("redirect_uri", &self.settings.redirect_uri)
            .append_pair("scope", &self.settings.scopes.join(" "))
            .append_pair("state", state);
        Ok(url)
    }

    #[tracing::instrument(skip_all)]
    pub async fn exchange_code(&self, code: &str) -> Result<TokenExchange, FederatedError> {
        let (client_id, client_secret) = self.require_credentials()?;
        let response = self
            .http
            .post(self.endpoint(&self.settings.token_path)?)
            .basic_auth(client_id, Some(client_secret))
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", self.settings.redirect_uri.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FederatedError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        let raw_claims: Value = response
            .json()
            .await
            .map_err(|e| FederatedError::InvalidResponse(e.to_string()))?;
        TokenExchange::from_response(raw_claims)
    }

    #[tracing::instrument(skip_all)]
    pub async fn fetch_profile(&self, access_token: &str) -> Result<FederatedProfile, FederatedError> {
        let response = self
            .http
            .get(self.endpoint(&self.settings.userinfo_path)?)
            .bearer_auth(access_token)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FederatedError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        let info: Value = response
            .json()
            .await
            .map_err(|e| FederatedError::InvalidResponse(e.to_string()))?;
        FederatedProfile::from_userinfo(&info)
    }

    /// Best-effort token revocation. Failures are logged, never returned.
    #[tracing::instrument(skip_all)]
    pub async fn revoke(&self, token: &str) {
        let Some((client_id, client_secret)) = self.credentials() else {
            return;
        };
        let url = match self.endpoint(&self.settings.revoke_path) {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping upstream token revocation");
                return;
            }
        };

        let result = self
            .http
            .post(url)
            .basic_auth(client_id, Some(client_secret))
            .form(&[("token", token), ("token_type_hint", "access_token")])
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                tracing::debug!("Revoked upstream access token");
            }
            Ok(response) => {
                tracing::warn!(status = %response.status(), "Upstream token revocation rejected");
            }
            Err(e) => tracing::warn!(error = %e, "Upstream token revocation failed"),
        }
    }
}
