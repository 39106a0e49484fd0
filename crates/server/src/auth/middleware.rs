//! Request authentication and scope-gated extractors.
//!
//! Handlers declare what they need in their signature:
//!
//! ```ignore
//! async fn list(RequireScope(user, ..): RequireScope<AgentView>) -> impl IntoResponse { .. }
//! ```
//!
//! Missing or invalid credentials are rejected with 401 before any handler
//! runs; a valid session lacking the scope is rejected with 403.

use std::marker::PhantomData;
use std::sync::Arc;

use axum::{
    extract::FromRequestParts,
    http::{HeaderMap, header, request::Parts},
};

use crate::AppResources;
use crate::auth::credentials::CredentialStore;
use crate::auth::session::{ScopeGrant, SessionCodec, SessionOrigin, SessionTokenError};
use crate::error::AuthError;

pub const SCOPE_AGENT_VIEW: &str = "agent:view";
pub const SCOPE_AGENT_CONTROL: &str = "agent:control";

/// The caller a request was authenticated as.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub user_id: String,
    pub username: String,
    pub email: Option<String>,
    pub origin: SessionOrigin,
    pub grant: ScopeGrant,
}

impl AuthenticatedUser {
    pub fn has_scope(&self, scope: &str) -> bool {
        self.grant.allows(scope)
    }

    pub fn is_unrestricted(&self) -> bool {
        self.grant == ScopeGrant::Unrestricted
    }
}

/// How requests are authenticated. Resolved once at startup.
#[derive(Debug, Clone)]
pub enum AuthMode {
    /// Every request must present a valid session token.
    Session,
    /// Authentication is skipped; every request acts as this account.
    Platform(AuthenticatedUser),
}

pub struct AuthGate {
    mode: AuthMode,
    codec: Arc<SessionCodec>,
    credentials: CredentialStore,
}

impl AuthGate {
    pub fn new(mode: AuthMode, codec: Arc<SessionCodec>, credentials: CredentialStore) -> Self {
        Self {
            mode,
            codec,
            credentials,
        }
    }

    pub fn mode(&self) -> &AuthMode {
        &self.mode
    }

    /// Authenticate a request from its headers.
    ///
    /// The token must verify and its subject must still exist; tokens of
    /// deleted accounts are rejected even while unexpired.
    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<AuthenticatedUser, AuthError> {
        if let AuthMode::Platform(user) = &self.mode {
            return Ok(user.clone());
        }

        let token = bearer_token(headers)?;
        let claims = self.codec.verify(token).map_err(|e| {
            tracing::debug!(error = %e, "Rejected session token");
            AuthError::Unauthenticated(
                match e {
                    SessionTokenError::Expired => "Token has expired",
                    SessionTokenError::Revoked => "Token has been revoked",
                    _ => "Token is not valid",
                }
                .into(),
            )
        })?;

        let account = self
            .credentials
            .find_by_id(&claims.sub)
            .await?
            .ok_or_else(|| {
                tracing::warn!(user_id = %claims.sub, "Session token for unknown account");
                AuthError::Unauthenticated("User not found".into())
            })?;

        Ok(AuthenticatedUser {
            grant: claims.grant(),
            user_id: account.id,
            username: account.username,
            email: account.email,
            origin: claims.origin,
        })
    }
}

/// Extract the token from `Authorization: Bearer <token>`.
pub fn bearer_token(headers: &HeaderMap) -> Result<&str, AuthError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or_else(|| AuthError::Unauthenticated("Missing Authorization header".into()))?
        .to_str()
        .map_err(|_| AuthError::Unauthenticated("Malformed Authorization header".into()))?;

    match value.split_once(' ') {
        Some((scheme, token)) if scheme.eq_ignore_ascii_case("bearer") && !token.trim().is_empty() => {
            Ok(token.trim())
        }
        _ => Err(AuthError::Unauthenticated(
            "Authorization header must use Bearer scheme".into(),
        )),
    }
}

fn resources(parts: &Parts) -> Result<AppResources, AuthError> {
    parts.extensions.get::<AppResources>().cloned().ok_or_else(|| {
        tracing::error!("AppResources not found in extensions");
        AuthError::Internal("application resources missing".into())
    })
}

/// Any authenticated caller.
pub struct Authenticated(pub AuthenticatedUser);

impl<S> FromRequestParts<S> for Authenticated
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let resources = resources(parts)?;
        let user = resources.gate.authenticate(&parts.headers).await?;
        Ok(Authenticated(user))
    }
}

/// Scope required by a [`RequireScope`] extractor.
pub trait Scope: Send + Sync + 'static {
    const NAME: &'static str;
}

pub struct AgentView;

impl Scope for AgentView {
    const NAME: &'static str = SCOPE_AGENT_VIEW;
}

pub struct AgentControl;

impl Scope for AgentControl {
    const NAME: &'static str = SCOPE_AGENT_CONTROL;
}

/// An authenticated caller holding scope `S`.
pub struct RequireScope<S: Scope>(pub AuthenticatedUser, pub PhantomData<S>);

impl<S: Scope> RequireScope<S> {
    pub fn user(&self) -> &AuthenticatedUser {
        &self.0
    }
}

impl<St, S> FromRequestParts<St> for RequireScope<S>
where
    St: Send + Sync,
    S: Scope,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &St) -> Result<Self, Self::Rejection> {
        let Authenticated(user) = Authenticated::from_request_parts(parts, state).await?;
        if !user.has_scope(S::NAME) {
            tracing::debug!(user_id = %user.user_id, scope = S::NAME, "Insufficient scope");
            return Err(AuthError::insufficient_scope(S::NAME));
        }
        Ok(RequireScope(user, PhantomData))
    }
}
