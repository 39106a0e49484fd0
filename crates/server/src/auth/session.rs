//! Session token codec.
//!
//! Session tokens are HS256 JWTs signed with the server-held secret. They are
//! self-verifying: signature and expiry are checked here without touching the
//! database. Callers that need to reject tokens of deleted users combine
//! [`SessionCodec::verify`] with a credential-store lookup (see
//! [`crate::auth::middleware::AuthGate`]).
//!
//! Local sessions carry no scope list and are treated as unrestricted;
//! federated sessions carry the scopes granted by the provider.

use std::collections::BTreeSet;

use dashmap::DashMap;
use jsonwebtoken::{
    Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode, errors::ErrorKind,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use utoipa::ToSchema;

use crate::auth::password::generate_token;
use crate::config::{AppConfig, ConfigError};
use crate::entity::user_account;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionTokenError {
    #[error("session token has expired")]
    Expired,
    #[error("session token is invalid")]
    Invalid,
    #[error("session token has been revoked")]
    Revoked,
    #[error("failed to encode session token: {0}")]
    Encoding(String),
}

/// Login path that produced a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum SessionOrigin {
    Local,
    Federated,
}

/// Permissions attached to a session.
///
/// `Unrestricted` is the trusted-operator mode of local and platform sessions
/// and passes every scope check. `Granted` holds the scopes a federated
/// caller was actually given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeGrant {
    Unrestricted,
    Granted(BTreeSet<String>),
}

impl ScopeGrant {
    pub fn granted<I, S>(scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ScopeGrant::Granted(scopes.into_iter().map(Into::into).collect())
    }

    pub fn allows(&self, scope: &str) -> bool {
        match self {
            ScopeGrant::Unrestricted => true,
            ScopeGrant::Granted(scopes) => scopes.contains(scope),
        }
    }

    /// Explicit scope list, `None` when unrestricted.
    pub fn scopes(&self) -> Option<Vec<String>> {
        match self {
            ScopeGrant::Unrestricted => None,
            ScopeGrant::Granted(scopes) => Some(scopes.iter().cloned().collect()),
        }
    }

    fn origin(&self) -> SessionOrigin {
        match self {
            ScopeGrant::Unrestricted => SessionOrigin::Local,
            ScopeGrant::Granted(_) => SessionOrigin::Federated,
        }
    }
}

/// Claims carried by a session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    /// User account id
    pub sub: String,
    pub username: String,
    /// Issued at (unix seconds)
    pub iat: i64,
    /// Expires at (unix seconds)
    pub exp: i64,
    /// Token id, used by the optional denylist
    pub jti: String,
    pub origin: SessionOrigin,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<String>>,
}

impl SessionClaims {
    pub fn grant(&self) -> ScopeGrant {
        match self.origin {
            SessionOrigin::Local => ScopeGrant::Unrestricted,
            SessionOrigin::Federated => {
                ScopeGrant::granted(self.scopes.clone().unwrap_or_default())
            }
        }
    }
}

/// A freshly signed token together with its claims.
#[derive(Debug, Clone)]
pub struct IssuedSession {
    pub token: String,
    pub claims: SessionClaims,
}

impl IssuedSession {
    pub fn expires_in(&self) -> i64 {
        self.claims.exp - self.claims.iat
    }
}

/// Logged-out token ids, kept until the token would have expired anyway.
#[derive(Debug, Default)]
pub struct Denylist {
    entries: DashMap<String, i64>,
}

impl Denylist {
    pub fn insert(&self, jti: &str, expires_at: i64) {
        self.entries.insert(jti.to_string(), expires_at);
    }

    pub fn contains(&self, jti: &str, now: i64) -> bool {
        self.entries.get(jti).is_some_and(|exp| *exp > now)
    }

    /// Drop entries whose tokens have expired. Returns the number removed.
    pub fn sweep(&self, now: i64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, exp| *exp > now);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub struct SessionCodec {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    lifetime: Duration,
    denylist: Option<Denylist>,
}

impl SessionCodec {
    pub fn new(secret: &[u8], lifetime: Duration) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // Expiry is checked against our own clock in `verify_at`.
        validation.validate_exp = false;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
            lifetime,
            denylist: None,
        }
    }

    pub fn with_denylist(mut self) -> Self {
        self.denylist = Some(Denylist::default());
        self
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, ConfigError> {
        let secret = config.signing_secret()?;
        if !config.is_production() && config.session.signing_secret.is_none() {
            tracing::warn!(
                "session.signing_secret is not set; using the built-in development secret. \
                 Never run like this in production."
            );
        }
        let lifetime = i64::try_from(config.session.lifetime_secs).map_err(|_| {
            ConfigError::Validation("session.lifetime_secs is out of range".into())
        })?;
        let codec = Self::new(secret.as_bytes(), Duration::seconds(lifetime));
        Ok(if config.session.denylist_enabled {
            codec.with_denylist()
        } else {
            codec
        })
    }

    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    pub fn issue(
        &self,
        account: &user_account::Model,
        grant: &ScopeGrant,
    ) -> Result<IssuedSession, SessionTokenError> {
        self.issue_at(account, grant, OffsetDateTime::now_utc())
    }

    pub fn issue_at(
        &self,
        account: &user_account::Model,
        grant: &ScopeGrant,
        issued_at: OffsetDateTime,
    ) -> Result<IssuedSession, SessionTokenError> {
        let expires_at = issued_at
            .checked_add(self.lifetime)
            .ok_or_else(|| SessionTokenError::Encoding("token lifetime out of range".into()))?;
        let claims = SessionClaims {
            sub: account.id.clone(),
            username: account.username.clone(),
            iat: issued_at.unix_timestamp(),
            exp: expires_at.unix_timestamp(),
            jti: generate_token().map_err(|e| SessionTokenError::Encoding(e.to_string()))?,
            origin: grant.origin(),
            scopes: grant.scopes(),
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| SessionTokenError::Encoding(e.to_string()))?;
        Ok(IssuedSession { token, claims })
    }

    pub fn verify(&self, token: &str) -> Result<SessionClaims, SessionTokenError> {
        self.verify_at(token, OffsetDateTime::now_utc())
    }

    pub fn verify_at(
        &self,
        token: &str,
        now: OffsetDateTime,
    ) -> Result<SessionClaims, SessionTokenError> {
        let claims = decode::<SessionClaims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => SessionTokenError::Expired,
                _ => SessionTokenError::Invalid,
            })?;

        let now = now.unix_timestamp();
        if claims.exp <= now {
            return Err(SessionTokenError::Expired);
        }
        if self
            .denylist
            .as_ref()
            .is_some_and(|list| list.contains(&claims.jti, now))
        {
            return Err(SessionTokenError::Revoked);
        }
        Ok(claims)
    }

    /// Record a token as logged out. Returns `false` when no denylist is
    /// configured, in which case the token stays valid until it expires.
    pub fn revoke(&self, claims: &SessionClaims) -> bool {
        match &self.denylist {
            Some(list) => {
                list.insert(&claims.jti, claims.exp);
                true
            }
            None => false,
        }
    }

    pub fn sweep_denylist(&self) -> usize {
        self.denylist
            .as_ref()
            .map_or(0, |list| list.sweep(OffsetDateTime::now_utc().unix_timestamp()))
    }
}
