//! OAuth2 handshake state store (CSRF protection for the callback).
//!
//! Each state token is consumed at most once: `consume` removes the entry and
//! reports whether it was present and unexpired in a single atomic step, so
//! concurrent callbacks replaying the same state have exactly one winner.
//! Expired entries are treated as absent whether or not a sweep has run yet.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter,
};
use time::OffsetDateTime;

use crate::auth::password::generate_token;
use crate::auth::session::SessionCodec;
use crate::config::{StateBackend, StateConfig};
use crate::entity::oauth_state;
use crate::error::AuthError;

#[async_trait]
pub trait StateStore: Send + Sync {
    /// Generate, record and return a fresh state token.
    async fn issue(&self) -> Result<String, AuthError>;

    /// Atomically check and remove `token`. `true` only for the first caller
    /// presenting an unexpired token.
    async fn consume(&self, token: &str) -> Result<bool, AuthError>;

    /// Reclaim expired entries. Returns how many were removed.
    async fn sweep(&self) -> Result<u64, AuthError>;
}

/// Single-instance store backed by a process-local map.
pub struct InMemoryStateStore {
    entries: DashMap<String, Instant>,
    ttl: Duration,
}

impl InMemoryStateStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn issue(&self) -> Result<String, AuthError> {
        let expires_at = Instant::now()
            .checked_add(self.ttl)
            .ok_or_else(|| AuthError::Configuration("state TTL is out of range".into()))?;
        let token = generate_token()?;
        self.entries.insert(token.clone(), expires_at);
        Ok(token)
    }

    async fn consume(&self, token: &str) -> Result<bool, AuthError> {
        // DashMap::remove takes the shard write lock, so only one caller gets the entry.
        Ok(self
            .entries
            .remove(token)
            .is_some_and(|(_, expires_at)| expires_at > Instant::now()))
    }

    async fn sweep(&self) -> Result<u64, AuthError> {
        let before = self.entries.len();
        let now = Instant::now();
        self.entries.retain(|_, expires_at| *expires_at > now);
        Ok(before.saturating_sub(self.entries.len()) as u64)
    }
}

/// Store backed by the shared `oauth_state` table, correct across instances.
pub struct DatabaseStateStore {
    db: Arc<DatabaseConnection>,
    ttl: Duration,
}

impl DatabaseStateStore {
    pub fn new(db: Arc<DatabaseConnection>, ttl: Duration) -> Self {
        Self { db, ttl }
    }
}

#[async_trait]
impl StateStore for DatabaseStateStore {
    async fn issue(&self) -> Result<String, AuthError> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let expires_at = i64::try_from(self.ttl.as_secs())
            .ok()
            .and_then(|ttl| now.checked_add(ttl))
            .ok_or_else(|| AuthError::Configuration("state TTL is out of range".into()))?;
        let token = generate_token()?;
        oauth_state::ActiveModel {
            token: Set(token.clone()),
            created_at: Set(now),
            expires_at: Set(expires_at),
        }
        .insert(self.db.as_ref())
        .await?;
        Ok(token)
    }

    async fn consume(&self, token: &str) -> Result<bool, AuthError> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let result = oauth_state::Entity::delete_many()
            .filter(oauth_state::Column::Token.eq(token))
            .filter(oauth_state::Column::ExpiresAt.gt(now))
            .exec(self.db.as_ref())
            .await?;
        Ok(result.rows_affected == 1)
    }

    async fn sweep(&self) -> Result<u64, AuthError> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let result = oauth_state::Entity::delete_many()
            .filter(oauth_state::Column::ExpiresAt.lte(now))
            .exec(self.db.as_ref())
            .await?;
        Ok(result.rows_affected)
    }
}

/// Build the store selected by `state.backend`.
pub fn state_store_from_config(
    config: &StateConfig,
    db: Arc<DatabaseConnection>,
) -> Arc<dyn StateStore> {
    let ttl = Duration::from_secs(config.ttl_secs);
    match config.backend {
        StateBackend::Memory => Arc::new(InMemoryStateStore::new(ttl)),
        StateBackend::Database => Arc::new(DatabaseStateStore::new(db, ttl)),
    }
}

/// Periodically reclaim expired handshake states and denylist entries.
///
/// Correctness never depends on this task; it only bounds memory.
pub fn spawn_sweeper(
    states: Arc<dyn StateStore>,
    codec: Arc<SessionCodec>,
    every: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            match states.sweep().await {
                Ok(0) => {}
                Ok(removed) => tracing::debug!(removed, "Swept expired OAuth2 states"),
                Err(e) => tracing::warn!(error = %e, "Failed to sweep OAuth2 states"),
            }
            let dropped = codec.sweep_denylist();
            if dropped > 0 {
                tracing::debug!(dropped, "Swept expired denylist entries");
            }
        }
    })
}
