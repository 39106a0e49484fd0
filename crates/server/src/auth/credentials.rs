//! Credential store: persistence of local and federated user accounts.
//!
//! ## Security: reconciliation by subject, never by email
//!
//! Federated logins are matched to accounts exclusively through the provider's
//! stable subject (`external_subject`). An email match alone never merges a
//! federated identity into an existing account: a provider that lets users
//! claim unverified addresses would otherwise hand out account takeovers.
//! Linking onto a local account only happens for emails on an explicit
//! allow-list ([`CredentialStore::link_local_account`]).

use std::sync::Arc;

use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QuerySelect, SqlErr,
    sea_query::{Expr, OnConflict},
};
use time::OffsetDateTime;

use crate::auth::password::{generate_token, hash_password};
use crate::entity::user_account::{self, IdentityProvider};
use crate::error::AuthError;

/// Username prefix reserved for accounts created by federated logins.
pub const FEDERATED_USERNAME_PREFIX: &str = "federated:";

/// Fields of a new local account. The password is hashed here.
#[derive(Debug, Clone)]
pub struct NewLocalAccount<'a> {
    pub username: &'a str,
    pub password: &'a str,
    pub email: Option<&'a str>,
    pub display_name: Option<&'a str>,
}

/// Profile data of a federated login, keyed by the provider subject.
#[derive(Debug, Clone)]
pub struct FederatedAccount<'a> {
    pub subject: &'a str,
    pub email: Option<&'a str>,
    pub display_name: Option<&'a str>,
    pub upstream_access_token: Option<&'a str>,
}

#[derive(Clone)]
pub struct CredentialStore {
    db: Arc<DatabaseConnection>,
}

impl CredentialStore {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn find_by_id(&self, id: &str) -> Result<Option<user_account::Model>, AuthError> {
        Ok(user_account::Entity::find_by_id(id)
            .one(self.db.as_ref())
            .await?)
    }

    pub async fn find_by_username(
        &self,
        username: &str,
    ) -> Result<Option<user_account::Model>, AuthError> {
        Ok(user_account::Entity::find()
            .filter(user_account::Column::Username.eq(username))
            .one(self.db.as_ref())
            .await?)
    }

    pub async fn find_by_subject(
        &self,
        subject: &str,
    ) -> Result<Option<user_account::Model>, AuthError> {
        Ok(user_account::Entity::find()
            .filter(user_account::Column::ExternalSubject.eq(subject))
            .one(self.db.as_ref())
            .await?)
    }

    /// Create a local account. Fails with `Conflict` if the username is taken.
    #[tracing::instrument(skip(self, account), fields(username = account.username))]
    pub async fn create_local(
        &self,
        account: NewLocalAccount<'_>,
    ) -> Result<user_account::Model, AuthError> {
        let password_hash = hash_password(account.password)?;
        let model = user_account::ActiveModel {
            id: Set(uuid::Uuid::new_v4().to_string()),
            username: Set(account.username.to_string()),
            password_hash: Set(Some(password_hash)),
            email: Set(account.email.map(str::to_lowercase)),
            display_name: Set(account.display_name.map(String::from)),
            identity_provider: Set(IdentityProvider::Local),
            external_subject: Set(None),
            upstream_access_token: Set(None),
            created_at: Set(OffsetDateTime::now_utc()),
            last_login_at: Set(None),
        };

        match model.insert(self.db.as_ref()).await {
            Ok(created) => {
                tracing::info!(user_id = %created.id, "Created local account");
                Ok(created)
            }
            Err(e) if matches!(e.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) => Err(
                AuthError::Conflict(format!("username '{}' is already taken", account.username)),
            ),
            Err(e) => Err(e.into()),
        }
    }

    /// Return the local account `username`, creating it if missing.
    ///
    /// With `password = None` the account gets a random password nobody
    /// knows, which keeps the local-account invariant without making it
    /// usable for password login.
    pub async fn ensure_local(
        &self,
        username: &str,
        password: Option<&str>,
        email: Option<&str>,
    ) -> Result<user_account::Model, AuthError> {
        if let Some(existing) = self.find_by_username(username).await? {
            return Ok(existing);
        }
        let unusable;
        let password = match password {
            Some(p) => p,
            None => {
                unusable = generate_token()?;
                unusable.as_str()
            }
        };
        match self
            .create_local(NewLocalAccount {
                username,
                password,
                email,
                display_name: None,
            })
            .await
        {
            // Lost a creation race with another instance.
            Err(AuthError::Conflict(_)) => self
                .find_by_username(username)
                .await?
                .ok_or_else(|| AuthError::Internal(format!("account '{username}' vanished"))),
            other => other,
        }
    }

    /// Attach `subject` to the local account with this email. Callers must
    /// only do this for allow-listed emails. Returns whether an account was
    /// linked.
    ///
    /// Nothing is linked when the subject already owns an account, or when
    /// the email does not identify exactly one unlinked local account.
    #[tracing::instrument(skip(self))]
    pub async fn link_local_account(&self, email: &str, subject: &str) -> Result<bool, AuthError> {
        if self.find_by_subject(subject).await?.is_some() {
            return Ok(false);
        }

        let candidates = user_account::Entity::find()
            .filter(user_account::Column::Email.eq(email.to_lowercase()))
            .filter(user_account::Column::IdentityProvider.eq(IdentityProvider::Local))
            .limit(2)
            .all(self.db.as_ref())
            .await?;
        let [candidate] = candidates.as_slice() else {
            if candidates.len() > 1 {
                tracing::warn!(subject, "Email matches several local accounts; not linking");
            }
            return Ok(false);
        };
        if candidate.external_subject.is_some() {
            return Ok(false);
        }

        let result = user_account::Entity::update_many()
            .col_expr(user_account::Column::ExternalSubject, Expr::value(subject))
            .filter(user_account::Column::Id.eq(candidate.id.as_str()))
            .filter(user_account::Column::ExternalSubject.is_null())
            .exec(self.db.as_ref())
            .await;

        match result {
            Ok(updated) if updated.rows_affected == 1 => {
                tracing::info!(subject, user_id = %candidate.id, "Linked federated identity to local account");
                Ok(true)
            }
            Ok(_) => Ok(false),
            // A concurrent first login claimed the subject in between.
            Err(e) if matches!(e.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) => {
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Create or refresh the account owned by a federated subject.
    ///
    /// This is a single `INSERT ... ON CONFLICT(external_subject) DO UPDATE`,
    /// so concurrent first logins of the same subject converge on one row.
    /// Also stamps `last_login_at`.
    #[tracing::instrument(skip(self, account), fields(subject = account.subject))]
    pub async fn upsert_federated(
        &self,
        account: FederatedAccount<'_>,
    ) -> Result<user_account::Model, AuthError> {
        let now = OffsetDateTime::now_utc();
        let model = user_account::ActiveModel {
            id: Set(uuid::Uuid::new_v4().to_string()),
            username: Set(format!("{FEDERATED_USERNAME_PREFIX}{}", account.subject)),
            password_hash: Set(None),
            email: Set(account.email.map(str::to_lowercase)),
            display_name: Set(account.display_name.map(String::from)),
            identity_provider: Set(IdentityProvider::Federated),
            external_subject: Set(Some(account.subject.to_string())),
            upstream_access_token: Set(account.upstream_access_token.map(String::from)),
            created_at: Set(now),
            last_login_at: Set(Some(now)),
        };

        let upserted = user_account::Entity::insert(model)
            .on_conflict(
                OnConflict::column(user_account::Column::ExternalSubject)
                    .update_columns([
                        user_account::Column::Email,
                        user_account::Column::DisplayName,
                        user_account::Column::UpstreamAccessToken,
                        user_account::Column::LastLoginAt,
                    ])
                    .to_owned(),
            )
            .exec_with_returning(self.db.as_ref())
            .await?;
        Ok(upserted)
    }

    pub async fn record_login(&self, id: &str) -> Result<(), AuthError> {
        user_account::Entity::update_many()
            .col_expr(
                user_account::Column::LastLoginAt,
                Expr::value(OffsetDateTime::now_utc()),
            )
            .filter(user_account::Column::Id.eq(id))
            .exec(self.db.as_ref())
            .await?;
        Ok(())
    }

    /// Remove and return the stored provider access token of an account.
    pub async fn take_upstream_token(&self, id: &str) -> Result<Option<String>, AuthError> {
        let Some(account) = self.find_by_id(id).await? else {
            return Ok(None);
        };
        let Some(token) = account.upstream_access_token.clone() else {
            return Ok(None);
        };
        let mut active: user_account::ActiveModel = account.into();
        active.upstream_access_token = Set(None);
        active.update(self.db.as_ref()).await?;
        Ok(Some(token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::{ConnectionTrait, Database, DbBackend, Statement};

    async fn setup_test_db() -> Arc<DatabaseConnection> {
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
        Arc::new(db)
    }

    fn local<'a>(username: &'a str, email: Option<&'a str>) -> NewLocalAccount<'a> {
        NewLocalAccount {
            username,
            password: "correct horse battery",
            email,
            display_name: None,
        }
    }

    fn federated<'a>(subject: &'a str, email: &'a str) -> FederatedAccount<'a> {
        FederatedAccount {
            subject,
            email: Some(email),
            display_name: Some("Fed User"),
            upstream_access_token: Some("upstream-token"),
        }
    }

    #[tokio::test]
    async fn test_create_local_hashes_password() {
        let store = CredentialStore::new(setup_test_db().await);
        let account = store.create_local(local("alice", None)).await.unwrap();

        assert_eq!(account.identity_provider, IdentityProvider::Local);
        assert!(account.has_password());
        assert_ne!(account.password_hash.as_deref(), Some("correct horse battery"));
    }

    #[tokio::test]
    async fn test_create_local_duplicate_username_conflicts() {
        let store = CredentialStore::new(setup_test_db().await);
        store.create_local(local("alice", None)).await.unwrap();

        let err = store.create_local(local("alice", None)).await.unwrap_err();
        assert!(matches!(err, AuthError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_upsert_federated_creates_then_updates_same_row() {
        let store = CredentialStore::new(setup_test_db().await);
        let first = store
            .upsert_federated(federated("sub-1", "fed@example.com"))
            .await
            .unwrap();
        assert_eq!(first.identity_provider, IdentityProvider::Federated);
        assert_eq!(first.username, "federated:sub-1");
        assert!(first.password_hash.is_none());
        assert!(first.last_login_at.is_some());

        let second = store
            .upsert_federated(FederatedAccount {
                display_name: Some("Renamed"),
                ..federated("sub-1", "fed@example.com")
            })
            .await
            .unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.display_name.as_deref(), Some("Renamed"));
    }

    #[tokio::test]
    async fn test_email_match_does_not_merge_accounts() {
        let store = CredentialStore::new(setup_test_db().await);
        let local_account = store
            .create_local(local("alice", Some("alice@example.com")))
            .await
            .unwrap();

        let fed = store
            .upsert_federated(federated("sub-alice", "alice@example.com"))
            .await
            .unwrap();
        assert_ne!(fed.id, local_account.id);

        let reloaded = store.find_by_id(&local_account.id).await.unwrap().unwrap();
        assert!(reloaded.external_subject.is_none());
    }

    #[tokio::test]
    async fn test_explicit_link_reuses_local_account() {
        let store = CredentialStore::new(setup_test_db().await);
        let local_account = store
            .create_local(local("alice", Some("Alice@Example.com")))
            .await
            .unwrap();

        assert!(store.link_local_account("alice@example.com", "sub-alice").await.unwrap());
        let linked = store
            .upsert_federated(federated("sub-alice", "alice@example.com"))
            .await
            .unwrap();

        assert_eq!(linked.id, local_account.id);
        assert_eq!(linked.identity_provider, IdentityProvider::Local);
        assert!(linked.is_linked());
        assert!(linked.has_password());

        // Already linked: a second link attempt is a no-op.
        assert!(!store.link_local_account("alice@example.com", "sub-other").await.unwrap());
    }

    #[tokio::test]
    async fn test_link_skipped_when_subject_already_has_account() {
        let store = CredentialStore::new(setup_test_db().await);
        let local_account = store
            .create_local(local("alice", Some("alice@example.com")))
            .await
            .unwrap();
        let fed = store
            .upsert_federated(federated("sub-alice", "alice@example.com"))
            .await
            .unwrap();

        assert!(!store.link_local_account("alice@example.com", "sub-alice").await.unwrap());

        let again = store
            .upsert_federated(federated("sub-alice", "alice@example.com"))
            .await
            .unwrap();
        assert_eq!(again.id, fed.id);
        let untouched = store.find_by_id(&local_account.id).await.unwrap().unwrap();
        assert!(untouched.external_subject.is_none());
    }

    #[tokio::test]
    async fn test_link_skipped_when_email_is_ambiguous() {
        let store = CredentialStore::new(setup_test_db().await);
        store
            .create_local(local("alice", Some("shared@example.com")))
            .await
            .unwrap();
        store
            .create_local(local("alice2", Some("shared@example.com")))
            .await
            .unwrap();

        assert!(!store.link_local_account("shared@example.com", "sub-1").await.unwrap());
        let fed = store
            .upsert_federated(federated("sub-1", "shared@example.com"))
            .await
            .unwrap();
        assert_eq!(fed.username, "federated:sub-1");
    }

    #[tokio::test]
    async fn test_concurrent_first_logins_create_one_account() {
        let store = CredentialStore::new(setup_test_db().await);
        let (a, b) = tokio::join!(
            store.upsert_federated(federated("sub-race", "race@example.com")),
            store.upsert_federated(federated("sub-race", "race@example.com")),
        );
        assert_eq!(a.unwrap().id, b.unwrap().id);
    }

    #[tokio::test]
    async fn test_take_upstream_token_clears_it() {
        let store = CredentialStore::new(setup_test_db().await);
        let account = store
            .upsert_federated(federated("sub-1", "fed@example.com"))
            .await
            .unwrap();

        assert_eq!(
            store.take_upstream_token(&account.id).await.unwrap().as_deref(),
            Some("upstream-token")
        );
        assert_eq!(store.take_upstream_token(&account.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_ensure_local_is_idempotent() {
        let store = CredentialStore::new(setup_test_db().await);
        let first = store.ensure_local("platform", None, None).await.unwrap();
        let second = store.ensure_local("platform", None, None).await.unwrap();

        assert_eq!(first.id, second.id);
        assert!(first.has_password());
    }

    #[tokio::test]
    async fn test_record_login_sets_timestamp() {
        let store = CredentialStore::new(setup_test_db().await);
        let account = store.create_local(local("bob", None)).await.unwrap();
        assert!(account.last_login_at.is_none());

        store.record_login(&account.id).await.unwrap();
        let reloaded = store.find_by_id(&account.id).await.unwrap().unwrap();
        assert!(reloaded.last_login_at.is_some());
    }
}
