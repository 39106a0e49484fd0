//! User account entity - local and federated identities.
//!
//! A `Local` account always has a `password_hash`; a `Federated` account always
//! has an `external_subject`. A local account may additionally carry an
//! `external_subject` once it has been explicitly linked.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use utoipa::ToSchema;

/// Which login path created the account.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize, ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "lowercase")]
pub enum IdentityProvider {
    #[sea_orm(string_value = "local")]
    Local,
    #[sea_orm(string_value = "federated")]
    Federated,
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "user_account")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    #[sea_orm(unique)]
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub identity_provider: IdentityProvider,
    /// Provider's stable `sub` claim.
    #[sea_orm(unique)]
    pub external_subject: Option<String>,
    /// Provider access token from the most recent federated login, revoked on logout.
    #[serde(skip_serializing)]
    pub upstream_access_token: Option<String>,
    pub created_at: OffsetDateTime,
    pub last_login_at: Option<OffsetDateTime>,
}

impl Model {
    pub fn has_password(&self) -> bool {
        self.password_hash.as_deref().is_some_and(|h| !h.is_empty())
    }

    pub fn is_linked(&self) -> bool {
        self.identity_provider == IdentityProvider::Local && self.external_subject.is_some()
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
