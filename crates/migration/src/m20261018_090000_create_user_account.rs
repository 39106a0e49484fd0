//! Creates the `user_account` table backing the credential store.
//!
//! Both local and federated identities live here. `external_subject` is the
//! provider's stable `sub` claim and is the only key federated logins are
//! reconciled by, so it carries a unique constraint (NULLs are allowed for
//! local-only accounts).

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(UserAccount::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(UserAccount::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(UserAccount::Username)
                            .string()
                            .not_null()
                            .unique_key(),
                    )
                    .col(
                        ColumnDef::new(UserAccount::PasswordHash)
                            .string_len(255)
                            .null(),
                    )
                    .col(ColumnDef::new(UserAccount::Email).string().null())
                    .col(ColumnDef::new(UserAccount::DisplayName).string().null())
                    .col(
                        ColumnDef::new(UserAccount::IdentityProvider)
                            .string_len(16)
                            .not_null()
                            .default("local"),
                    )
                    .col(
                        ColumnDef::new(UserAccount::ExternalSubject)
                            .string()
                            .null()
                            .unique_key(),
                    )
                    .col(
                        ColumnDef::new(UserAccount::UpstreamAccessToken)
                            .text()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(UserAccount::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(UserAccount::LastLoginAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_user_account_email")
                    .table(UserAccount::Table)
                    .col(UserAccount::Email)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(UserAccount::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
enum UserAccount {
    Table,
    Id,
    Username,
    PasswordHash,
    Email,
    DisplayName,
    IdentityProvider,
    ExternalSubject,
    UpstreamAccessToken,
    CreatedAt,
    LastLoginAt,
}
