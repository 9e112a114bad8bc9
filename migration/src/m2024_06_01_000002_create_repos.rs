//! Migration to create the repos table.
//!
//! Repos are the authoritative inventory rows reconciled against external
//! sources. The (name) and (external spec) uniqueness constraints are what
//! bound the per-repo apply step to at most two matching rows.

use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_orm::Statement;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Repos::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Repos::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Repos::Name).text().not_null())
                    .col(ColumnDef::new(Repos::Description).text().null())
                    .col(
                        ColumnDef::new(Repos::Fork)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(Repos::Archived)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(Repos::Private)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(ColumnDef::new(Repos::ExternalKind).text().not_null())
                    .col(
                        ColumnDef::new(Repos::ExternalServiceId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(Repos::ExternalId).text().not_null())
                    .col(
                        ColumnDef::new(Repos::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Repos::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Repos::DeletedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_repos_external_service_id")
                            .from(Repos::Table, Repos::ExternalServiceId)
                            .to(ExternalServices::Table, ExternalServices::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_repos_name")
                    .table(Repos::Table)
                    .col(Repos::Name)
                    .unique()
                    .to_owned(),
            )
            .await?;

        // Soft-deleted rows keep their external spec (deletion mangles only the
        // name), so spec uniqueness is enforced among live rows only.
        manager
            .get_connection()
            .execute(Statement::from_string(
                manager.get_database_backend(),
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_repos_external_spec \
                 ON repos (external_kind, external_service_id, external_id) \
                 WHERE deleted_at IS NULL"
                    .to_string(),
            ))
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_repos_external_spec").to_owned())
            .await?;

        manager
            .drop_index(Index::drop().name("idx_repos_name").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(Repos::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Repos {
    Table,
    Id,
    Name,
    Description,
    Fork,
    Archived,
    Private,
    ExternalKind,
    ExternalServiceId,
    ExternalId,
    CreatedAt,
    UpdatedAt,
    DeletedAt,
}

#[derive(DeriveIden)]
enum ExternalServices {
    Table,
    Id,
}
