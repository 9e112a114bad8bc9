//! Migration to create the external_services table.
//!
//! External services are configured connections to one code host or package
//! registry. They are owned by the site, a user, or an organization, and carry
//! the sync bookkeeping (last/next sync timestamps, latest failure).

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
                    .table(ExternalServices::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ExternalServices::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(ExternalServices::Kind).text().not_null())
                    .col(
                        ColumnDef::new(ExternalServices::DisplayName)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ExternalServices::NamespaceUserId)
                            .big_integer()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(ExternalServices::NamespaceOrgId)
                            .big_integer()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(ExternalServices::CloudDefault)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(ExternalServices::LastSyncAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(ExternalServices::NextSyncAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(ExternalServices::LastSyncError)
                            .text()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(ExternalServices::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(ExternalServices::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(ExternalServices::DeletedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .to_owned(),
            )
            .await?;

        // At most one cloud-default service per kind.
        manager
            .get_connection()
            .execute(Statement::from_string(
                manager.get_database_backend(),
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_external_services_cloud_default \
                 ON external_services (kind) WHERE cloud_default AND deleted_at IS NULL"
                    .to_string(),
            ))
            .await?;

        // Index for the enqueuer's due-service scan.
        manager
            .create_index(
                Index::create()
                    .name("idx_external_services_next_sync_at")
                    .table(ExternalServices::Table)
                    .col(ExternalServices::NextSyncAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_external_services_next_sync_at")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(
                Index::drop()
                    .name("idx_external_services_cloud_default")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(ExternalServices::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum ExternalServices {
    Table,
    Id,
    Kind,
    DisplayName,
    NamespaceUserId,
    NamespaceOrgId,
    CloudDefault,
    LastSyncAt,
    NextSyncAt,
    LastSyncError,
    CreatedAt,
    UpdatedAt,
    DeletedAt,
}
