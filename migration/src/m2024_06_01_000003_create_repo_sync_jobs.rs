//! Migration to create the repo_sync_jobs table.
//!
//! Sync jobs are the queued units of reconciliation work, one per external
//! service pass. Completed and errored jobs are retained for audit; a partial
//! unique index guarantees at most one live job per service.

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
                    .table(RepoSyncJobs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(RepoSyncJobs::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(RepoSyncJobs::ExternalServiceId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(RepoSyncJobs::State)
                            .text()
                            .not_null()
                            .default("queued"),
                    )
                    .col(ColumnDef::new(RepoSyncJobs::FailureMessage).text().null())
                    .col(
                        ColumnDef::new(RepoSyncJobs::StartedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(RepoSyncJobs::FinishedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(RepoSyncJobs::LastHeartbeatAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(RepoSyncJobs::NumResets)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(RepoSyncJobs::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(RepoSyncJobs::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_repo_sync_jobs_external_service_id")
                            .from(RepoSyncJobs::Table, RepoSyncJobs::ExternalServiceId)
                            .to(ExternalServices::Table, ExternalServices::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // One live (queued or processing) job per external service.
        manager
            .get_connection()
            .execute(Statement::from_string(
                manager.get_database_backend(),
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_repo_sync_jobs_one_live \
                 ON repo_sync_jobs (external_service_id) \
                 WHERE state IN ('queued', 'processing')"
                    .to_string(),
            ))
            .await?;

        // Index for the workers' dequeue scan.
        manager
            .create_index(
                Index::create()
                    .name("idx_repo_sync_jobs_state_created")
                    .table(RepoSyncJobs::Table)
                    .col(RepoSyncJobs::State)
                    .col(RepoSyncJobs::CreatedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_repo_sync_jobs_state_created")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(Index::drop().name("idx_repo_sync_jobs_one_live").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(RepoSyncJobs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum RepoSyncJobs {
    Table,
    Id,
    ExternalServiceId,
    State,
    FailureMessage,
    StartedAt,
    FinishedAt,
    LastHeartbeatAt,
    NumResets,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum ExternalServices {
    Table,
    Id,
}
