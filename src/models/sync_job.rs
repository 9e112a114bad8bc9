//! SyncJob entity model
//!
//! This module contains the SeaORM entity model for the repo_sync_jobs table,
//! which holds queued units of reconciliation work, one per external service
//! pass. Terminal jobs are retained for audit.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeUtc;

/// Lifecycle states of a sync job.
pub mod state {
    pub const QUEUED: &str = "queued";
    pub const PROCESSING: &str = "processing";
    pub const COMPLETED: &str = "completed";
    pub const ERRORED: &str = "errored";
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "repo_sync_jobs")]
pub struct Model {
    /// Unique identifier for the sync job (primary key)
    #[sea_orm(primary_key)]
    pub id: i64,

    /// External service this job reconciles
    pub external_service_id: i64,

    /// queued | processing | completed | errored
    pub state: String,

    /// Aggregate error message when the job ends in the errored state
    pub failure_message: Option<String>,

    /// When a handler claimed the job
    pub started_at: Option<DateTimeUtc>,

    /// When the job reached a terminal state
    pub finished_at: Option<DateTimeUtc>,

    /// Lease liveness marker; a lapsed heartbeat sends the job back to queued
    pub last_heartbeat_at: Option<DateTimeUtc>,

    /// How many times the reclaimer has reset this job
    pub num_resets: i32,

    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::external_service::Entity",
        from = "Column::ExternalServiceId",
        to = "super::external_service::Column::Id"
    )]
    ExternalService,
}

impl Related<super::external_service::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ExternalService.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
