//! # Store
//!
//! Narrow repository-CRUD layer over the transactional relational store,
//! encapsulating SeaORM operations for the repos, external_services, and
//! repo_sync_jobs tables. The syncer opens one transaction per repo apply
//! step and passes it to the table helpers, which are generic over
//! [`ConnectionTrait`] so they run against a pool connection or an open
//! transaction alike.

pub mod external_service;
pub mod repo;
pub mod sync_job;

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use sea_orm::{DatabaseConnection, DatabaseTransaction, DbErr, RuntimeErr, TransactionTrait};

use crate::models::{external_service as svc_model, repo as repo_model, sync_job as job_model};

/// Handle over the database shared by the syncer, scheduler, and workers.
#[derive(Clone)]
pub struct Store {
    db: DatabaseConnection,
}

impl Store {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Open a transaction for one per-repo apply step.
    pub async fn transact(&self) -> Result<DatabaseTransaction, DbErr> {
        self.db.begin().await
    }

    // External services

    pub async fn external_service(&self, id: i64) -> Result<Option<svc_model::Model>, DbErr> {
        external_service::get_by_id(&self.db, id).await
    }

    pub async fn list_external_services(
        &self,
        query: external_service::ServiceQuery,
    ) -> Result<Vec<svc_model::Model>, DbErr> {
        external_service::list(&self.db, query).await
    }

    pub async fn due_external_services(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<svc_model::Model>, DbErr> {
        external_service::list_due(&self.db, now).await
    }

    pub async fn update_service_sync_state(
        &self,
        svc: &svc_model::Model,
        last_sync_at: DateTime<Utc>,
        next_sync_at: DateTime<Utc>,
        last_sync_error: Option<String>,
    ) -> Result<svc_model::Model, DbErr> {
        external_service::update_sync_state(
            &self.db,
            svc,
            last_sync_at,
            next_sync_at,
            last_sync_error,
        )
        .await
    }

    // Repos

    pub async fn repo_by_name(&self, name: &str) -> Result<Option<repo_model::Model>, DbErr> {
        repo::get_by_name(&self.db, name).await
    }

    pub async fn list_repos(&self) -> Result<Vec<repo_model::Model>, DbErr> {
        repo::list_all(&self.db).await
    }

    pub async fn delete_repos_not_in(
        &self,
        service_id: i64,
        seen: &HashSet<i64>,
        now: DateTime<Utc>,
    ) -> Result<Vec<repo_model::Model>, DbErr> {
        repo::delete_not_in(&self.db, service_id, seen, now).await
    }

    pub async fn delete_repo(
        &self,
        stored: &repo_model::Model,
        now: DateTime<Utc>,
    ) -> Result<(), DbErr> {
        repo::soft_delete(&self.db, stored, now).await
    }

    // Sync jobs

    pub async fn enqueue_sync_jobs(&self, now: DateTime<Utc>) -> Result<u64, DbErr> {
        sync_job::enqueue_due(&self.db, now).await
    }

    pub async fn enqueue_sync_job(
        &self,
        service_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<job_model::Model>, DbErr> {
        sync_job::enqueue_for_service(&self.db, service_id, now).await
    }

    pub async fn claim_sync_job(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<job_model::Model>, DbErr> {
        sync_job::claim_next(&self.db, now).await
    }

    pub async fn heartbeat_sync_job(&self, job_id: i64, now: DateTime<Utc>) -> Result<(), DbErr> {
        sync_job::heartbeat(&self.db, job_id, now).await
    }

    pub async fn complete_sync_job(
        &self,
        job: &job_model::Model,
        now: DateTime<Utc>,
    ) -> Result<(), DbErr> {
        sync_job::complete(&self.db, job, now).await
    }

    pub async fn fail_sync_job(
        &self,
        job: &job_model::Model,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<(), DbErr> {
        sync_job::fail(&self.db, job, message, now).await
    }

    pub async fn reset_stalled_sync_jobs(
        &self,
        stalled_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<i64>, DbErr> {
        sync_job::reset_stalled(&self.db, stalled_before, now).await
    }
}

/// Whether a database error is a unique constraint violation, across the
/// Postgres and SQLite backends.
pub(crate) fn is_unique_violation(error: &DbErr) -> bool {
    const PG_UNIQUE: &str = "23505";
    const SQLITE_DUPLICATE_CODES: &[&str] = &["1555", "2067"];

    let runtime_err = match error {
        DbErr::Query(RuntimeErr::SqlxError(sqlx_err))
        | DbErr::Exec(RuntimeErr::SqlxError(sqlx_err)) => sqlx_err,
        _ => return false,
    };

    let Some(db_error) = runtime_err.as_database_error() else {
        return false;
    };

    if db_error.is_unique_violation() {
        return true;
    }

    matches!(
        db_error.code().as_deref(),
        Some(code) if code == PG_UNIQUE || SQLITE_DUPLICATE_CODES.contains(&code)
    )
}
