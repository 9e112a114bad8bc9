//! Sync job table operations: enqueueing, claiming, leases, and reclaim.

use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::sea_query::Expr;
use sea_orm::{Condition, ConnectionTrait, NotSet, QueryOrder, QuerySelect, Set};

use super::{external_service, is_unique_violation};
use crate::models::sync_job::{state, ActiveModel, Column, Entity, Model};

/// Enqueue one queued job for every due external service that does not
/// already have a live (queued or processing) job. Returns how many jobs were
/// inserted. Races with other enqueuers are settled by the partial unique
/// index on live jobs; losing an insert is not an error.
pub async fn enqueue_due<C: ConnectionTrait>(db: &C, now: DateTime<Utc>) -> Result<u64, DbErr> {
    let due = external_service::list_due(db, now).await?;

    let mut inserted = 0;
    for svc in due {
        if insert_if_no_live_job(db, svc.id, now).await?.is_some() {
            inserted += 1;
        }
    }

    Ok(inserted)
}

/// Enqueue a job for one service regardless of its schedule, deduplicating
/// against an existing live job. Returns None when a live job already covers
/// the service.
pub async fn enqueue_for_service<C: ConnectionTrait>(
    db: &C,
    service_id: i64,
    now: DateTime<Utc>,
) -> Result<Option<Model>, DbErr> {
    insert_if_no_live_job(db, service_id, now).await
}

async fn insert_if_no_live_job<C: ConnectionTrait>(
    db: &C,
    service_id: i64,
    now: DateTime<Utc>,
) -> Result<Option<Model>, DbErr> {
    let live = Entity::find()
        .filter(Column::ExternalServiceId.eq(service_id))
        .filter(Column::State.is_in([state::QUEUED, state::PROCESSING]))
        .one(db)
        .await?;
    if live.is_some() {
        return Ok(None);
    }

    let insert = ActiveModel {
        id: NotSet,
        external_service_id: Set(service_id),
        state: Set(state::QUEUED.to_string()),
        failure_message: Set(None),
        started_at: Set(None),
        finished_at: Set(None),
        last_heartbeat_at: Set(None),
        num_resets: Set(0),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(db)
    .await;

    match insert {
        Ok(job) => Ok(Some(job)),
        Err(err) if is_unique_violation(&err) => Ok(None),
        Err(err) => Err(err),
    }
}

/// Atomically claim the oldest queued job. The conditional update only
/// succeeds if the job is still queued, so concurrent handlers never claim
/// the same job twice.
pub async fn claim_next<C: ConnectionTrait>(
    db: &C,
    now: DateTime<Utc>,
) -> Result<Option<Model>, DbErr> {
    let candidates = Entity::find()
        .filter(Column::State.eq(state::QUEUED))
        .order_by_asc(Column::CreatedAt)
        .limit(5)
        .all(db)
        .await?;

    for candidate in candidates {
        let claimed = Entity::update_many()
            .filter(Column::Id.eq(candidate.id))
            .filter(Column::State.eq(state::QUEUED))
            .col_expr(Column::State, Expr::value(state::PROCESSING))
            .col_expr(Column::StartedAt, Expr::value(now))
            .col_expr(Column::LastHeartbeatAt, Expr::value(now))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .exec(db)
            .await?;

        if claimed.rows_affected == 1 {
            return Entity::find_by_id(candidate.id).one(db).await;
        }
    }

    Ok(None)
}

/// Renew the lease on a processing job.
pub async fn heartbeat<C: ConnectionTrait>(
    db: &C,
    job_id: i64,
    now: DateTime<Utc>,
) -> Result<(), DbErr> {
    Entity::update_many()
        .filter(Column::Id.eq(job_id))
        .filter(Column::State.eq(state::PROCESSING))
        .col_expr(Column::LastHeartbeatAt, Expr::value(now))
        .col_expr(Column::UpdatedAt, Expr::value(now))
        .exec(db)
        .await?;
    Ok(())
}

pub async fn complete<C: ConnectionTrait>(
    db: &C,
    job: &Model,
    now: DateTime<Utc>,
) -> Result<(), DbErr> {
    finish(db, job, state::COMPLETED, None, now).await
}

pub async fn fail<C: ConnectionTrait>(
    db: &C,
    job: &Model,
    message: &str,
    now: DateTime<Utc>,
) -> Result<(), DbErr> {
    finish(db, job, state::ERRORED, Some(message.to_string()), now).await
}

async fn finish<C: ConnectionTrait>(
    db: &C,
    job: &Model,
    final_state: &str,
    failure_message: Option<String>,
    now: DateTime<Utc>,
) -> Result<(), DbErr> {
    ActiveModel {
        id: Set(job.id),
        state: Set(final_state.to_string()),
        failure_message: Set(failure_message),
        finished_at: Set(Some(now)),
        updated_at: Set(now),
        ..Default::default()
    }
    .update(db)
    .await?;
    Ok(())
}

/// Send processing jobs whose lease lapsed before `stalled_before` back to
/// queued, bumping their reset counter. Returns the reset job IDs.
pub async fn reset_stalled<C: ConnectionTrait>(
    db: &C,
    stalled_before: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<Vec<i64>, DbErr> {
    let stalled: Vec<i64> = Entity::find()
        .filter(Column::State.eq(state::PROCESSING))
        .filter(
            Condition::any()
                .add(Column::LastHeartbeatAt.lt(stalled_before))
                .add(
                    Condition::all()
                        .add(Column::LastHeartbeatAt.is_null())
                        .add(Column::StartedAt.lt(stalled_before)),
                ),
        )
        .all(db)
        .await?
        .into_iter()
        .map(|job| job.id)
        .collect();

    if stalled.is_empty() {
        return Ok(stalled);
    }

    Entity::update_many()
        .filter(Column::Id.is_in(stalled.iter().copied()))
        .filter(Column::State.eq(state::PROCESSING))
        .col_expr(Column::State, Expr::value(state::QUEUED))
        .col_expr(Column::StartedAt, Expr::value(Option::<DateTime<Utc>>::None))
        .col_expr(
            Column::LastHeartbeatAt,
            Expr::value(Option::<DateTime<Utc>>::None),
        )
        .col_expr(
            Column::NumResets,
            Expr::col(Column::NumResets).add(1),
        )
        .col_expr(Column::UpdatedAt, Expr::value(now))
        .exec(db)
        .await?;

    Ok(stalled)
}
