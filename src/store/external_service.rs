//! External service table operations.

use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::{Condition, ConnectionTrait, NotSet, QueryOrder, QuerySelect, Set};

use crate::models::external_service::{ActiveModel, Column, Entity, Model, ServiceOwner};

/// Filter for listing external services.
#[derive(Debug, Clone, Default)]
pub struct ServiceQuery {
    /// Restrict to these kinds; empty means any kind.
    pub kinds: Vec<String>,
    /// Only cloud-default services.
    pub only_cloud_default: bool,
    pub limit: Option<u64>,
}

pub async fn get_by_id<C: ConnectionTrait>(db: &C, id: i64) -> Result<Option<Model>, DbErr> {
    Entity::find_by_id(id)
        .filter(Column::DeletedAt.is_null())
        .one(db)
        .await
}

pub async fn list<C: ConnectionTrait>(db: &C, query: ServiceQuery) -> Result<Vec<Model>, DbErr> {
    let mut select = Entity::find().filter(Column::DeletedAt.is_null());
    if !query.kinds.is_empty() {
        select = select.filter(Column::Kind.is_in(query.kinds));
    }
    if query.only_cloud_default {
        select = select.filter(Column::CloudDefault.eq(true));
    }
    if let Some(limit) = query.limit {
        select = select.limit(limit);
    }
    select.order_by_asc(Column::Id).all(db).await
}

/// Services whose next pass is due: never synced, or next_sync_at has passed.
/// Cloud-default services are excluded; they only sync lazily.
pub async fn list_due<C: ConnectionTrait>(
    db: &C,
    now: DateTime<Utc>,
) -> Result<Vec<Model>, DbErr> {
    Entity::find()
        .filter(Column::DeletedAt.is_null())
        .filter(Column::CloudDefault.eq(false))
        .filter(
            Condition::any()
                .add(Column::NextSyncAt.is_null())
                .add(Column::NextSyncAt.lte(now)),
        )
        .order_by_asc(Column::NextSyncAt)
        .all(db)
        .await
}

pub async fn create<C: ConnectionTrait>(
    db: &C,
    kind: &str,
    display_name: &str,
    owner: ServiceOwner,
    cloud_default: bool,
    now: DateTime<Utc>,
) -> Result<Model, DbErr> {
    let (namespace_user_id, namespace_org_id) = match owner {
        ServiceOwner::Site => (None, None),
        ServiceOwner::User(user_id) => (Some(user_id), None),
        ServiceOwner::Org(org_id) => (None, Some(org_id)),
    };

    ActiveModel {
        id: NotSet,
        kind: Set(kind.to_string()),
        display_name: Set(display_name.to_string()),
        namespace_user_id: Set(namespace_user_id),
        namespace_org_id: Set(namespace_org_id),
        cloud_default: Set(cloud_default),
        last_sync_at: Set(None),
        next_sync_at: Set(None),
        last_sync_error: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
        deleted_at: Set(None),
    }
    .insert(db)
    .await
}

/// Persist the bookkeeping of a finished pass: when it ran, when the next one
/// is due, and its aggregate error if any.
pub async fn update_sync_state<C: ConnectionTrait>(
    db: &C,
    svc: &Model,
    last_sync_at: DateTime<Utc>,
    next_sync_at: DateTime<Utc>,
    last_sync_error: Option<String>,
) -> Result<Model, DbErr> {
    ActiveModel {
        id: Set(svc.id),
        last_sync_at: Set(Some(last_sync_at)),
        next_sync_at: Set(Some(next_sync_at)),
        last_sync_error: Set(last_sync_error),
        updated_at: Set(last_sync_at),
        ..Default::default()
    }
    .update(db)
    .await
}
