//! Repo table operations.
//!
//! All functions are generic over [`ConnectionTrait`] so the per-repo apply
//! step can run them inside the transaction it owns.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::sea_query::JoinType;
use sea_orm::{Condition, ConnectionTrait, NotSet, QueryOrder, QuerySelect, Set};

use crate::models::external_service;
use crate::models::repo::{ActiveModel, Column, Entity, ExternalRepoSpec, Model, Relation, SourcedRepo};

/// Find every row matching the candidate by name or by external spec,
/// soft-deleted rows included. Name matches cannot hit soft-deleted rows
/// (deletion mangles the name), but spec matches can, which is how a deleted
/// repo gets resurrected when its source reports it again.
pub async fn list_by_name_or_spec<C: ConnectionTrait>(
    db: &C,
    name: &str,
    spec: &ExternalRepoSpec,
) -> Result<Vec<Model>, DbErr> {
    Entity::find()
        .filter(
            Condition::any().add(Column::Name.eq(name)).add(
                Condition::all()
                    .add(Column::ExternalKind.eq(spec.kind.as_str()))
                    .add(Column::ExternalServiceId.eq(spec.service_id))
                    .add(Column::ExternalId.eq(spec.id.as_str())),
            ),
        )
        .order_by_asc(Column::Id)
        .all(db)
        .await
}

/// Look up a live repo by name.
pub async fn get_by_name<C: ConnectionTrait>(db: &C, name: &str) -> Result<Option<Model>, DbErr> {
    Entity::find()
        .filter(Column::Name.eq(name))
        .filter(Column::DeletedAt.is_null())
        .one(db)
        .await
}

/// All live repos, ordered by ID.
pub async fn list_all<C: ConnectionTrait>(db: &C) -> Result<Vec<Model>, DbErr> {
    Entity::find()
        .filter(Column::DeletedAt.is_null())
        .order_by_asc(Column::Id)
        .all(db)
        .await
}

/// Insert a freshly sourced repo.
pub async fn create<C: ConnectionTrait>(
    db: &C,
    sourced: &SourcedRepo,
    now: DateTime<Utc>,
) -> Result<Model, DbErr> {
    ActiveModel {
        id: NotSet,
        name: Set(sourced.name.clone()),
        description: Set(sourced.description.clone()),
        fork: Set(sourced.fork),
        archived: Set(sourced.archived),
        private: Set(sourced.private),
        external_kind: Set(sourced.spec.kind.clone()),
        external_service_id: Set(sourced.spec.service_id),
        external_id: Set(sourced.spec.id.clone()),
        created_at: Set(now),
        updated_at: Set(now),
        deleted_at: Set(None),
    }
    .insert(db)
    .await
}

/// Persist every field of an already-absorbed row.
pub async fn update<C: ConnectionTrait>(
    db: &C,
    repo: &Model,
    now: DateTime<Utc>,
) -> Result<Model, DbErr> {
    ActiveModel {
        id: Set(repo.id),
        name: Set(repo.name.clone()),
        description: Set(repo.description.clone()),
        fork: Set(repo.fork),
        archived: Set(repo.archived),
        private: Set(repo.private),
        external_kind: Set(repo.external_kind.clone()),
        external_service_id: Set(repo.external_service_id),
        external_id: Set(repo.external_id.clone()),
        created_at: Set(repo.created_at),
        updated_at: Set(now),
        deleted_at: Set(repo.deleted_at),
    }
    .update(db)
    .await
}

/// Soft-delete one repo. The name is mangled so the global name uniqueness
/// index still allows a live row to take the name over later.
pub async fn soft_delete<C: ConnectionTrait>(
    db: &C,
    repo: &Model,
    now: DateTime<Utc>,
) -> Result<(), DbErr> {
    ActiveModel {
        id: Set(repo.id),
        name: Set(deleted_name(&repo.name, now)),
        updated_at: Set(now),
        deleted_at: Set(Some(now)),
        ..Default::default()
    }
    .update(db)
    .await?;
    Ok(())
}

/// Soft-delete every live repo of `service_id` whose ID is not in `seen`,
/// returning the rows as they were before deletion.
pub async fn delete_not_in<C: ConnectionTrait>(
    db: &C,
    service_id: i64,
    seen: &HashSet<i64>,
    now: DateTime<Utc>,
) -> Result<Vec<Model>, DbErr> {
    let mut query = Entity::find()
        .filter(Column::ExternalServiceId.eq(service_id))
        .filter(Column::DeletedAt.is_null());
    if !seen.is_empty() {
        query = query.filter(Column::Id.is_not_in(seen.iter().copied()));
    }
    let doomed = query.order_by_asc(Column::Id).all(db).await?;

    for repo in &doomed {
        soft_delete(db, repo, now).await?;
    }

    Ok(doomed)
}

/// Count live repos added through user- or org-owned services, site-wide.
/// Repos owned by site-level services do not count against quotas.
pub async fn count_namespaced<C: ConnectionTrait>(db: &C) -> Result<u64, DbErr> {
    namespaced_query()
        .filter(
            Condition::any()
                .add(external_service::Column::NamespaceUserId.is_not_null())
                .add(external_service::Column::NamespaceOrgId.is_not_null()),
        )
        .count(db)
        .await
}

/// Count live repos added through services owned by one user or org.
pub async fn count_for_namespace<C: ConnectionTrait>(
    db: &C,
    owner: external_service::ServiceOwner,
) -> Result<u64, DbErr> {
    let query = namespaced_query();
    let query = match owner {
        external_service::ServiceOwner::User(user_id) => {
            query.filter(external_service::Column::NamespaceUserId.eq(user_id))
        }
        external_service::ServiceOwner::Org(org_id) => {
            query.filter(external_service::Column::NamespaceOrgId.eq(org_id))
        }
        external_service::ServiceOwner::Site => return Ok(0),
    };
    query.count(db).await
}

fn namespaced_query() -> Select<Entity> {
    Entity::find()
        .join(JoinType::InnerJoin, Relation::ExternalService.def())
        .filter(Column::DeletedAt.is_null())
        .filter(external_service::Column::DeletedAt.is_null())
}

fn deleted_name(name: &str, now: DateTime<Utc>) -> String {
    format!("DELETED-{}-{}", now.timestamp(), name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use migration::{Migrator, MigratorTrait};
    use sea_orm::{Database, DatabaseConnection};

    use crate::models::external_service::ServiceOwner;
    use crate::store::external_service as svc_store;

    async fn setup_db() -> DatabaseConnection {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        Migrator::up(&db, None).await.unwrap();
        db
    }

    fn sourced(name: &str, external_id: &str, service_id: i64) -> SourcedRepo {
        SourcedRepo {
            name: name.to_string(),
            description: None,
            fork: false,
            archived: false,
            private: false,
            spec: ExternalRepoSpec {
                kind: "github".to_string(),
                service_id,
                id: external_id.to_string(),
            },
        }
    }

    async fn seed_service(db: &DatabaseConnection, owner: ServiceOwner) -> i64 {
        svc_store::create(db, "github", "GitHub", owner, false, Utc::now())
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn lookup_matches_by_name_and_by_spec() {
        let db = setup_db().await;
        let svc = seed_service(&db, ServiceOwner::Site).await;
        let now = Utc::now();

        let stored = create(&db, &sourced("github.com/acme/widgets", "id-1", svc), now)
            .await
            .unwrap();

        // Spec matches even under a different name (a rename at the host).
        let renamed = sourced("github.com/acme/gadgets", "id-1", svc);
        let matches = list_by_name_or_spec(&db, &renamed.name, &renamed.spec)
            .await
            .unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].id, stored.id);

        // Name matches even under a different spec (a local name collision).
        let collision = sourced("github.com/acme/widgets", "id-2", svc);
        let matches = list_by_name_or_spec(&db, &collision.name, &collision.spec)
            .await
            .unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].id, stored.id);
    }

    #[tokio::test]
    async fn soft_delete_mangles_name_and_hides_row() {
        let db = setup_db().await;
        let svc = seed_service(&db, ServiceOwner::Site).await;
        let now = Utc::now();

        let stored = create(&db, &sourced("github.com/acme/widgets", "id-1", svc), now)
            .await
            .unwrap();
        soft_delete(&db, &stored, now).await.unwrap();

        assert!(
            get_by_name(&db, "github.com/acme/widgets")
                .await
                .unwrap()
                .is_none()
        );

        // The name is free again for a new live row.
        create(&db, &sourced("github.com/acme/widgets", "id-2", svc), now)
            .await
            .unwrap();

        // The external spec still finds the deleted row, for resurrection.
        let sourced_again = sourced("github.com/acme/widgets", "id-1", svc);
        let matches = list_by_name_or_spec(&db, "github.com/other", &sourced_again.spec)
            .await
            .unwrap();
        assert_eq!(matches.len(), 1);
        assert!(matches[0].deleted_at.is_some());
    }

    #[tokio::test]
    async fn delete_not_in_spares_seen_rows() {
        let db = setup_db().await;
        let svc = seed_service(&db, ServiceOwner::Site).await;
        let now = Utc::now();

        let keep = create(&db, &sourced("github.com/acme/keep", "id-1", svc), now)
            .await
            .unwrap();
        let drop = create(&db, &sourced("github.com/acme/drop", "id-2", svc), now)
            .await
            .unwrap();

        let deleted = delete_not_in(&db, svc, &HashSet::from([keep.id]), now)
            .await
            .unwrap();
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].id, drop.id);
        assert_eq!(list_all(&db).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn namespace_counts_exclude_site_services() {
        let db = setup_db().await;
        let site = seed_service(&db, ServiceOwner::Site).await;
        let user = seed_service(&db, ServiceOwner::User(42)).await;
        let now = Utc::now();

        create(&db, &sourced("github.com/site/one", "s-1", site), now)
            .await
            .unwrap();
        create(&db, &sourced("github.com/user/one", "u-1", user), now)
            .await
            .unwrap();
        create(&db, &sourced("github.com/user/two", "u-2", user), now)
            .await
            .unwrap();

        assert_eq!(count_namespaced(&db).await.unwrap(), 2);
        assert_eq!(
            count_for_namespace(&db, ServiceOwner::User(42)).await.unwrap(),
            2
        );
        assert_eq!(
            count_for_namespace(&db, ServiceOwner::User(7)).await.unwrap(),
            0
        );
        assert_eq!(
            count_for_namespace(&db, ServiceOwner::Site).await.unwrap(),
            0
        );
    }
}
