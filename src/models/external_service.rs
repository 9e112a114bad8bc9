//! ExternalService entity model
//!
//! An external service is one configured connection to a code host or package
//! registry. It is owned by the site, a user, or an organization, and carries
//! the reconciliation bookkeeping mutated by the syncer.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeUtc;

/// Who owns an external service. Site-owned services are managed by admins
/// and are exempt from quota checks and error-driven deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceOwner {
    Site,
    User(i64),
    Org(i64),
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "external_services")]
pub struct Model {
    /// Unique identifier for the external service (primary key)
    #[sea_orm(primary_key)]
    pub id: i64,

    /// Source kind, e.g. "github", "gitlab", "npm"
    pub kind: String,

    /// Human-readable name shown in admin surfaces
    pub display_name: String,

    /// Owning user, if user-owned
    pub namespace_user_id: Option<i64>,

    /// Owning organization, if org-owned
    pub namespace_org_id: Option<i64>,

    /// Cloud-default services get repos lazily and are never fully synced
    pub cloud_default: bool,

    /// When the last reconciliation pass finished
    pub last_sync_at: Option<DateTimeUtc>,

    /// When the next reconciliation pass is due
    pub next_sync_at: Option<DateTimeUtc>,

    /// Aggregate failure message of the latest pass, if it errored
    pub last_sync_error: Option<String>,

    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
    pub deleted_at: Option<DateTimeUtc>,
}

impl Model {
    /// Site-owned means neither a user nor an org namespace is set.
    pub fn is_site_owned(&self) -> bool {
        self.namespace_user_id.is_none() && self.namespace_org_id.is_none()
    }

    pub fn owner(&self) -> ServiceOwner {
        if let Some(user_id) = self.namespace_user_id {
            ServiceOwner::User(user_id)
        } else if let Some(org_id) = self.namespace_org_id {
            ServiceOwner::Org(org_id)
        } else {
            ServiceOwner::Site
        }
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::repo::Entity")]
    Repos,
    #[sea_orm(has_many = "super::sync_job::Entity")]
    SyncJobs,
}

impl Related<super::repo::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Repos.def()
    }
}

impl Related<super::sync_job::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::SyncJobs.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
