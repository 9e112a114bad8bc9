//! Repo entity model
//!
//! A repo row is one entry in the authoritative repository inventory. The pair
//! (name, external spec) is the dedup key: two rows may transiently share a
//! spec across a rename, which the apply step resolves by deleting the row
//! that matches only by name.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeUtc;

/// The stable identity of a repository at its external source:
/// source kind, owning external service, and the host-assigned ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExternalRepoSpec {
    pub kind: String,
    pub service_id: i64,
    pub id: String,
}

impl std::fmt::Display for ExternalRepoSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.kind, self.service_id, self.id)
    }
}

/// A candidate repository as observed from an external source, before it has
/// been reconciled against the store.
#[derive(Debug, Clone, PartialEq)]
pub struct SourcedRepo {
    pub name: String,
    pub description: Option<String>,
    pub fork: bool,
    pub archived: bool,
    pub private: bool,
    pub spec: ExternalRepoSpec,
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "repos")]
pub struct Model {
    /// Unique identifier for the repo (primary key)
    #[sea_orm(primary_key)]
    pub id: i64,

    /// Human path, e.g. "github.com/acme/widgets" (unique among live rows)
    pub name: String,

    pub description: Option<String>,
    pub fork: bool,
    pub archived: bool,
    pub private: bool,

    /// External spec: source kind
    pub external_kind: String,

    /// External spec: owning external service
    pub external_service_id: i64,

    /// External spec: host-assigned stable ID
    pub external_id: String,

    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,

    /// Soft-delete marker; deletion also mangles the name so the global name
    /// uniqueness constraint keeps holding
    pub deleted_at: Option<DateTimeUtc>,
}

impl Model {
    pub fn external_repo_spec(&self) -> ExternalRepoSpec {
        ExternalRepoSpec {
            kind: self.external_kind.clone(),
            service_id: self.external_service_id,
            id: self.external_id.clone(),
        }
    }

    pub fn matches_spec(&self, spec: &ExternalRepoSpec) -> bool {
        self.external_kind == spec.kind
            && self.external_service_id == spec.service_id
            && self.external_id == spec.id
    }

    /// Overwrite this row's observable fields from a freshly sourced record.
    /// Returns false when nothing differs, i.e. the repo is unmodified.
    /// Resurrects soft-deleted rows.
    pub fn absorb(&mut self, sourced: &SourcedRepo) -> bool {
        let mut changed = false;

        if self.name != sourced.name {
            self.name = sourced.name.clone();
            changed = true;
        }
        if self.description != sourced.description {
            self.description = sourced.description.clone();
            changed = true;
        }
        if self.fork != sourced.fork {
            self.fork = sourced.fork;
            changed = true;
        }
        if self.archived != sourced.archived {
            self.archived = sourced.archived;
            changed = true;
        }
        if self.private != sourced.private {
            self.private = sourced.private;
            changed = true;
        }
        if !self.matches_spec(&sourced.spec) {
            self.external_kind = sourced.spec.kind.clone();
            self.external_service_id = sourced.spec.service_id;
            self.external_id = sourced.spec.id.clone();
            changed = true;
        }
        if self.deleted_at.is_some() {
            self.deleted_at = None;
            changed = true;
        }

        changed
    }
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
