//! Diff model
//!
//! A [`Diff`] describes the outcome of one reconciliation step: every repo it
//! touched, partitioned into added, modified, deleted, and unmodified. The
//! four sets are disjoint and their union never contains duplicates.

use crate::models::repo;

/// The difference found by a sync between what is in the store and what a
/// source reported.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Diff {
    pub added: Vec<repo::Model>,
    pub modified: Vec<repo::Model>,
    pub deleted: Vec<repo::Model>,
    pub unmodified: Vec<repo::Model>,
}

impl Diff {
    /// A diff containing only deletions, used by the pruning step and the
    /// lazy path's stale-entry cleanup.
    pub fn deleted_only(deleted: Vec<repo::Model>) -> Self {
        Self {
            deleted,
            ..Default::default()
        }
    }

    /// A diff classifying every given repo as unmodified, used for the
    /// startup bootstrap notification.
    pub fn unmodified_only(unmodified: Vec<repo::Model>) -> Self {
        Self {
            unmodified,
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.modified.len() + self.deleted.len() + self.unmodified.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All repos in the diff, across every set.
    pub fn repos(&self) -> impl Iterator<Item = &repo::Model> {
        self.added
            .iter()
            .chain(self.modified.iter())
            .chain(self.deleted.iter())
            .chain(self.unmodified.iter())
    }

    /// Sorts every set by repo ID, for deterministic output.
    pub fn sort(&mut self) {
        for set in [
            &mut self.added,
            &mut self.modified,
            &mut self.deleted,
            &mut self.unmodified,
        ] {
            set.sort_by_key(|r| r.id);
        }
    }
}

/// Records per-state repo counts on the metrics sink.
pub fn observe_diff(diff: &Diff) {
    for (state, set) in [
        ("added", &diff.added),
        ("modified", &diff.modified),
        ("deleted", &diff.deleted),
        ("unmodified", &diff.unmodified),
    ] {
        if !set.is_empty() {
            metrics::counter!("repo_syncer_synced_repos_total", "state" => state)
                .increment(set.len() as u64);
        }
    }
}
