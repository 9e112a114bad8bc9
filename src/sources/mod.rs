//! Source trait definition
//!
//! Defines the interface reconciliation consumes: a source streams candidate
//! repositories for one external service over a bounded channel, and may
//! optionally support fetching a single repository by path for the lazy sync
//! path. Concrete connectors live outside this crate.

pub mod registry;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::models::repo::SourcedRepo;

/// One item on the stream: a candidate repo, or the error the source hit
/// while producing it.
pub type SourceResult = Result<SourcedRepo, SourceError>;

/// Errors reported by sources, classified for the reconciler.
///
/// This enum is the single place where host errors map onto sync behavior;
/// connectors must classify here rather than letting callers sniff message
/// strings.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SourceError {
    #[error("bad credentials: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("account suspended: {0}")]
    AccountSuspended(String),

    #[error("repository not found: {0}")]
    NotFound(String),

    #[error("rate limited{}", retry_after_secs.map(|s| format!(" (retry after {s}s)")).unwrap_or_default())]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("transient source error: {0}")]
    Transient(String),
}

impl SourceError {
    /// Fatal errors abort the pass and clear the seen set: the service can
    /// see nothing, so everything it owned becomes eligible for deletion
    /// (non-site services only).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SourceError::Unauthorized(_)
                | SourceError::Forbidden(_)
                | SourceError::AccountSuspended(_)
        )
    }

    /// Not-found and fatal-auth errors on a single-repo fetch mean the stored
    /// record must not linger.
    pub fn evicts_stored_repo(&self) -> bool {
        self.is_fatal() || matches!(self, SourceError::NotFound(_))
    }
}

/// A source of candidate repositories for one external service.
#[async_trait]
pub trait Source: Send + Sync {
    /// Stream candidate repos into `results` until exhausted or `cancel`
    /// fires. The producer signals completion by returning (the channel
    /// closes when the sender is dropped). Errors are pushed as items, not
    /// returned, so a pass can outlive individual failures.
    async fn list_repos(&self, cancel: CancellationToken, results: mpsc::Sender<SourceResult>);

    /// Fetch live metadata for a single repository path (the name with the
    /// code host prefix stripped). Sources that cannot address single repos
    /// keep the default.
    async fn get_repo(&self, path: &str) -> Result<SourcedRepo, SourceError> {
        Err(SourceError::NotFound(format!(
            "single-repo fetch not supported (path {path})"
        )))
    }
}

/// A public code host whose repos may be synced lazily by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeHost {
    /// Source kind, matching `ExternalService::kind`
    pub kind: &'static str,
    /// Repo-name prefix identifying this host, e.g. "github.com/"
    pub name_prefix: &'static str,
    /// Package hosts keep their repo set in a side table, so lazily added
    /// repos survive full syncs and any matching service is eligible (not
    /// just cloud-default ones)
    pub package_host: bool,
}

/// Hosts eligible for the lazy single-repo path.
pub const PUBLIC_CODE_HOSTS: &[CodeHost] = &[
    CodeHost {
        kind: "github",
        name_prefix: "github.com/",
        package_host: false,
    },
    CodeHost {
        kind: "gitlab",
        name_prefix: "gitlab.com/",
        package_host: false,
    },
    CodeHost {
        kind: "npm",
        name_prefix: "npm/",
        package_host: true,
    },
    CodeHost {
        kind: "crates",
        name_prefix: "crates/",
        package_host: true,
    },
];

/// Resolves the code host owning a repo name by prefix, or None when the
/// name does not belong to any lazily-syncable host.
pub fn code_host_of(name: &str) -> Option<&'static CodeHost> {
    PUBLIC_CODE_HOSTS
        .iter()
        .find(|host| name.starts_with(host.name_prefix))
}

/// The repo path at its host: the name with the host prefix stripped.
pub fn repo_path(host: &CodeHost, name: &str) -> String {
    name.strip_prefix(host.name_prefix).unwrap_or(name).to_string()
}
