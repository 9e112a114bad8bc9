//! # Syncer
//!
//! Reconciles the repository inventory against external sources. A full pass
//! streams every repo a service can see and applies each candidate in its own
//! transaction; the lazy path fetches a single repo by name on demand. Both
//! paths publish the resulting diffs on the `synced` channel after commit.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sea_orm::{ConnectionTrait, DbErr};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::calc_sync_interval;
use crate::config::QuotaConfig;
use crate::diff::{observe_diff, Diff};
use crate::models::external_service::{self as svc_model, ServiceOwner};
use crate::models::repo::{self, SourcedRepo};
use crate::single_flight::SingleFlight;
use crate::sources::registry::{RegistryError, SourceRegistry};
use crate::sources::{self, SourceError};
use crate::store::{external_service as svc_store, repo as repo_store, Store};

/// How long a freshly synced repo is served from the store before the lazy
/// path fetches it again.
const LAZY_SYNC_DEBOUNCE: Duration = Duration::from_secs(60);

/// Upper bound on a background lazy fetch.
const BACKGROUND_SYNC_TIMEOUT: Duration = Duration::from_secs(60);

/// Buffer of the per-pass stream between a source and the reconciler.
const SOURCE_STREAM_BUFFER: usize = 64;

/// Injectable time source. Production uses the system clock; tests pin it.
#[derive(Clone)]
pub struct Clock(Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>);

impl Clock {
    pub fn system() -> Self {
        Self(Arc::new(Utc::now))
    }

    pub fn fixed(at: DateTime<Utc>) -> Self {
        Self(Arc::new(move || at))
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.0)()
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::system()
    }
}

impl fmt::Debug for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Clock").field(&self.now()).finish()
    }
}

/// Adding one more repo would exceed a quota.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "reached maximum allowed repos added by users and organizations \
     (site {site_count}/{site_limit}, namespace {namespace_count}/{namespace_limit})"
)]
pub struct RepoLimitError {
    pub site_count: u64,
    pub site_limit: u64,
    pub namespace_count: u64,
    pub namespace_limit: u64,
    pub owner: ServiceOwner,
}

#[derive(Debug, Clone, Error)]
pub enum SyncerError {
    #[error("store error: {0}")]
    Store(String),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    RepoLimit(#[from] RepoLimitError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("external service {0} not found")]
    ServiceNotFound(i64),

    #[error("repository not found: {0}")]
    RepoNotFound(String),

    #[error("cloud-default services sync repos lazily, not via full passes")]
    CloudDefaultSync,

    #[error("no eligible external service for kind '{0}'")]
    NoEligibleService(String),

    #[error("sync canceled")]
    Canceled,
}

impl From<DbErr> for SyncerError {
    fn from(err: DbErr) -> Self {
        SyncerError::Store(err.to_string())
    }
}

/// Every error one pass accumulated. A pass keeps going over per-repo
/// failures, so it can end with several.
#[derive(Debug, Clone, Default)]
pub struct SyncErrors(pub Vec<SyncerError>);

impl SyncErrors {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn push(&mut self, err: SyncerError) {
        self.0.push(err);
    }

    fn into_result(self) -> Result<(), SyncErrors> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl From<SyncerError> for SyncErrors {
    fn from(err: SyncerError) -> Self {
        Self(vec![err])
    }
}

impl fmt::Display for SyncErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.len() {
            1 => write!(f, "1 error during sync:")?,
            n => write!(f, "{n} errors during sync:")?,
        }
        for err in &self.0 {
            write!(f, "\n* {err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for SyncErrors {}

/// The reconciliation engine. Cheap to clone; clones share the store handle,
/// registry, and in-flight lazy sync group.
#[derive(Clone)]
pub struct Syncer {
    store: Store,
    sources: Arc<SourceRegistry>,
    /// Diffs of committed changes are published here, commit-before-publish.
    synced: Option<mpsc::Sender<Diff>>,
    clock: Clock,
    quotas: QuotaConfig,
    allow_user_private_repos: bool,
    lazy_group: SingleFlight<Result<repo::Model, SyncerError>>,
}

impl Syncer {
    pub fn new(
        store: Store,
        sources: Arc<SourceRegistry>,
        synced: Option<mpsc::Sender<Diff>>,
        clock: Clock,
        quotas: QuotaConfig,
        allow_user_private_repos: bool,
    ) -> Self {
        Self {
            store,
            sources,
            synced,
            clock,
            quotas,
            allow_user_private_repos,
            lazy_group: SingleFlight::new(),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Publish everything currently stored as one unmodified diff, so
    /// downstream consumers can initialize on startup.
    pub async fn publish_initial_unmodified(&self) -> Result<(), SyncerError> {
        let repos = self.store.list_repos().await?;
        if !repos.is_empty() {
            self.publish(Diff::unmodified_only(repos)).await;
        }
        Ok(())
    }

    /// Enqueue an out-of-schedule sync job for one service. Returns false when
    /// a live job already covers it.
    pub async fn trigger_sync(&self, service_id: i64) -> Result<bool, SyncerError> {
        let enqueued = self
            .store
            .enqueue_sync_job(service_id, self.clock.now())
            .await?;
        Ok(enqueued.is_some())
    }

    /// Run one full reconciliation pass for `service_id`.
    ///
    /// Per-repo failures are accumulated and the pass keeps going; fatal
    /// credential errors abort the stream and clear the seen set. Stored repos
    /// the pass did not see are deleted only when the pass was error-free, or
    /// when a fatal error hit a non-site service (whose repos must not outlive
    /// its access). Scheduling bookkeeping is persisted in every outcome.
    pub async fn sync_external_service(
        &self,
        cancel: CancellationToken,
        service_id: i64,
        min_interval: Duration,
    ) -> Result<(), SyncErrors> {
        let svc = self
            .store
            .external_service(service_id)
            .await
            .map_err(SyncerError::from)?
            .ok_or(SyncerError::ServiceNotFound(service_id))?;

        if svc.cloud_default {
            return Err(SyncerError::CloudDefaultSync.into());
        }

        info!(service_id, kind = %svc.kind, "started external service sync");

        let source = self
            .sources
            .get(&svc.kind)
            .map_err(SyncerError::Registry)?;

        let (results_tx, mut results_rx) = mpsc::channel(SOURCE_STREAM_BUFFER);
        let producer_cancel = cancel.child_token();
        let producer = {
            let cancel = producer_cancel.clone();
            tokio::spawn(async move { source.list_repos(cancel, results_tx).await })
        };

        let mut seen: HashSet<i64> = HashSet::new();
        let mut errs = SyncErrors::default();
        let mut modified = false;
        let mut fatal = false;

        loop {
            let item = tokio::select! {
                item = results_rx.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
                _ = cancel.cancelled() => {
                    errs.push(SyncerError::Canceled);
                    break;
                }
            };

            match item {
                Err(source_err) => {
                    warn!(service_id, error = %source_err, "source error during sync");
                    let is_fatal = source_err.is_fatal();
                    errs.push(SyncerError::Source(source_err));
                    if is_fatal {
                        // The service can see nothing; everything it owned is
                        // up for deletion.
                        seen.clear();
                        fatal = true;
                        break;
                    }
                }
                Ok(sourced) => {
                    if sourced.private && !self.private_repo_allowed(&svc) {
                        debug!(service_id, repo = %sourced.name, "skipping private repo");
                        continue;
                    }
                    match self.sync_one(&svc, &sourced).await {
                        Ok(diff) => {
                            modified |= !diff.added.is_empty() || !diff.modified.is_empty();
                            seen.extend(
                                diff.added
                                    .iter()
                                    .chain(diff.modified.iter())
                                    .chain(diff.unmodified.iter())
                                    .map(|r| r.id),
                            );
                        }
                        Err(err) => {
                            warn!(service_id, repo = %sourced.name, error = %err, "failed to sync repo");
                            let over_quota = matches!(err, SyncerError::RepoLimit(_));
                            errs.push(err);
                            // Quota exhaustion stops further adds; bookkeeping
                            // still runs below.
                            if over_quota {
                                break;
                            }
                        }
                    }
                }
            }
        }

        producer_cancel.cancel();
        let _ = producer.await;

        let now = self.clock.now();

        // Deleting unseen repos on a partial stream would drop repos that are
        // still there.
        if errs.is_empty() || (fatal && !svc.is_site_owned()) {
            let deleted = self.store.delete_repos_not_in(svc.id, &seen, now).await;
            match deleted {
                Ok(deleted) if !deleted.is_empty() => {
                    info!(service_id, count = deleted.len(), "deleted repos no longer visible");
                    modified = true;
                    let diff = Diff::deleted_only(deleted);
                    observe_diff(&diff);
                    self.publish(diff).await;
                }
                Ok(_) => {}
                Err(err) => errs.push(err.into()),
            }
        }

        let interval =
            calc_sync_interval(now, svc.last_sync_at, min_interval, modified, !errs.is_empty());
        let last_sync_error = (!errs.is_empty()).then(|| errs.to_string());
        if let Err(err) = self
            .store
            .update_service_sync_state(&svc, now, now + interval, last_sync_error)
            .await
        {
            errs.push(err.into());
        }

        metrics::counter!("repo_syncer_service_syncs_total", "success" => if errs.is_empty() { "true" } else { "false" })
            .increment(1);
        info!(
            service_id,
            modified,
            errors = errs.0.len(),
            next_sync_in_secs = interval.as_secs(),
            "finished external service sync"
        );

        errs.into_result()
    }

    /// Sync a single repo by name on demand.
    ///
    /// When `background` is set and a usable stored record exists, the fetch
    /// runs detached and the stored record is returned immediately. Concurrent
    /// calls for the same name share one fetch.
    pub async fn sync_repo(
        &self,
        name: &str,
        background: bool,
    ) -> Result<repo::Model, SyncerError> {
        let stored = self.store.repo_by_name(name).await?;

        let Some(host) = sources::code_host_of(name) else {
            return stored.ok_or_else(|| SyncerError::RepoNotFound(name.to_string()));
        };

        if let Some(stored) = &stored {
            // Private repos are never served through the lazy path.
            if stored.private {
                return Err(SyncerError::RepoNotFound(name.to_string()));
            }
            let age = self.clock.now() - stored.updated_at;
            if age.to_std().unwrap_or(Duration::ZERO) < LAZY_SYNC_DEBOUNCE {
                return Ok(stored.clone());
            }
        }

        if background {
            if let Some(stored) = stored {
                let syncer = self.clone();
                let name = name.to_string();
                tokio::spawn(async move {
                    let fetch = syncer.coalesced_fetch(&name, host);
                    match tokio::time::timeout(BACKGROUND_SYNC_TIMEOUT, fetch).await {
                        Ok(Ok(_)) => {}
                        Ok(Err(err)) => warn!(repo = %name, error = %err, "background repo sync failed"),
                        Err(_) => warn!(repo = %name, "background repo sync timed out"),
                    }
                });
                return Ok(stored);
            }
        }

        self.coalesced_fetch(name, host).await
    }

    async fn coalesced_fetch(
        &self,
        name: &str,
        host: &'static sources::CodeHost,
    ) -> Result<repo::Model, SyncerError> {
        let syncer = self.clone();
        let owned_name = name.to_string();
        self.lazy_group
            .run(name, move || async move {
                syncer.fetch_and_store(&owned_name, host).await
            })
            .await
    }

    async fn fetch_and_store(
        &self,
        name: &str,
        host: &sources::CodeHost,
    ) -> Result<repo::Model, SyncerError> {
        // A caller that raced past the first store lookup may land here right
        // after another fetch committed; serve that result instead of hitting
        // the host again.
        if let Some(stored) = self.store.repo_by_name(name).await? {
            let age = self.clock.now() - stored.updated_at;
            if !stored.private && age.to_std().unwrap_or(Duration::ZERO) < LAZY_SYNC_DEBOUNCE {
                return Ok(stored);
            }
        }

        // Package hosts keep lazily added repos across full syncs, so any
        // service of the kind may serve the fetch; code hosts need the
        // cloud-default service.
        let candidates = self
            .store
            .list_external_services(svc_store::ServiceQuery {
                kinds: vec![host.kind.to_string()],
                only_cloud_default: !host.package_host,
                limit: Some(1),
            })
            .await?;
        let svc = candidates
            .into_iter()
            .next()
            .ok_or_else(|| SyncerError::NoEligibleService(host.kind.to_string()))?;

        let source = self.sources.get(&svc.kind)?;
        let path = sources::repo_path(host, name);

        let sourced = match source.get_repo(&path).await {
            Ok(sourced) => sourced,
            Err(err) => {
                if err.evicts_stored_repo() {
                    self.evict_stored(name).await?;
                }
                return Err(match err {
                    SourceError::NotFound(_) => SyncerError::RepoNotFound(name.to_string()),
                    other => SyncerError::Source(other),
                });
            }
        };

        if sourced.private {
            // A stored record for a repo that went private is as stale as a
            // deleted one.
            self.evict_stored(name).await?;
            return Err(SyncerError::RepoNotFound(name.to_string()));
        }

        let diff = self.sync_one(&svc, &sourced).await?;
        diff.added
            .into_iter()
            .chain(diff.modified)
            .chain(diff.unmodified)
            .next()
            .ok_or_else(|| SyncerError::RepoNotFound(name.to_string()))
    }

    /// Drop a stored record whose source says it no longer exists (or can no
    /// longer be seen).
    async fn evict_stored(&self, name: &str) -> Result<(), SyncerError> {
        if let Some(stored) = self.store.repo_by_name(name).await? {
            info!(repo = %name, "deleting stored repo evicted by its source");
            self.store.delete_repo(&stored, self.clock.now()).await?;
            let diff = Diff::deleted_only(vec![stored]);
            observe_diff(&diff);
            self.publish(diff).await;
        }
        Ok(())
    }

    /// Apply one sourced repo against the store, in its own transaction.
    ///
    /// The candidate may match zero stored rows (insert, subject to quota),
    /// one (update or unmodified), or two (a rename took over a name that
    /// another row still holds; the row matching only by name loses). The
    /// diff is published after commit.
    async fn sync_one(
        &self,
        svc: &svc_model::Model,
        sourced: &SourcedRepo,
    ) -> Result<Diff, SyncerError> {
        let now = self.clock.now();
        let txn = self.store.transact().await?;

        let mut matches =
            repo_store::list_by_name_or_spec(&txn, &sourced.name, &sourced.spec).await?;

        let mut diff = Diff::default();
        match matches.len() {
            0 => {
                if !svc.is_site_owned() {
                    self.check_quota(&txn, svc).await?;
                }
                diff.added.push(repo_store::create(&txn, sourced, now).await?);
            }
            1 => {
                let mut stored = matches.remove(0);
                if stored.absorb(sourced) {
                    diff.modified.push(repo_store::update(&txn, &stored, now).await?);
                } else {
                    diff.unmodified.push(stored);
                }
            }
            2 => {
                // One row matches the external spec, the other only holds the
                // name (a rename at the host). The name-only row is deleted so
                // the external-spec match can take the name over.
                let spec_pos = matches
                    .iter()
                    .position(|m| m.matches_spec(&sourced.spec))
                    .unwrap_or(0);
                let mut winner = matches.remove(spec_pos);
                let loser = matches.remove(0);

                debug!(
                    winner = %winner.name,
                    loser = %loser.name,
                    "resolving repo name conflict"
                );
                repo_store::soft_delete(&txn, &loser, now).await?;
                diff.deleted.push(loser);

                if winner.absorb(sourced) {
                    diff.modified.push(repo_store::update(&txn, &winner, now).await?);
                } else {
                    diff.unmodified.push(winner);
                }
            }
            n => {
                // The pair of uniqueness constraints makes this impossible;
                // reaching it means the store is corrupt.
                panic!("repo {} matched {n} stored rows", sourced.name);
            }
        }

        txn.commit().await?;

        observe_diff(&diff);
        self.publish(diff.clone()).await;
        Ok(diff)
    }

    async fn check_quota<C: ConnectionTrait>(
        &self,
        db: &C,
        svc: &svc_model::Model,
    ) -> Result<(), SyncerError> {
        let site_limit = self.quotas.max_repos_per_site;
        let namespace_limit = self.quotas.max_repos_per_namespace;
        if site_limit == 0 && namespace_limit == 0 {
            return Ok(());
        }

        let site_count = repo_store::count_namespaced(db).await?;
        let namespace_count = repo_store::count_for_namespace(db, svc.owner()).await?;

        let site_full = site_limit != 0 && site_count >= site_limit;
        let namespace_full = namespace_limit != 0 && namespace_count >= namespace_limit;
        if site_full || namespace_full {
            return Err(RepoLimitError {
                site_count,
                site_limit,
                namespace_count,
                namespace_limit,
                owner: svc.owner(),
            }
            .into());
        }

        Ok(())
    }

    fn private_repo_allowed(&self, svc: &svc_model::Model) -> bool {
        svc.is_site_owned() || self.allow_user_private_repos
    }

    async fn publish(&self, diff: Diff) {
        if let Some(synced) = &self.synced {
            // A closed receiver just means nobody is listening anymore.
            let _ = synced.send(diff).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use migration::{Migrator, MigratorTrait};
    use sea_orm::Database;

    use crate::models::repo::ExternalRepoSpec;
    use crate::sources::{Source, SourceResult};

    /// Source fed from a fixed list, shared by full-pass and lazy tests.
    #[derive(Default)]
    struct StubSource {
        stream: Mutex<Vec<SourceResult>>,
        by_path: Mutex<std::collections::HashMap<String, Result<SourcedRepo, SourceError>>>,
        fetches: AtomicUsize,
    }

    impl StubSource {
        fn streaming(items: Vec<SourceResult>) -> Self {
            Self {
                stream: Mutex::new(items),
                ..Default::default()
            }
        }

        fn with_repo(self, path: &str, sourced: SourcedRepo) -> Self {
            self.by_path
                .lock()
                .unwrap()
                .insert(path.to_string(), Ok(sourced));
            self
        }

        fn with_error(self, path: &str, err: SourceError) -> Self {
            self.by_path
                .lock()
                .unwrap()
                .insert(path.to_string(), Err(err));
            self
        }
    }

    #[async_trait]
    impl Source for StubSource {
        async fn list_repos(
            &self,
            _cancel: CancellationToken,
            results: mpsc::Sender<SourceResult>,
        ) {
            let items = self.stream.lock().unwrap().clone();
            for item in items {
                if results.send(item).await.is_err() {
                    return;
                }
            }
        }

        async fn get_repo(&self, path: &str) -> Result<SourcedRepo, SourceError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.by_path
                .lock()
                .unwrap()
                .get(path)
                .cloned()
                .unwrap_or_else(|| Err(SourceError::NotFound(path.to_string())))
        }
    }

    struct Harness {
        syncer: Syncer,
        source: Arc<StubSource>,
    }

    async fn harness(source: StubSource, quotas: QuotaConfig) -> Harness {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        Migrator::up(&db, None).await.unwrap();

        let source = Arc::new(source);
        let mut registry = SourceRegistry::new();
        registry.register("github", source.clone());

        let syncer = Syncer::new(
            Store::new(db),
            Arc::new(registry),
            None,
            Clock::system(),
            quotas,
            false,
        );
        Harness { syncer, source }
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

    async fn seed_service(store: &Store, owner: ServiceOwner, cloud_default: bool) -> i64 {
        svc_store::create(store.db(), "github", "GitHub", owner, cloud_default, Utc::now())
            .await
            .unwrap()
            .id
    }

    fn live_names(repos: &[repo::Model]) -> Vec<&str> {
        repos.iter().map(|r| r.name.as_str()).collect()
    }

    #[tokio::test]
    async fn full_pass_adds_updates_and_deletes() {
        let h = harness(StubSource::default(), QuotaConfig::default()).await;
        let svc = seed_service(h.syncer.store(), ServiceOwner::Site, false).await;

        *h.source.stream.lock().unwrap() = vec![
            Ok(sourced("github.com/acme/a", "id-a", svc)),
            Ok(sourced("github.com/acme/b", "id-b", svc)),
        ];
        h.syncer
            .sync_external_service(CancellationToken::new(), svc, Duration::from_secs(60))
            .await
            .unwrap();

        let repos = h.syncer.store().list_repos().await.unwrap();
        assert_eq!(live_names(&repos), vec!["github.com/acme/a", "github.com/acme/b"]);

        // Next pass: b is gone, c appeared.
        *h.source.stream.lock().unwrap() = vec![
            Ok(sourced("github.com/acme/a", "id-a", svc)),
            Ok(sourced("github.com/acme/c", "id-c", svc)),
        ];
        h.syncer
            .sync_external_service(CancellationToken::new(), svc, Duration::from_secs(60))
            .await
            .unwrap();

        let repos = h.syncer.store().list_repos().await.unwrap();
        assert_eq!(live_names(&repos), vec!["github.com/acme/a", "github.com/acme/c"]);

        let svc_row = h.syncer.store().external_service(svc).await.unwrap().unwrap();
        assert!(svc_row.last_sync_at.is_some());
        assert!(svc_row.next_sync_at.is_some());
        assert!(svc_row.last_sync_error.is_none());
    }

    #[tokio::test]
    async fn repeated_pass_is_idempotent() {
        let h = harness(StubSource::default(), QuotaConfig::default()).await;
        let svc = seed_service(h.syncer.store(), ServiceOwner::Site, false).await;

        *h.source.stream.lock().unwrap() = vec![Ok(sourced("github.com/acme/a", "id-a", svc))];
        for _ in 0..2 {
            h.syncer
                .sync_external_service(CancellationToken::new(), svc, Duration::from_secs(60))
                .await
                .unwrap();
        }

        let repos = h.syncer.store().list_repos().await.unwrap();
        assert_eq!(repos.len(), 1);
    }

    #[tokio::test]
    async fn rename_conflict_deletes_name_only_match() {
        let h = harness(StubSource::default(), QuotaConfig::default()).await;
        let svc = seed_service(h.syncer.store(), ServiceOwner::Site, false).await;

        // Two repos; then "old" is renamed at the host to take over "taken".
        *h.source.stream.lock().unwrap() = vec![
            Ok(sourced("github.com/acme/taken", "id-1", svc)),
            Ok(sourced("github.com/acme/old", "id-2", svc)),
        ];
        h.syncer
            .sync_external_service(CancellationToken::new(), svc, Duration::from_secs(60))
            .await
            .unwrap();

        *h.source.stream.lock().unwrap() = vec![Ok(sourced("github.com/acme/taken", "id-2", svc))];
        h.syncer
            .sync_external_service(CancellationToken::new(), svc, Duration::from_secs(60))
            .await
            .unwrap();

        let repos = h.syncer.store().list_repos().await.unwrap();
        assert_eq!(repos.len(), 1);
        assert_eq!(repos[0].name, "github.com/acme/taken");
        assert_eq!(repos[0].external_id, "id-2");
    }

    #[tokio::test]
    async fn transient_error_skips_deletion_but_applies_adds() {
        let h = harness(StubSource::default(), QuotaConfig::default()).await;
        let svc = seed_service(h.syncer.store(), ServiceOwner::Site, false).await;

        *h.source.stream.lock().unwrap() = vec![Ok(sourced("github.com/acme/a", "id-a", svc))];
        h.syncer
            .sync_external_service(CancellationToken::new(), svc, Duration::from_secs(60))
            .await
            .unwrap();

        // A flaky pass that saw only b must not delete a.
        *h.source.stream.lock().unwrap() = vec![
            Ok(sourced("github.com/acme/b", "id-b", svc)),
            Err(SourceError::Transient("503".to_string())),
        ];
        let errs = h
            .syncer
            .sync_external_service(CancellationToken::new(), svc, Duration::from_secs(60))
            .await
            .unwrap_err();
        assert_eq!(errs.0.len(), 1);

        let repos = h.syncer.store().list_repos().await.unwrap();
        assert_eq!(live_names(&repos), vec!["github.com/acme/a", "github.com/acme/b"]);

        let svc_row = h.syncer.store().external_service(svc).await.unwrap().unwrap();
        assert!(svc_row.last_sync_error.is_some());
    }

    #[tokio::test]
    async fn fatal_error_deletes_repos_of_user_service_only() {
        for (owner, expect_left) in [(ServiceOwner::User(1), 0), (ServiceOwner::Site, 1)] {
            let h = harness(StubSource::default(), QuotaConfig::default()).await;
            let svc = seed_service(h.syncer.store(), owner, false).await;

            *h.source.stream.lock().unwrap() = vec![Ok(sourced("github.com/acme/a", "id-a", svc))];
            h.syncer
                .sync_external_service(CancellationToken::new(), svc, Duration::from_secs(60))
                .await
                .unwrap();

            *h.source.stream.lock().unwrap() =
                vec![Err(SourceError::Unauthorized("token revoked".to_string()))];
            let errs = h
                .syncer
                .sync_external_service(CancellationToken::new(), svc, Duration::from_secs(60))
                .await
                .unwrap_err();
            assert!(matches!(
                errs.0[0],
                SyncerError::Source(SourceError::Unauthorized(_))
            ));

            let repos = h.syncer.store().list_repos().await.unwrap();
            assert_eq!(repos.len(), expect_left, "owner {owner:?}");
        }
    }

    #[tokio::test]
    async fn quota_blocks_new_repos_for_user_services() {
        let quotas = QuotaConfig {
            max_repos_per_site: 0,
            max_repos_per_namespace: 1,
        };
        let h = harness(StubSource::default(), quotas).await;
        let svc = seed_service(h.syncer.store(), ServiceOwner::User(1), false).await;

        *h.source.stream.lock().unwrap() = vec![
            Ok(sourced("github.com/acme/a", "id-a", svc)),
            Ok(sourced("github.com/acme/b", "id-b", svc)),
        ];
        let errs = h
            .syncer
            .sync_external_service(CancellationToken::new(), svc, Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(errs.0[0], SyncerError::RepoLimit(_)));

        let repos = h.syncer.store().list_repos().await.unwrap();
        assert_eq!(repos.len(), 1);
    }

    #[tokio::test]
    async fn site_services_are_exempt_from_quota() {
        let quotas = QuotaConfig {
            max_repos_per_site: 1,
            max_repos_per_namespace: 1,
        };
        let h = harness(StubSource::default(), quotas).await;
        let svc = seed_service(h.syncer.store(), ServiceOwner::Site, false).await;

        *h.source.stream.lock().unwrap() = vec![
            Ok(sourced("github.com/acme/a", "id-a", svc)),
            Ok(sourced("github.com/acme/b", "id-b", svc)),
        ];
        h.syncer
            .sync_external_service(CancellationToken::new(), svc, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(h.syncer.store().list_repos().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn private_repos_from_user_services_are_skipped() {
        let h = harness(StubSource::default(), QuotaConfig::default()).await;
        let svc = seed_service(h.syncer.store(), ServiceOwner::User(1), false).await;

        let mut private = sourced("github.com/acme/secret", "id-s", svc);
        private.private = true;
        *h.source.stream.lock().unwrap() = vec![Ok(private)];
        h.syncer
            .sync_external_service(CancellationToken::new(), svc, Duration::from_secs(60))
            .await
            .unwrap();

        assert!(h.syncer.store().list_repos().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cloud_default_services_refuse_full_sync() {
        let h = harness(StubSource::default(), QuotaConfig::default()).await;
        let svc = seed_service(h.syncer.store(), ServiceOwner::Site, true).await;

        let errs = h
            .syncer
            .sync_external_service(CancellationToken::new(), svc, Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(errs.0[0], SyncerError::CloudDefaultSync));
    }

    #[tokio::test]
    async fn lazy_sync_adds_repo_and_debounces() {
        let source = StubSource::default()
            .with_repo("acme/widgets", sourced("github.com/acme/widgets", "id-w", 1));
        let h = harness(source, QuotaConfig::default()).await;
        seed_service(h.syncer.store(), ServiceOwner::Site, true).await;

        let repo = h.syncer.sync_repo("github.com/acme/widgets", false).await.unwrap();
        assert_eq!(repo.name, "github.com/acme/widgets");
        assert_eq!(h.source.fetches.load(Ordering::SeqCst), 1);

        // A fresh record is served from the store.
        h.syncer.sync_repo("github.com/acme/widgets", false).await.unwrap();
        assert_eq!(h.source.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn lazy_sync_coalesces_concurrent_callers() {
        let source = StubSource::default()
            .with_repo("acme/widgets", sourced("github.com/acme/widgets", "id-w", 1));
        let h = harness(source, QuotaConfig::default()).await;
        seed_service(h.syncer.store(), ServiceOwner::Site, true).await;

        let mut handles = Vec::new();
        for _ in 0..50 {
            let syncer = h.syncer.clone();
            handles.push(tokio::spawn(async move {
                syncer.sync_repo("github.com/acme/widgets", false).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(h.source.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(h.syncer.store().list_repos().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn lazy_sync_evicts_repo_its_source_lost() {
        let source = StubSource::default().with_error(
            "acme/widgets",
            SourceError::NotFound("acme/widgets".to_string()),
        );
        let h = harness(source, QuotaConfig::default()).await;
        let svc = seed_service(h.syncer.store(), ServiceOwner::Site, true).await;

        // Stored record older than the debounce window.
        let stale = Utc::now() - chrono::Duration::minutes(5);
        repo_store::create(
            h.syncer.store().db(),
            &sourced("github.com/acme/widgets", "id-w", svc),
            stale,
        )
        .await
        .unwrap();

        let err = h
            .syncer
            .sync_repo("github.com/acme/widgets", false)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncerError::RepoNotFound(_)));
        assert!(h.syncer.store().list_repos().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn lazy_sync_evicts_repo_that_went_private() {
        let mut private = sourced("github.com/acme/widgets", "id-w", 1);
        private.private = true;
        let source = StubSource::default().with_repo("acme/widgets", private);
        let h = harness(source, QuotaConfig::default()).await;
        let svc = seed_service(h.syncer.store(), ServiceOwner::Site, true).await;

        // Stored as public, older than the debounce window.
        let stale = Utc::now() - chrono::Duration::minutes(5);
        repo_store::create(
            h.syncer.store().db(),
            &sourced("github.com/acme/widgets", "id-w", svc),
            stale,
        )
        .await
        .unwrap();

        let err = h
            .syncer
            .sync_repo("github.com/acme/widgets", false)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncerError::RepoNotFound(_)));
        assert!(h.syncer.store().list_repos().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn lazy_sync_requires_known_code_host() {
        let h = harness(StubSource::default(), QuotaConfig::default()).await;
        let err = h
            .syncer
            .sync_repo("git.internal.example/team/repo", false)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncerError::RepoNotFound(_)));
    }

    #[tokio::test]
    async fn background_sync_returns_stored_record_immediately() {
        let source = StubSource::default()
            .with_repo("acme/widgets", sourced("github.com/acme/widgets", "id-w", 1));
        let h = harness(source, QuotaConfig::default()).await;
        let svc = seed_service(h.syncer.store(), ServiceOwner::Site, true).await;

        let stale = Utc::now() - chrono::Duration::minutes(5);
        let stored = repo_store::create(
            h.syncer.store().db(),
            &sourced("github.com/acme/widgets", "id-w", svc),
            stale,
        )
        .await
        .unwrap();

        let served = h
            .syncer
            .sync_repo("github.com/acme/widgets", true)
            .await
            .unwrap();
        assert_eq!(served.id, stored.id);
    }

    #[tokio::test]
    async fn diffs_are_published_after_commit() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        Migrator::up(&db, None).await.unwrap();
        let store = Store::new(db);
        let svc = seed_service(&store, ServiceOwner::Site, false).await;

        let source = Arc::new(StubSource::streaming(vec![Ok(sourced(
            "github.com/acme/a",
            "id-a",
            svc,
        ))]));
        let mut registry = SourceRegistry::new();
        registry.register("github", source);

        let (tx, mut rx) = mpsc::channel(16);
        let syncer = Syncer::new(
            store,
            Arc::new(registry),
            Some(tx),
            Clock::system(),
            QuotaConfig::default(),
            false,
        );

        syncer
            .sync_external_service(CancellationToken::new(), svc, Duration::from_secs(60))
            .await
            .unwrap();

        let diff = rx.recv().await.unwrap();
        assert_eq!(diff.added.len(), 1);
        // The published repo is already committed and readable.
        assert!(
            syncer
                .store()
                .repo_by_name(&diff.added[0].name)
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn initial_unmodified_diff_covers_stored_repos() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        Migrator::up(&db, None).await.unwrap();
        let store = Store::new(db);
        let svc = seed_service(&store, ServiceOwner::Site, false).await;
        repo_store::create(store.db(), &sourced("github.com/acme/a", "id-a", svc), Utc::now())
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let syncer = Syncer::new(
            store,
            Arc::new(SourceRegistry::new()),
            Some(tx),
            Clock::system(),
            QuotaConfig::default(),
            false,
        );

        syncer.publish_initial_unmodified().await.unwrap();
        let diff = rx.recv().await.unwrap();
        assert_eq!(diff.unmodified.len(), 1);
        assert!(diff.added.is_empty());
    }
}
