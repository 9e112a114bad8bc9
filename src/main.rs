//! # Repo Syncer Main Entry Point
//!
//! Wires the store, scheduler, worker, and reclaimer together and runs them
//! until interrupted.

use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use migration::{Migrator, MigratorTrait};
use repo_syncer::{
    config::ConfigLoader,
    db::init_pool,
    diff::Diff,
    logging,
    scheduler::SyncScheduler,
    sources::registry::SourceRegistry,
    store::Store,
    syncer::{Clock, Syncer},
    worker::{run_reclaimer, SyncWorker},
};

#[derive(Parser, Debug)]
#[command(name = "repo-syncer", about = "External repository reconciliation service")]
struct Cli {
    /// Apply pending migrations and exit
    #[arg(long)]
    migrate_only: bool,

    /// Enqueue due services, drain the queue once, and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = Arc::new(ConfigLoader::new().load()?);
    logging::init_subscriber(&config);

    info!(profile = %config.profile, "Loaded configuration");
    if let Ok(redacted_json) = config.redacted_json() {
        debug!(config = %redacted_json, "Effective configuration");
    }

    let db = init_pool(&config).await?;
    Migrator::up(&db, None).await?;
    if cli.migrate_only {
        info!("Migrations applied");
        return Ok(());
    }

    let store = Store::new(db);
    let clock = Clock::system();

    // Concrete sources are registered here as they are implemented; a kind
    // with no source fails its sync pass with a registry error.
    let registry = Arc::new(SourceRegistry::new());
    if registry.kinds().next().is_none() {
        warn!("No sources registered; sync passes will fail until sources are configured");
    }

    let (synced_tx, mut synced_rx) = mpsc::channel::<Diff>(128);
    tokio::spawn(async move {
        while let Some(diff) = synced_rx.recv().await {
            debug!(
                added = diff.added.len(),
                modified = diff.modified.len(),
                deleted = diff.deleted.len(),
                unmodified = diff.unmodified.len(),
                "Applied sync diff"
            );
        }
    });

    let syncer = Syncer::new(
        store.clone(),
        registry,
        Some(synced_tx),
        clock.clone(),
        config.quotas.clone(),
        config.syncer.allow_user_private_repos,
    );
    syncer.publish_initial_unmodified().await?;

    let worker = SyncWorker::new(config.clone(), store.clone(), syncer, clock.clone());

    if cli.once {
        return run_once(&store, &worker, &clock).await;
    }

    let shutdown = CancellationToken::new();
    let scheduler_task = tokio::spawn(
        SyncScheduler::new(config.clone(), store.clone(), clock.clone()).run(shutdown.clone()),
    );
    let worker_task = tokio::spawn(worker.run(shutdown.clone()));
    let reclaimer_task = tokio::spawn(run_reclaimer(
        config.clone(),
        store,
        clock,
        shutdown.clone(),
    ));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    shutdown.cancel();

    let _ = tokio::join!(scheduler_task, worker_task, reclaimer_task);
    info!("Repo syncer stopped");
    Ok(())
}

/// Enqueue every due service and process queued jobs sequentially until the
/// queue is empty.
async fn run_once(
    store: &Store,
    worker: &SyncWorker,
    clock: &Clock,
) -> Result<(), Box<dyn std::error::Error>> {
    let enqueued = store.enqueue_sync_jobs(clock.now()).await?;
    info!(enqueued, "Enqueued sync jobs");

    let mut processed = 0u64;
    while let Some(job) = store.claim_sync_job(clock.now()).await? {
        worker.handle_job(job, CancellationToken::new()).await;
        processed += 1;
    }
    info!(processed, "Single pass finished");
    Ok(())
}
