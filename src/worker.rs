//! # Sync Worker
//!
//! Background executor that claims queued sync jobs and runs full
//! reconciliation passes, several at a time. Each running job renews a
//! heartbeat lease; a companion reclaimer loop sends jobs whose lease lapsed
//! (a crashed or partitioned worker) back to the queue.

use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, histogram};
use tokio::sync::Semaphore;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::AppConfig;
use crate::models::sync_job;
use crate::store::Store;
use crate::syncer::{Clock, Syncer};

/// Background sync job executor.
#[derive(Clone)]
pub struct SyncWorker {
    config: Arc<AppConfig>,
    store: Store,
    syncer: Syncer,
    clock: Clock,
}

impl SyncWorker {
    pub fn new(config: Arc<AppConfig>, store: Store, syncer: Syncer, clock: Clock) -> Self {
        Self {
            config,
            store,
            syncer,
            clock,
        }
    }

    /// Run the worker loop until the provided shutdown token fires, then wait
    /// for in-flight jobs to finish.
    #[instrument(skip_all)]
    pub async fn run(self, shutdown: CancellationToken) {
        let handlers = self.config.worker.num_handlers as usize;
        let semaphore = Arc::new(Semaphore::new(handlers));
        let dequeue_interval = Duration::from_secs(self.config.worker.dequeue_interval_seconds);

        info!(handlers, "Starting sync worker");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Sync worker shutdown requested");
                    break;
                }
                _ = sleep(dequeue_interval) => {
                    if let Err(err) = self.dispatch_available(&semaphore, &shutdown).await {
                        error!(error = ?err, "Failed to claim sync jobs");
                    }
                }
            }
        }

        // Draining the semaphore waits out every in-flight job.
        let _ = semaphore.acquire_many(handlers as u32).await;
        info!("Sync worker stopped");
    }

    /// Claim as many queued jobs as there are free handlers and run each on
    /// its own task.
    async fn dispatch_available(
        &self,
        semaphore: &Arc<Semaphore>,
        shutdown: &CancellationToken,
    ) -> Result<(), sea_orm::DbErr> {
        loop {
            let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                return Ok(());
            };

            let Some(job) = self.store.claim_sync_job(self.clock.now()).await? else {
                return Ok(());
            };

            let worker = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                worker.handle_job(job, shutdown).await;
                drop(permit);
            });
        }
    }

    /// Run one claimed job to a terminal state, renewing its lease while the
    /// pass is in flight.
    pub async fn handle_job(&self, job: sync_job::Model, shutdown: CancellationToken) {
        let started = Instant::now();
        debug!(job_id = job.id, service_id = job.external_service_id, "Handling sync job");

        let heartbeat = {
            let store = self.store.clone();
            let clock = self.clock.clone();
            let interval = Duration::from_secs(self.config.worker.heartbeat_interval_seconds);
            let job_id = job.id;
            tokio::spawn(async move {
                loop {
                    sleep(interval).await;
                    if let Err(err) = store.heartbeat_sync_job(job_id, clock.now()).await {
                        warn!(job_id, error = ?err, "Failed to renew sync job lease");
                    }
                }
            })
        };

        let min_interval = Duration::from_secs(self.config.syncer.min_sync_interval_seconds);
        let result = self
            .syncer
            .sync_external_service(shutdown, job.external_service_id, min_interval)
            .await;

        heartbeat.abort();

        let now = self.clock.now();
        let finish = match &result {
            Ok(()) => self.store.complete_sync_job(&job, now).await,
            Err(errs) => self.store.fail_sync_job(&job, &errs.to_string(), now).await,
        };
        if let Err(err) = finish {
            error!(job_id = job.id, error = ?err, "Failed to finalize sync job");
        }

        histogram!("repo_syncer_job_duration_ms").record(started.elapsed().as_secs_f64() * 1_000.0);
        counter!("repo_syncer_jobs_total", "state" => if result.is_ok() { "completed" } else { "errored" })
            .increment(1);
    }
}

/// Periodically send stalled processing jobs back to the queue.
#[instrument(skip_all)]
pub async fn run_reclaimer(
    config: Arc<AppConfig>,
    store: Store,
    clock: Clock,
    shutdown: CancellationToken,
) {
    let reclaim_interval = Duration::from_secs(config.worker.reclaim_interval_seconds);
    let stalled_after = chrono::Duration::seconds(config.worker.stalled_after_seconds as i64);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Sync job reclaimer shutdown requested");
                return;
            }
            _ = sleep(reclaim_interval) => {
                let now = clock.now();
                match store.reset_stalled_sync_jobs(now - stalled_after, now).await {
                    Ok(reset) if !reset.is_empty() => {
                        warn!(jobs = ?reset, "Reset stalled sync jobs");
                        counter!("repo_syncer_jobs_reset_total").increment(reset.len() as u64);
                    }
                    Ok(_) => {}
                    Err(err) => error!(error = ?err, "Failed to reset stalled sync jobs"),
                }
            }
        }
    }
}
