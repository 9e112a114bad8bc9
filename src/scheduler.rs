//! # Sync Scheduler
//!
//! Background task that periodically finds external services whose next sync
//! is due and enqueues a sync job for each, maintaining at-most-one live job
//! per service. The due filter and the dedup both live in the store, so
//! multiple instances may run the scheduler safely.

use std::sync::Arc;

use metrics::{counter, histogram};
use tokio::time::{sleep, Duration as TokioDuration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

use crate::config::AppConfig;
use crate::store::Store;
use crate::syncer::Clock;

/// Background scheduler service.
pub struct SyncScheduler {
    config: Arc<AppConfig>,
    store: Store,
    clock: Clock,
}

impl SyncScheduler {
    /// Create a new scheduler instance.
    pub fn new(config: Arc<AppConfig>, store: Store, clock: Clock) -> Self {
        Self {
            config,
            store,
            clock,
        }
    }

    /// Run the scheduler loop until the provided shutdown token fires.
    #[instrument(skip_all)]
    pub async fn run(self, shutdown: CancellationToken) {
        info!("Starting sync scheduler");
        let tick_interval =
            TokioDuration::from_secs(self.config.syncer.enqueue_interval_seconds);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Sync scheduler shutdown requested");
                    break;
                }
                _ = sleep(tick_interval) => {
                    let tick_started = Instant::now();
                    if let Err(err) = self.tick().await {
                        error!(error = ?err, "Scheduler tick failed");
                    }
                    let elapsed = tick_started.elapsed();
                    histogram!("repo_syncer_scheduler_tick_duration_ms")
                        .record(elapsed.as_secs_f64() * 1_000.0);
                }
            }
        }

        info!("Sync scheduler stopped");
    }

    async fn tick(&self) -> Result<(), sea_orm::DbErr> {
        if self.config.syncer.pause_auto_sync {
            return Ok(());
        }

        let enqueued = self.store.enqueue_sync_jobs(self.clock.now()).await?;
        if enqueued > 0 {
            info!(enqueued, "Enqueued sync jobs for due external services");
        }
        counter!("repo_syncer_jobs_enqueued_total").increment(enqueued);
        Ok(())
    }
}
