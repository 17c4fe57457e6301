// SPDX-License-Identifier: GPL-3.0-or-later
pub mod job;
pub mod jobs;
pub mod registry;
pub mod workers;

use anyhow::Result;
use reelwright_application::Services;
use reelwright_config::AppConfig;
use registry::JobRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use jobs::{InterventionReportJob, ReclaimLeasesJob};
use workers::WorkerPool;

pub struct Scheduler {
    registry: Arc<JobRegistry>,
    pool: WorkerPool,
    services: Services,
    lease_sweep: Duration,
}

impl Scheduler {
    pub fn new(config: &AppConfig, services: Services) -> Self {
        Self {
            registry: Arc::new(JobRegistry::new(2)),
            pool: WorkerPool::new(
                services.pipeline.clone(),
                config.pipeline.workers,
                Duration::from_millis(config.pipeline.poll_interval_ms),
            ),
            services,
            // Stale leases are swept a few times per TTL.
            lease_sweep: Duration::from_secs((config.pipeline.lease_ttl_secs / 2).max(1)),
        }
    }

    pub async fn register_jobs(&self) {
        info!(target: "scheduler", "registering background jobs");

        self.registry
            .register(
                "reclaim-leases",
                ReclaimLeasesJob::new(self.services.pipeline.clone()),
                Schedule::Interval(self.lease_sweep),
            )
            .await;

        self.registry
            .register(
                "intervention-report",
                InterventionReportJob::new(self.services.coordinator.clone()),
                Schedule::Interval(Duration::from_secs(60 * 60)),
            )
            .await;
    }

    /// Recover in-flight releases, then run the jobs and the worker pool
    /// until `shutdown` fires.
    pub fn start(self, shutdown: CancellationToken) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            let reclaimed = self.services.pipeline.recover().await?;
            info!(target: "scheduler", reclaimed, "start-up recovery finished");

            let mut handles = self.registry.clone().start(shutdown.clone()).await;
            handles.extend(self.pool.start(shutdown.clone()));
            for handle in handles {
                handle.await?;
            }
            info!(target: "scheduler", "scheduler stopped");
            Ok(())
        })
    }
}

pub use job::{Job, JobContext, JobOutcome};
pub use registry::Schedule;

#[cfg(test)]
mod tests {
    use super::*;
    use reelwright_infrastructure::{init_memory_database, ReleaseRepository, SqliteReleaseRepository};

    async fn services(config: &AppConfig, shutdown: CancellationToken) -> Services {
        let pool = init_memory_database().await.unwrap();
        let store: Arc<dyn ReleaseRepository> = Arc::new(SqliteReleaseRepository::new(pool));
        Services::from_config(config, store, shutdown).unwrap()
    }

    #[tokio::test]
    async fn scheduler_runs_until_shutdown() {
        let mut config = AppConfig::default();
        config.pipeline.workers = 2;
        config.pipeline.poll_interval_ms = 10;
        let shutdown = CancellationToken::new();

        let scheduler = Scheduler::new(&config, services(&config, shutdown.clone()).await);
        scheduler.register_jobs().await;
        assert_eq!(scheduler.registry.len().await, 2);

        let handle = scheduler.start(shutdown.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn maintenance_jobs_succeed_on_an_empty_store() {
        let config = AppConfig::default();
        let services = services(&config, CancellationToken::new()).await;

        let ctx = JobContext::new("sweep", 1, CancellationToken::new());

        let reclaim = ReclaimLeasesJob::new(services.pipeline.clone());
        assert_eq!(reclaim.run(&ctx).await.unwrap(), JobOutcome::Swept { releases: 0 });
        let report = InterventionReportJob::new(services.coordinator.clone());
        assert_eq!(report.run(&ctx).await.unwrap(), JobOutcome::Swept { releases: 0 });
    }
}
