// SPDX-License-Identifier: GPL-3.0-or-later
use crate::job::{Job, JobContext, JobOutcome};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub enum Schedule {
    /// Run at fixed intervals, the first run immediately
    Interval(Duration),
    /// Run once immediately, then never again
    Once,
}

struct RegisteredJob {
    job: Arc<dyn Job>,
    schedule: Schedule,
}

/// Job registry that manages and executes scheduled jobs
pub struct JobRegistry {
    jobs: RwLock<HashMap<String, RegisteredJob>>,
    max_concurrent: usize,
}

impl JobRegistry {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            max_concurrent: max_concurrent.max(1),
        }
    }

    pub async fn register(&self, job_id: impl Into<String>, job: impl Job + 'static, schedule: Schedule) {
        let job_id = job_id.into();
        let registered = RegisteredJob {
            job: Arc::new(job) as Arc<dyn Job>,
            schedule,
        };

        let mut jobs = self.jobs.write().await;
        info!(target: "scheduler", %job_id, job_type = registered.job.job_type(), "registering job");
        jobs.insert(job_id, registered);
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    /// Spawn one driver task per job; all of them stop when `shutdown` fires.
    pub async fn start(self: Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        info!(target: "scheduler", max_concurrent = self.max_concurrent, "starting job registry");

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let jobs = self.jobs.read().await;
        let mut handles = Vec::with_capacity(jobs.len());

        for (job_id, registered) in jobs.iter() {
            let job_id = job_id.clone();
            let job = registered.job.clone();
            let semaphore = semaphore.clone();
            let shutdown = shutdown.clone();

            let handle = match registered.schedule.clone() {
                Schedule::Interval(period) => tokio::spawn(async move {
                    let mut ticker = interval(period);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    loop {
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = ticker.tick() => {}
                        }
                        let Ok(_permit) = semaphore.acquire().await else {
                            break;
                        };
                        Self::execute_job(&job_id, job.as_ref(), &shutdown).await;
                    }
                }),
                Schedule::Once => tokio::spawn(async move {
                    if let Ok(_permit) = semaphore.acquire().await {
                        Self::execute_job(&job_id, job.as_ref(), &shutdown).await;
                    }
                }),
            };
            handles.push(handle);
        }

        info!(target: "scheduler", "job registry started with {} jobs", jobs.len());
        handles
    }

    /// One tick of a job: the first try plus its bounded retries.
    async fn execute_job(job_id: &str, job: &dyn Job, shutdown: &CancellationToken) {
        let max_attempts = job.max_retries() + 1;

        for attempt in 1..=max_attempts {
            let ctx = JobContext::new(job_id, attempt, shutdown.clone());
            let retry = match job.run(&ctx).await {
                Ok(JobOutcome::Swept { releases }) => {
                    info!(target: "scheduler", job_id, job_type = job.job_type(), attempt, releases, "job completed");
                    return;
                }
                Ok(JobOutcome::Failed { error, retry }) => {
                    error!(target: "scheduler", job_id, attempt, %error, retry, "job failed");
                    retry
                }
                Err(err) => {
                    error!(target: "scheduler", job_id, attempt, error = %err, "job execution error");
                    true
                }
            };

            if !retry || attempt == max_attempts {
                break;
            }
            let delay = job.retry_delay();
            warn!(target: "scheduler", job_id, ?delay, "retrying job after delay");
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        error!(target: "scheduler", job_id, "job gave up until its next run");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyJob {
        runs: Arc<AtomicU32>,
        attempts: Arc<tokio::sync::Mutex<Vec<u32>>>,
        succeed_on: u32,
    }

    impl FlakyJob {
        fn new(runs: Arc<AtomicU32>, succeed_on: u32) -> Self {
            Self {
                runs,
                attempts: Arc::default(),
                succeed_on,
            }
        }
    }

    #[async_trait::async_trait]
    impl Job for FlakyJob {
        fn job_type(&self) -> &'static str {
            "flaky"
        }

        async fn run(&self, ctx: &JobContext) -> anyhow::Result<JobOutcome> {
            let run = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
            self.attempts.lock().await.push(ctx.attempt);
            if run >= self.succeed_on {
                Ok(JobOutcome::Swept { releases: 0 })
            } else {
                Ok(JobOutcome::Failed {
                    error: "not yet".to_string(),
                    retry: true,
                })
            }
        }

        fn retry_delay(&self) -> Duration {
            Duration::ZERO
        }
    }

    #[tokio::test]
    async fn once_job_retries_until_success() {
        let runs = Arc::new(AtomicU32::new(0));
        let job = FlakyJob::new(runs.clone(), 2);
        let attempts = job.attempts.clone();
        let registry = Arc::new(JobRegistry::new(1));
        registry.register("flaky", job, Schedule::Once).await;
        assert_eq!(registry.len().await, 1);

        for handle in registry.start(CancellationToken::new()).await {
            handle.await.unwrap();
        }
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(*attempts.lock().await, vec![1, 2]);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let runs = Arc::new(AtomicU32::new(0));
        let registry = Arc::new(JobRegistry::new(1));
        registry
            .register("never", FlakyJob::new(runs.clone(), u32::MAX), Schedule::Once)
            .await;

        for handle in registry.start(CancellationToken::new()).await {
            handle.await.unwrap();
        }
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn interval_jobs_stop_on_shutdown() {
        let runs = Arc::new(AtomicU32::new(0));
        let registry = Arc::new(JobRegistry::new(2));
        registry
            .register(
                "tick",
                FlakyJob::new(runs.clone(), 0),
                Schedule::Interval(Duration::from_millis(10)),
            )
            .await;

        let shutdown = CancellationToken::new();
        let handles = registry.start(shutdown.clone()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(runs.load(Ordering::SeqCst) >= 1);
    }
}
