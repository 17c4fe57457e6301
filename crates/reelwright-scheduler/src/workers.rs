// SPDX-License-Identifier: GPL-3.0-or-later
//! Bounded pool of workers pulling eligible releases from the store.

use reelwright_application::Pipeline;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub struct WorkerPool {
    pipeline: Arc<Pipeline>,
    workers: usize,
    poll_interval: Duration,
}

impl WorkerPool {
    pub fn new(pipeline: Arc<Pipeline>, workers: usize, poll_interval: Duration) -> Self {
        Self {
            pipeline,
            workers: workers.max(1),
            poll_interval,
        }
    }

    /// Spawn the workers. Each keeps claiming releases while any are
    /// eligible and sleeps for the poll interval when none are.
    pub fn start(&self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        info!(target: "scheduler", workers = self.workers, "starting worker pool");
        (0..self.workers)
            .map(|worker| {
                let pipeline = self.pipeline.clone();
                let shutdown = shutdown.clone();
                let poll_interval = self.poll_interval;
                tokio::spawn(async move {
                    run_worker(worker, pipeline, poll_interval, shutdown).await;
                })
            })
            .collect()
    }
}

async fn run_worker(
    worker: usize,
    pipeline: Arc<Pipeline>,
    poll_interval: Duration,
    shutdown: CancellationToken,
) {
    while !shutdown.is_cancelled() {
        let idle = match pipeline.process_next().await {
            Ok(Some(release)) => {
                debug!(target: "scheduler", worker, release_id = %release.id, state = %release.state, "worker pass finished");
                false
            }
            Ok(None) => true,
            Err(err) => {
                error!(target: "scheduler", worker, error = %err, "worker pass failed");
                true
            }
        };
        if idle {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }
    debug!(target: "scheduler", worker, "worker stopped");
}
