// SPDX-License-Identifier: GPL-3.0-or-later
//! Maintenance sweeps that run beside the pipeline workers.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// One run of a sweep.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: String,
    /// Starts at 1 on every tick and counts retries within it.
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub shutdown: CancellationToken,
}

impl JobContext {
    pub fn new(job_id: impl Into<String>, attempt: u32, shutdown: CancellationToken) -> Self {
        Self {
            job_id: job_id.into(),
            attempt,
            started_at: Utc::now(),
            shutdown,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum JobOutcome {
    /// `releases` is how many releases the sweep acted on or reported.
    Swept { releases: usize },
    Failed { error: String, retry: bool },
}

#[async_trait::async_trait]
pub trait Job: Send + Sync {
    fn job_type(&self) -> &'static str;

    async fn run(&self, ctx: &JobContext) -> Result<JobOutcome>;

    /// Extra tries within one tick after a retriable failure.
    fn max_retries(&self) -> u32 {
        2
    }

    fn retry_delay(&self) -> Duration {
        Duration::from_secs(5)
    }
}
