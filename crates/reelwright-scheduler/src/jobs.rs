// SPDX-License-Identifier: GPL-3.0-or-later
use crate::job::{Job, JobContext, JobOutcome};
use anyhow::Result;
use reelwright_application::{Pipeline, ResolutionCoordinator};
use std::sync::Arc;
use tracing::{debug, info};

/// Returns releases whose worker stopped renewing its lease to the pool.
pub struct ReclaimLeasesJob {
    pipeline: Arc<Pipeline>,
}

impl ReclaimLeasesJob {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }
}

#[async_trait::async_trait]
impl Job for ReclaimLeasesJob {
    fn job_type(&self) -> &'static str {
        "reclaim_leases"
    }

    async fn run(&self, ctx: &JobContext) -> Result<JobOutcome> {
        // Workers winding down still hold their leases; leave them be.
        if ctx.shutdown.is_cancelled() {
            return Ok(JobOutcome::Swept { releases: 0 });
        }
        match self.pipeline.recover().await {
            Ok(reclaimed) => {
                debug!(target: "scheduler", job_id = %ctx.job_id, reclaimed, "lease sweep finished");
                Ok(JobOutcome::Swept { releases: reclaimed as usize })
            }
            Err(err) => Ok(JobOutcome::Failed {
                error: err.to_string(),
                retry: true,
            }),
        }
    }
}

/// Logs how many releases are waiting on an operator and for how long.
pub struct InterventionReportJob {
    coordinator: Arc<ResolutionCoordinator>,
}

impl InterventionReportJob {
    pub fn new(coordinator: Arc<ResolutionCoordinator>) -> Self {
        Self { coordinator }
    }
}

#[async_trait::async_trait]
impl Job for InterventionReportJob {
    fn job_type(&self) -> &'static str {
        "intervention_report"
    }

    async fn run(&self, ctx: &JobContext) -> Result<JobOutcome> {
        let pending = self.coordinator.list_pending().await?;
        if let Some(oldest) = pending.first() {
            let waiting_hours = (ctx.started_at - oldest.updated_at).num_hours();
            info!(
                target: "scheduler",
                pending = pending.len(),
                oldest = %oldest.id,
                waiting_hours,
                "releases awaiting intervention"
            );
        }
        Ok(JobOutcome::Swept {
            releases: pending.len(),
        })
    }

    fn max_retries(&self) -> u32 {
        0
    }
}
