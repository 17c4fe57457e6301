// SPDX-License-Identifier: GPL-3.0-or-later
//! Operator resolution of releases awaiting intervention.

use chrono::Utc;
use reelwright_domain::{
    DecisionSource, Lease, PipelineState, Release, ReleaseDecision, ReleaseEvent, ReleaseId,
    SourceRef, TranscodeSpec,
};
use reelwright_infrastructure::{ReleaseRepository, StoreError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::decision::validate_override;
use crate::events::EventPublisher;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("invalid resolution: {0}")]
    InvalidResolution(String),
    #[error("release {0} not found")]
    NotFound(ReleaseId),
    #[error("release {0} is being worked on")]
    Busy(ReleaseId),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ResolutionAction {
    Resume { target: PipelineState },
    Abandon,
}

/// Replacements applied before the release resumes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionOverrides {
    /// A corrected source reference; the download starts over.
    #[serde(default)]
    pub source_ref: Option<SourceRef>,
    /// A manual track selection replacing the engine's decision.
    #[serde(default)]
    pub spec: Option<TranscodeSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionDecision {
    #[serde(flatten)]
    pub action: ResolutionAction,
    #[serde(default)]
    pub overrides: ResolutionOverrides,
}

impl ResolutionDecision {
    pub fn resume(target: PipelineState) -> Self {
        Self {
            action: ResolutionAction::Resume { target },
            overrides: ResolutionOverrides::default(),
        }
    }

    pub fn abandon() -> Self {
        Self {
            action: ResolutionAction::Abandon,
            overrides: ResolutionOverrides::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The release was idle and is now abandoned.
    Abandoned,
    /// A worker will abandon it at its next checkpoint.
    Requested,
}

pub struct ResolutionCoordinator {
    store: Arc<dyn ReleaseRepository>,
    events: Arc<dyn EventPublisher>,
    holder: String,
    lease_ttl: chrono::Duration,
}

impl ResolutionCoordinator {
    pub fn new(
        store: Arc<dyn ReleaseRepository>,
        events: Arc<dyn EventPublisher>,
        holder: impl Into<String>,
        lease_ttl: chrono::Duration,
    ) -> Self {
        Self {
            store,
            events,
            holder: format!("{}/coordinator", holder.into()),
            lease_ttl,
        }
    }

    pub async fn list_pending(&self) -> Result<Vec<Release>, CoordinatorError> {
        Ok(self.store.list_pending().await?)
    }

    async fn acquire(&self, id: ReleaseId) -> Result<(Release, Lease), CoordinatorError> {
        match self.store.try_acquire(id, &self.holder, self.lease_ttl, Utc::now()).await {
            Ok(Some(claimed)) => Ok(claimed),
            Ok(None) => Err(CoordinatorError::Busy(id)),
            Err(StoreError::NotFound(id)) => Err(CoordinatorError::NotFound(id)),
            Err(err) => Err(err.into()),
        }
    }

    async fn finish(&self, release: &Release, lease: &Lease) -> Result<(), CoordinatorError> {
        let saved = self.store.save(lease, release).await;
        if let Err(err) = self.store.release_lease(lease).await {
            warn!(target: "coordinator", release_id = %release.id, error = %err, "could not release lease");
        }
        saved?;
        if let Some(event) = ReleaseEvent::for_release(release) {
            self.events.publish(&event).await;
        }
        Ok(())
    }

    /// Apply an operator's decision to a release in `needs-intervention`.
    #[instrument(skip(self, decision), fields(release_id = %id))]
    pub async fn resolve(
        &self,
        id: ReleaseId,
        decision: ResolutionDecision,
    ) -> Result<Release, CoordinatorError> {
        let (mut release, lease) = self.acquire(id).await?;
        match apply(&mut release, decision) {
            Ok(()) => {
                self.finish(&release, &lease).await?;
                info!(target: "coordinator", state = %release.state, "intervention resolved");
                Ok(release)
            }
            Err(err) => {
                if let Err(release_err) = self.store.release_lease(&lease).await {
                    warn!(target: "coordinator", error = %release_err, "could not release lease");
                }
                Err(err)
            }
        }
    }

    /// Ask for a release to be abandoned. Idle releases awaiting
    /// intervention are abandoned on the spot; anything else is flagged and
    /// abandoned by its worker at the next checkpoint.
    pub async fn request_cancel(&self, id: ReleaseId) -> Result<CancelOutcome, CoordinatorError> {
        let release = self.store.get(id).await?.ok_or(CoordinatorError::NotFound(id))?;
        if release.state.is_terminal() {
            return Err(CoordinatorError::InvalidResolution(format!(
                "release is already {}",
                release.state
            )));
        }
        self.store.request_cancel(id).await?;

        if release.state == PipelineState::NeedsIntervention {
            if let Ok((mut release, lease)) = self.acquire(id).await {
                release.cancel_requested = true;
                if release
                    .abandon("abandoned at operator request while awaiting intervention")
                    .is_ok()
                {
                    self.finish(&release, &lease).await?;
                    info!(target: "coordinator", release_id = %id, "release abandoned");
                    return Ok(CancelOutcome::Abandoned);
                }
                if let Err(err) = self.store.release_lease(&lease).await {
                    warn!(target: "coordinator", error = %err, "could not release lease");
                }
            }
        }
        info!(target: "coordinator", release_id = %id, "cancellation requested");
        Ok(CancelOutcome::Requested)
    }
}

/// Check the decision against the recorded failure point and apply it.
fn apply(release: &mut Release, decision: ResolutionDecision) -> Result<(), CoordinatorError> {
    let invalid = |msg: String| CoordinatorError::InvalidResolution(msg);
    if release.state != PipelineState::NeedsIntervention {
        return Err(invalid(format!(
            "release is {}, not awaiting intervention",
            release.state
        )));
    }
    let failed_at = release
        .failure
        .as_ref()
        .map(|failure| failure.stage)
        .ok_or_else(|| invalid("no failure recorded".to_string()))?;

    let mut target = match decision.action {
        ResolutionAction::Abandon => {
            return release
                .abandon("abandoned by operator")
                .map_err(|err| invalid(err.to_string()));
        }
        ResolutionAction::Resume { target } => target,
    };

    if !target.is_resume_target() {
        return Err(invalid(format!("{target} is not a stage a release can resume at")));
    }
    if target.ordinal() > failed_at.ordinal() {
        return Err(invalid(format!(
            "{target} is not reachable from the failure at {failed_at}"
        )));
    }
    if target == PipelineState::Verifying && release.staging_path.is_none() {
        return Err(invalid("no staged artifact to verify".to_string()));
    }

    let ResolutionOverrides { source_ref, spec } = decision.overrides;
    let mut notes = Vec::new();

    if let Some(source_ref) = source_ref {
        if target.is_at_or_past(PipelineState::Verifying) {
            return Err(invalid(format!(
                "a new source reference restarts the download; cannot resume at {target}"
            )));
        }
        if source_ref.as_str().trim().is_empty() {
            return Err(invalid("empty source reference".to_string()));
        }
        release.source_ref = source_ref;
        release.staging_path = None;
        release.expected_size = None;
        release.expected_checksum = None;
        notes.push("source reference replaced".to_string());
    }

    if let Some(spec) = spec {
        if !matches!(target, PipelineState::Deciding | PipelineState::Decided) {
            return Err(invalid(format!(
                "a track selection resumes at decided, not {target}"
            )));
        }
        validate_override(&spec, &release.tracks).map_err(|err| invalid(err.to_string()))?;
        release.decision = Some(ReleaseDecision::new(spec, DecisionSource::Operator));
        target = PipelineState::Decided;
        notes.push("track selection overridden".to_string());
    }

    let mut note = format!("resumed at {target} by operator");
    if !notes.is_empty() {
        note.push_str(&format!(" ({})", notes.join(", ")));
    }
    release
        .resume(target, note)
        .map_err(|err| invalid(err.to_string()))
}
