// SPDX-License-Identifier: GPL-3.0-or-later
//! Pipeline state-machine driver.
//!
//! A worker holds a release's lease while it drives the release forward one
//! stage at a time. Each stage boundary persists the record and checks for
//! cancellation, so a crash or an abandon request always finds the release
//! at its last confirmed state.

use chrono::Utc;
use reelwright_config::AppConfig;
use reelwright_domain::{
    AudioTarget, DecisionSource, DomainError, InterventionReason, Lease, PipelineState, Release,
    ReleaseDecision, ReleaseEvent, ReleaseMetadata, SourceRef,
};
use reelwright_infrastructure::{ReleaseRepository, StoreError};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::decision::{decide, DecisionOutcome};
use crate::download::{BackoffPolicy, DownloadError, DownloadManager, FetchError, RetryDecision};
use crate::events::EventPublisher;
use crate::inspect::{InspectError, MediaProbe};
use crate::placement::{PlacementEngine, PlacementError};
use crate::resolver::{ResolveError, SourceResolver};
use crate::transcode::{TranscodeError, Transcoder};
use crate::verify::Verification;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid release: {0}")]
    InvalidRelease(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Domain(#[from] DomainError),
}

/// A source reference handed to the pipeline by an external collaborator.
#[derive(Debug, Clone)]
pub struct NewRelease {
    pub source_ref: SourceRef,
    pub metadata: ReleaseMetadata,
    pub expected_size: Option<u64>,
    pub expected_checksum: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub holder: String,
    pub lease_ttl: Duration,
    pub download_retry: BackoffPolicy,
    pub transcode_retry: BackoffPolicy,
    pub audio_target: AudioTarget,
}

impl PipelineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            holder: config.pipeline.holder_id(),
            lease_ttl: Duration::from_secs(config.pipeline.lease_ttl_secs),
            download_retry: BackoffPolicy::from_config(&config.download.retry),
            transcode_retry: BackoffPolicy::from_config(&config.transcoder.retry),
            audio_target: AudioTarget {
                codec: "ac3".to_string(),
                channels: config.transcoder.ac3_channels,
                bitrate_kbps: config.transcoder.ac3_bitrate_kbps,
            },
        }
    }

    pub(crate) fn chrono_ttl(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.lease_ttl).unwrap_or_else(|_| chrono::Duration::minutes(5))
    }
}

/// Why a stage did not reach its successor.
#[derive(Debug)]
enum StageError {
    /// May clear up on its own; retried under the stage's backoff policy.
    Transient(String),
    /// Needs an operator.
    Structural(InterventionReason, String),
    /// Shutdown stopped the stage at a safe point; the attempt stays counted.
    Interrupted,
    Store(StoreError),
    Domain(DomainError),
}

impl From<StoreError> for StageError {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

impl From<DomainError> for StageError {
    fn from(err: DomainError) -> Self {
        Self::Domain(err)
    }
}

fn resolve_failure(err: &ResolveError) -> StageError {
    match err {
        ResolveError::Denied(_) => StageError::Structural(InterventionReason::ResolutionDenied, err.to_string()),
        ResolveError::Unavailable(_) => {
            StageError::Structural(InterventionReason::ResolutionUnavailable, err.to_string())
        }
        ResolveError::Expired(_) | ResolveError::Transient(_) => StageError::Transient(err.to_string()),
    }
}

fn download_failure(err: &DownloadError) -> StageError {
    match err {
        DownloadError::Resolve(inner) => resolve_failure(inner),
        DownloadError::Fetch(FetchError::Cancelled) => StageError::Interrupted,
        other => StageError::Transient(other.to_string()),
    }
}

fn placement_failure(err: PlacementError) -> StageError {
    match err {
        PlacementError::PlacementConflict(_) => {
            StageError::Structural(InterventionReason::PlacementConflict, err.to_string())
        }
        PlacementError::MissingResolution => {
            StageError::Structural(InterventionReason::PlacementFailed, err.to_string())
        }
        PlacementError::MissingSource => missing_artifact(&err.to_string()),
        PlacementError::Io(_) => StageError::Transient(err.to_string()),
    }
}

fn missing_artifact(message: &str) -> StageError {
    StageError::Structural(InterventionReason::MissingArtifact, message.to_string())
}

fn transcode_inputs(release: &Release) -> Result<(PathBuf, ReleaseDecision), StageError> {
    match (&release.local_path, &release.decision) {
        (Some(input), Some(decision)) => Ok((input.clone(), decision.clone())),
        (None, _) => Err(missing_artifact("no local file to transcode")),
        (_, None) => Err(missing_artifact("no transcode plan recorded")),
    }
}

/// Stages whose every run consumes one attempt from the retry budget.
fn counts_attempt(stage: PipelineState) -> bool {
    use PipelineState::*;
    matches!(
        stage,
        Resolving | Downloading | Inspecting | Transcoding | Renaming | Organizing
    )
}

pub struct Pipeline {
    store: Arc<dyn ReleaseRepository>,
    downloads: DownloadManager,
    probe: Arc<dyn MediaProbe>,
    transcoder: Arc<dyn Transcoder>,
    placement: PlacementEngine,
    events: Arc<dyn EventPublisher>,
    settings: PipelineSettings,
    shutdown: CancellationToken,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn ReleaseRepository>,
        downloads: DownloadManager,
        probe: Arc<dyn MediaProbe>,
        transcoder: Arc<dyn Transcoder>,
        placement: PlacementEngine,
        events: Arc<dyn EventPublisher>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            store,
            downloads,
            probe,
            transcoder,
            placement,
            events,
            settings,
            shutdown: CancellationToken::new(),
        }
    }

    /// Stop long stages at their next safe point when `token` fires.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn store(&self) -> &Arc<dyn ReleaseRepository> {
        &self.store
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub async fn submit(&self, new: NewRelease) -> Result<Release, PipelineError> {
        if new.source_ref.as_str().trim().is_empty() {
            return Err(PipelineError::InvalidRelease("empty source reference".to_string()));
        }
        if new.metadata.title.trim().is_empty() {
            return Err(PipelineError::InvalidRelease("empty title".to_string()));
        }
        if new.metadata.primary_language.trim().is_empty() {
            return Err(PipelineError::InvalidRelease("missing primary language".to_string()));
        }
        if let Some(checksum) = &new.expected_checksum {
            if checksum.len() != 64 || !checksum.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(PipelineError::InvalidRelease(
                    "expected checksum must be a hex SHA-256".to_string(),
                ));
            }
        }

        let mut release = Release::new(new.source_ref, new.metadata);
        release.expected_size = new.expected_size;
        release.expected_checksum = new.expected_checksum.map(|c| c.to_ascii_lowercase());
        self.store.insert(&release).await?;
        info!(target: "pipeline", release_id = %release.id, title = %release.metadata.title, "release queued");
        Ok(release)
    }

    /// Clear leases left behind by workers that died mid-stage so their
    /// releases are re-run from the last persisted state.
    pub async fn recover(&self) -> Result<u64, PipelineError> {
        let reclaimed = self.store.reclaim_expired_leases(Utc::now()).await?;
        if reclaimed > 0 {
            info!(target: "pipeline", reclaimed, "recovered in-flight releases");
        }
        Ok(reclaimed)
    }

    /// Claim the next eligible release and drive it as far as it will go.
    pub async fn process_next(&self) -> Result<Option<Release>, PipelineError> {
        let claimed = self
            .store
            .claim_next(&self.settings.holder, self.settings.chrono_ttl(), Utc::now())
            .await?;
        match claimed {
            Some((release, lease)) => {
                debug!(target: "pipeline", release_id = %release.id, state = %release.state, "claimed");
                self.advance(release, lease).await.map(Some)
            }
            None => Ok(None),
        }
    }

    /// Drive `release` through consecutive stages until it is terminal,
    /// waiting on a backoff timer, awaiting intervention or cancelled. The
    /// lease is handed back before returning.
    #[instrument(skip_all, fields(release_id = %release.id))]
    pub async fn advance(&self, mut release: Release, mut lease: Lease) -> Result<Release, PipelineError> {
        let outcome = self.drive(&mut release, &mut lease).await;
        if let Err(err) = self.store.release_lease(&lease).await {
            warn!(target: "pipeline", error = %err, "could not release lease");
        }
        outcome.map(|()| release)
    }

    async fn drive(&self, release: &mut Release, lease: &mut Lease) -> Result<(), PipelineError> {
        loop {
            if release.cancel_requested || self.store.cancel_requested(release.id).await? {
                release.cancel_requested = true;
                if !release.state.is_terminal() {
                    self.abandon(release, lease).await?;
                }
                return Ok(());
            }
            if !release.state.is_workable() {
                return Ok(());
            }
            if let Some(at) = release.next_attempt_at.filter(|at| *at > Utc::now()) {
                debug!(target: "pipeline", next_attempt_at = %at, "backing off");
                return Ok(());
            }
            if self.shutdown.is_cancelled() {
                return Ok(());
            }

            let stage = release.state;
            if counts_attempt(stage) {
                let attempt = release.record_attempt(stage);
                self.store.save(lease, release).await?;
                debug!(target: "pipeline", state = %stage, attempt, "stage started");
            }

            match self.run_stage(release, lease).await {
                Ok(()) => {
                    self.store.save(lease, release).await?;
                    debug!(target: "pipeline", from = %stage, to = %release.state, "checkpoint");
                    if release.state == PipelineState::Placed {
                        self.publish(release).await;
                        return Ok(());
                    }
                }
                Err(StageError::Transient(message)) => {
                    return self.retry_or_exhaust(release, lease, stage, message).await;
                }
                Err(StageError::Structural(reason, message)) => {
                    warn!(target: "pipeline", state = %stage, %reason, %message, "stage needs intervention");
                    release.fail(stage, reason, message)?;
                    self.store.save(lease, release).await?;
                    self.publish(release).await;
                    return Ok(());
                }
                Err(StageError::Interrupted) => {
                    info!(target: "pipeline", state = %stage, "interrupted by shutdown");
                    return Ok(());
                }
                Err(StageError::Store(err)) => return Err(err.into()),
                Err(StageError::Domain(err)) => return Err(err.into()),
            }
        }
    }

    fn policy_for(&self, stage: PipelineState) -> &BackoffPolicy {
        match stage {
            PipelineState::Inspecting | PipelineState::Transcoding => &self.settings.transcode_retry,
            _ => &self.settings.download_retry,
        }
    }

    async fn retry_or_exhaust(
        &self,
        release: &mut Release,
        lease: &Lease,
        stage: PipelineState,
        message: String,
    ) -> Result<(), PipelineError> {
        let retry_stage = stage.retry_stage();
        if release.state != retry_stage {
            release.transition(retry_stage, format!("{stage} failed, returning to {retry_stage}"))?;
        }
        let attempts = release.attempts_at(retry_stage);

        match self
            .policy_for(retry_stage)
            .next_retry(attempts, release.retry_window_started_at, Utc::now())
        {
            RetryDecision::RetryAt(at) => {
                warn!(
                    target: "pipeline",
                    state = %retry_stage,
                    attempt = attempts,
                    %message,
                    next_attempt_at = %at,
                    "stage failed, will retry"
                );
                release.schedule_retry(
                    at,
                    format!(
                        "{stage} attempt {attempts} failed: {message}; next attempt at {}",
                        at.to_rfc3339()
                    ),
                );
                self.store.save(lease, release).await?;
            }
            RetryDecision::Exhausted => {
                let reason = InterventionReason::exhausted(retry_stage);
                warn!(target: "pipeline", state = %retry_stage, attempt = attempts, %reason, "retries exhausted");
                release.fail(retry_stage, reason, message)?;
                self.store.save(lease, release).await?;
                self.publish(release).await;
            }
        }
        Ok(())
    }

    async fn abandon(&self, release: &mut Release, lease: &Lease) -> Result<(), PipelineError> {
        release.abandon(format!("abandoned at operator request during {}", release.state))?;
        self.store.save(lease, release).await?;
        self.downloads.clear_staging(release.id).await;
        info!(target: "pipeline", "release abandoned");
        self.publish(release).await;
        Ok(())
    }

    async fn publish(&self, release: &Release) {
        if let Some(event) = ReleaseEvent::for_release(release) {
            self.events.publish(&event).await;
        }
    }

    /// Run `work` while renewing the lease every third of its TTL. Losing the
    /// lease abandons the work since another holder now owns the release.
    /// Shutdown is left to `work`, which watches the token itself.
    async fn with_heartbeat<F: Future>(
        &self,
        lease: &mut Lease,
        work: F,
    ) -> Result<F::Output, StageError> {
        let period = (self.settings.lease_ttl / 3).max(Duration::from_millis(10));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        tokio::pin!(work);
        loop {
            tokio::select! {
                output = &mut work => return Ok(output),
                _ = ticker.tick() => {
                    *lease = self
                        .store
                        .renew_lease(lease, self.settings.chrono_ttl(), Utc::now())
                        .await?;
                    debug!(target: "pipeline", expires_at = %lease.expires_at, "lease renewed");
                }
            }
        }
    }

    async fn run_stage(&self, release: &mut Release, lease: &mut Lease) -> Result<(), StageError> {
        use PipelineState::*;
        match release.state {
            Queued => {
                release.transition(Resolving, format!("picked up by {}", self.settings.holder))?;
                Ok(())
            }
            Resolving => self.resolve_stage(release).await,
            Downloading => self.download_stage(release, lease).await,
            Verifying => self.verify_stage(release).await,
            Downloaded => {
                release.transition(Inspecting, "inspecting tracks")?;
                Ok(())
            }
            Inspecting => self.inspect_stage(release).await,
            Deciding => self.decide_stage(release),
            Decided => {
                let pass_through = release.decision.as_ref().is_some_and(|d| d.pass_through);
                if pass_through {
                    release.transition(Renaming, "pass-through, transcoding skipped")?;
                } else {
                    release.transition(Transcoding, "transcoding")?;
                }
                Ok(())
            }
            Transcoding => self.transcode_stage(release, lease).await,
            Renaming => self.rename_stage(release).await,
            Organizing => self.organize_stage(release).await,
            Placed | NeedsIntervention | Abandoned => Ok(()),
        }
    }

    async fn resolve_stage(&self, release: &mut Release) -> Result<(), StageError> {
        let resolved = self
            .downloads
            .resolver()
            .resolve(&release.source_ref)
            .await
            .map_err(|err| resolve_failure(&err))?;
        if release.expected_size.is_none() {
            release.expected_size = resolved.size;
        }
        release.transition(
            PipelineState::Downloading,
            format!("resolved {}", resolved.filename.as_deref().unwrap_or("source")),
        )?;
        Ok(())
    }

    async fn download_stage(&self, release: &mut Release, lease: &mut Lease) -> Result<(), StageError> {
        // The transfer watches the shutdown token itself and stops between chunks.
        let report = self
            .with_heartbeat(lease, self.downloads.fetch(release, &self.shutdown))
            .await?
            .map_err(|err| download_failure(&err))?;

        if release.expected_size.is_none() {
            release.expected_size = report.reported_size;
        }
        release.staging_path = Some(report.path);
        let mut note = format!("fetched {} bytes", report.total_bytes);
        if report.resumed {
            note.push_str(" (resumed)");
        }
        if report.re_resolved {
            note.push_str(" after re-resolving an expired link");
        }
        release.transition(PipelineState::Verifying, note)?;
        Ok(())
    }

    async fn verify_stage(&self, release: &mut Release) -> Result<(), StageError> {
        let Some(path) = release.staging_path.clone() else {
            return Err(StageError::Transient("no staged artifact to verify".to_string()));
        };
        let verdict = self
            .downloads
            .verify(&path, release)
            .await
            .map_err(|err| StageError::Transient(err.to_string()))?;
        match verdict {
            Verification::Verified { size } => {
                release.local_path = Some(path);
                release.transition(PipelineState::Downloaded, format!("verified {size} bytes"))?;
                Ok(())
            }
            Verification::Incomplete { expected, actual } => Err(StageError::Transient(match expected {
                Some(expected) => format!("incomplete download: {actual} of {expected} bytes"),
                None => format!("incomplete download: {actual} bytes"),
            })),
            Verification::Corrupt { detail } => Err(StageError::Transient(format!(
                "corrupt download discarded: {detail}"
            ))),
        }
    }

    async fn inspect_stage(&self, release: &mut Release) -> Result<(), StageError> {
        let Some(path) = release.local_path.clone() else {
            return Err(missing_artifact("no local file to inspect"));
        };
        let info = match self.probe.inspect(&path).await {
            Ok(info) => info,
            Err(InspectError::UnreadableContainer(message)) => {
                return Err(StageError::Structural(InterventionReason::UnreadableMedia, message))
            }
            Err(InspectError::ProbeUnavailable(message)) => return Err(StageError::Transient(message)),
        };
        let Some(tier) = info.resolution else {
            return Err(StageError::Structural(
                InterventionReason::UnreadableMedia,
                "no video stream".to_string(),
            ));
        };

        let summary = info.summary();
        release.tracks = info.tracks;
        release.resolution = Some(tier);
        release.transition(PipelineState::Deciding, format!("inspected: {summary}"))?;
        Ok(())
    }

    fn decide_stage(&self, release: &mut Release) -> Result<(), StageError> {
        let policy = release.metadata.language_policy();
        match decide(&release.tracks, &policy, &self.settings.audio_target) {
            DecisionOutcome::Decided(spec) => {
                let summary = spec.summary(&release.tracks);
                let decision = ReleaseDecision::new(spec, DecisionSource::Engine);
                let label = if decision.pass_through { "pass-through" } else { "transcode" };
                release.decision = Some(decision);
                release.transition(PipelineState::Decided, format!("{label}: {summary}"))?;
                Ok(())
            }
            DecisionOutcome::NoAudioOutput(message) => {
                Err(StageError::Structural(InterventionReason::NoAudioOutput, message))
            }
        }
    }

    async fn transcode_stage(&self, release: &mut Release, lease: &mut Lease) -> Result<(), StageError> {
        let (input, decision) = transcode_inputs(release)?;
        let work = self
            .transcoder
            .transcode(&input, &decision.spec, &release.tracks, &self.shutdown);
        match self.with_heartbeat(lease, work).await? {
            Ok(output) => {
                release.local_path = Some(output);
                release.transcode_complete = true;
                release.transition(PipelineState::Renaming, "transcode validated")?;
                Ok(())
            }
            Err(TranscodeError::Cancelled) => Err(StageError::Interrupted),
            Err(err) => Err(StageError::Transient(err.to_string())),
        }
    }

    async fn rename_stage(&self, release: &mut Release) -> Result<(), StageError> {
        let renamed = self.placement.rename(release).await.map_err(placement_failure)?;
        let note = format!("renamed to {}", renamed.display());
        release.local_path = Some(renamed);
        release.transition(PipelineState::Organizing, note)?;
        Ok(())
    }

    async fn organize_stage(&self, release: &mut Release) -> Result<(), StageError> {
        let placed = self.placement.place(release).await.map_err(placement_failure)?;
        let note = format!("placed at {}", placed.display());
        release.local_path = Some(placed.clone());
        release.final_path = Some(placed);
        release.transition(PipelineState::Placed, note)?;
        self.downloads.clear_staging(release.id).await;
        Ok(())
    }
}
