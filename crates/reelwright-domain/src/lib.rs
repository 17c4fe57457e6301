// SPDX-License-Identifier: GPL-3.0-or-later
pub mod media;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

pub use media::{
    is_english_tag, normalize_language, AudioTarget, Container, ResolutionTier, Track, TrackAction,
    TrackKind, TranscodeSpec,
};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition {
        from: PipelineState,
        to: PipelineState,
    },
    #[error("invariant violated: {0}")]
    InvariantViolated(String),
    #[error("release is not awaiting intervention (state {0})")]
    NotPending(PipelineState),
    #[error("invalid release record: {0}")]
    SchemaInvalid(String),
    #[error("unknown pipeline state: {0}")]
    UnknownState(String),
}

// ============================================================================
// Value Objects & IDs
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReleaseId(pub Uuid);

impl ReleaseId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn parse(value: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(value)?))
    }
}

impl Default for ReleaseId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ReleaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque reference understood by the resolution service. Never a direct URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceRef(pub String);

impl SourceRef {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Pipeline state machine
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PipelineState {
    Queued,
    Resolving,
    Downloading,
    Verifying,
    Downloaded,
    Inspecting,
    Deciding,
    Decided,
    Transcoding,
    Renaming,
    Organizing,
    Placed,
    NeedsIntervention,
    Abandoned,
}

const WORKING_ORDER: [PipelineState; 12] = [
    PipelineState::Queued,
    PipelineState::Resolving,
    PipelineState::Downloading,
    PipelineState::Verifying,
    PipelineState::Downloaded,
    PipelineState::Inspecting,
    PipelineState::Deciding,
    PipelineState::Decided,
    PipelineState::Transcoding,
    PipelineState::Renaming,
    PipelineState::Organizing,
    PipelineState::Placed,
];

impl PipelineState {
    pub fn all() -> [PipelineState; 14] {
        [
            Self::Queued,
            Self::Resolving,
            Self::Downloading,
            Self::Verifying,
            Self::Downloaded,
            Self::Inspecting,
            Self::Deciding,
            Self::Decided,
            Self::Transcoding,
            Self::Renaming,
            Self::Organizing,
            Self::Placed,
            Self::NeedsIntervention,
            Self::Abandoned,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Resolving => "resolving",
            Self::Downloading => "downloading",
            Self::Verifying => "verifying",
            Self::Downloaded => "downloaded",
            Self::Inspecting => "inspecting",
            Self::Deciding => "deciding",
            Self::Decided => "decided",
            Self::Transcoding => "transcoding",
            Self::Renaming => "renaming",
            Self::Organizing => "organizing",
            Self::Placed => "placed",
            Self::NeedsIntervention => "needs-intervention",
            Self::Abandoned => "abandoned",
        }
    }

    /// Position along the linear pipeline; `None` for the off-path states.
    pub fn ordinal(&self) -> Option<usize> {
        WORKING_ORDER.iter().position(|state| state == self)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Placed | Self::Abandoned)
    }

    pub fn is_at_or_past(&self, other: PipelineState) -> bool {
        match (self.ordinal(), other.ordinal()) {
            (Some(own), Some(other)) => own >= other,
            _ => false,
        }
    }

    /// States a worker may pick up and advance.
    pub fn is_workable(&self) -> bool {
        self.ordinal().is_some() && !self.is_terminal()
    }

    fn forward_successors(&self) -> &'static [PipelineState] {
        use PipelineState::*;
        match self {
            Queued => &[Resolving],
            Resolving => &[Downloading],
            Downloading => &[Verifying],
            Verifying => &[Downloaded, Downloading],
            Downloaded => &[Inspecting],
            Inspecting => &[Deciding],
            Deciding => &[Decided],
            Decided => &[Transcoding, Renaming],
            Transcoding => &[Renaming],
            Renaming => &[Organizing],
            Organizing => &[Placed],
            Placed | NeedsIntervention | Abandoned => &[],
        }
    }

    /// Transitions a worker may take on its own. `Verifying -> Downloading`
    /// is the only step back: a failed verification re-enters the download
    /// stage. Resuming from `NeedsIntervention` is not covered here.
    pub fn can_advance_to(&self, to: PipelineState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match to {
            Self::NeedsIntervention => *self != Self::NeedsIntervention,
            Self::Abandoned => true,
            _ => self.forward_successors().contains(&to),
        }
    }

    /// Whether an operator may resume a release at this stage.
    pub fn is_resume_target(&self) -> bool {
        self.is_workable()
    }

    /// Stage whose attempt counter a failure in this state is charged to.
    pub fn retry_stage(&self) -> PipelineState {
        match self {
            Self::Verifying => Self::Downloading,
            other => *other,
        }
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PipelineState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::all()
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| DomainError::UnknownState(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InterventionReason {
    ResolutionDenied,
    ResolutionUnavailable,
    ResolveExhausted,
    DownloadExhausted,
    UnreadableMedia,
    InspectExhausted,
    NoAudioOutput,
    TranscodeExhausted,
    PlacementConflict,
    PlacementFailed,
    /// A stage found the file or plan it works on missing from the record.
    MissingArtifact,
}

impl InterventionReason {
    /// `<Stage>Exhausted` reason for a stage whose retry budget ran out.
    pub fn exhausted(stage: PipelineState) -> Self {
        match stage.retry_stage() {
            PipelineState::Queued | PipelineState::Resolving => Self::ResolveExhausted,
            PipelineState::Downloading => Self::DownloadExhausted,
            PipelineState::Transcoding => Self::TranscodeExhausted,
            PipelineState::Renaming | PipelineState::Organizing => Self::PlacementFailed,
            _ => Self::InspectExhausted,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ResolutionDenied => "ResolutionDenied",
            Self::ResolutionUnavailable => "ResolutionUnavailable",
            Self::ResolveExhausted => "ResolveExhausted",
            Self::DownloadExhausted => "DownloadExhausted",
            Self::UnreadableMedia => "UnreadableMedia",
            Self::InspectExhausted => "InspectExhausted",
            Self::NoAudioOutput => "NoAudioOutput",
            Self::TranscodeExhausted => "TranscodeExhausted",
            Self::PlacementConflict => "PlacementConflict",
            Self::PlacementFailed => "PlacementFailed",
            Self::MissingArtifact => "MissingArtifact",
        }
    }
}

impl std::fmt::Display for InterventionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where and why a release left the normal path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub stage: PipelineState,
    pub reason: InterventionReason,
    pub attempt: u32,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub at: DateTime<Utc>,
    pub state: PipelineState,
    pub note: String,
}

// ============================================================================
// Decisions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionSource {
    Engine,
    Operator,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseDecision {
    pub spec: TranscodeSpec,
    pub pass_through: bool,
    pub source: DecisionSource,
    pub decided_at: DateTime<Utc>,
}

impl ReleaseDecision {
    pub fn new(spec: TranscodeSpec, source: DecisionSource) -> Self {
        Self {
            pass_through: spec.is_pass_through(),
            spec,
            source,
            decided_at: Utc::now(),
        }
    }
}

/// Declared primary language of a release, consulted by the audio rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilmLanguagePolicy {
    pub primary_language: String,
}

impl FilmLanguagePolicy {
    pub fn new(primary_language: impl Into<String>) -> Self {
        Self {
            primary_language: primary_language.into(),
        }
    }

    pub fn primary_is_english(&self) -> bool {
        is_english_tag(&self.primary_language)
    }
}

// ============================================================================
// Release
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseMetadata {
    pub title: String,
    pub year: Option<u16>,
    pub edition: Option<String>,
    pub primary_language: String,
}

impl ReleaseMetadata {
    pub fn language_policy(&self) -> FilmLanguagePolicy {
        FilmLanguagePolicy::new(self.primary_language.clone())
    }
}

/// Time-bounded exclusive right to mutate one release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub release_id: ReleaseId,
    pub holder: String,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    pub id: ReleaseId,
    pub source_ref: SourceRef,
    pub metadata: ReleaseMetadata,
    pub state: PipelineState,
    pub attempts: BTreeMap<PipelineState, u32>,
    pub expected_size: Option<u64>,
    /// Lowercase hex SHA-256 of the complete artifact.
    pub expected_checksum: Option<String>,
    /// Partial or complete download that has not passed verification yet.
    pub staging_path: Option<PathBuf>,
    pub local_path: Option<PathBuf>,
    pub final_path: Option<PathBuf>,
    pub tracks: Vec<Track>,
    pub decision: Option<ReleaseDecision>,
    pub resolution: Option<ResolutionTier>,
    pub failure: Option<Failure>,
    pub history: Vec<HistoryEntry>,
    pub cancel_requested: bool,
    pub transcode_complete: bool,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub retry_window_started_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Release {
    pub fn new(source_ref: SourceRef, metadata: ReleaseMetadata) -> Self {
        let now = Utc::now();
        Self {
            id: ReleaseId::new(),
            source_ref,
            metadata,
            state: PipelineState::Queued,
            attempts: BTreeMap::new(),
            expected_size: None,
            expected_checksum: None,
            staging_path: None,
            local_path: None,
            final_path: None,
            tracks: Vec::new(),
            decision: None,
            resolution: None,
            failure: None,
            history: vec![HistoryEntry {
                at: now,
                state: PipelineState::Queued,
                note: "release submitted".to_string(),
            }],
            cancel_requested: false,
            transcode_complete: false,
            next_attempt_at: None,
            retry_window_started_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// State the invariants are judged against: the failure point while
    /// waiting for intervention, otherwise the current state.
    pub fn effective_state(&self) -> PipelineState {
        match (&self.state, &self.failure) {
            (PipelineState::NeedsIntervention, Some(failure)) => failure.stage,
            (state, _) => *state,
        }
    }

    pub fn attempts_at(&self, stage: PipelineState) -> u32 {
        self.attempts
            .get(&stage.retry_stage())
            .copied()
            .unwrap_or_default()
    }

    /// Count a new attempt at `stage` and return the attempt number.
    pub fn record_attempt(&mut self, stage: PipelineState) -> u32 {
        let counter = self.attempts.entry(stage.retry_stage()).or_insert(0);
        *counter += 1;
        *counter
    }

    pub fn note(&mut self, note: impl Into<String>) {
        let now = Utc::now();
        self.history.push(HistoryEntry {
            at: now,
            state: self.state,
            note: note.into(),
        });
        self.updated_at = now;
    }

    /// Move forward along the state graph, recording the step in history.
    pub fn transition(&mut self, to: PipelineState, note: impl Into<String>) -> Result<(), DomainError> {
        if !self.state.can_advance_to(to) {
            return Err(DomainError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        self.check_prerequisites(to)?;

        let leaving_retry_stage = to.retry_stage() != self.state.retry_stage();
        self.state = to;
        self.next_attempt_at = None;
        if leaving_retry_stage {
            self.retry_window_started_at = None;
        }
        self.note(note);
        Ok(())
    }

    /// Leave the normal path. The failure is recorded before the state moves.
    pub fn fail(
        &mut self,
        stage: PipelineState,
        reason: InterventionReason,
        message: impl Into<String>,
    ) -> Result<(), DomainError> {
        if !self.state.can_advance_to(PipelineState::NeedsIntervention) {
            return Err(DomainError::InvalidTransition {
                from: self.state,
                to: PipelineState::NeedsIntervention,
            });
        }
        let message = message.into();
        let attempt = self.attempts_at(stage);
        self.note(format!(
            "{stage} failed: {reason} (attempt {attempt}): {message}"
        ));
        self.failure = Some(Failure {
            stage,
            reason,
            attempt,
            message,
            at: Utc::now(),
        });
        self.state = PipelineState::NeedsIntervention;
        self.next_attempt_at = None;
        self.note(format!("awaiting intervention: {reason}"));
        Ok(())
    }

    pub fn abandon(&mut self, note: impl Into<String>) -> Result<(), DomainError> {
        if self.state.is_terminal() {
            return Err(DomainError::InvalidTransition {
                from: self.state,
                to: PipelineState::Abandoned,
            });
        }
        self.state = PipelineState::Abandoned;
        self.next_attempt_at = None;
        self.note(note);
        Ok(())
    }

    /// Park the release until `at`; other releases keep progressing meanwhile.
    pub fn schedule_retry(&mut self, at: DateTime<Utc>, note: impl Into<String>) {
        let now = Utc::now();
        self.retry_window_started_at.get_or_insert(now);
        self.next_attempt_at = Some(at);
        self.note(note);
    }

    /// Operator-driven move out of `NeedsIntervention` back to `target`.
    /// Counters of `target` and every later stage restart from zero and any
    /// data derived after `target` is discarded so it is recomputed.
    pub fn resume(&mut self, target: PipelineState, note: impl Into<String>) -> Result<(), DomainError> {
        if self.state != PipelineState::NeedsIntervention {
            return Err(DomainError::NotPending(self.state));
        }
        if !target.is_resume_target() {
            return Err(DomainError::InvalidTransition {
                from: self.state,
                to: target,
            });
        }

        if !target.is_at_or_past(PipelineState::Downloaded) {
            self.local_path = None;
            self.final_path = None;
        }
        if !target.is_at_or_past(PipelineState::Deciding) {
            self.tracks.clear();
            self.resolution = None;
        }
        if !target.is_at_or_past(PipelineState::Decided) {
            self.decision = None;
        }
        if !target.is_at_or_past(PipelineState::Renaming) {
            self.transcode_complete = false;
        }
        self.check_prerequisites(target)?;

        let target_ordinal = target.ordinal().unwrap_or_default();
        self.attempts.retain(|stage, _| {
            stage
                .ordinal()
                .is_some_and(|ordinal| ordinal < target_ordinal)
        });

        self.state = target;
        self.failure = None;
        self.next_attempt_at = None;
        self.retry_window_started_at = None;
        self.note(note);
        Ok(())
    }

    fn check_prerequisites(&self, state: PipelineState) -> Result<(), DomainError> {
        if state.is_at_or_past(PipelineState::Downloaded) && self.local_path.is_none() {
            return Err(DomainError::InvariantViolated(format!(
                "{state} requires a local file"
            )));
        }
        if !state.is_at_or_past(PipelineState::Downloaded)
            && state.ordinal().is_some()
            && self.local_path.is_some()
        {
            return Err(DomainError::InvariantViolated(format!(
                "{state} must not carry a verified local file"
            )));
        }
        if state.is_at_or_past(PipelineState::Decided) && self.decision.is_none() {
            return Err(DomainError::InvariantViolated(format!(
                "{state} requires a transcode decision"
            )));
        }
        if !state.is_at_or_past(PipelineState::Decided)
            && state.ordinal().is_some()
            && self.decision.is_some()
        {
            return Err(DomainError::InvariantViolated(format!(
                "{state} must not carry a transcode decision"
            )));
        }
        Ok(())
    }

    /// Structural validation applied to records loaded from storage.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.state == PipelineState::NeedsIntervention && self.failure.is_none() {
            return Err(DomainError::SchemaInvalid(
                "needs-intervention without a recorded failure".to_string(),
            ));
        }
        if self.metadata.title.trim().is_empty() {
            return Err(DomainError::SchemaInvalid("empty title".to_string()));
        }
        if self.history.is_empty() {
            return Err(DomainError::SchemaInvalid("empty history".to_string()));
        }
        if self.state != PipelineState::Abandoned {
            self.check_prerequisites(self.effective_state())
                .map_err(|err| DomainError::SchemaInvalid(err.to_string()))?;
        }
        Ok(())
    }
}

// ============================================================================
// Domain events
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent<TPayload> {
    pub name: &'static str,
    pub occurred_at: DateTime<Utc>,
    pub payload: TPayload,
}

impl<TPayload> DomainEvent<TPayload> {
    pub fn new(name: &'static str, payload: TPayload) -> Self {
        Self {
            name,
            occurred_at: Utc::now(),
            payload,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseEventPayload {
    pub release_id: ReleaseId,
    pub state: PipelineState,
    pub note: String,
}

pub type ReleaseEvent = DomainEvent<ReleaseEventPayload>;

pub const RELEASE_PLACED: &str = "release.placed";
pub const RELEASE_NEEDS_INTERVENTION: &str = "release.needs_intervention";
pub const RELEASE_ABANDONED: &str = "release.abandoned";

impl ReleaseEvent {
    /// Event announcing that `release` just entered its current state, if
    /// that state is one subscribers are told about.
    pub fn for_release(release: &Release) -> Option<Self> {
        let name = match release.state {
            PipelineState::Placed => RELEASE_PLACED,
            PipelineState::NeedsIntervention => RELEASE_NEEDS_INTERVENTION,
            PipelineState::Abandoned => RELEASE_ABANDONED,
            _ => return None,
        };
        let note = release
            .history
            .last()
            .map(|entry| entry.note.clone())
            .unwrap_or_default();
        Some(DomainEvent::new(
            name,
            ReleaseEventPayload {
                release_id: release.id,
                state: release.state,
                note,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_release() -> Release {
        Release::new(
            SourceRef::new("hoster://abc"),
            ReleaseMetadata {
                title: "Amelie".to_string(),
                year: Some(2001),
                edition: None,
                primary_language: "fra".to_string(),
            },
        )
    }

    fn sample_spec() -> TranscodeSpec {
        TranscodeSpec {
            actions: vec![TrackAction::Keep { track: 0 }],
            container: Container::Matroska,
            audio_target: AudioTarget {
                codec: "ac3".to_string(),
                channels: 6,
                bitrate_kbps: 640,
            },
        }
    }

    fn drive_to(release: &mut Release, target: PipelineState) {
        use PipelineState::*;
        for state in [Resolving, Downloading, Verifying, Downloaded, Inspecting, Deciding, Decided] {
            if state == Downloaded {
                release.local_path = Some(PathBuf::from("/tmp/a.mkv"));
            }
            if state == Decided {
                release.decision = Some(ReleaseDecision::new(sample_spec(), DecisionSource::Engine));
            }
            release.transition(state, "step").expect("forward transition");
            if state == target {
                return;
            }
        }
    }

    #[test]
    fn states_round_trip_through_strings() {
        for state in PipelineState::all() {
            let parsed: PipelineState = state.as_str().parse().expect("known state");
            assert_eq!(parsed, state);
        }
        assert!("bogus".parse::<PipelineState>().is_err());
    }

    #[test]
    fn only_forward_transitions_are_allowed() {
        let mut release = sample_release();
        assert!(release.transition(PipelineState::Downloading, "skip").is_err());
        release
            .transition(PipelineState::Resolving, "resolving")
            .expect("queued -> resolving");
        assert!(release.transition(PipelineState::Queued, "back").is_err());
    }

    #[test]
    fn downloaded_requires_local_path() {
        let mut release = sample_release();
        drive_to(&mut release, PipelineState::Verifying);
        let err = release
            .transition(PipelineState::Downloaded, "verified")
            .expect_err("missing local path");
        assert!(matches!(err, DomainError::InvariantViolated(_)));
    }

    #[test]
    fn verification_failure_may_reenter_download() {
        let mut release = sample_release();
        drive_to(&mut release, PipelineState::Verifying);
        release
            .transition(PipelineState::Downloading, "incomplete, resuming")
            .expect("retry edge");
        assert_eq!(release.state, PipelineState::Downloading);
    }

    #[test]
    fn decided_may_skip_transcoding() {
        let mut release = sample_release();
        drive_to(&mut release, PipelineState::Decided);
        release
            .transition(PipelineState::Renaming, "pass-through")
            .expect("skip transcoding");
    }

    #[test]
    fn fail_records_failure_before_state_change() {
        let mut release = sample_release();
        drive_to(&mut release, PipelineState::Downloading);
        release.record_attempt(PipelineState::Downloading);
        release
            .fail(PipelineState::Downloading, InterventionReason::DownloadExhausted, "gave up")
            .expect("fail");

        assert_eq!(release.state, PipelineState::NeedsIntervention);
        let failure = release.failure.clone().expect("failure recorded");
        assert_eq!(failure.stage, PipelineState::Downloading);
        assert_eq!(failure.attempt, 1);
        assert!(release
            .history
            .iter()
            .any(|entry| entry.state == PipelineState::Downloading && entry.note.contains("DownloadExhausted")));
        assert!(release.validate().is_ok());
    }

    #[test]
    fn resume_resets_counters_from_target_onwards() {
        let mut release = sample_release();
        drive_to(&mut release, PipelineState::Downloading);
        release.record_attempt(PipelineState::Resolving);
        release.record_attempt(PipelineState::Downloading);
        release.record_attempt(PipelineState::Downloading);
        release
            .fail(PipelineState::Downloading, InterventionReason::DownloadExhausted, "boom")
            .expect("fail");

        release
            .resume(PipelineState::Downloading, "operator retry")
            .expect("resume");
        assert_eq!(release.state, PipelineState::Downloading);
        assert_eq!(release.attempts_at(PipelineState::Downloading), 0);
        assert_eq!(release.attempts_at(PipelineState::Resolving), 1);
        assert!(release.failure.is_none());
    }

    #[test]
    fn resume_requires_pending_release() {
        let mut release = sample_release();
        let err = release
            .resume(PipelineState::Queued, "nope")
            .expect_err("not pending");
        assert_eq!(err, DomainError::NotPending(PipelineState::Queued));
    }

    #[test]
    fn terminal_states_cannot_move() {
        let mut release = sample_release();
        release.abandon("operator gave up").expect("abandon");
        assert!(release.abandon("again").is_err());
        assert!(release.transition(PipelineState::Resolving, "no").is_err());
    }

    #[test]
    fn events_are_emitted_only_for_notable_states() {
        let mut release = sample_release();
        assert!(ReleaseEvent::for_release(&release).is_none());
        release.abandon("operator gave up").expect("abandon");
        let event = ReleaseEvent::for_release(&release).expect("abandon event");
        assert_eq!(event.name, RELEASE_ABANDONED);
        assert_eq!(event.payload.note, "operator gave up");
    }

    #[test]
    fn attempts_serialize_with_state_keys() {
        let mut release = sample_release();
        release.record_attempt(PipelineState::Verifying);
        let json = serde_json::to_value(&release.attempts).expect("serialize attempts");
        assert_eq!(json["downloading"], 1);
    }
}
