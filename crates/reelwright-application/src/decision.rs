// SPDX-License-Identifier: GPL-3.0-or-later
//! Reencode decision engine.
//!
//! Pure policy over inspected tracks. Rules, strongest first:
//! 1. the output always carries an AC3 track, downmixed from the best kept
//!    source when none is present;
//! 2. lossless and object-based audio is always kept verbatim;
//! 3. non-English audio is dropped, except the primary-language track of a
//!    film whose declared language is not English;
//! 4. English and forced subtitles are kept, every other subtitle dropped;
//! 5. a plan without any audio output is refused.
//!
//! A plan that keeps every track is pass-through. The downloaded file is
//! placed as it is, in the container it arrived in; the spec's container
//! only describes what a transcode would write.

use reelwright_domain::{
    AudioTarget, Container, FilmLanguagePolicy, Track, TrackAction, TrackKind, TranscodeSpec,
};
use std::cmp::Reverse;
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecisionOutcome {
    Decided(TranscodeSpec),
    /// The rules would leave the output without audio.
    NoAudioOutput(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpecValidationError {
    #[error("action references unknown track {0}")]
    UnknownTrack(u32),
    #[error("AC3 source {0} is not an audio track")]
    SourceNotAudio(u32),
    #[error("track {0} appears in more than one keep/drop action")]
    DuplicateTrack(u32),
    #[error("plan produces no audio output")]
    NoAudio,
}

/// Ranking used to pick the AC3 downmix source.
pub fn source_score(track: &Track) -> u32 {
    let quality = if track.is_object_based() {
        100
    } else if track.is_lossless() || matches!(track.codec.as_str(), "truehd" | "eac3" | "dts") {
        50
    } else {
        10
    };
    quality + track.channel_count().unwrap_or_default()
}

enum AudioVerdict {
    Keep,
    Drop(&'static str),
}

pub fn decide(tracks: &[Track], policy: &FilmLanguagePolicy, target: &AudioTarget) -> DecisionOutcome {
    let primary_foreign = !policy.primary_is_english();
    let primary_pick = primary_foreign
        .then(|| best_of(tracks.iter().filter(|t| t.is_audio() && t.has_language(&policy.primary_language))))
        .flatten()
        .map(|t| t.index);

    let mut indexed: Vec<&Track> = tracks.iter().collect();
    indexed.sort_by_key(|t| t.index);

    let mut actions = Vec::with_capacity(indexed.len() + 1);
    let mut kept_audio: Vec<&Track> = Vec::new();

    for track in indexed {
        let action = match track.kind {
            TrackKind::Video | TrackKind::Other => TrackAction::Keep { track: track.index },
            TrackKind::Audio => match audio_verdict(track, primary_pick, policy) {
                AudioVerdict::Keep => {
                    kept_audio.push(track);
                    TrackAction::Keep { track: track.index }
                }
                AudioVerdict::Drop(reason) => TrackAction::Drop {
                    track: track.index,
                    reason: reason.to_string(),
                },
            },
            TrackKind::Subtitle if track.is_english() || track.forced => {
                TrackAction::Keep { track: track.index }
            }
            TrackKind::Subtitle => TrackAction::Drop {
                track: track.index,
                reason: "non-English subtitle".to_string(),
            },
        };
        actions.push(action);
    }

    if kept_audio.is_empty() {
        let audio_total = tracks.iter().filter(|t| t.is_audio()).count();
        return DecisionOutcome::NoAudioOutput(format!(
            "no audio track survives the language rules ({audio_total} audio tracks inspected)"
        ));
    }

    if !kept_audio.iter().any(|t| t.codec == target.codec) {
        if let Some(source) = downmix_source(&kept_audio, policy) {
            let channels = source
                .channel_count()
                .unwrap_or(target.channels)
                .min(target.channels);
            debug!(target: "decision", source = source.index, channels, "scheduling AC3 downmix");
            actions.push(TrackAction::CreateAc3 {
                source: source.index,
                channels,
                bitrate_kbps: target.bitrate_kbps,
            });
        }
    }

    DecisionOutcome::Decided(TranscodeSpec {
        actions,
        container: Container::Matroska,
        audio_target: target.clone(),
    })
}

fn audio_verdict(track: &Track, primary_pick: Option<u32>, policy: &FilmLanguagePolicy) -> AudioVerdict {
    if track.is_advanced_audio() {
        return AudioVerdict::Keep;
    }
    if track.is_english() {
        return AudioVerdict::Keep;
    }
    if primary_pick == Some(track.index) {
        return AudioVerdict::Keep;
    }
    if track.normalized_language().is_none() {
        return AudioVerdict::Drop("unknown audio language");
    }
    if !policy.primary_is_english() && track.has_language(&policy.primary_language) {
        return AudioVerdict::Drop("secondary primary-language audio");
    }
    AudioVerdict::Drop("non-English audio")
}

fn best_of<'a>(candidates: impl Iterator<Item = &'a Track>) -> Option<&'a Track> {
    candidates.min_by_key(|t| (Reverse(source_score(t)), t.index))
}

/// Preferred downmix source: primary language, then English, then anything
/// kept; highest score within each group.
fn downmix_source<'a>(kept_audio: &[&'a Track], policy: &FilmLanguagePolicy) -> Option<&'a Track> {
    let rank = |t: &Track| {
        if t.has_language(&policy.primary_language) {
            0
        } else if t.is_english() {
            1
        } else {
            2
        }
    };
    kept_audio
        .iter()
        .copied()
        .min_by_key(|t| (rank(t), Reverse(source_score(t)), t.index))
}

/// Check an operator-supplied plan against the inspected tracks.
pub fn validate_override(spec: &TranscodeSpec, tracks: &[Track]) -> Result<(), SpecValidationError> {
    let find = |index: u32| tracks.iter().find(|t| t.index == index);
    let mut seen = BTreeSet::new();
    for action in &spec.actions {
        match action {
            TrackAction::Keep { track } | TrackAction::Drop { track, .. } => {
                find(*track).ok_or(SpecValidationError::UnknownTrack(*track))?;
                if !seen.insert(*track) {
                    return Err(SpecValidationError::DuplicateTrack(*track));
                }
            }
            TrackAction::CreateAc3 { source, .. } => {
                let source_track = find(*source).ok_or(SpecValidationError::UnknownTrack(*source))?;
                if !source_track.is_audio() {
                    return Err(SpecValidationError::SourceNotAudio(*source));
                }
            }
        }
    }
    if spec.audio_output_count(tracks) == 0 {
        return Err(SpecValidationError::NoAudio);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> AudioTarget {
        AudioTarget {
            codec: "ac3".to_string(),
            channels: 6,
            bitrate_kbps: 640,
        }
    }

    fn video() -> Track {
        Track::new(0, TrackKind::Video, "hevc").with_dimensions(1920, 1080)
    }

    fn spec_of(outcome: DecisionOutcome) -> TranscodeSpec {
        match outcome {
            DecisionOutcome::Decided(spec) => spec,
            other => panic!("expected a spec, got {other:?}"),
        }
    }

    #[test]
    fn french_film_keeps_primary_and_english() {
        let tracks = vec![
            video(),
            Track::new(1, TrackKind::Audio, "ac3").with_language("fre").with_channels(6),
            Track::new(2, TrackKind::Audio, "aac").with_language("eng").with_channels(2),
            Track::new(3, TrackKind::Audio, "aac").with_language("spa").with_channels(2),
            Track::new(4, TrackKind::Subtitle, "subrip").with_language("eng"),
            Track::new(5, TrackKind::Subtitle, "subrip").with_language("eng").forced(),
            Track::new(6, TrackKind::Subtitle, "subrip").with_language("spa"),
        ];
        let spec = spec_of(decide(&tracks, &FilmLanguagePolicy::new("French"), &target()));

        assert_eq!(
            spec.actions,
            vec![
                TrackAction::Keep { track: 0 },
                TrackAction::Keep { track: 1 },
                TrackAction::Keep { track: 2 },
                TrackAction::Drop {
                    track: 3,
                    reason: "non-English audio".to_string()
                },
                TrackAction::Keep { track: 4 },
                TrackAction::Keep { track: 5 },
                TrackAction::Drop {
                    track: 6,
                    reason: "non-English subtitle".to_string()
                },
            ]
        );
        assert!(!spec.is_pass_through());
    }

    #[test]
    fn lone_lossless_track_is_kept_and_downmixed() {
        let tracks = vec![
            video(),
            Track::new(1, TrackKind::Audio, "dts")
                .with_profile("DTS-HD MA")
                .with_channels(8),
        ];
        let spec = spec_of(decide(&tracks, &FilmLanguagePolicy::new("eng"), &target()));

        assert!(spec.actions.contains(&TrackAction::Keep { track: 1 }));
        assert!(spec.actions.contains(&TrackAction::CreateAc3 {
            source: 1,
            channels: 6,
            bitrate_kbps: 640
        }));
    }

    #[test]
    fn advanced_audio_survives_language_rules() {
        let tracks = vec![
            video(),
            Track::new(1, TrackKind::Audio, "truehd")
                .with_language("ger")
                .with_title("Atmos"),
            Track::new(2, TrackKind::Audio, "ac3").with_language("eng").with_channels(6),
        ];
        let spec = spec_of(decide(&tracks, &FilmLanguagePolicy::new("eng"), &target()));
        assert!(spec.actions.contains(&TrackAction::Keep { track: 1 }));
        assert!(spec.is_pass_through());
    }

    #[test]
    fn compliant_file_is_pass_through() {
        let tracks = vec![
            video(),
            Track::new(1, TrackKind::Audio, "ac3").with_language("eng").with_channels(6),
            Track::new(2, TrackKind::Subtitle, "subrip").with_language("eng"),
        ];
        let spec = spec_of(decide(&tracks, &FilmLanguagePolicy::new("eng"), &target()));
        assert!(spec.is_pass_through());
    }

    #[test]
    fn zero_audio_output_needs_intervention() {
        let tracks = vec![
            video(),
            Track::new(1, TrackKind::Audio, "aac").with_language("spa"),
            Track::new(2, TrackKind::Audio, "aac"),
        ];
        let outcome = decide(&tracks, &FilmLanguagePolicy::new("eng"), &target());
        assert!(matches!(outcome, DecisionOutcome::NoAudioOutput(_)));

        let silent = vec![video()];
        assert!(matches!(
            decide(&silent, &FilmLanguagePolicy::new("eng"), &target()),
            DecisionOutcome::NoAudioOutput(_)
        ));
    }

    #[test]
    fn downmix_prefers_primary_language_source() {
        let tracks = vec![
            video(),
            Track::new(1, TrackKind::Audio, "eac3").with_language("eng").with_channels(6),
            Track::new(2, TrackKind::Audio, "aac").with_language("jpn").with_channels(2),
        ];
        let spec = spec_of(decide(&tracks, &FilmLanguagePolicy::new("ja"), &target()));
        let creations: Vec<_> = spec.creations().cloned().collect();
        assert_eq!(
            creations,
            vec![TrackAction::CreateAc3 {
                source: 2,
                channels: 2,
                bitrate_kbps: 640
            }]
        );
    }

    #[test]
    fn only_the_best_primary_language_track_is_kept() {
        let tracks = vec![
            video(),
            Track::new(1, TrackKind::Audio, "aac").with_language("ita").with_channels(2),
            Track::new(2, TrackKind::Audio, "eac3").with_language("ita").with_channels(6),
        ];
        let spec = spec_of(decide(&tracks, &FilmLanguagePolicy::new("ita"), &target()));
        assert!(spec.actions.contains(&TrackAction::Keep { track: 2 }));
        assert!(spec.actions.iter().any(|a| matches!(a, TrackAction::Drop { track: 1, .. })));
    }

    #[test]
    fn decisions_are_deterministic() {
        let tracks = vec![
            Track::new(2, TrackKind::Audio, "aac").with_language("eng").with_channels(2),
            video(),
            Track::new(1, TrackKind::Audio, "flac").with_language("eng").with_channels(2),
        ];
        let policy = FilmLanguagePolicy::new("eng");
        let first = decide(&tracks, &policy, &target());
        let second = decide(&tracks, &policy, &target());
        assert_eq!(first, second);
        let spec = spec_of(first);
        assert_eq!(spec.actions[0], TrackAction::Keep { track: 0 });
    }

    #[test]
    fn overrides_are_checked_against_tracks() {
        let tracks = vec![
            video(),
            Track::new(1, TrackKind::Audio, "aac").with_language("eng"),
        ];
        let mut spec = spec_of(decide(&tracks, &FilmLanguagePolicy::new("eng"), &target()));
        assert!(validate_override(&spec, &tracks).is_ok());

        spec.actions = vec![
            TrackAction::Keep { track: 0 },
            TrackAction::Drop {
                track: 1,
                reason: "operator".to_string(),
            },
        ];
        assert_eq!(validate_override(&spec, &tracks), Err(SpecValidationError::NoAudio));

        spec.actions.push(TrackAction::Keep { track: 9 });
        assert_eq!(
            validate_override(&spec, &tracks),
            Err(SpecValidationError::UnknownTrack(9))
        );
    }
}
