// SPDX-License-Identifier: GPL-3.0-or-later
//! Track inspection through ffprobe.

use async_trait::async_trait;
use reelwright_domain::{ResolutionTier, Track, TrackKind};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, instrument};

const SHOW_ENTRIES: &str = "stream=index,codec_type,codec_name,codec_tag_string,profile,width,height,channels,channel_layout,color_primaries,color_transfer:stream_tags=language,title,handler_name:stream_disposition=forced:format=duration";

#[derive(Debug, Error)]
pub enum InspectError {
    /// The file is intact but its container makes no sense. Never retried.
    #[error("unreadable container: {0}")]
    UnreadableContainer(String),
    /// The probe could not run at all; worth another attempt later.
    #[error("probe unavailable: {0}")]
    ProbeUnavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HdrFormat {
    Sdr,
    Hdr10,
    Hlg,
    DolbyVision,
}

impl HdrFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sdr => "SDR",
            Self::Hdr10 => "HDR10",
            Self::Hlg => "HLG",
            Self::DolbyVision => "Dolby Vision",
        }
    }
}

impl std::fmt::Display for HdrFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaInfo {
    pub tracks: Vec<Track>,
    pub duration_ms: Option<u64>,
    pub resolution: Option<ResolutionTier>,
    pub hdr: HdrFormat,
}

impl MediaInfo {
    /// One-line account written to history once inspection finishes.
    pub fn summary(&self) -> String {
        let count = |kind: TrackKind| self.tracks.iter().filter(|t| t.kind == kind).count();
        format!(
            "{} audio, {} subtitle, video {} {}",
            count(TrackKind::Audio),
            count(TrackKind::Subtitle),
            self.resolution.map(|r| r.dir_name()).unwrap_or("unknown"),
            self.hdr
        )
    }
}

#[async_trait]
pub trait MediaProbe: Send + Sync {
    async fn inspect(&self, path: &Path) -> Result<MediaInfo, InspectError>;
}

// ============================================================================
// ffprobe output
// ============================================================================

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    #[serde(default)]
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    #[serde(default)]
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    index: u32,
    #[serde(default)]
    codec_type: Option<String>,
    #[serde(default)]
    codec_name: Option<String>,
    #[serde(default)]
    codec_tag_string: Option<String>,
    #[serde(default)]
    profile: Option<String>,
    #[serde(default)]
    width: Option<u32>,
    #[serde(default)]
    height: Option<u32>,
    #[serde(default)]
    channels: Option<u32>,
    #[serde(default)]
    channel_layout: Option<String>,
    #[serde(default)]
    color_primaries: Option<String>,
    #[serde(default)]
    color_transfer: Option<String>,
    #[serde(default)]
    tags: HashMap<String, String>,
    #[serde(default)]
    disposition: HashMap<String, i64>,
}

impl ProbeStream {
    fn tag(&self, key: &str) -> Option<String> {
        self.tags
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn into_track(self) -> Track {
        let kind = match self.codec_type.as_deref() {
            Some("video") => TrackKind::Video,
            Some("audio") => TrackKind::Audio,
            Some("subtitle") => TrackKind::Subtitle,
            _ => TrackKind::Other,
        };
        let mut track = Track::new(
            self.index,
            kind,
            self.codec_name.clone().unwrap_or_else(|| "unknown".to_string()),
        );
        track.language = self.tag("language");
        track.title = self.tag("title").or_else(|| self.tag("handler_name"));
        track.profile = self.profile.clone().filter(|p| !p.is_empty());
        track.channels = self.channels.filter(|c| *c > 0);
        track.channel_layout = self.channel_layout.clone();
        track.forced = self.disposition.get("forced").copied().unwrap_or_default() == 1;
        track.width = self.width;
        track.height = self.height;
        track
    }

    fn hdr(&self) -> HdrFormat {
        let tag = self.codec_tag_string.as_deref().unwrap_or_default().to_lowercase();
        let profile = self.profile.as_deref().unwrap_or_default().to_lowercase();
        if tag.starts_with("dvh") || profile.contains("dolby vision") {
            return HdrFormat::DolbyVision;
        }
        let transfer = self.color_transfer.as_deref().unwrap_or_default();
        let primaries = self.color_primaries.as_deref().unwrap_or_default();
        if transfer == "arib-std-b67" || transfer.contains("hlg") {
            HdrFormat::Hlg
        } else if transfer == "smpte2084" || primaries == "bt2020" {
            HdrFormat::Hdr10
        } else {
            HdrFormat::Sdr
        }
    }
}

/// Turn ffprobe JSON into tracks, rejecting containers that fail the sanity
/// check: no streams, or no positive duration.
pub fn parse_probe_output(json: &[u8]) -> Result<MediaInfo, InspectError> {
    let output: ProbeOutput = serde_json::from_slice(json)
        .map_err(|e| InspectError::UnreadableContainer(format!("malformed probe output: {e}")))?;

    if output.streams.is_empty() {
        return Err(InspectError::UnreadableContainer("no streams".to_string()));
    }

    let duration_ms = output
        .format
        .and_then(|format| format.duration)
        .and_then(|d| d.trim().parse::<f64>().ok())
        .filter(|seconds| seconds.is_finite() && *seconds > 0.0)
        .map(|seconds| (seconds * 1000.0).round() as u64);
    if duration_ms.is_none() {
        return Err(InspectError::UnreadableContainer("zero duration".to_string()));
    }

    let video = output
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"));
    let resolution = video.and_then(|s| match (s.width, s.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => Some(ResolutionTier::from_dimensions(w, h)),
        _ => None,
    });
    let hdr = video.map(ProbeStream::hdr).unwrap_or(HdrFormat::Sdr);

    let tracks = output
        .streams
        .into_iter()
        .map(ProbeStream::into_track)
        .collect();

    Ok(MediaInfo {
        tracks,
        duration_ms,
        resolution,
        hdr,
    })
}

// ============================================================================
// ffprobe runner
// ============================================================================

#[derive(Debug, Clone)]
pub struct FfprobeInspector {
    ffprobe: PathBuf,
    timeout: Duration,
}

impl FfprobeInspector {
    pub fn new(ffprobe: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            ffprobe: ffprobe.into(),
            timeout,
        }
    }
}

#[async_trait]
impl MediaProbe for FfprobeInspector {
    #[instrument(skip(self, path), fields(path = %path.display()))]
    async fn inspect(&self, path: &Path) -> Result<MediaInfo, InspectError> {
        let child = Command::new(&self.ffprobe)
            .args(["-v", "error", "-show_entries", SHOW_ENTRIES, "-of", "json"])
            .arg(path)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, child).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                return Err(InspectError::ProbeUnavailable(format!(
                    "failed to run {}: {err}",
                    self.ffprobe.display()
                )))
            }
            Err(_) => {
                return Err(InspectError::ProbeUnavailable(format!(
                    "ffprobe timed out after {:?}",
                    self.timeout
                )))
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(InspectError::UnreadableContainer(stderr.trim().to_string()));
        }

        let info = parse_probe_output(&output.stdout)?;
        debug!(target: "inspect", summary = %info.summary(), "probe finished");
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_probe() -> serde_json::Value {
        serde_json::json!({
            "streams": [
                {
                    "index": 0, "codec_type": "video", "codec_name": "hevc",
                    "codec_tag_string": "[0][0][0][0]", "profile": "Main 10",
                    "width": 3840, "height": 1600,
                    "color_primaries": "bt2020", "color_transfer": "smpte2084",
                    "disposition": {"forced": 0}
                },
                {
                    "index": 1, "codec_type": "audio", "codec_name": "truehd",
                    "channels": 8, "channel_layout": "7.1",
                    "tags": {"language": "eng", "title": "TrueHD Atmos 7.1"},
                    "disposition": {"forced": 0}
                },
                {
                    "index": 2, "codec_type": "audio", "codec_name": "ac3",
                    "channel_layout": "5.1(side)",
                    "tags": {"language": "fre", "handler_name": "French"},
                    "disposition": {"forced": 0}
                },
                {
                    "index": 3, "codec_type": "subtitle", "codec_name": "subrip",
                    "tags": {"LANGUAGE": "eng"},
                    "disposition": {"forced": 1}
                }
            ],
            "format": {"duration": "7260.120000"}
        })
    }

    #[test]
    fn probe_output_becomes_tracks() {
        let bytes = serde_json::to_vec(&sample_probe()).unwrap();
        let info = parse_probe_output(&bytes).unwrap();

        assert_eq!(info.tracks.len(), 4);
        assert_eq!(info.duration_ms, Some(7_260_120));
        assert_eq!(info.resolution, Some(ResolutionTier::Uhd4k));
        assert_eq!(info.hdr, HdrFormat::Hdr10);

        let atmos = &info.tracks[1];
        assert!(atmos.is_object_based());
        assert_eq!(atmos.channel_count(), Some(8));

        let french = &info.tracks[2];
        assert_eq!(french.channel_count(), Some(6));
        assert_eq!(french.title.as_deref(), Some("French"));
        assert!(french.has_language("fra"));

        let subtitle = &info.tracks[3];
        assert!(subtitle.forced);
        assert!(subtitle.is_english());
    }

    #[test]
    fn dolby_vision_is_detected_from_codec_tag() {
        let mut probe = sample_probe();
        probe["streams"][0]["codec_tag_string"] = "dvh1".into();
        let info = parse_probe_output(&serde_json::to_vec(&probe).unwrap()).unwrap();
        assert_eq!(info.hdr, HdrFormat::DolbyVision);
    }

    #[test]
    fn empty_or_zero_length_containers_are_unreadable() {
        let no_streams = br#"{"streams": [], "format": {"duration": "10.0"}}"#;
        assert!(matches!(
            parse_probe_output(no_streams),
            Err(InspectError::UnreadableContainer(_))
        ));

        let mut zero = sample_probe();
        zero["format"]["duration"] = "0.000000".into();
        assert!(matches!(
            parse_probe_output(&serde_json::to_vec(&zero).unwrap()),
            Err(InspectError::UnreadableContainer(_))
        ));

        assert!(parse_probe_output(b"not json").is_err());
    }

    #[tokio::test]
    async fn missing_binary_is_probe_unavailable() {
        let inspector = FfprobeInspector::new("/nonexistent/ffprobe", Duration::from_secs(5));
        let err = inspector
            .inspect(Path::new("/tmp/whatever.mkv"))
            .await
            .unwrap_err();
        assert!(matches!(err, InspectError::ProbeUnavailable(_)));
    }
}
