// SPDX-License-Identifier: GPL-3.0-or-later
//! Inspected media tracks and the transcode plan computed over them.

use serde::{Deserialize, Serialize};

// ============================================================================
// Languages
// ============================================================================

const LANGUAGE_ALIASES: &[(&str, &[&str])] = &[
    ("eng", &["en", "eng", "english"]),
    ("fra", &["fr", "fra", "fre", "french", "francais", "français"]),
    ("spa", &["es", "spa", "spanish", "espanol", "español"]),
    ("deu", &["de", "deu", "ger", "german", "deutsch"]),
    ("ita", &["it", "ita", "italian"]),
    ("jpn", &["ja", "jpn", "japanese"]),
    ("kor", &["ko", "kor", "korean"]),
    ("zho", &["zh", "zho", "chi", "chinese", "mandarin"]),
    ("por", &["pt", "por", "portuguese"]),
    ("rus", &["ru", "rus", "russian"]),
    ("nld", &["nl", "nld", "dut", "dutch"]),
    ("swe", &["sv", "swe", "swedish"]),
    ("dan", &["da", "dan", "danish"]),
    ("nor", &["no", "nor", "nob", "nno", "norwegian"]),
    ("fin", &["fi", "fin", "finnish"]),
    ("pol", &["pl", "pol", "polish"]),
    ("hin", &["hi", "hin", "hindi"]),
];

/// Normalize a language tag or name to its ISO 639-2/T code.
///
/// Returns `None` for empty and undetermined tags. Unknown tags are passed
/// through lowercased so that two identical unknown tags still compare equal.
pub fn normalize_language(tag: &str) -> Option<String> {
    let lowered = tag.trim().to_lowercase();
    if lowered.is_empty() || lowered == "und" || lowered == "unknown" {
        return None;
    }
    let code = LANGUAGE_ALIASES
        .iter()
        .find(|(_, aliases)| aliases.contains(&lowered.as_str()))
        .map(|(code, _)| (*code).to_string());
    Some(code.unwrap_or(lowered))
}

pub fn is_english_tag(tag: &str) -> bool {
    normalize_language(tag).as_deref() == Some("eng")
}

// ============================================================================
// Tracks
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Video,
    Audio,
    Subtitle,
    Other,
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Video => write!(f, "video"),
            Self::Audio => write!(f, "audio"),
            Self::Subtitle => write!(f, "subtitle"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// One stream of a container, as reported by the track inspector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    /// Absolute stream index inside the container.
    pub index: u32,
    pub kind: TrackKind,
    pub codec: String,
    #[serde(default)]
    pub profile: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub channels: Option<u32>,
    #[serde(default)]
    pub channel_layout: Option<String>,
    #[serde(default)]
    pub forced: bool,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
}

const LAYOUT_CHANNELS: &[(&str, u32)] = &[
    ("mono", 1),
    ("1.0", 1),
    ("stereo", 2),
    ("2.0", 2),
    ("2.1", 3),
    ("3.0", 3),
    ("3.1", 4),
    ("4.0", 4),
    ("4.1", 5),
    ("5.0", 5),
    ("5.1", 6),
    ("6.1", 7),
    ("7.1", 8),
    ("7.1(wide)", 8),
];

impl Track {
    pub fn new(index: u32, kind: TrackKind, codec: impl Into<String>) -> Self {
        Self {
            index,
            kind,
            codec: codec.into().to_lowercase(),
            profile: None,
            language: None,
            title: None,
            channels: None,
            channel_layout: None,
            forced: false,
            width: None,
            height: None,
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn with_channels(mut self, channels: u32) -> Self {
        self.channels = Some(channels);
        self
    }

    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = Some(profile.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn forced(mut self) -> Self {
        self.forced = true;
        self
    }

    pub fn with_dimensions(mut self, width: u32, height: u32) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }

    pub fn is_audio(&self) -> bool {
        self.kind == TrackKind::Audio
    }

    pub fn is_subtitle(&self) -> bool {
        self.kind == TrackKind::Subtitle
    }

    pub fn normalized_language(&self) -> Option<String> {
        self.language.as_deref().and_then(normalize_language)
    }

    pub fn is_english(&self) -> bool {
        self.language.as_deref().is_some_and(is_english_tag)
    }

    pub fn has_language(&self, language: &str) -> bool {
        match (self.normalized_language(), normalize_language(language)) {
            (Some(own), Some(wanted)) => own == wanted,
            _ => false,
        }
    }

    /// Channel count from the stream header, falling back to the layout name.
    pub fn channel_count(&self) -> Option<u32> {
        if let Some(channels) = self.channels.filter(|c| *c > 0) {
            return Some(channels);
        }
        let layout = self.channel_layout.as_deref()?.trim().to_lowercase();
        if let Some((_, count)) = LAYOUT_CHANNELS.iter().find(|(name, _)| *name == layout) {
            return Some(*count);
        }
        let (front, lfe) = layout.split_once('.')?;
        let lfe: String = lfe.chars().take_while(|c| c.is_ascii_digit()).collect();
        Some(front.parse::<u32>().ok()? + lfe.parse::<u32>().ok()?)
    }

    fn tag_text(&self) -> String {
        let mut text = self.title.clone().unwrap_or_default();
        if let Some(profile) = &self.profile {
            text.push(' ');
            text.push_str(profile);
        }
        text.to_lowercase()
    }

    pub fn is_ac3(&self) -> bool {
        self.is_audio() && self.codec == "ac3"
    }

    /// Object-based immersive audio (Atmos, DTS:X).
    pub fn is_object_based(&self) -> bool {
        if !self.is_audio() {
            return false;
        }
        let tags = self.tag_text();
        tags.contains("atmos") || tags.contains("dts:x") || tags.contains("dtsx")
    }

    /// Lossless codecs, including the lossless DTS-HD MA extension.
    pub fn is_lossless(&self) -> bool {
        if !self.is_audio() {
            return false;
        }
        match self.codec.as_str() {
            "truehd" | "mlp" | "flac" | "alac" => true,
            "dts" => self.tag_text().contains("dts-hd ma"),
            codec => codec.starts_with("pcm_"),
        }
    }

    /// Tracks that must always be preserved verbatim.
    pub fn is_advanced_audio(&self) -> bool {
        self.is_lossless() || self.is_object_based()
    }

    pub fn codec_label(&self) -> String {
        let atmos = self.tag_text().contains("atmos");
        match self.codec.as_str() {
            "truehd" if atmos => "Dolby Atmos".to_string(),
            "truehd" => "Dolby TrueHD".to_string(),
            "eac3" if atmos => "Dolby Atmos".to_string(),
            "eac3" => "Dolby Digital Plus (E-AC3)".to_string(),
            "dts" if self.is_object_based() => "DTS:X".to_string(),
            "dts" if self.is_lossless() => "DTS-HD MA".to_string(),
            "dts" => "DTS".to_string(),
            "ac3" => "AC3".to_string(),
            "aac" => "AAC".to_string(),
            other => other.to_uppercase(),
        }
    }

    /// Short human label, e.g. `AC3-6 (fra)` or `English subtitle (forced)`.
    pub fn label(&self) -> String {
        let language = self
            .language
            .clone()
            .unwrap_or_else(|| "unknown".to_string());
        match self.kind {
            TrackKind::Audio => {
                let channels = self
                    .channel_count()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "?".to_string());
                format!("{}-{} ({})", self.codec_label(), channels, language)
            }
            TrackKind::Subtitle if self.forced => format!("{} subtitle ({}, forced)", self.codec, language),
            TrackKind::Subtitle => format!("{} subtitle ({})", self.codec, language),
            TrackKind::Video => match (self.width, self.height) {
                (Some(w), Some(h)) => format!("{} video {}x{}", self.codec, w, h),
                _ => format!("{} video", self.codec),
            },
            TrackKind::Other => format!("{} stream", self.codec),
        }
    }
}

// ============================================================================
// Resolution tiers
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResolutionTier {
    #[serde(rename = "4K")]
    Uhd4k,
    #[serde(rename = "1080p")]
    Hd1080,
    #[serde(rename = "720p")]
    Hd720,
    #[serde(rename = "SD")]
    Sd,
}

impl ResolutionTier {
    /// Tier from the video frame size. Width is consulted as well so that
    /// letterboxed encodes (1920x800) land in the tier they were mastered for.
    pub fn from_dimensions(width: u32, height: u32) -> Self {
        if height >= 2160 || width >= 3840 {
            Self::Uhd4k
        } else if height >= 1080 || width >= 1920 {
            Self::Hd1080
        } else if height >= 720 || width >= 1280 {
            Self::Hd720
        } else {
            Self::Sd
        }
    }

    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Uhd4k => "4K",
            Self::Hd1080 => "1080p",
            Self::Hd720 => "720p",
            Self::Sd => "SD",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "4K" => Some(Self::Uhd4k),
            "1080p" => Some(Self::Hd1080),
            "720p" => Some(Self::Hd720),
            "SD" => Some(Self::Sd),
            _ => None,
        }
    }
}

impl std::fmt::Display for ResolutionTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.dir_name())
    }
}

// ============================================================================
// Transcode plan
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TrackAction {
    Keep {
        track: u32,
    },
    Drop {
        track: u32,
        reason: String,
    },
    CreateAc3 {
        source: u32,
        channels: u32,
        bitrate_kbps: u32,
    },
}

impl TrackAction {
    pub fn track(&self) -> u32 {
        match self {
            Self::Keep { track } | Self::Drop { track, .. } => *track,
            Self::CreateAc3 { source, .. } => *source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Container {
    #[default]
    Matroska,
}

impl Container {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Matroska => "mkv",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioTarget {
    pub codec: String,
    pub channels: u32,
    pub bitrate_kbps: u32,
}

/// Ordered keep/drop/create actions the external transcoder must apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscodeSpec {
    pub actions: Vec<TrackAction>,
    pub container: Container,
    pub audio_target: AudioTarget,
}

impl TranscodeSpec {
    /// True when every action is a keep: the file is already compliant and
    /// keeps its original container.
    pub fn is_pass_through(&self) -> bool {
        self.actions
            .iter()
            .all(|action| matches!(action, TrackAction::Keep { .. }))
    }

    pub fn kept(&self) -> impl Iterator<Item = u32> + '_ {
        self.actions.iter().filter_map(|action| match action {
            TrackAction::Keep { track } => Some(*track),
            _ => None,
        })
    }

    pub fn creations(&self) -> impl Iterator<Item = &TrackAction> + '_ {
        self.actions
            .iter()
            .filter(|action| matches!(action, TrackAction::CreateAc3 { .. }))
    }

    /// Number of audio streams the output will carry.
    pub fn audio_output_count(&self, tracks: &[Track]) -> usize {
        let kept_audio = self
            .kept()
            .filter(|index| {
                tracks
                    .iter()
                    .any(|track| track.index == *index && track.is_audio())
            })
            .count();
        kept_audio + self.creations().count()
    }

    /// Human-readable account of the plan, written to history when decided.
    pub fn summary(&self, tracks: &[Track]) -> String {
        let label = |index: u32| {
            tracks
                .iter()
                .find(|track| track.index == index)
                .map(Track::label)
                .unwrap_or_else(|| format!("stream #{index}"))
        };

        let mut lines = Vec::new();
        for action in &self.actions {
            let line = match action {
                TrackAction::Keep { track } => format!("keep #{track} {}", label(*track)),
                TrackAction::Drop { track, reason } => {
                    format!("drop #{track} {} ({reason})", label(*track))
                }
                TrackAction::CreateAc3 {
                    source,
                    channels,
                    bitrate_kbps,
                } => format!(
                    "create AC3-{channels} @ {bitrate_kbps}k from #{source} {}",
                    label(*source)
                ),
            };
            lines.push(line);
        }
        if self.is_pass_through() {
            lines.push("pass-through: no transcode required".to_string());
        }
        lines.join("; ")
    }
}
