// SPDX-License-Identifier: GPL-3.0-or-later
//! External transcoder invocation.
//!
//! The plan is computed before anything runs; ffmpeg only executes it. The
//! source file is replaced only after the new file passes validation.

use async_trait::async_trait;
use reelwright_domain::{Container, Track, TrackAction, TranscodeSpec};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::inspect::MediaProbe;

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("transcoder timed out after {0:?}")]
    Timeout(Duration),
    #[error("transcoder failed ({status}): {stderr}")]
    Failed { status: String, stderr: String },
    #[error("output failed validation: {0}")]
    ValidationFailed(String),
    #[error("transcode interrupted by shutdown")]
    Cancelled,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Apply `spec` to `input` and return the path of the finished file.
    async fn transcode(
        &self,
        input: &Path,
        spec: &TranscodeSpec,
        tracks: &[Track],
        cancel: &CancellationToken,
    ) -> Result<PathBuf, TranscodeError>;
}

/// Name of the validated result next to `input`. Only a file that passed
/// validation is ever given this name.
pub fn staging_output(input: &Path, container: Container) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    input.with_file_name(format!("{stem}.reencoded.{}", container.extension()))
}

/// Where ffmpeg writes before the result is validated.
fn partial_output(finished: &Path) -> PathBuf {
    finished.with_extension("partial")
}

/// ffmpeg arguments for `spec`: kept streams copied, created AC3 streams
/// encoded, metadata and chapters carried over, Matroska output.
pub fn build_ffmpeg_args(input: &Path, output: &Path, spec: &TranscodeSpec, tracks: &[Track]) -> Vec<OsString> {
    let mut args: Vec<OsString> = ["-hide_banner", "-nostdin", "-y", "-v", "error", "-i"]
        .iter()
        .map(OsString::from)
        .collect();
    args.push(input.as_os_str().to_owned());

    let mut out_index = 0usize;
    for action in &spec.actions {
        if let TrackAction::Keep { track } = action {
            args.push("-map".into());
            args.push(format!("0:{track}").into());
            out_index += 1;
        }
    }
    args.push("-c".into());
    args.push("copy".into());

    for action in spec.creations() {
        if let TrackAction::CreateAc3 {
            source,
            channels,
            bitrate_kbps,
        } = action
        {
            args.push("-map".into());
            args.push(format!("0:{source}").into());
            for (flag, value) in [
                (format!("-c:{out_index}"), "ac3".to_string()),
                (format!("-b:{out_index}"), format!("{bitrate_kbps}k")),
                (format!("-ac:{out_index}"), channels.to_string()),
                (format!("-metadata:s:{out_index}"), format!("title=AC3 {}", layout_name(*channels))),
            ] {
                args.push(flag.into());
                args.push(value.into());
            }
            if let Some(language) = tracks
                .iter()
                .find(|t| t.index == *source)
                .and_then(|t| t.language.clone())
            {
                args.push(format!("-metadata:s:{out_index}").into());
                args.push(format!("language={language}").into());
            }
            out_index += 1;
        }
    }

    for arg in ["-map_metadata", "0", "-map_chapters", "0", "-f", "matroska"] {
        args.push(arg.into());
    }
    args.push(output.as_os_str().to_owned());
    args
}

fn layout_name(channels: u32) -> String {
    match channels {
        1 => "1.0".to_string(),
        2 => "2.0".to_string(),
        6 => "5.1".to_string(),
        8 => "7.1".to_string(),
        n => format!("{n}ch"),
    }
}

enum Wait {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Run a tool to completion, bounded by `timeout`, collecting stderr.
pub async fn run_tool(
    program: &Path,
    args: &[OsString],
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(ExitStatus, String), TranscodeError> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let stderr_task = child.stderr.take().map(|mut stderr| {
        tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        })
    });

    let waited = tokio::select! {
        status = child.wait() => Wait::Exited(status),
        _ = tokio::time::sleep(timeout) => Wait::TimedOut,
        _ = cancel.cancelled() => Wait::Cancelled,
    };

    let status = match waited {
        Wait::Exited(status) => status?,
        Wait::TimedOut => {
            let _ = child.kill().await;
            return Err(TranscodeError::Timeout(timeout));
        }
        Wait::Cancelled => {
            let _ = child.kill().await;
            return Err(TranscodeError::Cancelled);
        }
    };

    let stderr = match stderr_task {
        Some(task) => task.await.unwrap_or_default(),
        None => String::new(),
    };
    Ok((status, stderr))
}

pub struct FfmpegTranscoder {
    ffmpeg: PathBuf,
    probe: Arc<dyn MediaProbe>,
    timeout: Duration,
    decode_check_timeout: Duration,
    permits: Arc<Semaphore>,
}

impl FfmpegTranscoder {
    pub fn new(
        ffmpeg: impl Into<PathBuf>,
        probe: Arc<dyn MediaProbe>,
        timeout: Duration,
        decode_check_timeout: Duration,
        max_concurrent: usize,
    ) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            probe,
            timeout,
            decode_check_timeout,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Durations equal to the millisecond pass outright; otherwise the
    /// output must decode end to end without a single error line.
    async fn validate_output(
        &self,
        input: &Path,
        output: &Path,
        expected_audio: usize,
        cancel: &CancellationToken,
    ) -> Result<(), TranscodeError> {
        let produced = self
            .probe
            .inspect(output)
            .await
            .map_err(|e| TranscodeError::ValidationFailed(format!("output does not probe: {e}")))?;
        let produced_audio = produced.tracks.iter().filter(|t| t.is_audio()).count();
        if produced_audio != expected_audio {
            return Err(TranscodeError::ValidationFailed(format!(
                "expected {expected_audio} audio streams, found {produced_audio}"
            )));
        }

        let source = self
            .probe
            .inspect(input)
            .await
            .map_err(|e| TranscodeError::ValidationFailed(format!("source does not probe: {e}")))?;
        if source.duration_ms.is_some() && source.duration_ms == produced.duration_ms {
            debug!(target: "transcode", duration_ms = ?produced.duration_ms, "durations match");
            return Ok(());
        }

        info!(
            target: "transcode",
            source_ms = ?source.duration_ms,
            output_ms = ?produced.duration_ms,
            "durations differ, running decode check"
        );
        let args: Vec<OsString> = ["-v", "error", "-i"]
            .iter()
            .map(OsString::from)
            .chain([output.as_os_str().to_owned()])
            .chain(["-f", "null", "-"].iter().map(OsString::from))
            .collect();
        let (status, stderr) = match run_tool(&self.ffmpeg, &args, self.decode_check_timeout, cancel).await {
            Err(TranscodeError::Timeout(after)) => {
                return Err(TranscodeError::ValidationFailed(format!(
                    "decode check timed out after {after:?}"
                )))
            }
            other => other?,
        };
        if !status.success() || !stderr.trim().is_empty() {
            return Err(TranscodeError::ValidationFailed(format!(
                "decode check failed ({status}): {}",
                stderr.trim()
            )));
        }
        Ok(())
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(err) = tokio::fs::remove_file(path).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(target: "transcode", path = %path.display(), error = %err, "failed to remove file");
        }
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    #[instrument(skip_all, fields(input = %input.display()))]
    async fn transcode(
        &self,
        input: &Path,
        spec: &TranscodeSpec,
        tracks: &[Track],
        cancel: &CancellationToken,
    ) -> Result<PathBuf, TranscodeError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| TranscodeError::Cancelled)?;

        let finished = staging_output(input, spec.container);
        if tokio::fs::try_exists(&finished).await? {
            // A previous run validated the output but stopped before it was recorded.
            remove_quietly(input).await;
            info!(target: "transcode", path = %finished.display(), "reusing validated output");
            return Ok(finished);
        }

        let output = partial_output(&finished);
        let args = build_ffmpeg_args(input, &output, spec, tracks);
        info!(target: "transcode", output = %output.display(), "starting ffmpeg");

        let (status, stderr) = match run_tool(&self.ffmpeg, &args, self.timeout, cancel).await {
            Ok(result) => result,
            Err(err) => {
                remove_quietly(&output).await;
                return Err(err);
            }
        };
        if !status.success() {
            remove_quietly(&output).await;
            return Err(TranscodeError::Failed {
                status: status.to_string(),
                stderr: stderr.trim().to_string(),
            });
        }

        if let Err(err) = self
            .validate_output(input, &output, spec.audio_output_count(tracks), cancel)
            .await
        {
            remove_quietly(&output).await;
            return Err(err);
        }

        tokio::fs::rename(&output, &finished).await?;
        remove_quietly(input).await;
        info!(target: "transcode", path = %finished.display(), "transcode validated");
        Ok(finished)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inspect::{HdrFormat, InspectError, MediaInfo};
    use reelwright_domain::{AudioTarget, TrackKind};

    fn sample_spec() -> TranscodeSpec {
        TranscodeSpec {
            actions: vec![
                TrackAction::Keep { track: 0 },
                TrackAction::Keep { track: 1 },
                TrackAction::Drop {
                    track: 2,
                    reason: "non-English audio".to_string(),
                },
                TrackAction::Keep { track: 3 },
                TrackAction::CreateAc3 {
                    source: 1,
                    channels: 6,
                    bitrate_kbps: 640,
                },
            ],
            container: Container::Matroska,
            audio_target: AudioTarget {
                codec: "ac3".to_string(),
                channels: 6,
                bitrate_kbps: 640,
            },
        }
    }

    fn sample_tracks() -> Vec<Track> {
        vec![
            Track::new(0, TrackKind::Video, "hevc"),
            Track::new(1, TrackKind::Audio, "truehd").with_language("eng").with_channels(8),
            Track::new(2, TrackKind::Audio, "aac").with_language("spa"),
            Track::new(3, TrackKind::Subtitle, "subrip").with_language("eng"),
        ]
    }

    fn strings(args: &[OsString]) -> Vec<String> {
        args.iter().map(|a| a.to_string_lossy().into_owned()).collect()
    }

    #[test]
    fn output_lands_next_to_input() {
        let finished = staging_output(Path::new("/staging/abc/Movie.mp4"), Container::Matroska);
        assert_eq!(finished, PathBuf::from("/staging/abc/Movie.reencoded.mkv"));
        assert_eq!(partial_output(&finished), PathBuf::from("/staging/abc/Movie.reencoded.partial"));
    }

    #[test]
    fn args_map_kept_streams_and_encode_creations() {
        let args = strings(&build_ffmpeg_args(
            Path::new("in.mkv"),
            Path::new("out.mkv"),
            &sample_spec(),
            &sample_tracks(),
        ));
        let joined = args.join(" ");

        assert!(joined.contains("-i in.mkv -map 0:0 -map 0:1 -map 0:3 -c copy -map 0:1"));
        assert!(joined.contains("-c:3 ac3 -b:3 640k -ac:3 6"));
        assert!(joined.contains("-metadata:s:3 language=eng"));
        assert!(!joined.contains("0:2"), "dropped stream must not be mapped");
        assert!(joined.ends_with("-map_metadata 0 -map_chapters 0 -f matroska out.mkv"));
    }

    struct FixedProbe {
        audio: usize,
        duration_ms: u64,
    }

    #[async_trait]
    impl MediaProbe for FixedProbe {
        async fn inspect(&self, _path: &Path) -> Result<MediaInfo, InspectError> {
            let tracks = (0..self.audio)
                .map(|i| Track::new(i as u32, TrackKind::Audio, "ac3"))
                .collect();
            Ok(MediaInfo {
                tracks,
                duration_ms: Some(self.duration_ms),
                resolution: None,
                hdr: HdrFormat::Sdr,
            })
        }
    }

    #[tokio::test]
    async fn matching_durations_pass_validation() {
        let transcoder = FfmpegTranscoder::new(
            "/nonexistent/ffmpeg",
            Arc::new(FixedProbe {
                audio: 2,
                duration_ms: 5_000,
            }),
            Duration::from_secs(5),
            Duration::from_secs(5),
            1,
        );
        let cancel = CancellationToken::new();
        transcoder
            .validate_output(Path::new("in.mkv"), Path::new("out.mkv"), 2, &cancel)
            .await
            .unwrap();

        let err = transcoder
            .validate_output(Path::new("in.mkv"), Path::new("out.mkv"), 3, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, TranscodeError::ValidationFailed(_)));
    }

    fn transcoder_without_ffmpeg() -> FfmpegTranscoder {
        FfmpegTranscoder::new(
            "/nonexistent/ffmpeg",
            Arc::new(FixedProbe {
                audio: 2,
                duration_ms: 5_000,
            }),
            Duration::from_secs(5),
            Duration::from_secs(5),
            1,
        )
    }

    #[tokio::test]
    async fn validated_output_from_an_earlier_run_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("Movie.mp4");
        tokio::fs::write(&input, b"source").await.unwrap();
        let finished = staging_output(&input, Container::Matroska);
        tokio::fs::write(&finished, b"reencoded").await.unwrap();

        // ffmpeg does not exist, so only the existing output can satisfy this.
        let output = transcoder_without_ffmpeg()
            .transcode(&input, &sample_spec(), &sample_tracks(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(output, finished);
        assert_eq!(tokio::fs::read(&output).await.unwrap(), b"reencoded");
        assert!(!input.exists());

        // Running once more with the input already gone gives the same answer.
        let again = transcoder_without_ffmpeg()
            .transcode(&input, &sample_spec(), &sample_tracks(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(again, finished);
    }

    #[tokio::test]
    async fn failed_runs_leave_the_input_alone() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("Movie.mkv");
        tokio::fs::write(&input, b"source").await.unwrap();

        let err = transcoder_without_ffmpeg()
            .transcode(&input, &sample_spec(), &sample_tracks(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TranscodeError::Io(_)));
        assert_eq!(tokio::fs::read(&input).await.unwrap(), b"source");
        let finished = staging_output(&input, Container::Matroska);
        assert!(!finished.exists());
        assert!(!partial_output(&finished).exists());
    }

    #[tokio::test]
    async fn missing_ffmpeg_is_an_io_error() {
        let err = run_tool(
            Path::new("/nonexistent/ffmpeg"),
            &[],
            Duration::from_secs(1),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TranscodeError::Io(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_tools_time_out() {
        let err = run_tool(
            Path::new("sleep"),
            &[OsString::from("5")],
            Duration::from_millis(100),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TranscodeError::Timeout(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn shutdown_interrupts_tools() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = run_tool(Path::new("sleep"), &[OsString::from("5")], Duration::from_secs(10), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, TranscodeError::Cancelled));
    }
}
