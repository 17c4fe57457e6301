// SPDX-License-Identifier: GPL-3.0-or-later
//! Resumable downloads with per-release retry timing.

use chrono::{DateTime, Utc};
use rand::Rng;
use reelwright_config::RetryConfig;
use reelwright_domain::{Release, ReleaseId};
use reqwest::header::RANGE;
use reqwest::{Client, StatusCode};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::resolver::{CachingResolver, ResolveError, SourceResolver};
use crate::verify::{self, Verification, VerifyError};

// ============================================================================
// Retry policy
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_elapsed: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAt(DateTime<Utc>),
    Exhausted,
}

impl BackoffPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_secs(config.base_delay_secs),
            max_delay: Duration::from_secs(config.max_delay_secs),
            max_elapsed: Duration::from_secs(config.max_elapsed_secs),
        }
    }

    /// Delay after the `failed_attempt`-th failure: `base * 2^(n-1)`, capped,
    /// then scaled by `jitter` (clamped to `0.5..=1.0`).
    pub fn delay_for(&self, failed_attempt: u32, jitter: f64) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(20);
        let raw = self.base_delay.saturating_mul(1u32 << exponent);
        raw.min(self.max_delay).mul_f64(jitter.clamp(0.5, 1.0))
    }

    pub fn next_delay(&self, failed_attempt: u32) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.5..=1.0);
        self.delay_for(failed_attempt, jitter)
    }

    /// Decide whether a stage that has used `attempts` tries may go again.
    ///
    /// The retry window opened at the first failure; a retry that would land
    /// beyond `max_elapsed` from there counts as exhaustion.
    pub fn next_retry(
        &self,
        attempts: u32,
        window_started: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> RetryDecision {
        if attempts >= self.max_attempts {
            return RetryDecision::Exhausted;
        }
        let delay = chrono::Duration::from_std(self.next_delay(attempts))
            .unwrap_or_else(|_| chrono::Duration::seconds(i64::from(u32::MAX)));
        let at = now + delay;
        let started = window_started.unwrap_or(now);
        let budget = chrono::Duration::from_std(self.max_elapsed)
            .unwrap_or_else(|_| chrono::Duration::seconds(i64::from(u32::MAX)));
        if at - started > budget {
            return RetryDecision::Exhausted;
        }
        RetryDecision::RetryAt(at)
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum FetchError {
    /// The host refused the URL; it has to be resolved again.
    #[error("download url rejected with status {0}")]
    Expired(u16),
    #[error("download failed with status {0}")]
    Status(u16),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("transfer interrupted by shutdown")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Verify(#[from] VerifyError),
}

// ============================================================================
// Download manager
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchReport {
    pub path: PathBuf,
    /// Size reported by the resolution service, when the release had none.
    pub reported_size: Option<u64>,
    pub bytes_written: u64,
    pub total_bytes: u64,
    pub resumed: bool,
    pub re_resolved: bool,
}

#[derive(Debug, Clone, Copy)]
struct TransferStats {
    written: u64,
    total: u64,
    resumed: bool,
}

#[derive(Clone)]
pub struct DownloadManager {
    client: Client,
    resolver: CachingResolver,
    staging_dir: PathBuf,
}

impl DownloadManager {
    pub fn new(client: Client, resolver: CachingResolver, staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            client,
            resolver,
            staging_dir: staging_dir.into(),
        }
    }

    pub fn resolver(&self) -> &CachingResolver {
        &self.resolver
    }

    /// Staging location for a release's artifact: one directory per release.
    pub fn staging_path_for(&self, id: ReleaseId, filename: Option<&str>) -> PathBuf {
        let name = filename
            .map(sanitize_filename)
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "source.mkv".to_string());
        self.staging_dir.join(id.to_string()).join(name)
    }

    /// Fetch the artifact into staging, resuming any prefix already present.
    ///
    /// A URL rejected as expired is re-resolved exactly once within the same
    /// attempt. Verification is left to the caller. Cancellation is observed
    /// between chunks, so every byte on disk was written whole.
    #[instrument(skip(self, release, cancel), fields(release_id = %release.id))]
    pub async fn fetch(&self, release: &Release, cancel: &CancellationToken) -> Result<FetchReport, DownloadError> {
        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled.into());
        }
        let resolved = self.resolver.resolve(&release.source_ref).await?;
        let path = release
            .staging_path
            .clone()
            .unwrap_or_else(|| self.staging_path_for(release.id, resolved.filename.as_deref()));
        let expected = release.expected_size.or(resolved.size);
        let reported_size = if release.expected_size.is_none() {
            resolved.size
        } else {
            None
        };

        let (stats, re_resolved) = match self.transfer(&resolved.url, &path, expected, cancel).await {
            Err(FetchError::Expired(status)) => {
                warn!(target: "download", status, "download url rejected, resolving again");
                self.resolver.invalidate(&release.source_ref);
                let fresh = self.resolver.resolve(&release.source_ref).await?;
                (self.transfer(&fresh.url, &path, expected, cancel).await?, true)
            }
            other => (other?, false),
        };

        info!(
            target: "download",
            path = %path.display(),
            written = stats.written,
            total = stats.total,
            resumed = stats.resumed,
            "transfer finished"
        );
        Ok(FetchReport {
            path,
            reported_size,
            bytes_written: stats.written,
            total_bytes: stats.total,
            resumed: stats.resumed,
            re_resolved,
        })
    }

    pub async fn verify(&self, path: &Path, release: &Release) -> Result<Verification, DownloadError> {
        let result = verify::verify(path, release.expected_size, release.expected_checksum.as_deref()).await?;
        if let Verification::Corrupt { detail } = &result {
            warn!(target: "verify", release_id = %release.id, %detail, "discarding corrupt artifact");
            self.discard(path).await?;
        }
        Ok(result)
    }

    /// Remove whatever is left of a release's staging directory.
    pub async fn clear_staging(&self, id: ReleaseId) {
        let dir = self.staging_dir.join(id.to_string());
        match fs::remove_dir_all(&dir).await {
            Ok(()) => debug!(target: "download", path = %dir.display(), "staging cleared"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(target: "download", path = %dir.display(), error = %err, "could not clear staging"),
        }
    }

    pub async fn discard(&self, path: &Path) -> Result<(), FetchError> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn transfer(
        &self,
        url: &str,
        path: &Path,
        expected: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<TransferStats, FetchError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut existing = match fs::metadata(path).await {
            Ok(metadata) => metadata.len(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => 0,
            Err(err) => return Err(err.into()),
        };
        if let Some(expected) = expected {
            if existing == expected && existing > 0 {
                debug!(target: "download", "artifact already complete");
                return Ok(TransferStats {
                    written: 0,
                    total: existing,
                    resumed: true,
                });
            }
            if existing > expected {
                warn!(target: "download", existing, expected, "staged file is oversized, restarting");
                fs::remove_file(path).await?;
                existing = 0;
            }
        }

        let mut request = self.client.get(url);
        if existing > 0 {
            request = request.header(RANGE, format!("bytes={existing}-"));
        }
        let mut response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            response = request.send() => response?,
        };
        let status = response.status();
        debug!(target: "download", %status, existing, "transfer response");

        match status.as_u16() {
            401 | 403 | 404 | 410 => return Err(FetchError::Expired(status.as_u16())),
            416 if existing > 0 => {
                return Ok(TransferStats {
                    written: 0,
                    total: existing,
                    resumed: true,
                })
            }
            _ if !status.is_success() => return Err(FetchError::Status(status.as_u16())),
            _ => {}
        }

        // A plain 200 means the host ignored the range: start over.
        let resumed = status == StatusCode::PARTIAL_CONTENT && existing > 0;
        let mut file = if resumed {
            OpenOptions::new().append(true).open(path).await?
        } else {
            fs::File::create(path).await?
        };

        let mut written = 0u64;
        let streamed = loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Err(FetchError::Cancelled),
                next = response.chunk() => next,
            };
            match next {
                Ok(Some(bytes)) => {
                    file.write_all(&bytes).await?;
                    written += bytes.len() as u64;
                }
                Ok(None) => break Ok(()),
                Err(err) => break Err(FetchError::Network(err)),
            }
        };
        // Whatever arrived stays on disk so the next attempt can resume.
        file.flush().await?;
        file.sync_all().await?;
        streamed?;

        Ok(TransferStats {
            written,
            total: if resumed { existing + written } else { written },
            resumed,
        })
    }
}

fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '.' | '-' | '_' | ' ' | '(' | ')') {
                c
            } else {
                '_'
            }
        })
        .collect();
    cleaned.trim_matches(|c: char| c == '.' || c.is_whitespace()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use reelwright_domain::{ReleaseMetadata, SourceRef};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::resolver::ResolvedSource;

    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    /// Hands out `<base>/file-<n>` on the n-th call.
    struct SequenceResolver {
        base: String,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SourceResolver for SequenceResolver {
        async fn resolve(&self, _source: &SourceRef) -> Result<ResolvedSource, ResolveError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ResolvedSource {
                url: format!("{}/file-{}", self.base, n),
                filename: Some("Movie.mkv".to_string()),
                size: Some(5),
            })
        }
    }

    fn manager(server: &MockServer, staging: &Path) -> (DownloadManager, Arc<SequenceResolver>) {
        let inner = Arc::new(SequenceResolver {
            base: server.uri(),
            calls: AtomicUsize::new(0),
        });
        let resolver = CachingResolver::new(inner.clone(), Duration::from_secs(60));
        (DownloadManager::new(Client::new(), resolver, staging), inner)
    }

    fn release() -> Release {
        let mut release = Release::new(
            SourceRef::new("hoster://movie"),
            ReleaseMetadata {
                title: "Movie".to_string(),
                year: Some(2020),
                edition: None,
                primary_language: "eng".to_string(),
            },
        );
        release.expected_checksum = Some(HELLO_SHA256.to_string());
        release
    }

    #[tokio::test]
    async fn full_download_verifies() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/file-0"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello".to_vec()))
            .mount(&server)
            .await;
        let staging = tempfile::tempdir().unwrap();
        let (manager, _) = manager(&server, staging.path());

        let release = release();
        let report = manager.fetch(&release, &CancellationToken::new()).await.unwrap();
        assert_eq!(report.reported_size, Some(5));
        assert_eq!(tokio::fs::read(&report.path).await.unwrap(), b"hello");
        assert!(report.path.ends_with("Movie.mkv"));
        assert_eq!(
            manager.verify(&report.path, &release).await.unwrap(),
            Verification::Verified { size: 5 }
        );
    }

    #[tokio::test]
    async fn partial_file_resumes_with_range() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/file-0"))
            .and(header("range", "bytes=3-"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(b"lo".to_vec()))
            .mount(&server)
            .await;
        let staging = tempfile::tempdir().unwrap();
        let (manager, _) = manager(&server, staging.path());

        let mut release = release();
        let staged = manager.staging_path_for(release.id, Some("Movie.mkv"));
        tokio::fs::create_dir_all(staged.parent().unwrap()).await.unwrap();
        tokio::fs::write(&staged, b"hel").await.unwrap();
        release.staging_path = Some(staged.clone());
        release.expected_size = Some(5);

        let report = manager.fetch(&release, &CancellationToken::new()).await.unwrap();
        assert!(report.resumed);
        assert_eq!(report.bytes_written, 2);
        assert_eq!(report.total_bytes, 5);
        assert_eq!(
            manager.verify(&staged, &release).await.unwrap(),
            Verification::Verified { size: 5 }
        );
    }

    #[tokio::test]
    async fn expired_url_is_resolved_again_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/file-0"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/file-1"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello".to_vec()))
            .mount(&server)
            .await;
        let staging = tempfile::tempdir().unwrap();
        let (manager, resolver) = manager(&server, staging.path());

        let report = manager.fetch(&release(), &CancellationToken::new()).await.unwrap();
        assert!(report.re_resolved);
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn second_expiry_in_one_attempt_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(410))
            .mount(&server)
            .await;
        let staging = tempfile::tempdir().unwrap();
        let (manager, resolver) = manager(&server, staging.path());

        let err = manager.fetch(&release(), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, DownloadError::Fetch(FetchError::Expired(410))));
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn corrupt_artifact_is_discarded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/file-0"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"jello".to_vec()))
            .mount(&server)
            .await;
        let staging = tempfile::tempdir().unwrap();
        let (manager, _) = manager(&server, staging.path());
        let release = release();

        let report = manager.fetch(&release, &CancellationToken::new()).await.unwrap();
        assert!(matches!(
            manager.verify(&report.path, &release).await.unwrap(),
            Verification::Corrupt { .. }
        ));
        assert!(!report.path.exists(), "corrupt prefix must not survive for a resume");
    }

    #[tokio::test]
    async fn shutdown_stops_the_transfer_and_keeps_the_prefix() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(b"lo".to_vec()))
            .expect(0)
            .mount(&server)
            .await;
        let staging = tempfile::tempdir().unwrap();
        let (manager, _) = manager(&server, staging.path());

        let mut release = release();
        let staged = manager.staging_path_for(release.id, Some("Movie.mkv"));
        tokio::fs::create_dir_all(staged.parent().unwrap()).await.unwrap();
        tokio::fs::write(&staged, b"hel").await.unwrap();
        release.staging_path = Some(staged.clone());
        release.expected_size = Some(5);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = manager.fetch(&release, &cancel).await.unwrap_err();
        assert!(matches!(err, DownloadError::Fetch(FetchError::Cancelled)));
        assert_eq!(tokio::fs::read(&staged).await.unwrap(), b"hel");

        // A resumed transfer cut off before the first chunk leaves the prefix intact too.
        let err = manager
            .transfer(&format!("{}/file-0", server.uri()), &staged, Some(5), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Cancelled));
        assert_eq!(tokio::fs::read(&staged).await.unwrap(), b"hel");
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = BackoffPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(100),
            max_elapsed: Duration::from_secs(3600),
        };
        assert_eq!(policy.delay_for(1, 1.0), Duration::from_secs(30));
        assert_eq!(policy.delay_for(2, 1.0), Duration::from_secs(60));
        assert_eq!(policy.delay_for(3, 1.0), Duration::from_secs(100));
        assert_eq!(policy.delay_for(1, 0.5), Duration::from_secs(15));
        assert_eq!(policy.delay_for(1, 7.0), Duration::from_secs(30));
    }

    #[test]
    fn retry_budget_is_bounded_by_attempts_and_elapsed_time() {
        let policy = BackoffPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(600),
            max_elapsed: Duration::from_secs(3600),
        };
        let now = Utc::now();
        assert!(matches!(policy.next_retry(1, None, now), RetryDecision::RetryAt(_)));
        assert_eq!(policy.next_retry(3, None, now), RetryDecision::Exhausted);

        let long_ago = now - chrono::Duration::hours(2);
        assert_eq!(policy.next_retry(1, Some(long_ago), now), RetryDecision::Exhausted);
    }

    #[test]
    fn filenames_are_sanitized() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "_.._etc_passwd");
        assert_eq!(sanitize_filename("Heat (1995).mkv"), "Heat (1995).mkv");
    }
}
