// SPDX-License-Identifier: GPL-3.0-or-later
//! Integrity verification of downloaded artifacts.

use sha2::{Digest, Sha256};
use std::path::Path;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tracing::{debug, instrument};

const READ_CHUNK: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Verified { size: u64 },
    /// Fewer bytes than expected. The prefix is kept and the next attempt resumes.
    Incomplete { expected: Option<u64>, actual: u64 },
    /// Content cannot be trusted. The file must be discarded and fetched from zero.
    Corrupt { detail: String },
}

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("artifact missing at {0}")]
    Missing(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Streaming SHA-256 of a file, lowercase hex.
pub async fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Compare a local artifact against the expected size and checksum.
///
/// Without a checksum only the size is judged; the inspector's container
/// sanity check then stands in for content integrity. An empty file is
/// always incomplete.
#[instrument(skip_all, fields(path = %path.display()))]
pub async fn verify(
    path: &Path,
    expected_size: Option<u64>,
    expected_checksum: Option<&str>,
) -> Result<Verification, VerifyError> {
    let metadata = match tokio::fs::metadata(path).await {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(VerifyError::Missing(path.display().to_string()))
        }
        Err(err) => return Err(err.into()),
    };
    let actual = metadata.len();

    if actual == 0 {
        return Ok(Verification::Incomplete {
            expected: expected_size,
            actual,
        });
    }

    if let Some(expected) = expected_size {
        if actual < expected {
            debug!(target: "verify", expected, actual, "artifact is short");
            return Ok(Verification::Incomplete {
                expected: Some(expected),
                actual,
            });
        }
        if actual > expected {
            return Ok(Verification::Corrupt {
                detail: format!("size {actual} exceeds expected {expected}"),
            });
        }
    }

    if let Some(expected) = expected_checksum {
        let digest = sha256_file(path).await?;
        if !digest.eq_ignore_ascii_case(expected.trim()) {
            return Ok(Verification::Corrupt {
                detail: format!("sha256 {digest} does not match expected {expected}"),
            });
        }
        debug!(target: "verify", "checksum matches");
    }

    Ok(Verification::Verified { size: actual })
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    async fn write(dir: &tempfile::TempDir, content: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join("artifact.mkv");
        tokio::fs::write(&path, content).await.unwrap();
        path
    }

    #[tokio::test]
    async fn matching_size_and_checksum_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, b"hello").await;
        let result = verify(&path, Some(5), Some(HELLO_SHA256)).await.unwrap();
        assert_eq!(result, Verification::Verified { size: 5 });
    }

    #[tokio::test]
    async fn short_file_is_incomplete() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, b"hel").await;
        let result = verify(&path, Some(5), Some(HELLO_SHA256)).await.unwrap();
        assert_eq!(
            result,
            Verification::Incomplete {
                expected: Some(5),
                actual: 3
            }
        );
    }

    #[tokio::test]
    async fn checksum_mismatch_at_full_size_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, b"jello").await;
        let result = verify(&path, Some(5), Some(HELLO_SHA256)).await.unwrap();
        assert!(matches!(result, Verification::Corrupt { .. }));
    }

    #[tokio::test]
    async fn unknown_expectations_degrade_to_non_empty_check() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, b"anything").await;
        assert_eq!(
            verify(&path, None, None).await.unwrap(),
            Verification::Verified { size: 8 }
        );

        let empty = write(&dir, b"").await;
        assert!(matches!(
            verify(&empty, None, None).await.unwrap(),
            Verification::Incomplete { .. }
        ));
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = verify(&dir.path().join("nope"), None, None).await.unwrap_err();
        assert!(matches!(err, VerifyError::Missing(_)));
    }

    #[tokio::test]
    async fn sha256_streams_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, b"hello").await;
        assert_eq!(sha256_file(&path).await.unwrap(), HELLO_SHA256);
    }
}
