// SPDX-License-Identifier: GPL-3.0-or-later
//! Canonical naming and placement into the resolution-tiered library.

use lazy_static::lazy_static;
use regex::Regex;
use reelwright_domain::{Release, ReleaseMetadata};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, instrument, warn};
use unicode_normalization::UnicodeNormalization;

use crate::verify::sha256_file;

lazy_static! {
    static ref INVALID_CHARS: Regex = Regex::new(r#"[<>:"/\\|?*\x00-\x1F]"#).expect("valid path character regex");
    static ref WHITESPACE: Regex = Regex::new(r"\s+").expect("valid whitespace regex");
}

#[derive(Debug, Error)]
pub enum PlacementError {
    #[error("a different file already exists at {0}")]
    PlacementConflict(PathBuf),
    #[error("release has no resolution tier")]
    MissingResolution,
    #[error("release has no local file")]
    MissingSource,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn sanitize(component: &str) -> String {
    let composed: String = component.nfc().collect();
    let cleaned = INVALID_CHARS.replace_all(&composed, " ");
    let collapsed = WHITESPACE.replace_all(&cleaned, " ");
    collapsed
        .trim_matches(|c: char| c == '.' || c.is_whitespace())
        .to_string()
}

/// `Title (Year) - Edition`, filesystem safe and NFC-normalized.
pub fn canonical_name(metadata: &ReleaseMetadata) -> String {
    let mut name = sanitize(&metadata.title);
    if name.is_empty() {
        name = "Untitled".to_string();
    }
    if let Some(year) = metadata.year {
        name.push_str(&format!(" ({year})"));
    }
    if let Some(edition) = metadata.edition.as_deref().map(sanitize).filter(|e| !e.is_empty()) {
        name.push_str(" - ");
        name.push_str(&edition);
    }
    name
}

#[derive(Debug, Clone)]
pub struct PlacementEngine {
    library_root: PathBuf,
}

impl PlacementEngine {
    pub fn new(library_root: impl Into<PathBuf>) -> Self {
        Self {
            library_root: library_root.into(),
        }
    }

    fn file_name(release: &Release, source: &Path) -> String {
        let extension = source
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_else(|| "mkv".to_string());
        format!("{}.{}", canonical_name(&release.metadata), extension)
    }

    /// `<root>/<tier>/<canonical>/<canonical>.<ext>`
    pub fn destination(&self, release: &Release) -> Result<PathBuf, PlacementError> {
        let source = release.local_path.as_deref().ok_or(PlacementError::MissingSource)?;
        let tier = release.resolution.ok_or(PlacementError::MissingResolution)?;
        Ok(self
            .library_root
            .join(tier.dir_name())
            .join(canonical_name(&release.metadata))
            .join(Self::file_name(release, source)))
    }

    /// Give the staged file its canonical name without leaving its directory.
    ///
    /// A record that still points at the old name after the rename went
    /// through resolves to the renamed file.
    #[instrument(skip_all, fields(release_id = %release.id))]
    pub async fn rename(&self, release: &Release) -> Result<PathBuf, PlacementError> {
        let source = release.local_path.as_deref().ok_or(PlacementError::MissingSource)?;
        let target = source.with_file_name(Self::file_name(release, source));
        if target != source {
            if already_moved(source, &target).await? {
                debug!(target: "placement", path = %target.display(), "already renamed");
                return Ok(target);
            }
            fs::rename(source, &target).await?;
            debug!(target: "placement", from = %source.display(), to = %target.display(), "renamed");
        }
        Ok(target)
    }

    /// Move the release's file into the library.
    ///
    /// An identical file already at the destination counts as placed; a
    /// different one is a conflict and nothing is overwritten.
    #[instrument(skip_all, fields(release_id = %release.id))]
    pub async fn place(&self, release: &Release) -> Result<PathBuf, PlacementError> {
        let source = release.local_path.as_deref().ok_or(PlacementError::MissingSource)?;
        let destination = self.destination(release)?;

        if source == destination {
            return Ok(destination);
        }
        if already_moved(source, &destination).await? {
            info!(target: "placement", path = %destination.display(), "already placed");
            return Ok(destination);
        }

        if fs::try_exists(&destination).await? {
            let (existing, incoming) = (sha256_file(&destination).await?, sha256_file(source).await?);
            if existing != incoming {
                return Err(PlacementError::PlacementConflict(destination));
            }
            info!(target: "placement", path = %destination.display(), "identical file already placed");
            fs::remove_file(source).await?;
            return Ok(destination);
        }

        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).await?;
        }
        move_file(source, &destination).await?;
        info!(target: "placement", path = %destination.display(), "placed in library");
        Ok(destination)
    }
}

/// The source is gone and the target exists: a previous run finished the
/// move but did not get to record it.
async fn already_moved(source: &Path, target: &Path) -> Result<bool, PlacementError> {
    Ok(!fs::try_exists(source).await? && fs::try_exists(target).await?)
}

/// Rename, falling back to copy + rename when crossing filesystems, so the
/// destination name only ever holds a complete file.
async fn move_file(source: &Path, destination: &Path) -> Result<(), PlacementError> {
    match fs::rename(source, destination).await {
        Ok(()) => return Ok(()),
        Err(err) => debug!(target: "placement", error = %err, "rename failed, copying instead"),
    }

    let partial = destination.with_extension("partial");
    if let Err(err) = fs::copy(source, &partial).await {
        let _ = fs::remove_file(&partial).await;
        return Err(err.into());
    }
    fs::File::open(&partial).await?.sync_all().await?;
    fs::rename(&partial, destination).await?;
    if let Err(err) = fs::remove_file(source).await {
        warn!(target: "placement", error = %err, "copied file but could not remove the source");
    }
    Ok(())
}
