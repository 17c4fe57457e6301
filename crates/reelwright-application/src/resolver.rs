// SPDX-License-Identifier: GPL-3.0-or-later
//! Acquisition resolver: source reference in, short-lived download URL out.

use async_trait::async_trait;
use moka::sync::Cache;
use reelwright_debrid::{DebridClient, DebridError};
use reelwright_domain::SourceRef;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSource {
    pub url: String,
    pub filename: Option<String>,
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("resolved link expired: {0}")]
    Expired(String),
    #[error("resolution denied: {0}")]
    Denied(String),
    #[error("source unavailable: {0}")]
    Unavailable(String),
    #[error("resolution service error: {0}")]
    Transient(String),
}

#[async_trait]
pub trait SourceResolver: Send + Sync {
    async fn resolve(&self, source: &SourceRef) -> Result<ResolvedSource, ResolveError>;
}

impl From<DebridError> for ResolveError {
    fn from(err: DebridError) -> Self {
        match err {
            DebridError::MissingToken | DebridError::Denied { .. } => Self::Denied(err.to_string()),
            DebridError::Unavailable { .. } => Self::Unavailable(err.to_string()),
            DebridError::RequestFailed(_)
            | DebridError::RateLimitExceeded
            | DebridError::InvalidResponse(_)
            | DebridError::ApiError { .. } => Self::Transient(err.to_string()),
        }
    }
}

#[async_trait]
impl SourceResolver for DebridClient {
    async fn resolve(&self, source: &SourceRef) -> Result<ResolvedSource, ResolveError> {
        let link = self.unrestrict_link(source.as_str()).await?;
        Ok(ResolvedSource {
            size: link.size(),
            filename: Some(link.filename).filter(|name| !name.is_empty()),
            url: link.download,
        })
    }
}

/// Keeps resolved URLs in memory for their expected lifetime.
///
/// URLs are never written to the store: after a restart every release
/// re-resolves, which is always safe.
#[derive(Clone)]
pub struct CachingResolver {
    inner: Arc<dyn SourceResolver>,
    cache: Cache<String, ResolvedSource>,
}

impl CachingResolver {
    pub fn new(inner: Arc<dyn SourceResolver>, ttl: Duration) -> Self {
        Self {
            inner,
            cache: Cache::builder()
                .max_capacity(10_000)
                .time_to_live(ttl)
                .build(),
        }
    }

    /// Drop the cached URL, e.g. after the host rejected it as expired.
    pub fn invalidate(&self, source: &SourceRef) {
        self.cache.invalidate(source.as_str());
    }
}

#[async_trait]
impl SourceResolver for CachingResolver {
    #[instrument(skip(self, source), fields(source = %source))]
    async fn resolve(&self, source: &SourceRef) -> Result<ResolvedSource, ResolveError> {
        if let Some(cached) = self.cache.get(source.as_str()) {
            debug!(target: "resolver", "using cached download url");
            return Ok(cached);
        }
        let resolved = self.inner.resolve(source).await?;
        debug!(target: "resolver", size = ?resolved.size, "resolved download url");
        self.cache
            .insert(source.as_str().to_string(), resolved.clone());
        Ok(resolved)
    }
}
