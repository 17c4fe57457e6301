// SPDX-License-Identifier: GPL-3.0-or-later
use chrono::{DateTime, Duration, Utc};
use reelwright_domain::{Lease, PipelineState, Release, ReleaseId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("release {0} not found")]
    NotFound(ReleaseId),
    #[error("lease on release {0} was lost or has expired")]
    LeaseLost(ReleaseId),
    #[error("invalid release record: {0}")]
    SchemaInvalid(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

// ============================================================================
// Repository Traits
// ============================================================================

/// Durable record of every release and the arbiter of per-release leases.
///
/// Reads are unrestricted. Every write to an existing release goes through
/// [`ReleaseRepository::save`] and is only accepted from the current lease
/// holder, which serializes mutations of one release while distinct
/// releases proceed independently.
#[async_trait::async_trait]
pub trait ReleaseRepository: Send + Sync {
    async fn insert(&self, release: &Release) -> StoreResult<()>;
    async fn get(&self, id: ReleaseId) -> StoreResult<Option<Release>>;
    async fn list(
        &self,
        state: Option<PipelineState>,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<Release>>;
    /// Releases waiting in `needs-intervention`, oldest first.
    async fn list_pending(&self) -> StoreResult<Vec<Release>>;

    /// Lease the next release a worker can advance: a workable state, its
    /// backoff timer elapsed (or cancellation requested) and no live lease.
    async fn claim_next(
        &self,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<(Release, Lease)>>;

    /// Lease a specific release. `Ok(None)` when another holder owns it.
    async fn try_acquire(
        &self,
        id: ReleaseId,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<(Release, Lease)>>;

    async fn renew_lease(&self, lease: &Lease, ttl: Duration, now: DateTime<Utc>) -> StoreResult<Lease>;
    async fn release_lease(&self, lease: &Lease) -> StoreResult<()>;

    /// Persist the record and append its new history entries atomically.
    /// Fails with [`StoreError::LeaseLost`] unless `lease` is still live.
    async fn save(&self, lease: &Lease, release: &Release) -> StoreResult<()>;

    /// Flag a release for abandonment at its next checkpoint.
    async fn request_cancel(&self, id: ReleaseId) -> StoreResult<bool>;
    async fn cancel_requested(&self, id: ReleaseId) -> StoreResult<bool>;

    /// Drop leases whose holder stopped renewing them.
    async fn reclaim_expired_leases(&self, now: DateTime<Utc>) -> StoreResult<u64>;
}
