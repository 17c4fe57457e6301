// SPDX-License-Identifier: GPL-3.0-or-later
use chrono::{DateTime, Duration, NaiveDateTime, SecondsFormat, Utc};
use reelwright_domain::{
    Failure, HistoryEntry, Lease, PipelineState, Release, ReleaseDecision, ReleaseId,
    ReleaseMetadata, ResolutionTier, SourceRef, Track,
};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, warn};

use crate::repositories::{ReleaseRepository, StoreError, StoreResult};

/// SQLx-backed release store.
#[derive(Clone)]
pub struct SqliteReleaseRepository {
    pool: SqlitePool,
}

impl SqliteReleaseRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn load_history(&self, id: ReleaseId) -> StoreResult<Vec<HistoryEntry>> {
        let rows = sqlx::query(
            "SELECT at, state, note FROM release_history WHERE release_id = ? ORDER BY seq",
        )
        .bind(id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_history).collect()
    }

    async fn hydrate(&self, row: &SqliteRow) -> StoreResult<Release> {
        let id = parse_id(row)?;
        let history = self.load_history(id).await?;
        row_to_release(row, history)
    }

    async fn hydrate_leased(&self, row: &SqliteRow) -> StoreResult<(Release, Lease)> {
        let release = self.hydrate(row).await?;
        let holder: Option<String> = row.try_get("lease_holder")?;
        let expires: Option<String> = row.try_get("lease_expires_at")?;
        let (Some(holder), Some(expires)) = (holder, expires) else {
            return Err(StoreError::SchemaInvalid(format!(
                "release {} claimed without lease columns",
                release.id
            )));
        };
        let lease = Lease {
            release_id: release.id,
            holder,
            expires_at: parse_dt("lease_expires_at", &expires)?,
        };
        Ok((release, lease))
    }

    async fn append_history(
        tx: &mut Transaction<'_, Sqlite>,
        release: &Release,
    ) -> StoreResult<()> {
        let persisted: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM release_history WHERE release_id = ?")
                .bind(release.id.to_string())
                .fetch_one(&mut **tx)
                .await?;
        let persisted = usize::try_from(persisted).unwrap_or_default();
        if release.history.len() < persisted {
            return Err(StoreError::SchemaInvalid(format!(
                "release {} history shrank from {} to {} entries",
                release.id,
                persisted,
                release.history.len()
            )));
        }

        for (seq, entry) in release.history.iter().enumerate().skip(persisted) {
            sqlx::query(
                "INSERT INTO release_history (release_id, seq, at, state, note) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(release.id.to_string())
            .bind(seq as i64)
            .bind(ts(entry.at))
            .bind(entry.state.as_str())
            .bind(&entry.note)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ReleaseRepository for SqliteReleaseRepository {
    async fn insert(&self, release: &Release) -> StoreResult<()> {
        debug!(target: "repository", release_id = %release.id, "inserting release");
        let cols = ReleaseColumns::encode(release)?;
        let mut tx = self.pool.begin().await?;

        let q = r#"
            INSERT INTO releases (
                id, source_ref, title, year, edition, primary_language, state, attempts,
                expected_size, expected_checksum, staging_path, local_path, final_path,
                tracks, decision, resolution, failure, cancel_requested, transcode_complete,
                next_attempt_at, retry_window_started_at, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#;
        sqlx::query(q)
            .bind(release.id.to_string())
            .bind(release.source_ref.as_str())
            .bind(&release.metadata.title)
            .bind(release.metadata.year.map(i64::from))
            .bind(release.metadata.edition.clone())
            .bind(&release.metadata.primary_language)
            .bind(release.state.as_str())
            .bind(cols.attempts)
            .bind(cols.expected_size)
            .bind(release.expected_checksum.clone())
            .bind(cols.staging_path)
            .bind(cols.local_path)
            .bind(cols.final_path)
            .bind(cols.tracks)
            .bind(cols.decision)
            .bind(cols.resolution)
            .bind(cols.failure)
            .bind(release.cancel_requested)
            .bind(release.transcode_complete)
            .bind(release.next_attempt_at.map(ts))
            .bind(release.retry_window_started_at.map(ts))
            .bind(ts(release.created_at))
            .bind(ts(release.updated_at))
            .execute(&mut *tx)
            .await?;

        Self::append_history(&mut tx, release).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, id: ReleaseId) -> StoreResult<Option<Release>> {
        debug!(target: "repository", %id, "fetching release by id");
        let row = sqlx::query("SELECT * FROM releases WHERE id = ? LIMIT 1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(self.hydrate(&row).await?)),
            None => Ok(None),
        }
    }

    async fn list(
        &self,
        state: Option<PipelineState>,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<Release>> {
        debug!(target: "repository", ?state, limit, offset, "listing releases");
        let rows = match state {
            Some(state) => {
                sqlx::query(
                    "SELECT * FROM releases WHERE state = ? ORDER BY created_at LIMIT ? OFFSET ?",
                )
                .bind(state.as_str())
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM releases ORDER BY created_at LIMIT ? OFFSET ?")
                    .bind(limit)
                    .bind(offset)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(self.hydrate(row).await?);
        }
        Ok(out)
    }

    async fn list_pending(&self) -> StoreResult<Vec<Release>> {
        debug!(target: "repository", "listing releases awaiting intervention");
        let rows = sqlx::query("SELECT * FROM releases WHERE state = ? ORDER BY updated_at")
            .bind(PipelineState::NeedsIntervention.as_str())
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(self.hydrate(row).await?);
        }
        Ok(out)
    }

    async fn claim_next(
        &self,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<(Release, Lease)>> {
        let q = r#"
            UPDATE releases SET lease_holder = ?1, lease_expires_at = ?2
            WHERE id = (
                SELECT id FROM releases
                WHERE state NOT IN ('placed', 'abandoned', 'needs-intervention')
                  AND (lease_expires_at IS NULL OR lease_expires_at <= ?3)
                  AND (next_attempt_at IS NULL OR next_attempt_at <= ?3 OR cancel_requested = 1)
                ORDER BY COALESCE(next_attempt_at, updated_at) ASC
                LIMIT 1
            )
            AND (lease_expires_at IS NULL OR lease_expires_at <= ?3)
            RETURNING *
        "#;
        let row = sqlx::query(q)
            .bind(holder)
            .bind(ts(now + ttl))
            .bind(ts(now))
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let claimed = self.hydrate_leased(&row).await?;
                debug!(target: "repository", release_id = %claimed.0.id, holder, "claimed release");
                Ok(Some(claimed))
            }
            None => Ok(None),
        }
    }

    async fn try_acquire(
        &self,
        id: ReleaseId,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<(Release, Lease)>> {
        let q = r#"
            UPDATE releases SET lease_holder = ?1, lease_expires_at = ?2
            WHERE id = ?3
              AND (lease_expires_at IS NULL OR lease_expires_at <= ?4 OR lease_holder = ?1)
            RETURNING *
        "#;
        let row = sqlx::query(q)
            .bind(holder)
            .bind(ts(now + ttl))
            .bind(id.to_string())
            .bind(ts(now))
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(self.hydrate_leased(&row).await?)),
            None => {
                let exists: Option<String> =
                    sqlx::query_scalar("SELECT id FROM releases WHERE id = ?")
                        .bind(id.to_string())
                        .fetch_optional(&self.pool)
                        .await?;
                if exists.is_none() {
                    return Err(StoreError::NotFound(id));
                }
                debug!(target: "repository", %id, holder, "release is leased by another holder");
                Ok(None)
            }
        }
    }

    async fn renew_lease(&self, lease: &Lease, ttl: Duration, now: DateTime<Utc>) -> StoreResult<Lease> {
        let expires_at = now + ttl;
        let result = sqlx::query(
            "UPDATE releases SET lease_expires_at = ? WHERE id = ? AND lease_holder = ? AND lease_expires_at > ?",
        )
        .bind(ts(expires_at))
        .bind(lease.release_id.to_string())
        .bind(&lease.holder)
        .bind(ts(now))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::LeaseLost(lease.release_id));
        }
        Ok(Lease {
            expires_at,
            ..lease.clone()
        })
    }

    async fn release_lease(&self, lease: &Lease) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE releases SET lease_holder = NULL, lease_expires_at = NULL WHERE id = ? AND lease_holder = ?",
        )
        .bind(lease.release_id.to_string())
        .bind(&lease.holder)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            warn!(target: "repository", release_id = %lease.release_id, holder = %lease.holder, "lease was already gone on release");
        }
        Ok(())
    }

    async fn save(&self, lease: &Lease, release: &Release) -> StoreResult<()> {
        debug!(target: "repository", release_id = %release.id, state = %release.state, "saving release");
        if lease.release_id != release.id {
            return Err(StoreError::LeaseLost(release.id));
        }
        let cols = ReleaseColumns::encode(release)?;
        let mut tx = self.pool.begin().await?;

        let q = r#"
            UPDATE releases SET
                source_ref = ?,
                title = ?,
                year = ?,
                edition = ?,
                primary_language = ?,
                state = ?,
                attempts = ?,
                expected_size = ?,
                expected_checksum = ?,
                staging_path = ?,
                local_path = ?,
                final_path = ?,
                tracks = ?,
                decision = ?,
                resolution = ?,
                failure = ?,
                cancel_requested = MAX(cancel_requested, ?),
                transcode_complete = ?,
                next_attempt_at = ?,
                retry_window_started_at = ?,
                updated_at = ?
            WHERE id = ? AND lease_holder = ? AND lease_expires_at > ?
        "#;
        let result = sqlx::query(q)
            .bind(release.source_ref.as_str())
            .bind(&release.metadata.title)
            .bind(release.metadata.year.map(i64::from))
            .bind(release.metadata.edition.clone())
            .bind(&release.metadata.primary_language)
            .bind(release.state.as_str())
            .bind(cols.attempts)
            .bind(cols.expected_size)
            .bind(release.expected_checksum.clone())
            .bind(cols.staging_path)
            .bind(cols.local_path)
            .bind(cols.final_path)
            .bind(cols.tracks)
            .bind(cols.decision)
            .bind(cols.resolution)
            .bind(cols.failure)
            .bind(release.cancel_requested)
            .bind(release.transcode_complete)
            .bind(release.next_attempt_at.map(ts))
            .bind(release.retry_window_started_at.map(ts))
            .bind(ts(release.updated_at))
            .bind(release.id.to_string())
            .bind(&lease.holder)
            .bind(ts(Utc::now()))
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(StoreError::LeaseLost(release.id));
        }

        Self::append_history(&mut tx, release).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn request_cancel(&self, id: ReleaseId) -> StoreResult<bool> {
        debug!(target: "repository", %id, "requesting cancellation");
        let result = sqlx::query(
            "UPDATE releases SET cancel_requested = 1 WHERE id = ? AND state NOT IN ('placed', 'abandoned')",
        )
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn cancel_requested(&self, id: ReleaseId) -> StoreResult<bool> {
        let flag: Option<bool> =
            sqlx::query_scalar("SELECT cancel_requested FROM releases WHERE id = ?")
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await?;
        flag.ok_or(StoreError::NotFound(id))
    }

    async fn reclaim_expired_leases(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE releases SET lease_holder = NULL, lease_expires_at = NULL WHERE lease_expires_at IS NOT NULL AND lease_expires_at <= ?",
        )
        .bind(ts(now))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

/// Fixed-width UTC timestamps so that string comparison in SQL orders correctly.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

struct ReleaseColumns {
    attempts: String,
    expected_size: Option<i64>,
    staging_path: Option<String>,
    local_path: Option<String>,
    final_path: Option<String>,
    tracks: String,
    decision: Option<String>,
    resolution: Option<String>,
    failure: Option<String>,
}

impl ReleaseColumns {
    fn encode(release: &Release) -> StoreResult<Self> {
        let to_json = |field: &str, value: Result<String, serde_json::Error>| {
            value.map_err(|err| invalid(field, err))
        };
        let path = |p: &Option<PathBuf>| p.as_ref().map(|p| p.to_string_lossy().into_owned());

        Ok(Self {
            attempts: to_json("attempts", serde_json::to_string(&release.attempts))?,
            expected_size: release
                .expected_size
                .map(i64::try_from)
                .transpose()
                .map_err(|err| invalid("expected_size", err))?,
            staging_path: path(&release.staging_path),
            local_path: path(&release.local_path),
            final_path: path(&release.final_path),
            tracks: to_json("tracks", serde_json::to_string(&release.tracks))?,
            decision: release
                .decision
                .as_ref()
                .map(|d| to_json("decision", serde_json::to_string(d)))
                .transpose()?,
            resolution: release.resolution.map(|tier| tier.dir_name().to_string()),
            failure: release
                .failure
                .as_ref()
                .map(|f| to_json("failure", serde_json::to_string(f)))
                .transpose()?,
        })
    }
}

fn invalid(field: &str, err: impl std::fmt::Display) -> StoreError {
    StoreError::SchemaInvalid(format!("{field}: {err}"))
}

fn parse_id(row: &SqliteRow) -> StoreResult<ReleaseId> {
    let id_str: String = row.try_get("id")?;
    ReleaseId::parse(&id_str).map_err(|err| invalid("id", err))
}

fn parse_dt(field: &str, s: &str) -> StoreResult<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    // Fallback to SQLite default CURRENT_TIMESTAMP format: "YYYY-MM-DD HH:MM:SS"
    let ndt = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .map_err(|err| invalid(field, err))?;
    Ok(DateTime::<Utc>::from_naive_utc_and_offset(ndt, Utc))
}

fn parse_dt_opt(field: &str, s: Option<String>) -> StoreResult<Option<DateTime<Utc>>> {
    s.map(|s| parse_dt(field, &s)).transpose()
}

fn parse_json<T: serde::de::DeserializeOwned>(field: &str, s: &str) -> StoreResult<T> {
    let value: Value = serde_json::from_str(s).map_err(|err| invalid(field, err))?;
    serde_json::from_value(value).map_err(|err| invalid(field, err))
}

fn parse_state(field: &str, s: &str) -> StoreResult<PipelineState> {
    s.parse().map_err(|err| invalid(field, err))
}

fn row_to_history(row: &SqliteRow) -> StoreResult<HistoryEntry> {
    let at: String = row.try_get("at")?;
    let state: String = row.try_get("state")?;
    let note: String = row.try_get("note")?;
    Ok(HistoryEntry {
        at: parse_dt("history.at", &at)?,
        state: parse_state("history.state", &state)?,
        note,
    })
}

fn row_to_release(row: &SqliteRow, history: Vec<HistoryEntry>) -> StoreResult<Release> {
    let id = parse_id(row)?;
    let source_ref: String = row.try_get("source_ref")?;
    let title: String = row.try_get("title")?;
    let year: Option<i64> = row.try_get("year")?;
    let edition: Option<String> = row.try_get("edition")?;
    let primary_language: String = row.try_get("primary_language")?;
    let state: String = row.try_get("state")?;
    let attempts: String = row.try_get("attempts")?;
    let expected_size: Option<i64> = row.try_get("expected_size")?;
    let expected_checksum: Option<String> = row.try_get("expected_checksum")?;
    let staging_path: Option<String> = row.try_get("staging_path")?;
    let local_path: Option<String> = row.try_get("local_path")?;
    let final_path: Option<String> = row.try_get("final_path")?;
    let tracks: String = row.try_get("tracks")?;
    let decision: Option<String> = row.try_get("decision")?;
    let resolution: Option<String> = row.try_get("resolution")?;
    let failure: Option<String> = row.try_get("failure")?;
    let cancel_requested: bool = row.try_get("cancel_requested")?;
    let transcode_complete: bool = row.try_get("transcode_complete")?;
    let next_attempt_at: Option<String> = row.try_get("next_attempt_at")?;
    let retry_window_started_at: Option<String> = row.try_get("retry_window_started_at")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    let resolution = match resolution {
        Some(value) => Some(
            ResolutionTier::parse(&value)
                .ok_or_else(|| invalid("resolution", format!("unknown tier {value}")))?,
        ),
        None => None,
    };

    let release = Release {
        id,
        source_ref: SourceRef::new(source_ref),
        metadata: ReleaseMetadata {
            title,
            year: year
                .map(u16::try_from)
                .transpose()
                .map_err(|err| invalid("year", err))?,
            edition,
            primary_language,
        },
        state: parse_state("state", &state)?,
        attempts: parse_json::<BTreeMap<PipelineState, u32>>("attempts", &attempts)?,
        expected_size: expected_size
            .map(u64::try_from)
            .transpose()
            .map_err(|err| invalid("expected_size", err))?,
        expected_checksum,
        staging_path: staging_path.map(PathBuf::from),
        local_path: local_path.map(PathBuf::from),
        final_path: final_path.map(PathBuf::from),
        tracks: parse_json::<Vec<Track>>("tracks", &tracks)?,
        decision: decision
            .map(|d| parse_json::<ReleaseDecision>("decision", &d))
            .transpose()?,
        resolution,
        failure: failure
            .map(|f| parse_json::<Failure>("failure", &f))
            .transpose()?,
        history,
        cancel_requested,
        transcode_complete,
        next_attempt_at: parse_dt_opt("next_attempt_at", next_attempt_at)?,
        retry_window_started_at: parse_dt_opt("retry_window_started_at", retry_window_started_at)?,
        created_at: parse_dt("created_at", &created_at)?,
        updated_at: parse_dt("updated_at", &updated_at)?,
    };

    release
        .validate()
        .map_err(|err| StoreError::SchemaInvalid(format!("release {}: {}", release.id, err)))?;
    Ok(release)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::init_memory_database;
    use reelwright_domain::{InterventionReason, ReleaseMetadata};

    fn sample_release(title: &str) -> Release {
        Release::new(
            SourceRef::new(format!("hoster://{title}")),
            ReleaseMetadata {
                title: title.to_string(),
                year: Some(1999),
                edition: Some("Director's Cut".to_string()),
                primary_language: "eng".to_string(),
            },
        )
    }

    async fn repo() -> SqliteReleaseRepository {
        let pool = init_memory_database().await.expect("memory database");
        SqliteReleaseRepository::new(pool)
    }

    #[tokio::test]
    async fn insert_and_get_round_trip() {
        let repo = repo().await;
        let release = sample_release("The Matrix");
        repo.insert(&release).await.expect("insert");

        let loaded = repo.get(release.id).await.expect("get").expect("present");
        assert_eq!(loaded.metadata, release.metadata);
        assert_eq!(loaded.state, PipelineState::Queued);
        assert_eq!(loaded.history.len(), 1);
    }

    #[tokio::test]
    async fn claim_grants_exclusive_lease() {
        let repo = repo().await;
        let release = sample_release("Heat");
        repo.insert(&release).await.expect("insert");
        let now = Utc::now();

        let (claimed, lease) = repo
            .claim_next("worker-a", Duration::seconds(60), now)
            .await
            .expect("claim")
            .expect("release available");
        assert_eq!(claimed.id, release.id);
        assert_eq!(lease.holder, "worker-a");

        let second = repo
            .claim_next("worker-b", Duration::seconds(60), now)
            .await
            .expect("claim");
        assert!(second.is_none());

        let busy = repo
            .try_acquire(release.id, "worker-b", Duration::seconds(60), now)
            .await
            .expect("try acquire");
        assert!(busy.is_none());
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimable() {
        let repo = repo().await;
        let release = sample_release("Ronin");
        repo.insert(&release).await.expect("insert");
        let past = Utc::now() - Duration::seconds(120);

        repo.claim_next("crashed", Duration::seconds(60), past)
            .await
            .expect("claim")
            .expect("available");

        let (_, lease) = repo
            .claim_next("survivor", Duration::seconds(60), Utc::now())
            .await
            .expect("claim")
            .expect("stale lease reclaimed");
        assert_eq!(lease.holder, "survivor");
    }

    #[tokio::test]
    async fn save_requires_live_lease_and_appends_history() {
        let repo = repo().await;
        let release = sample_release("Alien");
        repo.insert(&release).await.expect("insert");

        let (mut claimed, lease) = repo
            .claim_next("worker-a", Duration::seconds(60), Utc::now())
            .await
            .expect("claim")
            .expect("available");
        claimed
            .transition(PipelineState::Resolving, "resolving source")
            .expect("transition");
        repo.save(&lease, &claimed).await.expect("save");

        let loaded = repo.get(release.id).await.expect("get").expect("present");
        assert_eq!(loaded.state, PipelineState::Resolving);
        assert_eq!(loaded.history.len(), 2);

        let stolen = Lease {
            holder: "intruder".to_string(),
            ..lease.clone()
        };
        let err = repo.save(&stolen, &claimed).await.expect_err("not the holder");
        assert!(matches!(err, StoreError::LeaseLost(_)));
    }

    #[tokio::test]
    async fn backoff_timer_hides_release_until_due() {
        let repo = repo().await;
        let release = sample_release("Tenet");
        repo.insert(&release).await.expect("insert");

        let (mut claimed, lease) = repo
            .claim_next("worker-a", Duration::seconds(60), Utc::now())
            .await
            .expect("claim")
            .expect("available");
        claimed.schedule_retry(Utc::now() + Duration::minutes(10), "backing off");
        repo.save(&lease, &claimed).await.expect("save");
        repo.release_lease(&lease).await.expect("release");

        let none = repo
            .claim_next("worker-a", Duration::seconds(60), Utc::now())
            .await
            .expect("claim");
        assert!(none.is_none());

        assert!(repo.request_cancel(release.id).await.expect("cancel"));
        let due = repo
            .claim_next("worker-a", Duration::seconds(60), Utc::now())
            .await
            .expect("claim");
        assert!(due.is_some(), "cancellation overrides the backoff timer");
    }

    #[tokio::test]
    async fn save_never_clears_cancel_flag() {
        let repo = repo().await;
        let release = sample_release("Drive");
        repo.insert(&release).await.expect("insert");
        let (claimed, lease) = repo
            .claim_next("worker-a", Duration::seconds(60), Utc::now())
            .await
            .expect("claim")
            .expect("available");

        repo.request_cancel(release.id).await.expect("cancel");
        repo.save(&lease, &claimed).await.expect("save stale copy");
        assert!(repo.cancel_requested(release.id).await.expect("flag"));
    }

    #[tokio::test]
    async fn pending_lists_only_interventions() {
        let repo = repo().await;
        let ok = sample_release("Up");
        repo.insert(&ok).await.expect("insert");

        let mut failed = sample_release("Down");
        failed
            .fail(PipelineState::Queued, InterventionReason::ResolutionDenied, "quota")
            .expect("fail");
        repo.insert(&failed).await.expect("insert");

        let pending = repo.list_pending().await.expect("pending");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, failed.id);
        assert_eq!(
            pending[0].failure.as_ref().map(|f| f.reason),
            Some(InterventionReason::ResolutionDenied)
        );
    }

    #[tokio::test]
    async fn garbage_rows_fail_fast() {
        let repo = repo().await;
        let release = sample_release("Brazil");
        repo.insert(&release).await.expect("insert");
        sqlx::query("UPDATE releases SET tracks = 'not json' WHERE id = ?")
            .bind(release.id.to_string())
            .execute(&repo.pool)
            .await
            .expect("corrupt row");

        let err = repo.get(release.id).await.expect_err("schema invalid");
        assert!(matches!(err, StoreError::SchemaInvalid(_)));
    }

    #[tokio::test]
    async fn reclaim_clears_expired_leases() {
        let repo = repo().await;
        let release = sample_release("Memento");
        repo.insert(&release).await.expect("insert");
        let past = Utc::now() - Duration::seconds(300);
        repo.claim_next("gone", Duration::seconds(10), past)
            .await
            .expect("claim")
            .expect("available");

        let reclaimed = repo.reclaim_expired_leases(Utc::now()).await.expect("reclaim");
        assert_eq!(reclaimed, 1);
    }
}
