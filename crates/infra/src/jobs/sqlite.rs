//! Durable job store persisted in SQLite.
//!
//! Two tables: `jobs` (one row per content hash) and `job_payloads` (the raw
//! record, removed once the job completes). The database runs in WAL mode
//! with `synchronous = FULL`, so a committed transition survives power loss.
//!
//! The pool holds a single connection: every statement and transaction is
//! serialized, which makes the claim `UPDATE ... RETURNING` trivially atomic
//! and avoids `SQLITE_BUSY` upgrades between concurrent writers.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqliteConnection, SqlitePool};

use vaultline_core::{ContentHash, ConversationRecord, JobId, WorkerId};

use super::store::{InsertOutcome, JobStore, JobStoreError, apply_transition};
use super::types::{Job, JobError, JobState, QueueStats, Transition};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id             TEXT PRIMARY KEY,
        content_hash   TEXT NOT NULL UNIQUE,
        source_id      TEXT NOT NULL,
        state          TEXT NOT NULL,
        attempt_count  INTEGER NOT NULL DEFAULT 0,
        lease_owner    TEXT NULL,
        lease_expiry   INTEGER NULL,
        available_at   INTEGER NOT NULL,
        forced         INTEGER NOT NULL DEFAULT 0,
        created_at     INTEGER NOT NULL,
        updated_at     INTEGER NOT NULL,
        last_error     TEXT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs (state, available_at, created_at)",
    r#"
    CREATE TABLE IF NOT EXISTS job_payloads (
        job_id   TEXT PRIMARY KEY REFERENCES jobs (id) ON DELETE CASCADE,
        payload  TEXT NOT NULL
    )
    "#,
];

/// SQLite-backed [`JobStore`].
///
/// Cheap to clone; clones share the pool.
#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    /// Open (creating if needed) the queue database at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, JobStoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                JobStoreError::Storage(format!("failed to create {}: {e}", parent.display()))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);
        Self::connect(options).await
    }

    /// Private in-memory database; gone when the store is dropped.
    pub async fn open_in_memory() -> Result<Self, JobStoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        Self::connect(options).await
    }

    async fn connect(options: SqliteConnectOptions) -> Result<Self, JobStoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self { pool })
    }

    /// Close the pool, checkpointing the WAL.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

impl From<sqlx::Error> for JobStoreError {
    fn from(value: sqlx::Error) -> Self {
        Self::Storage(value.to_string())
    }
}

fn to_ms(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_ms(ms: i64, column: &str) -> Result<DateTime<Utc>, JobStoreError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| JobStoreError::Serialization(format!("invalid {column} in jobs: {ms}")))
}

fn row_to_job(row: &SqliteRow) -> Result<Job, JobStoreError> {
    let id_str: String = row.try_get("id")?;
    let id = JobId::from_str(&id_str)
        .map_err(|e| JobStoreError::Serialization(format!("invalid jobs.id: {e}")))?;

    let hash_str: String = row.try_get("content_hash")?;
    let content_hash = ContentHash::from_str(&hash_str)
        .map_err(|e| JobStoreError::Serialization(format!("invalid jobs.content_hash: {e}")))?;

    let state_str: String = row.try_get("state")?;
    let state = JobState::from_str(&state_str).map_err(JobStoreError::Serialization)?;

    let lease_owner = row
        .try_get::<Option<String>, _>("lease_owner")?
        .map(|s| WorkerId::from_str(&s))
        .transpose()
        .map_err(|e| JobStoreError::Serialization(format!("invalid jobs.lease_owner: {e}")))?;

    let lease_expiry = row
        .try_get::<Option<i64>, _>("lease_expiry")?
        .map(|ms| from_ms(ms, "lease_expiry"))
        .transpose()?;

    let last_error = row
        .try_get::<Option<String>, _>("last_error")?
        .map(|s| serde_json::from_str::<JobError>(&s))
        .transpose()?;

    let attempt_count: i64 = row.try_get("attempt_count")?;

    Ok(Job {
        id,
        content_hash,
        source_id: row.try_get("source_id")?,
        state,
        attempt_count: attempt_count.max(0) as u32,
        lease_owner,
        lease_expiry,
        available_at: from_ms(row.try_get("available_at")?, "available_at")?,
        forced: row.try_get::<i64, _>("forced")? != 0,
        created_at: from_ms(row.try_get("created_at")?, "created_at")?,
        updated_at: from_ms(row.try_get("updated_at")?, "updated_at")?,
        last_error,
    })
}

async fn fetch_job(conn: &mut SqliteConnection, id: JobId) -> Result<Option<Job>, JobStoreError> {
    sqlx::query("SELECT * FROM jobs WHERE id = ?1")
        .bind(id.to_string())
        .fetch_optional(&mut *conn)
        .await?
        .map(|row| row_to_job(&row))
        .transpose()
}

async fn write_job(conn: &mut SqliteConnection, job: &Job) -> Result<(), JobStoreError> {
    let last_error = job.last_error.as_ref().map(serde_json::to_string).transpose()?;
    sqlx::query(
        r#"
        UPDATE jobs
        SET state = ?2,
            attempt_count = ?3,
            lease_owner = ?4,
            lease_expiry = ?5,
            available_at = ?6,
            forced = ?7,
            updated_at = ?8,
            last_error = ?9
        WHERE id = ?1
        "#,
    )
    .bind(job.id.to_string())
    .bind(job.state.as_str())
    .bind(job.attempt_count as i64)
    .bind(job.lease_owner.map(|w| w.to_string()))
    .bind(job.lease_expiry.map(to_ms))
    .bind(to_ms(job.available_at))
    .bind(job.forced as i64)
    .bind(to_ms(job.updated_at))
    .bind(last_error)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn write_payload(
    conn: &mut SqliteConnection,
    id: JobId,
    payload: &ConversationRecord,
) -> Result<(), JobStoreError> {
    sqlx::query(
        r#"
        INSERT INTO job_payloads (job_id, payload) VALUES (?1, ?2)
        ON CONFLICT (job_id) DO UPDATE SET payload = excluded.payload
        "#,
    )
    .bind(id.to_string())
    .bind(serde_json::to_string(payload)?)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn insert(
        &self,
        job: Job,
        payload: &ConversationRecord,
    ) -> Result<InsertOutcome, JobStoreError> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO jobs (
                id, content_hash, source_id, state, attempt_count,
                lease_owner, lease_expiry, available_at, forced,
                created_at, updated_at, last_error
            )
            VALUES (?1, ?2, ?3, ?4, 0, NULL, NULL, ?5, ?6, ?7, ?8, NULL)
            ON CONFLICT (content_hash) DO NOTHING
            "#,
        )
        .bind(job.id.to_string())
        .bind(job.content_hash.as_str())
        .bind(&job.source_id)
        .bind(job.state.as_str())
        .bind(to_ms(job.available_at))
        .bind(job.forced as i64)
        .bind(to_ms(job.created_at))
        .bind(to_ms(job.updated_at))
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            let row = sqlx::query("SELECT * FROM jobs WHERE content_hash = ?1")
                .bind(job.content_hash.as_str())
                .fetch_one(&mut *tx)
                .await?;
            let existing = row_to_job(&row)?;
            tx.commit().await?;
            return Ok(InsertOutcome::Existing(existing));
        }

        write_payload(&mut tx, job.id, payload).await?;
        tx.commit().await?;
        Ok(InsertOutcome::Inserted(job))
    }

    async fn reset(
        &self,
        id: JobId,
        payload: &ConversationRecord,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        let mut tx = self.pool.begin().await?;
        let mut job = fetch_job(&mut tx, id)
            .await?
            .ok_or(JobStoreError::NotFound(id))?;
        if job.state == JobState::InProgress {
            return Err(JobStoreError::InvalidState {
                id,
                state: job.state,
            });
        }

        job.state = JobState::Pending;
        job.attempt_count = 0;
        job.forced = true;
        job.available_at = now;
        job.updated_at = now;
        job.last_error = None;
        write_job(&mut tx, &job).await?;
        write_payload(&mut tx, id, payload).await?;
        tx.commit().await?;
        Ok(job)
    }

    async fn claim(
        &self,
        worker: WorkerId,
        lease_expiry: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'in_progress',
                lease_owner = ?1,
                lease_expiry = ?2,
                updated_at = ?3
            WHERE id = (
                SELECT id FROM jobs
                WHERE state IN ('pending', 'failed') AND available_at <= ?3
                ORDER BY created_at, id
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(worker.to_string())
        .bind(to_ms(lease_expiry))
        .bind(to_ms(now))
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| row_to_job(&r)).transpose()
    }

    async fn transition(
        &self,
        id: JobId,
        worker: WorkerId,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        let complete = transition == Transition::Complete;
        let mut tx = self.pool.begin().await?;
        let mut job = fetch_job(&mut tx, id)
            .await?
            .ok_or(JobStoreError::NotFound(id))?;
        apply_transition(&mut job, worker, transition, now)?;
        write_job(&mut tx, &job).await?;
        if complete {
            sqlx::query("DELETE FROM job_payloads WHERE job_id = ?1")
                .bind(id.to_string())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(job)
    }

    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<usize, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'pending',
                lease_owner = NULL,
                lease_expiry = NULL,
                available_at = ?1,
                updated_at = ?1
            WHERE state = 'in_progress'
              AND (lease_expiry IS NULL OR lease_expiry <= ?1)
            "#,
        )
        .bind(to_ms(now))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        let mut conn = self.pool.acquire().await?;
        fetch_job(&mut conn, id).await
    }

    async fn find_by_hash(&self, hash: &ContentHash) -> Result<Option<Job>, JobStoreError> {
        sqlx::query("SELECT * FROM jobs WHERE content_hash = ?1")
            .bind(hash.as_str())
            .fetch_optional(&self.pool)
            .await?
            .map(|row| row_to_job(&row))
            .transpose()
    }

    async fn payload(&self, id: JobId) -> Result<Option<ConversationRecord>, JobStoreError> {
        let payload: Option<String> =
            sqlx::query_scalar("SELECT payload FROM job_payloads WHERE job_id = ?1")
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await?;
        Ok(payload
            .map(|p| serde_json::from_str::<ConversationRecord>(&p))
            .transpose()?)
    }

    async fn list(&self, state: JobState, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(
            "SELECT * FROM jobs WHERE state = ?1 ORDER BY updated_at, id LIMIT ?2",
        )
        .bind(state.as_str())
        .bind(limit.min(i64::MAX as usize) as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_job).collect()
    }

    async fn requeue(&self, id: JobId, now: DateTime<Utc>) -> Result<Job, JobStoreError> {
        let mut tx = self.pool.begin().await?;
        let mut job = fetch_job(&mut tx, id)
            .await?
            .ok_or(JobStoreError::NotFound(id))?;
        if job.state != JobState::Dead {
            return Err(JobStoreError::InvalidState {
                id,
                state: job.state,
            });
        }
        job.state = JobState::Pending;
        job.attempt_count = 0;
        job.available_at = now;
        job.updated_at = now;
        write_job(&mut tx, &job).await?;
        tx.commit().await?;
        Ok(job)
    }

    async fn purge(&self, cutoff: DateTime<Utc>) -> Result<usize, JobStoreError> {
        let result =
            sqlx::query("DELETE FROM jobs WHERE state IN ('done', 'dead') AND updated_at < ?1")
                .bind(to_ms(cutoff))
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn clear(&self) -> Result<usize, JobStoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM job_payloads")
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM jobs").execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(result.rows_affected() as usize)
    }

    async fn stats(&self) -> Result<QueueStats, JobStoreError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM jobs GROUP BY state")
                .fetch_all(&self.pool)
                .await?;
        let mut stats = QueueStats::default();
        for (state, count) in rows {
            let state = JobState::from_str(&state).map_err(JobStoreError::Serialization)?;
            stats.add(state, count.max(0) as usize);
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn record(n: usize) -> ConversationRecord {
        ConversationRecord::new(format!("c-{n}"), format!("sqlite topic {n}"))
            .with_message("user", format!("how durable is write {n}?"))
            .with_message("assistant", "fsync before returning")
    }

    fn job_for(n: usize, now: DateTime<Utc>) -> Job {
        Job::new(record(n).content_hash(), format!("c-{n}"), now)
    }

    #[tokio::test]
    async fn row_round_trip_preserves_fields() {
        let store = SqliteJobStore::open_in_memory().await.unwrap();
        let now = DateTime::from_timestamp_millis(Utc::now().timestamp_millis()).unwrap();
        let job = job_for(1, now).forced(true);

        store.insert(job.clone(), &record(1)).await.unwrap();
        let loaded = store.get(job.id).await.unwrap().unwrap();

        assert_eq!(loaded, job);
        assert_eq!(store.payload(job.id).await.unwrap(), Some(record(1)));
    }

    #[tokio::test]
    async fn duplicate_hash_returns_existing_job() {
        let store = SqliteJobStore::open_in_memory().await.unwrap();
        let now = Utc::now();
        let first = job_for(1, now);
        store.insert(first.clone(), &record(1)).await.unwrap();

        match store.insert(job_for(1, now), &record(1)).await.unwrap() {
            InsertOutcome::Existing(existing) => assert_eq!(existing.id, first.id),
            other => panic!("expected existing job, got {other:?}"),
        }
        assert_eq!(store.stats().await.unwrap().total(), 1);
    }

    #[tokio::test]
    async fn lease_and_error_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let now = Utc::now();
        let worker = WorkerId::new();
        let job = job_for(1, now);

        {
            let store = SqliteJobStore::open(&path).await.unwrap();
            store.insert(job.clone(), &record(1)).await.unwrap();
            store
                .claim(worker, now + ChronoDuration::seconds(60), now)
                .await
                .unwrap()
                .unwrap();
            store
                .transition(
                    job.id,
                    worker,
                    Transition::Retry {
                        error: JobError::new("embed", "connection reset", true),
                        available_at: now,
                    },
                    now,
                )
                .await
                .unwrap();
            store.close().await;
        }

        let store = SqliteJobStore::open(&path).await.unwrap();
        let loaded = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.state, JobState::Failed);
        assert_eq!(loaded.attempt_count, 1);
        assert_eq!(loaded.last_error.unwrap().stage, "embed");
        assert!(store.payload(job.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn expired_leases_are_reclaimed() {
        let store = SqliteJobStore::open_in_memory().await.unwrap();
        let now = Utc::now();
        let job = job_for(1, now);
        store.insert(job.clone(), &record(1)).await.unwrap();
        store
            .claim(WorkerId::new(), now + ChronoDuration::seconds(1), now)
            .await
            .unwrap();

        assert_eq!(store.reclaim_expired(now).await.unwrap(), 0);
        let later = now + ChronoDuration::seconds(2);
        assert_eq!(store.reclaim_expired(later).await.unwrap(), 1);

        let reclaimed = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(reclaimed.state, JobState::Pending);
        assert!(reclaimed.lease_owner.is_none());
        assert_eq!(reclaimed.attempt_count, 0);
    }

    #[tokio::test]
    async fn purge_cascades_to_payloads() {
        let store = SqliteJobStore::open_in_memory().await.unwrap();
        let then = Utc::now() - ChronoDuration::days(30);
        let worker = WorkerId::new();
        let job = job_for(1, then);
        store.insert(job.clone(), &record(1)).await.unwrap();
        store
            .claim(worker, then + ChronoDuration::seconds(5), then)
            .await
            .unwrap();
        store
            .transition(
                job.id,
                worker,
                Transition::Kill {
                    error: JobError::new("validate", "no messages", false),
                },
                then,
            )
            .await
            .unwrap();

        assert_eq!(store.purge(Utc::now()).await.unwrap(), 1);
        assert!(store.payload(job.id).await.unwrap().is_none());
        assert!(store.find_by_hash(&job.content_hash).await.unwrap().is_none());
    }
}
