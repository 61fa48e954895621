//! SQLite-backed Job Store.
//!
//! Jobs survive a server restart here, which lets a client keep polling an id
//! it received before the restart. Workers do not survive it, so the server
//! marks interrupted jobs failed on startup (see [`SqliteJobStore::fail_interrupted`]).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Builder, Connection, Row, params};
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::job::{
    ArtifactLocation, ConversionJob, JobId, JobState, JobStatus, UNKNOWN_FAILURE, WorkerEvent,
};
use crate::source::SourceUrl;
use crate::store::JobStore;

const JOB_COLUMNS: &str = "id, source_url, status, progress, title, artifact_kind, \
                           artifact_ref, error_detail, created_at, updated_at";

const INTERRUPTED_DETAIL: &str = "server restarted before the conversion finished";

async fn configure_connection(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        "#,
    )
    .await?;
    Ok(())
}

async fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id TEXT PRIMARY KEY,
            source_url TEXT NOT NULL,
            status TEXT NOT NULL,
            progress INTEGER NOT NULL DEFAULT 0,
            title TEXT,
            artifact_kind TEXT,
            artifact_ref TEXT,
            error_detail TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_jobs_status_updated ON jobs(status, updated_at);
        "#,
    )
    .await?;
    Ok(())
}

pub struct SqliteJobStore {
    conn: Connection,
    // Serializes writers so `apply` stays a single read-modify-write.
    write_lock: Mutex<()>,
}

impl SqliteJobStore {
    /// Opens (and if necessary creates) the job database.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating job store directory {}", parent.display()))?;
        }

        let db = Builder::new_local(path)
            .build()
            .await
            .with_context(|| format!("opening job DB {}", path.display()))?;
        let conn = db.connect()?;
        configure_connection(&conn).await?;
        ensure_schema(&conn).await?;

        Ok(Self {
            conn,
            write_lock: Mutex::new(()),
        })
    }

    /// Fails every job that was still pending or processing. Called once at
    /// startup, before any worker of this process exists.
    pub async fn fail_interrupted(&self) -> Result<u64, StoreError> {
        let _guard = self.write_lock.lock().await;
        let changed = self
            .conn
            .execute(
                r#"
                UPDATE jobs
                SET status = 'failed', error_detail = ?1, updated_at = ?2
                WHERE status IN ('pending', 'processing')
                "#,
                params![INTERRUPTED_DETAIL, timestamp(Utc::now())],
            )
            .await?;
        Ok(changed)
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn insert(&self, job: ConversionJob) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let row = JobRow::from_job(&job);
        let inserted = self
            .conn
            .execute(
                r#"
                INSERT INTO jobs (
                    id, source_url, status, progress, title, artifact_kind,
                    artifact_ref, error_detail, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                ON CONFLICT(id) DO NOTHING
                "#,
                params![
                    row.id,
                    row.source_url,
                    row.status,
                    row.progress,
                    row.title.as_deref(),
                    row.artifact_kind,
                    row.artifact_ref.as_deref(),
                    row.error_detail.as_deref(),
                    row.created_at,
                    row.updated_at,
                ],
            )
            .await?;
        if inserted == 0 {
            return Err(StoreError::Duplicate(job.id().clone()));
        }
        Ok(())
    }

    async fn get(&self, id: &JobId) -> Result<Option<ConversionJob>, StoreError> {
        fetch_job(&self.conn, id).await
    }

    async fn apply(&self, id: &JobId, event: WorkerEvent) -> Result<ConversionJob, StoreError> {
        let _guard = self.write_lock.lock().await;
        let tx = self.conn.transaction().await?;

        let Some(mut job) = fetch_job(&tx, id).await? else {
            tx.rollback().await?;
            return Err(StoreError::Missing(id.clone()));
        };
        if let Err(err) = job.apply(event) {
            tx.rollback().await?;
            return Err(err.into());
        }

        let row = JobRow::from_job(&job);
        tx.execute(
            r#"
            UPDATE jobs
            SET status = ?2, progress = ?3, title = ?4, artifact_kind = ?5,
                artifact_ref = ?6, error_detail = ?7, updated_at = ?8
            WHERE id = ?1
            "#,
            params![
                row.id,
                row.status,
                row.progress,
                row.title.as_deref(),
                row.artifact_kind,
                row.artifact_ref.as_deref(),
                row.error_detail.as_deref(),
                row.updated_at,
            ],
        )
        .await?;
        tx.commit().await?;
        Ok(job)
    }

    async fn remove_finished_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ConversionJob>, StoreError> {
        let _guard = self.write_lock.lock().await;
        let cutoff = timestamp(cutoff);
        let tx = self.conn.transaction().await?;

        let mut rows = tx
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs \
                     WHERE status IN ('completed', 'failed') AND updated_at < ?1"
                ),
                params![cutoff.as_str()],
            )
            .await?;
        let mut removed = Vec::new();
        while let Some(row) = rows.next().await? {
            match row_to_job(&row) {
                Ok(job) => removed.push(job),
                Err(err) => tracing::warn!(error = %err, "dropping unreadable job row"),
            }
        }
        drop(rows);

        tx.execute(
            "DELETE FROM jobs WHERE status IN ('completed', 'failed') AND updated_at < ?1",
            params![cutoff.as_str()],
        )
        .await?;
        tx.commit().await?;
        Ok(removed)
    }
}

async fn fetch_job(conn: &Connection, id: &JobId) -> Result<Option<ConversionJob>, StoreError> {
    let mut rows = conn
        .query(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
            params![id.as_str()],
        )
        .await?;
    let Some(row) = rows.next().await? else {
        return Ok(None);
    };
    row_to_job(&row).map(Some)
}

/// Column values for one job, in the shape SQLite stores them.
struct JobRow {
    id: String,
    source_url: String,
    status: &'static str,
    progress: i64,
    title: Option<String>,
    artifact_kind: Option<&'static str>,
    artifact_ref: Option<String>,
    error_detail: Option<String>,
    created_at: String,
    updated_at: String,
}

impl JobRow {
    fn from_job(job: &ConversionJob) -> Self {
        let (artifact_kind, artifact_ref) = match job.artifact() {
            Some(ArtifactLocation::File(path)) => {
                (Some("file"), Some(path.to_string_lossy().into_owned()))
            }
            Some(ArtifactLocation::Remote(url)) => (Some("remote"), Some(url.clone())),
            None => (None, None),
        };
        Self {
            id: job.id().as_str().to_string(),
            source_url: job.source().as_str().to_string(),
            status: job.status().as_str(),
            progress: i64::from(job.progress()),
            title: job.title().map(str::to_string),
            artifact_kind,
            artifact_ref,
            error_detail: job.error_detail().map(str::to_string),
            created_at: timestamp(job.created_at()),
            updated_at: timestamp(job.updated_at()),
        }
    }
}

fn row_to_job(row: &Row) -> Result<ConversionJob, StoreError> {
    let raw_id: String = row.get(0)?;
    let corrupt = |reason: String| StoreError::Corrupt {
        id: raw_id.clone(),
        reason,
    };

    let id = JobId::parse(&raw_id).ok_or_else(|| corrupt("invalid id".into()))?;
    let source_url: String = row.get(1)?;
    let source = SourceUrl::parse(&source_url).map_err(|err| corrupt(err.to_string()))?;
    let status_raw: String = row.get(2)?;
    let status =
        JobStatus::parse(&status_raw).ok_or_else(|| corrupt(format!("status `{status_raw}`")))?;
    let progress: i64 = row.get(3)?;
    let title: Option<String> = row.get(4)?;
    let artifact_kind: Option<String> = row.get(5)?;
    let artifact_ref: Option<String> = row.get(6)?;
    let error_detail: Option<String> = row.get(7)?;
    let created_raw: String = row.get(8)?;
    let updated_raw: String = row.get(9)?;

    let state = match status {
        JobStatus::Pending => JobState::Pending,
        JobStatus::Processing => JobState::Processing,
        JobStatus::Completed => {
            let artifact = match (artifact_kind.as_deref(), artifact_ref) {
                (Some("file"), Some(path)) => ArtifactLocation::File(PathBuf::from(path)),
                (Some("remote"), Some(url)) => ArtifactLocation::Remote(url),
                _ => return Err(corrupt("completed job without artifact".into())),
            };
            JobState::Completed { artifact }
        }
        JobStatus::Failed => JobState::Failed {
            detail: error_detail.unwrap_or_else(|| UNKNOWN_FAILURE.to_string()),
        },
    };

    let created_at = parse_timestamp(&created_raw).map_err(&corrupt)?;
    let updated_at = parse_timestamp(&updated_raw).map_err(&corrupt)?;

    Ok(ConversionJob::restore(
        id,
        source,
        state,
        progress.clamp(0, 100) as u8,
        title,
        created_at,
        updated_at,
    ))
}

// Fixed-width UTC timestamps compare correctly as plain strings.
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|err| format!("timestamp `{raw}`: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, SubsecRound};
    use tempfile::tempdir;

    fn job(id: &str) -> ConversionJob {
        ConversionJob::new(
            JobId::parse(id).unwrap(),
            SourceUrl::parse("https://youtu.be/dQw4w9WgXcQ").unwrap(),
        )
    }

    fn id(value: &str) -> JobId {
        JobId::parse(value).unwrap()
    }

    async fn open_store() -> Result<(tempfile::TempDir, SqliteJobStore, PathBuf)> {
        let dir = tempdir()?;
        let path = dir.path().join("jobs/jobs.db");
        let store = SqliteJobStore::open(&path).await?;
        Ok((dir, store, path))
    }

    #[tokio::test]
    async fn opens_store_and_creates_schema() -> Result<()> {
        let (_temp, store, path) = open_store().await?;
        assert!(path.exists(), "database file should be created");

        let mut rows = store
            .conn
            .query(
                "SELECT name FROM sqlite_master WHERE type='table' AND name='jobs'",
                params![],
            )
            .await?;
        assert!(rows.next().await?.is_some(), "jobs table should exist");
        Ok(())
    }

    #[tokio::test]
    async fn stores_and_reads_back_jobs() -> Result<()> {
        let (_temp, store, _path) = open_store().await?;
        let original = job("j1");
        store.insert(original.clone()).await?;

        let loaded = store.get(&id("j1")).await?.context("job should exist")?;
        assert_eq!(loaded.id(), original.id());
        assert_eq!(loaded.status(), JobStatus::Pending);
        assert_eq!(loaded.source().video_id(), "dQw4w9WgXcQ");
        assert_eq!(
            loaded.created_at(),
            original.created_at().trunc_subsecs(6)
        );
        assert!(store.get(&id("missing")).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_insert_is_rejected() -> Result<()> {
        let (_temp, store, _path) = open_store().await?;
        store.insert(job("j1")).await?;
        let err = store.insert(job("j1")).await.unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(_)));
        Ok(())
    }

    #[tokio::test]
    async fn applied_events_survive_reopen() -> Result<()> {
        let (_temp, store, path) = open_store().await?;
        store.insert(job("j1")).await?;
        store.apply(&id("j1"), WorkerEvent::Progress(42)).await?;
        store
            .apply(&id("j1"), WorkerEvent::Title("Sample Track".into()))
            .await?;
        store
            .apply(
                &id("j1"),
                WorkerEvent::Completed {
                    artifact: ArtifactLocation::File(PathBuf::from("/data/j1.mp3")),
                    title: None,
                },
            )
            .await?;
        drop(store);

        let reopened = SqliteJobStore::open(&path).await?;
        let loaded = reopened.get(&id("j1")).await?.context("job should exist")?;
        assert_eq!(loaded.status(), JobStatus::Completed);
        assert_eq!(loaded.progress(), 100);
        assert_eq!(loaded.title(), Some("Sample Track"));
        assert_eq!(
            loaded.artifact(),
            Some(&ArtifactLocation::File(PathBuf::from("/data/j1.mp3")))
        );
        Ok(())
    }

    #[tokio::test]
    async fn terminal_rows_reject_events_without_changes() -> Result<()> {
        let (_temp, store, _path) = open_store().await?;
        store.insert(job("j1")).await?;
        store
            .apply(&id("j1"), WorkerEvent::Failed("no formats".into()))
            .await?;

        let err = store
            .apply(&id("j1"), WorkerEvent::Progress(80))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Transition(_)));

        let loaded = store.get(&id("j1")).await?.context("job should exist")?;
        assert_eq!(loaded.error_detail(), Some("no formats"));
        assert_eq!(loaded.progress(), 0);

        // The rolled back transaction must not block later writers.
        store.insert(job("j2")).await?;
        Ok(())
    }

    #[tokio::test]
    async fn missing_job_apply_fails() -> Result<()> {
        let (_temp, store, _path) = open_store().await?;
        let err = store
            .apply(&id("ghost"), WorkerEvent::Started)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Missing(_)));
        Ok(())
    }

    #[tokio::test]
    async fn purge_removes_only_expired_terminal_jobs() -> Result<()> {
        let (_temp, store, _path) = open_store().await?;
        store.insert(job("done")).await?;
        store.insert(job("busy")).await?;
        store.apply(&id("done"), WorkerEvent::Started).await?;
        store
            .apply(
                &id("done"),
                WorkerEvent::Completed {
                    artifact: ArtifactLocation::Remote("https://cdn.test/a.mp3".into()),
                    title: Some("Done".into()),
                },
            )
            .await?;
        store.apply(&id("busy"), WorkerEvent::Started).await?;

        let kept = store
            .remove_finished_before(Utc::now() - Duration::hours(1))
            .await?;
        assert!(kept.is_empty());

        let removed = store
            .remove_finished_before(Utc::now() + Duration::seconds(1))
            .await?;
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id().as_str(), "done");
        assert!(store.get(&id("done")).await?.is_none());
        assert!(store.get(&id("busy")).await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn interrupted_jobs_are_failed_on_startup() -> Result<()> {
        let (_temp, store, _path) = open_store().await?;
        store.insert(job("queued")).await?;
        store.insert(job("running")).await?;
        store.apply(&id("running"), WorkerEvent::Progress(10)).await?;

        assert_eq!(store.fail_interrupted().await?, 2);
        let loaded = store
            .get(&id("running"))
            .await?
            .context("job should exist")?;
        assert_eq!(loaded.status(), JobStatus::Failed);
        assert_eq!(loaded.error_detail(), Some(INTERRUPTED_DETAIL));
        Ok(())
    }

    #[test]
    fn timestamps_sort_lexicographically() {
        let early = Utc::now();
        let late = early + Duration::milliseconds(5);
        assert!(timestamp(early) < timestamp(late));
        assert_eq!(
            parse_timestamp(&timestamp(early)).unwrap(),
            early.trunc_subsecs(6)
        );
    }
}
