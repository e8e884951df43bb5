//! Download state persistence.
//!
//! The full file list is stored with every download record so an
//! interrupted or paused download can be resumed with range requests
//! after a restart.

use chrono::Duration;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use sdlib_core::{DownloadFile, DownloadJob, DownloadStatus, RepositoryError};

use super::{map_storage_error, now_str, parse_timestamp};

/// SQLite persistence for download jobs and their file lists.
#[derive(Clone)]
pub struct DownloadStateRepository {
    pool: SqlitePool,
}

impl DownloadStateRepository {
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or replace a download record together with its file rows.
    pub async fn upsert(&self, job: &DownloadJob) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await.map_err(map_storage_error)?;

        sqlx::query(
            r#"
            INSERT INTO downloads (
                id, repo, status, bytes_downloaded, total_bytes,
                error, created_at, started_at, completed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                bytes_downloaded = excluded.bytes_downloaded,
                total_bytes = excluded.total_bytes,
                error = excluded.error,
                started_at = excluded.started_at,
                completed_at = excluded.completed_at
            "#,
        )
        .bind(job.id.to_string())
        .bind(&job.repo)
        .bind(job.status.as_str())
        .bind(to_i64(job.bytes_downloaded))
        .bind(to_i64(job.total_bytes))
        .bind(&job.error)
        .bind(now_str())
        .bind(job.started_at.map(|t| t.to_rfc3339()))
        .bind(job.completed_at.map(|t| t.to_rfc3339()))
        .execute(&mut *tx)
        .await
        .map_err(map_storage_error)?;

        for file in &job.files {
            sqlx::query(
                r#"
                INSERT INTO download_files (
                    download_id, remote_path, destination,
                    total_bytes, downloaded_bytes, complete
                ) VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(download_id, remote_path) DO UPDATE SET
                    total_bytes = excluded.total_bytes,
                    downloaded_bytes = excluded.downloaded_bytes,
                    complete = excluded.complete
                "#,
            )
            .bind(job.id.to_string())
            .bind(&file.remote_path)
            .bind(file.destination.to_string_lossy().into_owned())
            .bind(to_i64(file.total_bytes))
            .bind(to_i64(file.downloaded_bytes))
            .bind(i64::from(file.complete))
            .execute(&mut *tx)
            .await
            .map_err(map_storage_error)?;
        }

        tx.commit().await.map_err(map_storage_error)
    }

    /// Update one file's counters plus the record aggregates.
    pub async fn update_file_progress(
        &self,
        download_id: Uuid,
        remote_path: &str,
        downloaded_bytes: u64,
        total_bytes: u64,
        complete: bool,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            UPDATE download_files
            SET downloaded_bytes = ?, total_bytes = ?, complete = ?
            WHERE download_id = ? AND remote_path = ?
            "#,
        )
        .bind(to_i64(downloaded_bytes))
        .bind(to_i64(total_bytes))
        .bind(i64::from(complete))
        .bind(download_id.to_string())
        .bind(remote_path)
        .execute(&self.pool)
        .await
        .map_err(map_storage_error)?;

        sqlx::query(
            r#"
            UPDATE downloads SET
                bytes_downloaded = (
                    SELECT COALESCE(SUM(downloaded_bytes), 0)
                    FROM download_files WHERE download_id = downloads.id
                ),
                total_bytes = (
                    SELECT COALESCE(SUM(total_bytes), 0)
                    FROM download_files WHERE download_id = downloads.id
                )
            WHERE id = ?
            "#,
        )
        .bind(download_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(map_storage_error)?;

        Ok(())
    }

    /// Move a download to a new status, recording terminal timestamps.
    pub async fn set_status(
        &self,
        id: Uuid,
        status: DownloadStatus,
        error: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let completed_at = status.is_terminal().then(now_str);
        let started_at = matches!(status, DownloadStatus::Downloading).then(now_str);

        let result = sqlx::query(
            r#"
            UPDATE downloads SET
                status = ?,
                error = COALESCE(?, error),
                started_at = COALESCE(started_at, ?),
                completed_at = COALESCE(?, completed_at)
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(error)
        .bind(started_at)
        .bind(completed_at)
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(map_storage_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!("download {id}")));
        }
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<DownloadJob>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM downloads WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_storage_error)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut job = row_to_download(&row)?;
        job.files = self.files_for(id).await?;
        Ok(Some(job))
    }

    pub async fn all(&self) -> Result<Vec<DownloadJob>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM downloads ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await
            .map_err(map_storage_error)?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut job = row_to_download(row)?;
            job.files = self.files_for(job.id).await?;
            jobs.push(job);
        }
        Ok(jobs)
    }

    pub async fn delete(&self, id: Uuid) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM downloads WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(map_storage_error)?;
        Ok(())
    }

    /// Remove terminal records older than `max_age`. Returns the number
    /// removed.
    pub async fn cleanup(&self, max_age: Duration) -> Result<u32, RepositoryError> {
        let cutoff = (chrono::Utc::now() - max_age).to_rfc3339();
        let result = sqlx::query(
            r#"
            DELETE FROM downloads
            WHERE status IN ('completed', 'failed', 'cancelled')
            AND completed_at IS NOT NULL
            AND completed_at < ?
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(map_storage_error)?;

        #[allow(clippy::cast_possible_truncation)]
        Ok(result.rows_affected() as u32)
    }

    async fn files_for(&self, id: Uuid) -> Result<Vec<DownloadFile>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM download_files WHERE download_id = ? ORDER BY id ASC",
        )
        .bind(id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(map_storage_error)?;

        rows.iter().map(row_to_file).collect()
    }
}

#[allow(clippy::cast_possible_wrap)]
const fn to_i64(v: u64) -> i64 {
    v as i64
}

#[allow(clippy::cast_sign_loss)]
const fn to_u64(v: i64) -> u64 {
    if v < 0 { 0 } else { v as u64 }
}

fn row_to_download(row: &sqlx::sqlite::SqliteRow) -> Result<DownloadJob, RepositoryError> {
    let id: String = row.try_get("id").map_err(map_storage_error)?;
    let status: String = row.try_get("status").map_err(map_storage_error)?;
    let bytes_downloaded: i64 = row.try_get("bytes_downloaded").map_err(map_storage_error)?;
    let total_bytes: i64 = row.try_get("total_bytes").map_err(map_storage_error)?;
    let started_at: Option<String> = row.try_get("started_at").map_err(map_storage_error)?;
    let completed_at: Option<String> = row.try_get("completed_at").map_err(map_storage_error)?;

    Ok(DownloadJob {
        id: id
            .parse()
            .map_err(|e| RepositoryError::Serialization(format!("bad download id '{id}': {e}")))?,
        repo: row.try_get("repo").map_err(map_storage_error)?,
        files: Vec::new(),
        status: status.parse().map_err(RepositoryError::Serialization)?,
        bytes_downloaded: to_u64(bytes_downloaded),
        total_bytes: to_u64(total_bytes),
        speed_bps: 0.0,    // Not persisted, calculated live
        eta_seconds: None, // Not persisted, calculated live
        started_at: started_at.as_deref().map(parse_timestamp).transpose()?,
        completed_at: completed_at.as_deref().map(parse_timestamp).transpose()?,
        error: row.try_get("error").map_err(map_storage_error)?,
    })
}

fn row_to_file(row: &sqlx::sqlite::SqliteRow) -> Result<DownloadFile, RepositoryError> {
    let destination: String = row.try_get("destination").map_err(map_storage_error)?;
    let total_bytes: i64 = row.try_get("total_bytes").map_err(map_storage_error)?;
    let downloaded_bytes: i64 = row.try_get("downloaded_bytes").map_err(map_storage_error)?;
    let complete: i64 = row.try_get("complete").map_err(map_storage_error)?;

    Ok(DownloadFile {
        remote_path: row.try_get("remote_path").map_err(map_storage_error)?,
        destination: destination.into(),
        total_bytes: to_u64(total_bytes),
        downloaded_bytes: to_u64(downloaded_bytes),
        complete: complete != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::setup::setup_test_database;

    async fn repo() -> DownloadStateRepository {
        DownloadStateRepository::new(setup_test_database().await.unwrap())
    }

    fn job_fixture() -> DownloadJob {
        DownloadJob::new(
            "org/model",
            vec![
                DownloadFile::new("model.safetensors", "/tmp/models/model.safetensors"),
                DownloadFile::new("vae/decoder.bin", "/tmp/models/vae/decoder.bin"),
            ],
        )
    }

    #[tokio::test]
    async fn upsert_and_get_round_trip() {
        let repo = repo().await;
        let job = job_fixture();
        repo.upsert(&job).await.unwrap();

        let stored = repo.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.repo, "org/model");
        assert_eq!(stored.files.len(), 2);
        assert_eq!(stored.status, DownloadStatus::Pending);
    }

    #[tokio::test]
    async fn file_progress_rolls_up_to_aggregates() {
        let repo = repo().await;
        let job = job_fixture();
        repo.upsert(&job).await.unwrap();

        repo.update_file_progress(job.id, "model.safetensors", 500, 1000, false)
            .await
            .unwrap();
        repo.update_file_progress(job.id, "vae/decoder.bin", 200, 200, true)
            .await
            .unwrap();

        let stored = repo.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.bytes_downloaded, 700);
        assert_eq!(stored.total_bytes, 1200);
        assert!(stored.files[1].complete);
        assert_eq!(
            stored.bytes_downloaded,
            stored.files.iter().map(|f| f.downloaded_bytes).sum::<u64>()
        );
    }

    #[tokio::test]
    async fn status_transitions_record_timestamps() {
        let repo = repo().await;
        let job = job_fixture();
        repo.upsert(&job).await.unwrap();

        repo.set_status(job.id, DownloadStatus::Downloading, None)
            .await
            .unwrap();
        let downloading = repo.get(job.id).await.unwrap().unwrap();
        assert!(downloading.started_at.is_some());
        assert!(downloading.completed_at.is_none());

        repo.set_status(job.id, DownloadStatus::Failed, Some("boom"))
            .await
            .unwrap();
        let failed = repo.get(job.id).await.unwrap().unwrap();
        assert_eq!(failed.status, DownloadStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("boom"));
        assert!(failed.completed_at.is_some());
    }

    #[tokio::test]
    async fn cleanup_removes_old_terminal_records() {
        let repo = repo().await;
        let job = job_fixture();
        repo.upsert(&job).await.unwrap();
        repo.set_status(job.id, DownloadStatus::Completed, None)
            .await
            .unwrap();

        // Fresh terminal record survives a 1-day horizon
        assert_eq!(repo.cleanup(Duration::days(1)).await.unwrap(), 0);

        // Backdate it and sweep again
        sqlx::query("UPDATE downloads SET completed_at = '2020-01-01T00:00:00+00:00' WHERE id = ?")
            .bind(job.id.to_string())
            .execute(&repo.pool)
            .await
            .unwrap();
        assert_eq!(repo.cleanup(Duration::days(1)).await.unwrap(), 1);
        assert!(repo.get(job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_cascades_to_files() {
        let repo = repo().await;
        let job = job_fixture();
        repo.upsert(&job).await.unwrap();
        repo.delete(job.id).await.unwrap();

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM download_files")
            .fetch_one(&repo.pool)
            .await
            .unwrap();
        assert_eq!(count.0, 0);
    }
}
