//! Job store: durable FIFO queue merged with the generation history.

use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use sdlib_core::{
    GeneratedImage, Job, JobFilter, JobPage, JobStatus, JobType, NewImage, NewJob,
    RepositoryError,
};

use super::{map_storage_error, now_str, parse_timestamp};

/// Extra columns written together with a status change.
#[derive(Debug, Clone, Default)]
pub struct StatusExtras {
    pub error: Option<String>,
    pub model_loading_time_ms: Option<i64>,
    pub generation_time_ms: Option<i64>,
}

/// SQLite-backed job store.
///
/// Writes are serialized by the database, so the atomic claim query is
/// the only coordination the processor needs.
#[derive(Clone)]
pub struct JobRepository {
    pool: SqlitePool,
}

impl JobRepository {
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a new job as `pending` and return the stored row.
    pub async fn enqueue(&self, new: NewJob) -> Result<Job, RepositoryError> {
        if new.model_id.is_empty() {
            return Err(RepositoryError::Serialization(
                "job requires a model id".to_string(),
            ));
        }

        let id = Uuid::new_v4();
        let now = now_str();
        let job_type = new.job_type.unwrap_or(JobType::Generate);
        let n = new.n.unwrap_or(1).max(1);

        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, type, model_id, prompt, negative_prompt, size, seed, n,
                quality, style, source_image, mask_image, strength,
                cfg_scale, sample_steps, sampling_method, clip_skip,
                status, progress, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending', 0, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(job_type.as_str())
        .bind(&new.model_id)
        .bind(&new.prompt)
        .bind(&new.negative_prompt)
        .bind(new.size.map(|s| s.to_string()))
        .bind(new.seed)
        .bind(i64::from(n))
        .bind(new.quality.map(sdlib_core::Quality::as_str))
        .bind(&new.style)
        .bind(&new.source_image)
        .bind(&new.mask_image)
        .bind(new.strength)
        .bind(new.cfg_scale)
        .bind(new.sample_steps.map(i64::from))
        .bind(&new.sampling_method)
        .bind(new.clip_skip.map(i64::from))
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(map_storage_error)?;

        self.get(id)
            .await?
            .ok_or_else(|| RepositoryError::Storage("inserted job vanished".to_string()))
    }

    /// Claim the oldest pending job: select and flip to `processing` in a
    /// single statement, so two pollers can never claim the same row.
    pub async fn claim_next_pending(&self) -> Result<Option<Job>, RepositoryError> {
        let now = now_str();
        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'processing', started_at = ?, updated_at = ?
            WHERE id = (
                SELECT id FROM jobs
                WHERE status = 'pending'
                ORDER BY created_at ASC, id ASC
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(&now)
        .bind(&now)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_storage_error)?;

        row.as_ref().map(row_to_job).transpose()
    }

    /// Update a job's status plus any terminal extras. Sets
    /// `completed_at` when the status is terminal.
    pub async fn set_status(
        &self,
        id: Uuid,
        status: JobStatus,
        extras: StatusExtras,
    ) -> Result<(), RepositoryError> {
        let now = now_str();
        let completed_at = status.is_terminal().then(|| now.clone());
        let progress_override = matches!(status, JobStatus::Completed).then_some(1.0f64);

        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                status = ?,
                error = COALESCE(?, error),
                model_loading_time_ms = COALESCE(?, model_loading_time_ms),
                generation_time_ms = COALESCE(?, generation_time_ms),
                progress = COALESCE(?, progress),
                completed_at = COALESCE(?, completed_at),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(&extras.error)
        .bind(extras.model_loading_time_ms)
        .bind(extras.generation_time_ms)
        .bind(progress_override)
        .bind(&completed_at)
        .bind(&now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(map_storage_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!("job {id}")));
        }
        Ok(())
    }

    /// Record the model startup portion of a job's wall time.
    pub async fn set_model_loading_time(
        &self,
        id: Uuid,
        millis: i64,
    ) -> Result<(), RepositoryError> {
        sqlx::query("UPDATE jobs SET model_loading_time_ms = ?, updated_at = ? WHERE id = ?")
            .bind(millis)
            .bind(now_str())
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(map_storage_error)?;
        Ok(())
    }

    /// Update a job's progress fraction.
    pub async fn set_progress(&self, id: Uuid, progress: f64) -> Result<(), RepositoryError> {
        sqlx::query("UPDATE jobs SET progress = ?, updated_at = ? WHERE id = ?")
            .bind(progress.clamp(0.0, 1.0))
            .bind(now_str())
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(map_storage_error)?;
        Ok(())
    }

    /// Persist a generated image under a job and return the stored record.
    pub async fn append_image(
        &self,
        job_id: Uuid,
        image: NewImage,
    ) -> Result<GeneratedImage, RepositoryError> {
        let now = now_str();
        let result = sqlx::query(
            r#"
            INSERT INTO generated_images (
                job_id, batch_index, mime_type, data, revised_prompt,
                width, height, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(job_id.to_string())
        .bind(i64::from(image.batch_index))
        .bind(&image.mime_type)
        .bind(&image.data)
        .bind(&image.revised_prompt)
        .bind(image.width.map(i64::from))
        .bind(image.height.map(i64::from))
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(map_storage_error)?;

        Ok(GeneratedImage {
            id: result.last_insert_rowid(),
            job_id,
            batch_index: image.batch_index,
            mime_type: image.mime_type,
            data: image.data,
            revised_prompt: image.revised_prompt,
            width: image.width,
            height: image.height,
            created_at: parse_timestamp(&now)?,
        })
    }

    /// All images for a job, ordered by batch index.
    pub async fn images_for_job(
        &self,
        job_id: Uuid,
    ) -> Result<Vec<GeneratedImage>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM generated_images WHERE job_id = ? ORDER BY batch_index ASC",
        )
        .bind(job_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(map_storage_error)?;

        rows.iter().map(row_to_image).collect()
    }

    /// Fetch one image by its record id.
    pub async fn get_image(&self, image_id: i64) -> Result<GeneratedImage, RepositoryError> {
        let row = sqlx::query("SELECT * FROM generated_images WHERE id = ?")
            .bind(image_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_storage_error)?;

        row.as_ref()
            .map(row_to_image)
            .transpose()?
            .ok_or_else(|| RepositoryError::NotFound(format!("image {image_id}")))
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Job>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_storage_error)?;

        row.as_ref().map(row_to_job).transpose()
    }

    /// List jobs newest-first, with pagination.
    pub async fn list(
        &self,
        filter: JobFilter,
        limit: u32,
        offset: u32,
    ) -> Result<JobPage, RepositoryError> {
        let limit = limit.clamp(1, 200);
        let status = filter.status.map(JobStatus::as_str);

        let total: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM jobs WHERE (? IS NULL OR status = ?)")
                .bind(status)
                .bind(status)
                .fetch_one(&self.pool)
                .await
                .map_err(map_storage_error)?;

        let rows = sqlx::query(
            r#"
            SELECT * FROM jobs
            WHERE (? IS NULL OR status = ?)
            ORDER BY created_at DESC, id DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(status)
        .bind(status)
        .bind(i64::from(limit))
        .bind(i64::from(offset))
        .fetch_all(&self.pool)
        .await
        .map_err(map_storage_error)?;

        let jobs: Vec<Job> = rows.iter().map(row_to_job).collect::<Result<_, _>>()?;

        #[allow(clippy::cast_sign_loss)]
        let total = total.0 as u64;
        Ok(JobPage {
            has_more: u64::from(offset) + (jobs.len() as u64) < total,
            jobs,
            total,
            limit,
            offset,
        })
    }

    /// Cancel a job, allowed only while it is still pending.
    pub async fn cancel(&self, id: Uuid) -> Result<Job, RepositoryError> {
        let now = now_str();
        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'cancelled', completed_at = ?, updated_at = ?
            WHERE id = ? AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(&now)
        .bind(&now)
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_storage_error)?;

        if let Some(row) = row {
            return row_to_job(&row);
        }

        match self.get(id).await? {
            Some(job) => Err(RepositoryError::Conflict(format!(
                "job {id} is {} and can no longer be cancelled",
                job.status
            ))),
            None => Err(RepositoryError::NotFound(format!("job {id}"))),
        }
    }

    pub async fn delete(&self, id: Uuid) -> Result<(), RepositoryError> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(map_storage_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!("job {id}")));
        }
        Ok(())
    }
}

fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> Result<Job, RepositoryError> {
    let id: String = row.try_get("id").map_err(map_storage_error)?;
    let job_type: String = row.try_get("type").map_err(map_storage_error)?;
    let status: String = row.try_get("status").map_err(map_storage_error)?;
    let size: Option<String> = row.try_get("size").map_err(map_storage_error)?;
    let quality: Option<String> = row.try_get("quality").map_err(map_storage_error)?;
    let created_at: String = row.try_get("created_at").map_err(map_storage_error)?;
    let updated_at: String = row.try_get("updated_at").map_err(map_storage_error)?;
    let started_at: Option<String> = row.try_get("started_at").map_err(map_storage_error)?;
    let completed_at: Option<String> = row.try_get("completed_at").map_err(map_storage_error)?;
    let n: i64 = row.try_get("n").map_err(map_storage_error)?;
    let seed: Option<i64> = row.try_get("seed").map_err(map_storage_error)?;
    let sample_steps: Option<i64> = row.try_get("sample_steps").map_err(map_storage_error)?;
    let clip_skip: Option<i64> = row.try_get("clip_skip").map_err(map_storage_error)?;

    Ok(Job {
        id: id
            .parse()
            .map_err(|e| RepositoryError::Serialization(format!("bad job id '{id}': {e}")))?,
        job_type: job_type
            .parse()
            .map_err(RepositoryError::Serialization)?,
        model_id: row.try_get("model_id").map_err(map_storage_error)?,
        prompt: row.try_get("prompt").map_err(map_storage_error)?,
        negative_prompt: row.try_get("negative_prompt").map_err(map_storage_error)?,
        size: size
            .map(|s| s.parse().map_err(RepositoryError::Serialization))
            .transpose()?,
        seed,
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        n: n.max(1) as u32,
        quality: quality
            .map(|q| q.parse().map_err(RepositoryError::Serialization))
            .transpose()?,
        style: row.try_get("style").map_err(map_storage_error)?,
        source_image: row.try_get("source_image").map_err(map_storage_error)?,
        mask_image: row.try_get("mask_image").map_err(map_storage_error)?,
        strength: row.try_get("strength").map_err(map_storage_error)?,
        cfg_scale: row.try_get("cfg_scale").map_err(map_storage_error)?,
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        sample_steps: sample_steps.map(|v| v as u32),
        sampling_method: row.try_get("sampling_method").map_err(map_storage_error)?,
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        clip_skip: clip_skip.map(|v| v as u32),
        status: status.parse().map_err(RepositoryError::Serialization)?,
        progress: row.try_get("progress").map_err(map_storage_error)?,
        error: row.try_get("error").map_err(map_storage_error)?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
        started_at: started_at.as_deref().map(parse_timestamp).transpose()?,
        completed_at: completed_at.as_deref().map(parse_timestamp).transpose()?,
        model_loading_time_ms: row
            .try_get("model_loading_time_ms")
            .map_err(map_storage_error)?,
        generation_time_ms: row
            .try_get("generation_time_ms")
            .map_err(map_storage_error)?,
    })
}

fn row_to_image(row: &sqlx::sqlite::SqliteRow) -> Result<GeneratedImage, RepositoryError> {
    let job_id: String = row.try_get("job_id").map_err(map_storage_error)?;
    let batch_index: i64 = row.try_get("batch_index").map_err(map_storage_error)?;
    let width: Option<i64> = row.try_get("width").map_err(map_storage_error)?;
    let height: Option<i64> = row.try_get("height").map_err(map_storage_error)?;
    let created_at: String = row.try_get("created_at").map_err(map_storage_error)?;

    Ok(GeneratedImage {
        id: row.try_get("id").map_err(map_storage_error)?,
        job_id: job_id
            .parse()
            .map_err(|e| RepositoryError::Serialization(format!("bad job id '{job_id}': {e}")))?,
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        batch_index: batch_index.max(0) as u32,
        mime_type: row.try_get("mime_type").map_err(map_storage_error)?,
        data: row.try_get("data").map_err(map_storage_error)?,
        revised_prompt: row.try_get("revised_prompt").map_err(map_storage_error)?,
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        width: width.map(|v| v as u32),
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        height: height.map(|v| v as u32),
        created_at: parse_timestamp(&created_at)?,
    })
}
