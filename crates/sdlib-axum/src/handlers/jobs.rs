//! Job submission, listing, and cancellation.
//!
//! Submission bodies are JSON, or multipart form-data when the client
//! uploads a source image for edit/variation/upscale. Uploaded files
//! land in the uploads directory and jobs reference them by path.

use axum::extract::{FromRequest, Multipart, Path, Query, Request, State};
use axum::http::header::CONTENT_TYPE;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use sdlib_core::{
    AppEvent, GeneratedImage, ImageSize, Job, JobFilter, JobStatus, JobType, NewJob, Quality,
};

use crate::error::HttpError;
use crate::state::AppState;

/// Submission body, shared by all job endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct JobRequest {
    pub model: Option<String>,
    pub prompt: Option<String>,
    pub negative_prompt: Option<String>,
    /// `WIDTHxHEIGHT`, e.g. `"512x512"`.
    pub size: Option<String>,
    pub seed: Option<i64>,
    pub n: Option<u32>,
    pub quality: Option<String>,
    pub style: Option<String>,
    /// Server-local path of the source image (JSON bodies); multipart
    /// uploads fill this in after saving the file.
    pub image: Option<String>,
    pub mask: Option<String>,
    pub strength: Option<f64>,
    pub cfg_scale: Option<f64>,
    pub sample_steps: Option<u32>,
    pub sampling_method: Option<String>,
    pub clip_skip: Option<u32>,
}

/// Response for accepted submissions.
#[derive(Debug, Serialize)]
pub struct JobAccepted {
    pub job_id: Uuid,
    pub status: JobStatus,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
    pub status: Option<String>,
}

const fn default_limit() -> u32 {
    20
}

#[derive(Serialize)]
pub struct Pagination {
    pub total: u64,
    pub limit: u32,
    pub offset: u32,
    #[serde(rename = "hasMore")]
    pub has_more: bool,
}

#[derive(Serialize)]
pub struct JobListResponse {
    pub jobs: Vec<Job>,
    pub pagination: Pagination,
}

/// Image metadata exposed over the API; binaries are fetched from `url`.
#[derive(Serialize)]
pub struct ImageMeta {
    pub id: i64,
    #[serde(rename = "jobId")]
    pub job_id: Uuid,
    #[serde(rename = "batchIndex")]
    pub batch_index: u32,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    pub url: String,
    #[serde(rename = "revisedPrompt", skip_serializing_if = "Option::is_none")]
    pub revised_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

impl From<GeneratedImage> for ImageMeta {
    fn from(image: GeneratedImage) -> Self {
        Self {
            url: image.url(),
            id: image.id,
            job_id: image.job_id,
            batch_index: image.batch_index,
            mime_type: image.mime_type,
            revised_prompt: image.revised_prompt,
            width: image.width,
            height: image.height,
        }
    }
}

/// `POST /jobs/generate` (JSON only).
pub async fn generate(
    State(state): State<AppState>,
    Json(req): Json<JobRequest>,
) -> Result<Json<JobAccepted>, HttpError> {
    submit(&state, req, JobType::Generate).await
}

/// `POST /jobs/edit` (JSON or multipart).
pub async fn edit(
    State(state): State<AppState>,
    req: Request,
) -> Result<Json<JobAccepted>, HttpError> {
    let body = extract_job_request(&state, req).await?;
    submit(&state, body, JobType::Edit).await
}

/// `POST /jobs/variation` (JSON or multipart).
pub async fn variation(
    State(state): State<AppState>,
    req: Request,
) -> Result<Json<JobAccepted>, HttpError> {
    let body = extract_job_request(&state, req).await?;
    submit(&state, body, JobType::Variation).await
}

/// `POST /jobs/upscale` (JSON or multipart).
pub async fn upscale(
    State(state): State<AppState>,
    req: Request,
) -> Result<Json<JobAccepted>, HttpError> {
    let body = extract_job_request(&state, req).await?;
    submit(&state, body, JobType::Upscale).await
}

/// `GET /jobs` with pagination and optional status filter.
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<JobListResponse>, HttpError> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<JobStatus>)
        .transpose()
        .map_err(HttpError::BadRequest)?;

    let page = state
        .jobs
        .list(JobFilter { status }, query.limit, query.offset)
        .await?;

    Ok(Json(JobListResponse {
        pagination: Pagination {
            total: page.total,
            limit: page.limit,
            offset: page.offset,
            has_more: page.has_more,
        },
        jobs: page.jobs,
    }))
}

/// `GET /jobs/{id}`.
pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>, HttpError> {
    fetch_job(&state, id).await.map(Json)
}

/// `DELETE /jobs/{id}`: cancel while still pending.
pub async fn cancel(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>, HttpError> {
    let job = state.jobs.cancel(id).await?;
    state.bus.publish(&AppEvent::JobCancelled { job_id: id });
    Ok(Json(job))
}

/// `GET /generations/{id}`: a completed job is its own generation record.
pub async fn generation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>, HttpError> {
    fetch_job(&state, id).await.map(Json)
}

/// `GET /generations/{id}/images`.
pub async fn generation_images(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<ImageMeta>>, HttpError> {
    fetch_job(&state, id).await?;
    let images = state.jobs.images_for_job(id).await?;
    Ok(Json(images.into_iter().map(ImageMeta::from).collect()))
}

async fn fetch_job(state: &AppState, id: Uuid) -> Result<Job, HttpError> {
    state
        .jobs
        .get(id)
        .await?
        .ok_or_else(|| HttpError::NotFound(format!("job {id}")))
}

/// Shared submission path: validate, enqueue, announce.
async fn submit(
    state: &AppState,
    req: JobRequest,
    job_type: JobType,
) -> Result<Json<JobAccepted>, HttpError> {
    let model = req
        .model
        .filter(|m| !m.is_empty())
        .ok_or_else(|| HttpError::BadRequest("model is required".to_string()))?;
    if state.manager.get(&model).is_none() {
        return Err(HttpError::NotFound(format!("model {model}")));
    }

    let prompt = req.prompt.unwrap_or_default();
    if job_type != JobType::Upscale && prompt.trim().is_empty() {
        return Err(HttpError::BadRequest("prompt is required".to_string()));
    }
    if matches!(
        job_type,
        JobType::Edit | JobType::Variation | JobType::Upscale
    ) && req.image.is_none()
    {
        return Err(HttpError::BadRequest(format!(
            "{job_type} requires a source image"
        )));
    }
    if let Some(strength) = req.strength {
        if !(0.0..=1.0).contains(&strength) {
            return Err(HttpError::BadRequest(
                "strength must be within [0, 1]".to_string(),
            ));
        }
    }

    let size = req
        .size
        .as_deref()
        .map(str::parse::<ImageSize>)
        .transpose()
        .map_err(HttpError::BadRequest)?;
    let quality = req
        .quality
        .as_deref()
        .map(str::parse::<Quality>)
        .transpose()
        .map_err(HttpError::BadRequest)?;

    let job = state
        .jobs
        .enqueue(NewJob {
            job_type: Some(job_type),
            model_id: model,
            prompt,
            negative_prompt: req.negative_prompt,
            size,
            seed: req.seed,
            n: req.n,
            quality,
            style: req.style,
            source_image: req.image,
            mask_image: req.mask,
            strength: req.strength,
            cfg_scale: req.cfg_scale,
            sample_steps: req.sample_steps,
            sampling_method: req.sampling_method,
            clip_skip: req.clip_skip,
        })
        .await?;

    state.bus.publish(&AppEvent::JobQueued {
        job_id: job.id,
        job_type: job.job_type,
        model_id: job.model_id.clone(),
    });

    Ok(Json(JobAccepted {
        job_id: job.id,
        status: job.status,
    }))
}

/// Read a submission from either a JSON body or a multipart form.
async fn extract_job_request(state: &AppState, req: Request) -> Result<JobRequest, HttpError> {
    let is_multipart = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("multipart/form-data"));

    if !is_multipart {
        let Json(body) = Json::<JobRequest>::from_request(req, &())
            .await
            .map_err(|e| HttpError::BadRequest(e.to_string()))?;
        return Ok(body);
    }

    let mut multipart = Multipart::from_request(req, &())
        .await
        .map_err(|e| HttpError::BadRequest(e.to_string()))?;

    let mut fields = serde_json::Map::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| HttpError::BadRequest(e.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "image" | "mask" => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| HttpError::BadRequest(e.to_string()))?;
                if bytes.is_empty() {
                    continue;
                }
                let path = save_upload(state, &bytes).await?;
                fields.insert(name, json!(path));
            }
            _ => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| HttpError::BadRequest(e.to_string()))?;
                fields.insert(name.clone(), coerce_form_value(&name, text));
            }
        }
    }

    serde_json::from_value(serde_json::Value::Object(fields))
        .map_err(|e| HttpError::BadRequest(format!("invalid form fields: {e}")))
}

/// Multipart text fields arrive as strings; numeric job fields need to
/// be numbers for deserialization.
fn coerce_form_value(name: &str, text: String) -> serde_json::Value {
    const NUMERIC_FIELDS: &[&str] = &[
        "seed",
        "n",
        "strength",
        "cfg_scale",
        "sample_steps",
        "clip_skip",
    ];
    if NUMERIC_FIELDS.contains(&name) {
        if let Ok(int) = text.parse::<i64>() {
            return json!(int);
        }
        if let Ok(float) = text.parse::<f64>() {
            return json!(float);
        }
    }
    json!(text)
}

/// Persist an uploaded image and return its path.
async fn save_upload(state: &AppState, bytes: &[u8]) -> Result<String, HttpError> {
    let path = state.uploads_dir.join(format!("{}.png", Uuid::new_v4()));
    tokio::fs::write(&path, bytes)
        .await
        .map_err(|e| HttpError::Internal(format!("failed to store upload: {e}")))?;
    Ok(path.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_form_fields_are_coerced() {
        assert_eq!(coerce_form_value("seed", "42".into()), json!(42));
        assert_eq!(coerce_form_value("strength", "0.6".into()), json!(0.6));
        assert_eq!(coerce_form_value("prompt", "42".into()), json!("42"));
        assert_eq!(coerce_form_value("seed", "oops".into()), json!("oops"));
    }

    #[test]
    fn accepted_response_shape_is_stable() {
        let response = JobAccepted {
            job_id: Uuid::nil(),
            status: JobStatus::Pending,
        };
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["status"], "pending");
        assert!(value.get("job_id").is_some());
    }
}
