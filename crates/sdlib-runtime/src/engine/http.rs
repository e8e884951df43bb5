//! HTTP dispatch to `server` mode engines.
//!
//! Generation endpoints accept an image-generation JSON schema and
//! return `{data: [{b64_json, revised_prompt?}]}`; upscaling goes
//! through the engine's `extra-single-image` endpoint which returns
//! `{image: base64}`.

use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use sdlib_core::{Job, JobType};

use super::params::{prompt_with_extra_args, EffectiveParams};
use super::EngineError;

/// Upscaler selection forwarded to the `extra-single-image` endpoint.
const DEFAULT_UPSCALER: &str = "R-ESRGAN 4x+";
const DEFAULT_UPSCALE_FACTOR: f64 = 2.0;

/// Decoded image returned by an engine.
#[derive(Debug, Clone)]
pub struct EngineImage {
    pub data: Vec<u8>,
    pub mime_type: String,
    pub revised_prompt: Option<String>,
}

#[derive(Deserialize)]
struct GenerationResponse {
    data: Vec<GenerationEntry>,
}

#[derive(Deserialize)]
struct GenerationEntry {
    b64_json: String,
    #[serde(default)]
    revised_prompt: Option<String>,
}

#[derive(Deserialize)]
struct UpscaleResponse {
    image: String,
}

/// HTTP client for dispatching jobs to a running engine.
pub struct EngineHttpClient {
    client: reqwest::Client,
}

impl EngineHttpClient {
    pub fn new(request_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .expect("failed to create engine HTTP client");
        Self { client }
    }

    /// Dispatch a job to the engine at `api_url` and decode the images.
    pub async fn dispatch(
        &self,
        api_url: &str,
        job: &Job,
        params: &EffectiveParams,
        source_image: Option<&[u8]>,
        mask_image: Option<&[u8]>,
    ) -> Result<Vec<EngineImage>, EngineError> {
        let endpoint = endpoint_for(job.job_type);
        let url = format!("{}{endpoint}", api_url.trim_end_matches('/'));
        let body = build_request_body(job, params, source_image, mask_image)?;

        debug!(url = %url, job_type = %job.job_type, "dispatching job to engine");
        let response = self.client.post(&url).json(&body).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Http {
                status: status.as_u16(),
                body,
            });
        }

        if job.job_type == JobType::Upscale {
            let parsed: UpscaleResponse = response
                .json()
                .await
                .map_err(|e| EngineError::BadResponse(e.to_string()))?;
            let data = BASE64
                .decode(parsed.image)
                .map_err(|e| EngineError::BadResponse(format!("bad base64 image: {e}")))?;
            return Ok(vec![EngineImage {
                data,
                mime_type: "image/png".to_string(),
                revised_prompt: None,
            }]);
        }

        let parsed: GenerationResponse = response
            .json()
            .await
            .map_err(|e| EngineError::BadResponse(e.to_string()))?;
        if parsed.data.is_empty() {
            return Err(EngineError::BadResponse(
                "engine returned no images".to_string(),
            ));
        }

        parsed
            .data
            .into_iter()
            .map(|entry| {
                let data = BASE64
                    .decode(entry.b64_json)
                    .map_err(|e| EngineError::BadResponse(format!("bad base64 image: {e}")))?;
                Ok(EngineImage {
                    data,
                    mime_type: "image/png".to_string(),
                    revised_prompt: entry.revised_prompt,
                })
            })
            .collect()
    }
}

/// Engine endpoint for a job type.
pub(crate) const fn endpoint_for(job_type: JobType) -> &'static str {
    match job_type {
        JobType::Generate => "/v1/images/generations",
        JobType::Edit => "/v1/images/edits",
        JobType::Variation => "/v1/images/variations",
        JobType::Upscale => "/sdapi/v1/extra-single-image",
    }
}

/// Build the JSON request for an engine call.
///
/// Side-channel parameters travel inside the prompt sentinel;
/// `sample_steps` is additionally sent as the engine-native `steps`
/// field.
pub(crate) fn build_request_body(
    job: &Job,
    params: &EffectiveParams,
    source_image: Option<&[u8]>,
    mask_image: Option<&[u8]>,
) -> Result<Value, EngineError> {
    if job.job_type == JobType::Upscale {
        let source = source_image.ok_or_else(|| {
            EngineError::BadResponse("upscale requires a source image".to_string())
        })?;
        return Ok(json!({
            "image": BASE64.encode(source),
            "resize_mode": 0,
            "upscaling_resize": DEFAULT_UPSCALE_FACTOR,
            "upscaler_1": DEFAULT_UPSCALER,
        }));
    }

    let mut body = serde_json::Map::new();
    body.insert(
        "prompt".into(),
        json!(prompt_with_extra_args(&job.prompt, params)),
    );
    if let Some(negative) = &job.negative_prompt {
        body.insert("negative_prompt".into(), json!(negative));
    }
    if let Some(size) = params.size {
        body.insert("width".into(), json!(size.width));
        body.insert("height".into(), json!(size.height));
    }
    body.insert("n".into(), json!(job.n));
    if let Some(seed) = job.seed {
        body.insert("seed".into(), json!(seed));
    }
    if let Some(steps) = params.sample_steps {
        body.insert("steps".into(), json!(steps));
    }
    if let Some(cfg) = params.cfg_scale {
        body.insert("cfg_scale".into(), json!(cfg));
    }
    if let Some(method) = &params.sampling_method {
        body.insert("sampler".into(), json!(method));
    }
    if matches!(job.job_type, JobType::Edit | JobType::Variation) {
        if let Some(strength) = params.strength {
            body.insert("strength".into(), json!(strength));
        }
        let source = source_image.ok_or_else(|| {
            EngineError::BadResponse(format!("{} requires a source image", job.job_type))
        })?;
        body.insert("image".into(), json!(BASE64.encode(source)));
        if let Some(mask) = mask_image {
            body.insert("mask".into(), json!(BASE64.encode(mask)));
        }
    }

    Ok(Value::Object(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sdlib_core::{ImageSize, JobStatus};
    use uuid::Uuid;

    fn job(job_type: JobType) -> Job {
        Job {
            id: Uuid::new_v4(),
            job_type,
            model_id: "m".into(),
            prompt: "a cat".into(),
            negative_prompt: Some("blurry".into()),
            size: Some(ImageSize::new(512, 512)),
            seed: Some(42),
            n: 2,
            quality: None,
            style: None,
            source_image: None,
            mask_image: None,
            strength: None,
            cfg_scale: None,
            sample_steps: None,
            sampling_method: None,
            clip_skip: None,
            status: JobStatus::Processing,
            progress: 0.0,
            error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            started_at: None,
            completed_at: None,
            model_loading_time_ms: None,
            generation_time_ms: None,
        }
    }

    #[test]
    fn endpoints_follow_job_type() {
        assert_eq!(endpoint_for(JobType::Generate), "/v1/images/generations");
        assert_eq!(endpoint_for(JobType::Edit), "/v1/images/edits");
        assert_eq!(endpoint_for(JobType::Variation), "/v1/images/variations");
        assert_eq!(
            endpoint_for(JobType::Upscale),
            "/sdapi/v1/extra-single-image"
        );
    }

    #[test]
    fn generate_body_carries_steps_and_sentinel() {
        let j = job(JobType::Generate);
        let params = EffectiveParams {
            size: j.size,
            sample_steps: Some(9),
            ..EffectiveParams::default()
        };
        let body = build_request_body(&j, &params, None, None).unwrap();

        assert_eq!(body["steps"], 9);
        assert_eq!(body["width"], 512);
        assert_eq!(body["height"], 512);
        assert_eq!(body["n"], 2);
        assert_eq!(body["seed"], 42);
        assert_eq!(body["negative_prompt"], "blurry");
        let prompt = body["prompt"].as_str().unwrap();
        assert!(prompt.contains("<sd_cpp_extra_args>"));
        assert!(prompt.contains("\"sample_steps\":9"));
    }

    #[test]
    fn absent_steps_never_materialize() {
        let j = job(JobType::Generate);
        let params = EffectiveParams {
            size: j.size,
            ..EffectiveParams::default()
        };
        let body = build_request_body(&j, &params, None, None).unwrap();
        assert!(body.get("steps").is_none());
        assert!(!body["prompt"].as_str().unwrap().contains("sample_steps"));
    }

    #[test]
    fn variation_body_includes_strength_and_image() {
        let j = job(JobType::Variation);
        let params = EffectiveParams {
            strength: Some(0.75),
            ..EffectiveParams::default()
        };
        let body = build_request_body(&j, &params, Some(&[1, 2, 3]), None).unwrap();
        assert_eq!(body["strength"], 0.75);
        assert_eq!(body["image"], BASE64.encode([1, 2, 3]));
    }

    #[test]
    fn variation_without_source_image_is_rejected() {
        let j = job(JobType::Variation);
        let result = build_request_body(&j, &EffectiveParams::default(), None, None);
        assert!(result.is_err());
    }

    #[test]
    fn upscale_body_uses_extra_single_image_schema() {
        let j = job(JobType::Upscale);
        let body =
            build_request_body(&j, &EffectiveParams::default(), Some(&[9, 9]), None).unwrap();
        assert!(body.get("prompt").is_none());
        assert!(body.get("strength").is_none());
        assert_eq!(body["resize_mode"], 0);
        assert_eq!(body["upscaler_1"], DEFAULT_UPSCALER);
        assert_eq!(body["image"], BASE64.encode([9, 9]));
    }
}
