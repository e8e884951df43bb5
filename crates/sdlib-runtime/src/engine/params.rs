//! Effective-parameter resolution and the side-channel prompt suffix.
//!
//! The merge rule is strict: a user-supplied value wins, else the model's
//! configured default applies, else the parameter is omitted from the
//! engine request entirely. There is no hard-coded step count anywhere.

use serde_json::json;

use sdlib_core::{GenerationDefaults, ImageSize, Job, Quality};

/// Sentinel wrapping side-channel parameters appended to the prompt.
pub const EXTRA_ARGS_OPEN: &str = "<sd_cpp_extra_args>";
pub const EXTRA_ARGS_CLOSE: &str = "</sd_cpp_extra_args>";

/// Parameters after merging job values with model defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EffectiveParams {
    pub size: Option<ImageSize>,
    pub sample_steps: Option<u32>,
    pub cfg_scale: Option<f64>,
    pub sampling_method: Option<String>,
    pub clip_skip: Option<u32>,
    pub strength: Option<f64>,
}

/// Merge job parameters with the model's generation defaults.
pub fn effective_params(job: &Job, defaults: &GenerationDefaults) -> EffectiveParams {
    EffectiveParams {
        size: job.size.or(defaults.size),
        sample_steps: job.sample_steps.or(defaults.sample_steps),
        cfg_scale: job.cfg_scale.or(defaults.cfg_scale),
        sampling_method: job
            .sampling_method
            .clone()
            .or_else(|| defaults.sampling_method.clone()),
        clip_skip: job.clip_skip,
        strength: job.effective_strength(),
    }
}

/// Step count for a quality hint, used on the CLI path only when the job
/// carries no explicit `sample_steps`.
pub const fn quality_steps(quality: Quality) -> u32 {
    match quality {
        Quality::Draft => 12,
        Quality::Standard => 25,
        Quality::High => 40,
    }
}

/// Append side-channel parameters to the prompt inside the sentinel tag.
///
/// Returns the prompt unchanged when there is nothing to pass through.
pub fn prompt_with_extra_args(prompt: &str, params: &EffectiveParams) -> String {
    let mut extra = serde_json::Map::new();
    if let Some(steps) = params.sample_steps {
        extra.insert("sample_steps".into(), json!(steps));
    }
    if let Some(cfg) = params.cfg_scale {
        extra.insert("cfg_scale".into(), json!(cfg));
    }
    if let Some(method) = &params.sampling_method {
        extra.insert("sampling_method".into(), json!(method));
    }
    if let Some(clip_skip) = params.clip_skip {
        extra.insert("clip_skip".into(), json!(clip_skip));
    }

    if extra.is_empty() {
        return prompt.to_string();
    }

    let payload = serde_json::Value::Object(extra).to_string();
    format!("{prompt}{EXTRA_ARGS_OPEN}{payload}{EXTRA_ARGS_CLOSE}")
}
