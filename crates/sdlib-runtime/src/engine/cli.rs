//! One-shot CLI invocations for `cli` mode engines.
//!
//! CLI engines own no state beyond their argv and the output file path:
//! the lifecycle manager never registers them.

use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::debug;

use sdlib_core::{Job, JobType};

use super::params::{quality_steps, EffectiveParams};
use super::EngineError;

/// A fully built engine command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliInvocation {
    pub program: String,
    pub args: Vec<String>,
}

impl CliInvocation {
    /// Whether the argv carries a flag (exact match).
    pub fn has_flag(&self, flag: &str) -> bool {
        self.args.iter().any(|a| a == flag)
    }

    /// Value following a flag, when present.
    pub fn flag_value(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(String::as_str)
    }
}

/// Build the argv for a one-shot engine run.
///
/// `--steps` resolution: the effective `sample_steps` when present, else
/// the quality mapping when the job carries a quality hint, else no flag
/// at all. At most one `--steps` ever appears, even if the descriptor's
/// base args already carry one.
pub fn build_cli_invocation(
    command: &str,
    base_args: &[String],
    job: &Job,
    params: &EffectiveParams,
    output_path: &Path,
) -> CliInvocation {
    let mut args: Vec<String> = base_args.to_vec();
    let base_has_steps = args.iter().any(|a| a == "--steps");

    if !job.prompt.is_empty() {
        args.push("--prompt".into());
        args.push(job.prompt.clone());
    }
    if let Some(negative) = &job.negative_prompt {
        args.push("--negative-prompt".into());
        args.push(negative.clone());
    }
    if let Some(size) = params.size {
        args.push("--width".into());
        args.push(size.width.to_string());
        args.push("--height".into());
        args.push(size.height.to_string());
    }
    if let Some(seed) = job.seed {
        args.push("--seed".into());
        args.push(seed.to_string());
    }

    if !base_has_steps {
        let steps = params
            .sample_steps
            .or_else(|| job.quality.map(quality_steps));
        if let Some(steps) = steps {
            args.push("--steps".into());
            args.push(steps.to_string());
        }
    }

    if job.job_type == JobType::Variation {
        if let Some(strength) = params.strength {
            args.push("--strength".into());
            args.push(strength.to_string());
        }
    }

    if let Some(source) = &job.source_image {
        args.push("--init-img".into());
        args.push(source.clone());
    }
    if let Some(mask) = &job.mask_image {
        args.push("--mask".into());
        args.push(mask.clone());
    }

    args.push("--output".into());
    args.push(output_path.to_string_lossy().into_owned());

    CliInvocation {
        program: command.to_string(),
        args,
    }
}

/// Run a one-shot invocation and return the path of the produced image.
///
/// The engine is expected to write to the `--output` path; if it reports
/// a different existing path on stdout, that path wins.
pub async fn run_cli_invocation(
    invocation: &CliInvocation,
    expected_output: &Path,
) -> Result<PathBuf, EngineError> {
    debug!(program = %invocation.program, args = ?invocation.args, "running cli engine");

    let output = Command::new(&invocation.program)
        .args(&invocation.args)
        .output()
        .await?;

    if !output.status.success() {
        return Err(EngineError::CliExit {
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    if let Some(reported) = parse_output_path(&stdout) {
        if reported.exists() {
            return Ok(reported);
        }
    }

    if expected_output.exists() {
        return Ok(expected_output.to_path_buf());
    }

    Err(EngineError::CliOutputUnparseable)
}

/// Scan engine stdout for a path-looking token that exists on disk.
fn parse_output_path(stdout: &str) -> Option<PathBuf> {
    stdout
        .split_whitespace()
        .map(|token| token.trim_matches(|c: char| c == '"' || c == '\'' || c == ':'))
        .filter(|token| token.contains(std::path::MAIN_SEPARATOR))
        .map(PathBuf::from)
        .find(|path| path.is_absolute())
}
