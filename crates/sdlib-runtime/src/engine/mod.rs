//! Engine dispatch: HTTP clients for `server` mode, one-shot invocations
//! for `cli` mode, and the shared effective-parameter merge.

mod cli;
mod http;
mod params;

use thiserror::Error;

pub use cli::{build_cli_invocation, run_cli_invocation, CliInvocation};
pub use http::{EngineHttpClient, EngineImage};
pub use params::{effective_params, prompt_with_extra_args, quality_steps, EffectiveParams};

/// Errors from talking to an inference engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine returned status {status}: {body}")]
    Http { status: u16, body: String },

    #[error("engine returned an unusable response: {0}")]
    BadResponse(String),

    #[error("engine exited with {code:?}: {stderr}")]
    CliExit { code: Option<i32>, stderr: String },

    #[error("could not locate an output image in the engine output")]
    CliOutputUnparseable,

    #[error("engine request failed: {0}")]
    Request(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        Self::Request(err.to_string())
    }
}

impl From<EngineError> for sdlib_core::JobError {
    fn from(err: EngineError) -> Self {
        Self::Engine(err.to_string())
    }
}
