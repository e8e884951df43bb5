//! Engine process runtime for sdlib.
//!
//! Owns everything between a persisted job and an inference engine:
//! the process registry (ports, heartbeats, zombie reclamation), the
//! model manager (spawning, readiness probing, termination), the engine
//! clients (HTTP and one-shot CLI), and the job processor loop.

pub mod engine;
pub mod manager;
pub mod process;
pub mod processor;

pub use engine::{
    build_cli_invocation, effective_params, run_cli_invocation, CliInvocation, EffectiveParams,
    EngineError, EngineHttpClient, EngineImage,
};
pub use manager::{ModelManager, ModelStatus, StartOptions};
pub use process::{
    allocate_port, is_port_available, LogRing, ProcessRecord, ProcessRegistry, ProcessStatus,
};
pub use processor::JobProcessor;
