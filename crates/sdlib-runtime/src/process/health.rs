//! Readiness probing and PID liveness checks.

use std::time::{Duration, Instant};

use sysinfo::{Pid, ProcessStatus, System};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Initial probe interval; doubles up to [`MAX_PROBE_INTERVAL`].
const INITIAL_PROBE_INTERVAL: Duration = Duration::from_millis(200);
const MAX_PROBE_INTERVAL: Duration = Duration::from_secs(1);

/// Poll an engine's health endpoint until it answers 2xx or the deadline
/// passes. Returns `false` on timeout or cancellation.
pub async fn wait_for_engine_ready(
    api_url: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> bool {
    let health_url = format!("{}/health", api_url.trim_end_matches('/'));
    let deadline = Instant::now() + timeout;
    let mut interval = INITIAL_PROBE_INTERVAL;

    let Ok(client) = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
    else {
        return false;
    };

    loop {
        if Instant::now() >= deadline {
            debug!(url = %health_url, "engine readiness deadline passed");
            return false;
        }

        tokio::select! {
            () = cancel.cancelled() => return false,
            () = sleep(interval.min(deadline.saturating_duration_since(Instant::now()))) => {}
        }

        match client.get(&health_url).send().await {
            Ok(response) if response.status().is_success() => {
                debug!(url = %health_url, "engine is ready");
                return true;
            }
            Ok(response) => {
                debug!(url = %health_url, status = %response.status(), "engine not ready yet");
            }
            Err(e) => {
                debug!(url = %health_url, error = %e, "engine health probe failed");
            }
        }

        interval = (interval * 2).min(MAX_PROBE_INTERVAL);
    }
}

/// Whether a PID still refers to a live (non-zombie) process.
pub fn pid_alive(pid: u32) -> bool {
    let mut system = System::new();
    system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[Pid::from_u32(pid)]), true);

    system.process(Pid::from_u32(pid)).is_some_and(|process| {
        matches!(
            process.status(),
            ProcessStatus::Run | ProcessStatus::Sleep | ProcessStatus::Idle
        )
    })
}
