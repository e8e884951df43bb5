//! Model manager: spawning, readiness, and termination of engines.
//!
//! Descriptors come from the config document loaded at startup. Only
//! long-running `server` engines are registered; `cli` engines are
//! invoked per job by the processor and own no runtime state.

use std::time::Duration;

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sdlib_core::{
    AppEvent, EventBus, ExecMode, LoadMode, ModelDescriptor, ModelsConfig, ProcessError,
};

use crate::process::{
    wait_for_engine_ready, LogRing, ProcessRecord, ProcessRegistry, ProcessStatus,
};

/// Options for a start request.
#[derive(Debug, Clone, Copy, Default)]
pub struct StartOptions {
    /// Overrides the descriptor's startup timeout.
    pub timeout: Option<Duration>,
}

/// Externally visible status of a configured model.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ModelStatus {
    #[serde(rename = "modelId")]
    pub model_id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(rename = "uptimeMs", skip_serializing_if = "Option::is_none")]
    pub uptime_ms: Option<u64>,
}

/// Lifecycle manager for configured engines.
pub struct ModelManager {
    config: ModelsConfig,
    registry: Arc<ProcessRegistry>,
    logs: Arc<LogRing>,
    bus: Arc<EventBus>,
}

impl ModelManager {
    pub fn new(
        config: ModelsConfig,
        registry: Arc<ProcessRegistry>,
        logs: Arc<LogRing>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            config,
            registry,
            logs,
            bus,
        }
    }

    pub fn get(&self, model_id: &str) -> Option<&ModelDescriptor> {
        self.config.get(model_id)
    }

    pub fn all(&self) -> &[ModelDescriptor] {
        &self.config.models
    }

    pub fn default_model(&self) -> Option<&ModelDescriptor> {
        self.config.default_model()
    }

    /// Ids of models with a live process.
    pub fn running(&self) -> Vec<String> {
        self.registry
            .all()
            .into_iter()
            .filter(|r| {
                !matches!(r.status, ProcessStatus::Stopped | ProcessStatus::Error)
            })
            .map(|r| r.model_id)
            .collect()
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    pub fn engine_logs(&self, port: u16) -> Vec<String> {
        self.logs.lines(port)
    }

    /// Start a model's engine.
    ///
    /// `server` mode: allocates a port, spawns the child with captured
    /// stdio, registers it as `starting`, and probes readiness until the
    /// timeout. `cli` mode engines are per-job one-shots, so start just
    /// returns a stub record.
    pub async fn start(
        &self,
        model_id: &str,
        options: StartOptions,
    ) -> Result<ProcessRecord, ProcessError> {
        let desc = self
            .get(model_id)
            .ok_or_else(|| ProcessError::UnknownModel(model_id.to_string()))?;

        if desc.exec_mode == ExecMode::Cli {
            return Ok(cli_stub_record(model_id));
        }

        if let Some(record) = self.registry.get(model_id) {
            match record.status {
                ProcessStatus::Starting | ProcessStatus::Running | ProcessStatus::Stopping => {
                    return Err(ProcessError::AlreadyRunning(model_id.to_string()));
                }
                // Stale terminal record: replace it
                ProcessStatus::Stopped | ProcessStatus::Error => {
                    self.registry.unregister(model_id);
                }
            }
        }

        let port = self.registry.allocate_port(desc.port)?;
        let args = substitute_port(&desc.args, port);

        let mut cmd = Command::new(&desc.command);
        cmd.args(&args)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.registry.release_reservation(port);
                return Err(ProcessError::StartFailure {
                    model_id: model_id.to_string(),
                    reason: e.to_string(),
                });
            }
        };
        self.spawn_log_readers(&mut child, port);

        let record = match self.registry.register(model_id, child, port, ExecMode::Server) {
            Ok(record) => record,
            Err(e) => {
                self.registry.release_reservation(port);
                return Err(e);
            }
        };
        info!(model_id, port, pid = record.pid, "engine spawned");
        self.publish_state(model_id, ProcessStatus::Starting, Some(port), Some(record.pid));

        let api_url = desc
            .resolved_api_url(port)
            .unwrap_or_else(|| format!("http://127.0.0.1:{port}"));
        let timeout = resolve_timeout(desc, options);
        let cancel = self
            .registry
            .cancel_token(model_id)
            .unwrap_or_else(CancellationToken::new);

        #[allow(clippy::cast_possible_truncation)]
        let timeout_ms = timeout.as_millis() as u64;
        if wait_for_engine_ready(&api_url, timeout, &cancel).await {
            self.registry.heartbeat(model_id);
            let record = self
                .registry
                .get(model_id)
                .ok_or_else(|| ProcessError::Crashed(format!("{model_id} vanished during startup")))?;
            info!(model_id, port, "engine is ready");
            self.publish_state(model_id, ProcessStatus::Running, Some(port), Some(record.pid));
            Ok(record)
        } else {
            warn!(model_id, port, timeout_ms, "engine startup timed out");
            let _ = self.registry.kill(model_id).await;
            self.publish_state(model_id, ProcessStatus::Error, Some(port), None);
            Err(ProcessError::StartupTimeout {
                model_id: model_id.to_string(),
                timeout_ms,
            })
        }
    }

    /// Kill and unregister a model's engine. Returns whether a process
    /// was actually stopped.
    pub async fn stop(&self, model_id: &str) -> Result<bool, ProcessError> {
        self.get(model_id)
            .ok_or_else(|| ProcessError::UnknownModel(model_id.to_string()))?;

        let stopped = self.registry.kill(model_id).await?;
        if stopped {
            info!(model_id, "engine stopped");
            self.publish_state(model_id, ProcessStatus::Stopped, None, None);
        }
        Ok(stopped)
    }

    /// Status of a configured model, `stopped` when nothing is tracked.
    pub fn status(&self, model_id: &str) -> Result<ModelStatus, ProcessError> {
        self.get(model_id)
            .ok_or_else(|| ProcessError::UnknownModel(model_id.to_string()))?;

        Ok(self.registry.get(model_id).map_or_else(
            || ModelStatus {
                model_id: model_id.to_string(),
                status: ProcessStatus::Stopped.as_str().to_string(),
                pid: None,
                port: None,
                uptime_ms: None,
            },
            |record| ModelStatus {
                model_id: model_id.to_string(),
                status: record.status.as_str().to_string(),
                pid: Some(record.pid),
                port: Some(record.port),
                uptime_ms: Some(record.uptime_ms()),
            },
        ))
    }

    /// Make sure a `server` engine is running and return its API URL.
    /// Returns `None` for `cli` engines, which are invoked per job.
    pub async fn ensure_running(
        &self,
        model_id: &str,
        options: StartOptions,
    ) -> Result<Option<String>, ProcessError> {
        let desc = self
            .get(model_id)
            .ok_or_else(|| ProcessError::UnknownModel(model_id.to_string()))?;

        if desc.exec_mode == ExecMode::Cli {
            return Ok(None);
        }

        if let Some(record) = self.registry.get(model_id) {
            match record.status {
                ProcessStatus::Running => {
                    return Ok(desc.resolved_api_url(record.port));
                }
                ProcessStatus::Starting => {
                    // Someone else is starting it; wait for readiness
                    let api_url = desc
                        .resolved_api_url(record.port)
                        .unwrap_or_else(|| format!("http://127.0.0.1:{}", record.port));
                    let timeout = resolve_timeout(desc, options);
                    #[allow(clippy::cast_possible_truncation)]
                    let timeout_ms = timeout.as_millis() as u64;
                    let cancel = self
                        .registry
                        .cancel_token(model_id)
                        .unwrap_or_else(CancellationToken::new);
                    if wait_for_engine_ready(&api_url, timeout, &cancel).await {
                        self.registry.heartbeat(model_id);
                        return Ok(Some(api_url));
                    }
                    return Err(ProcessError::StartupTimeout {
                        model_id: model_id.to_string(),
                        timeout_ms,
                    });
                }
                _ => {
                    self.registry.unregister(model_id);
                }
            }
        }

        let record = self.start(model_id, options).await?;
        Ok(desc.resolved_api_url(record.port))
    }

    /// Start every `preload` model. Failures are logged, not fatal.
    pub async fn preload(&self) {
        let preload: Vec<String> = self
            .all()
            .iter()
            .filter(|d| d.load_mode == LoadMode::Preload && d.exec_mode == ExecMode::Server)
            .map(|d| d.id.clone())
            .collect();

        for model_id in preload {
            if let Err(e) = self.start(&model_id, StartOptions::default()).await {
                warn!(model_id = %model_id, error = %e, "preload failed");
            }
        }
    }

    /// Reclaim dead processes and publish their state changes.
    pub fn cleanup_zombies(&self) {
        for record in self.registry.cleanup_zombies() {
            debug!(model_id = %record.model_id, "reclaimed dead engine");
            self.logs.clear(record.port);
            self.publish_state(&record.model_id, ProcessStatus::Stopped, None, None);
        }
    }

    /// Stop every tracked engine. Used at shutdown.
    pub async fn stop_all(&self) {
        for record in self.registry.all() {
            let _ = self.registry.kill(&record.model_id).await;
            self.publish_state(&record.model_id, ProcessStatus::Stopped, None, None);
        }
    }

    fn spawn_log_readers(&self, child: &mut tokio::process::Child, port: u16) {
        if let Some(stdout) = child.stdout.take() {
            let logs = Arc::clone(&self.logs);
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(text)) = lines.next_line().await {
                    logs.add_line(port, &text);
                }
                debug!(port, "stdout reader exiting");
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let logs = Arc::clone(&self.logs);
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(text)) = lines.next_line().await {
                    logs.add_line(port, &text);
                }
                debug!(port, "stderr reader exiting");
            });
        }
    }

    fn publish_state(
        &self,
        model_id: &str,
        status: ProcessStatus,
        port: Option<u16>,
        pid: Option<u32>,
    ) {
        self.bus.publish(&AppEvent::ModelStateChanged {
            model_id: model_id.to_string(),
            status: status.as_str().to_string(),
            port,
            pid,
        });
    }
}

/// Substitute the `{port}` placeholder in descriptor args.
fn substitute_port(args: &[String], port: u16) -> Vec<String> {
    args.iter()
        .map(|arg| arg.replace("{port}", &port.to_string()))
        .collect()
}

/// Timeout resolution: caller option, else descriptor, else default.
fn resolve_timeout(desc: &ModelDescriptor, options: StartOptions) -> Duration {
    options.timeout.unwrap_or_else(|| desc.startup_timeout())
}

/// Stub record for `cli` engines, which are never registered.
fn cli_stub_record(model_id: &str) -> ProcessRecord {
    ProcessRecord {
        model_id: model_id.to_string(),
        pid: 0,
        port: 0,
        exec_mode: ExecMode::Cli,
        status: ProcessStatus::Running,
        started_at_ms: 0,
        last_heartbeat_ms: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdlib_core::Topic;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Fixture health endpoint: answers 200 to every request.
    async fn spawn_health_fixture() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 2048];
                    let _ = socket.read(&mut buf).await;
                    let _ = socket
                        .write_all(
                            b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok",
                        )
                        .await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        addr
    }

    fn descriptor(json: serde_json::Value) -> ModelDescriptor {
        serde_json::from_value(json).unwrap()
    }

    fn manager_with(models: Vec<ModelDescriptor>) -> (ModelManager, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new());
        let manager = ModelManager::new(
            ModelsConfig {
                models,
                default_model: None,
            },
            Arc::new(ProcessRegistry::new()),
            Arc::new(LogRing::new()),
            Arc::clone(&bus),
        );
        (manager, bus)
    }

    #[tokio::test]
    async fn unknown_model_is_rejected() {
        let (manager, _bus) = manager_with(vec![]);
        assert!(matches!(
            manager.start("nope", StartOptions::default()).await,
            Err(ProcessError::UnknownModel(_))
        ));
        assert!(matches!(
            manager.status("nope"),
            Err(ProcessError::UnknownModel(_))
        ));
    }

    #[tokio::test]
    async fn cli_models_get_a_stub_and_no_registration() {
        let (manager, _bus) = manager_with(vec![descriptor(serde_json::json!({
            "id": "up4x", "name": "Upscaler", "command": "sd", "exec_mode": "cli"
        }))]);

        let record = manager.start("up4x", StartOptions::default()).await.unwrap();
        assert_eq!(record.exec_mode, ExecMode::Cli);
        assert_eq!(manager.registry().count(), 0);

        // ensure_running yields no API URL for cli engines
        let url = manager
            .ensure_running("up4x", StartOptions::default())
            .await
            .unwrap();
        assert!(url.is_none());
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn server_start_becomes_running_against_a_healthy_engine() {
        let addr = spawn_health_fixture().await;
        let (manager, bus) = manager_with(vec![descriptor(serde_json::json!({
            "id": "m1", "name": "M1", "command": "sleep", "args": ["30"],
            "api_url": format!("http://{addr}")
        }))]);
        let mut sub = bus.subscribe([Topic::Models]);

        let record = manager.start("m1", StartOptions::default()).await.unwrap();
        assert_eq!(record.status, ProcessStatus::Running);
        assert!(manager.running().contains(&"m1".to_string()));

        // starting then running, in order
        let first = sub.recv().await.unwrap();
        assert!(
            matches!(first, AppEvent::ModelStateChanged { ref status, .. } if status == "starting")
        );
        let second = sub.recv().await.unwrap();
        assert!(
            matches!(second, AppEvent::ModelStateChanged { ref status, .. } if status == "running")
        );

        // A second start is rejected while running
        assert!(matches!(
            manager.start("m1", StartOptions::default()).await,
            Err(ProcessError::AlreadyRunning(_))
        ));

        // ensure_running reuses the live process
        let url = manager
            .ensure_running("m1", StartOptions::default())
            .await
            .unwrap();
        assert_eq!(url.as_deref(), Some(format!("http://{addr}").as_str()));

        assert!(manager.stop("m1").await.unwrap());
        assert!(!manager.running().contains(&"m1".to_string()));
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn startup_timeout_kills_the_child_and_releases_the_port() {
        // Nothing answers health probes on the allocated port
        let (manager, _bus) = manager_with(vec![descriptor(serde_json::json!({
            "id": "m2", "name": "M2", "command": "sleep", "args": ["30"],
            "startup_timeout_ms": 500
        }))]);

        let started = std::time::Instant::now();
        let result = manager.start("m2", StartOptions::default()).await;

        assert!(matches!(
            result,
            Err(ProcessError::StartupTimeout { timeout_ms: 500, .. })
        ));
        // 500 ms deadline plus the SIGTERM grace window at most
        assert!(started.elapsed() < Duration::from_secs(8));
        assert_eq!(manager.registry().count(), 0, "no record remains");
        assert!(manager.registry().used_ports().is_empty(), "port released");
        assert_eq!(manager.status("m2").unwrap().status, "stopped");
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn spawn_failure_releases_the_reservation() {
        let (manager, _bus) = manager_with(vec![descriptor(serde_json::json!({
            "id": "bad", "name": "Bad", "command": "/nonexistent/engine/binary"
        }))]);

        assert!(matches!(
            manager.start("bad", StartOptions::default()).await,
            Err(ProcessError::StartFailure { .. })
        ));
        // Reservation was dropped: the next allocation can reuse the range
        assert!(manager.registry().allocate_port(None).is_ok());
    }
}
