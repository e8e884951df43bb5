//! Job processor: the single cooperative worker draining the queue.
//!
//! Exactly one job is in flight per instance. The loop wakes on a fixed
//! interval, claims the oldest pending job atomically, resolves the
//! model, ensures the engine is running, dispatches over HTTP or CLI,
//! persists the images, and records timings. Failures mark the job and
//! the loop moves on.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sdlib_core::{AppEvent, EventBus, ExecMode, Job, JobError, JobStatus, JobType, NewImage};
use sdlib_db::{JobRepository, StatusExtras};

use crate::engine::{
    build_cli_invocation, effective_params, run_cli_invocation, EngineHttpClient, EngineImage,
};
use crate::manager::{ModelManager, StartOptions};

/// Default wake interval for the poll loop.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1500);

/// Default timeout for one engine generation call.
const ENGINE_REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

/// Clears the in-flight flag on every exit path.
struct InFlightGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
            .then_some(Self { flag })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Single-writer queue worker.
pub struct JobProcessor {
    jobs: JobRepository,
    manager: Arc<ModelManager>,
    http: EngineHttpClient,
    bus: Arc<EventBus>,
    poll_interval: Duration,
    /// Scratch directory for CLI engine output files.
    work_dir: PathBuf,
    in_flight: AtomicBool,
}

impl JobProcessor {
    pub fn new(
        jobs: JobRepository,
        manager: Arc<ModelManager>,
        bus: Arc<EventBus>,
        work_dir: PathBuf,
    ) -> Self {
        Self {
            jobs,
            manager,
            http: EngineHttpClient::new(ENGINE_REQUEST_TIMEOUT),
            bus,
            poll_interval: DEFAULT_POLL_INTERVAL,
            work_dir,
            in_flight: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Run the poll loop until cancelled.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_ms = self.poll_interval.as_millis() as u64, "job processor started");
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        info!("job processor stopping");
                        return;
                    }
                    () = tokio::time::sleep(self.poll_interval) => {}
                }
                // Drain everything that is ready before sleeping again
                while self.tick().await {}
            }
        })
    }

    /// Process at most one job. Returns whether a job was claimed.
    pub async fn tick(&self) -> bool {
        let Some(_guard) = InFlightGuard::acquire(&self.in_flight) else {
            return false;
        };

        let claimed = match self.jobs.claim_next_pending().await {
            Ok(Some(job)) => job,
            Ok(None) => return false,
            Err(e) => {
                warn!(error = %e, "failed to claim next job");
                return false;
            }
        };

        let job_id = claimed.id;
        debug!(job_id = %job_id, job_type = %claimed.job_type, "claimed job");
        self.bus.publish(&AppEvent::JobStarted { job_id });

        if let Err(e) = self.process(&claimed).await {
            let message = e.to_string();
            warn!(job_id = %job_id, error = %message, "job failed");
            let extras = StatusExtras {
                error: Some(message.clone()),
                ..StatusExtras::default()
            };
            if let Err(db_err) = self.jobs.set_status(job_id, JobStatus::Failed, extras).await {
                warn!(job_id = %job_id, error = %db_err, "failed to persist job failure");
            }
            self.bus.publish(&AppEvent::JobFailed {
                job_id,
                error: message,
            });
        }
        true
    }

    async fn process(&self, job: &Job) -> Result<(), JobError> {
        let started = Instant::now();

        let desc = self
            .manager
            .get(&job.model_id)
            .cloned()
            .ok_or_else(|| JobError::UnknownModel(job.model_id.clone()))?;
        validate(job)?;

        let params = effective_params(job, &desc.generation_params);
        self.publish_progress(job.id, 0.1).await;

        // Bring the engine up; its share of the wall time is recorded
        // separately from generation.
        let load_started = Instant::now();
        let api_url = self
            .manager
            .ensure_running(&job.model_id, StartOptions::default())
            .await?;
        #[allow(clippy::cast_possible_truncation)]
        let model_loading_time_ms = load_started.elapsed().as_millis() as i64;
        self.jobs
            .set_model_loading_time(job.id, model_loading_time_ms)
            .await?;
        self.publish_progress(job.id, 0.3).await;

        let images = match (desc.exec_mode, api_url) {
            (ExecMode::Server, Some(api_url)) => self.dispatch_http(&api_url, job, &params).await?,
            (ExecMode::Cli, _) => self.dispatch_cli(&desc, job, &params).await?,
            (ExecMode::Server, None) => {
                return Err(JobError::ModelStart(format!(
                    "{} reported no API URL",
                    job.model_id
                )));
            }
        };
        self.publish_progress(job.id, 0.7).await;

        for (index, image) in images.into_iter().enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            let record = self
                .jobs
                .append_image(
                    job.id,
                    NewImage {
                        batch_index: index as u32,
                        mime_type: image.mime_type,
                        data: image.data,
                        revised_prompt: image.revised_prompt,
                        width: params.size.map(|s| s.width),
                        height: params.size.map(|s| s.height),
                    },
                )
                .await?;
            self.bus.publish(&AppEvent::ImageGenerated {
                job_id: job.id,
                image_id: record.id,
                batch_index: record.batch_index,
                url: record.url(),
            });
        }
        self.publish_progress(job.id, 0.9).await;

        #[allow(clippy::cast_possible_truncation)]
        let total_ms = started.elapsed().as_millis() as i64;
        let extras = StatusExtras {
            generation_time_ms: Some((total_ms - model_loading_time_ms).max(0)),
            ..StatusExtras::default()
        };
        self.jobs
            .set_status(job.id, JobStatus::Completed, extras)
            .await?;
        self.publish_progress(job.id, 1.0).await;

        let image_count = self.jobs.images_for_job(job.id).await?.len();
        #[allow(clippy::cast_possible_truncation)]
        self.bus.publish(&AppEvent::JobCompleted {
            job_id: job.id,
            image_count: image_count as u32,
        });
        info!(job_id = %job.id, images = image_count, "job completed");
        Ok(())
    }

    async fn dispatch_http(
        &self,
        api_url: &str,
        job: &Job,
        params: &crate::engine::EffectiveParams,
    ) -> Result<Vec<EngineImage>, JobError> {
        let source = match &job.source_image {
            Some(path) => Some(tokio::fs::read(path).await.map_err(|e| {
                JobError::Invalid(format!("source image unreadable: {e}"))
            })?),
            None => None,
        };
        let mask = match &job.mask_image {
            Some(path) => Some(tokio::fs::read(path).await.map_err(|e| {
                JobError::Invalid(format!("mask image unreadable: {e}"))
            })?),
            None => None,
        };

        self.http
            .dispatch(api_url, job, params, source.as_deref(), mask.as_deref())
            .await
            .map_err(Into::into)
    }

    async fn dispatch_cli(
        &self,
        desc: &sdlib_core::ModelDescriptor,
        job: &Job,
        params: &crate::engine::EffectiveParams,
    ) -> Result<Vec<EngineImage>, JobError> {
        tokio::fs::create_dir_all(&self.work_dir)
            .await
            .map_err(|e| JobError::Engine(format!("cannot create work dir: {e}")))?;
        let output_path = self.work_dir.join(format!("{}.png", job.id));

        let invocation = build_cli_invocation(&desc.command, &desc.args, job, params, &output_path);
        let produced = run_cli_invocation(&invocation, &output_path).await?;

        let data = tokio::fs::read(&produced)
            .await
            .map_err(|e| JobError::Engine(format!("engine output unreadable: {e}")))?;
        Ok(vec![EngineImage {
            data,
            mime_type: "image/png".to_string(),
            revised_prompt: None,
        }])
    }

    async fn publish_progress(&self, job_id: uuid::Uuid, progress: f64) {
        if let Err(e) = self.jobs.set_progress(job_id, progress).await {
            warn!(job_id = %job_id, error = %e, "failed to persist progress");
        }
        self.bus
            .publish(&AppEvent::JobProgress { job_id, progress });
    }
}

/// Reject jobs missing required inputs before any engine work happens.
fn validate(job: &Job) -> Result<(), JobError> {
    match job.job_type {
        JobType::Generate => {
            if job.prompt.trim().is_empty() {
                return Err(JobError::Invalid("prompt is required".to_string()));
            }
        }
        JobType::Edit | JobType::Variation | JobType::Upscale => {
            if job.source_image.is_none() {
                return Err(JobError::Invalid(format!(
                    "{} requires a source image",
                    job.job_type
                )));
            }
        }
    }
    if let Some(strength) = job.strength {
        if !(0.0..=1.0).contains(&strength) {
            return Err(JobError::Invalid("strength must be within [0, 1]".to_string()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::Mutex;

    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use sdlib_core::{
        ImageSize, JobFilter, ModelDescriptor, ModelsConfig, NewJob, Topic,
    };
    use sdlib_db::setup_test_database;

    use crate::process::{LogRing, ProcessRegistry};

    /// Fake engine: 200 on GET /health, canned generation payload on
    /// POST. Records every POST body.
    async fn spawn_engine_fixture(bodies: Arc<Mutex<Vec<String>>>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let bodies = Arc::clone(&bodies);
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut tmp = [0u8; 4096];
                    // Read headers
                    loop {
                        let Ok(n) = socket.read(&mut tmp).await else {
                            return;
                        };
                        if n == 0 {
                            break;
                        }
                        buf.extend_from_slice(&tmp[..n]);
                        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                    }
                    let header_end = buf
                        .windows(4)
                        .position(|w| w == b"\r\n\r\n")
                        .map_or(buf.len(), |p| p + 4);
                    let head = String::from_utf8_lossy(&buf[..header_end]).into_owned();
                    let content_length: usize = head
                        .lines()
                        .find_map(|l| {
                            l.to_ascii_lowercase()
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse().unwrap_or(0))
                        })
                        .unwrap_or(0);
                    // Read the remaining body bytes
                    while buf.len() < header_end + content_length {
                        let Ok(n) = socket.read(&mut tmp).await else {
                            return;
                        };
                        if n == 0 {
                            break;
                        }
                        buf.extend_from_slice(&tmp[..n]);
                    }

                    let response_body = if head.starts_with("GET") {
                        "ok".to_string()
                    } else {
                        let body =
                            String::from_utf8_lossy(&buf[header_end..]).into_owned();
                        bodies.lock().unwrap().push(body);
                        format!(
                            r#"{{"data":[{{"b64_json":"{}","revised_prompt":"a fluffy cat"}}]}}"#,
                            BASE64.encode(b"fake-png-bytes")
                        )
                    };
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{response_body}",
                        response_body.len()
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        addr
    }

    struct Harness {
        processor: Arc<JobProcessor>,
        jobs: JobRepository,
        bus: Arc<EventBus>,
        manager: Arc<ModelManager>,
        _work_dir: tempfile::TempDir,
    }

    async fn harness(models: Vec<ModelDescriptor>) -> Harness {
        let pool = setup_test_database().await.unwrap();
        let jobs = JobRepository::new(pool);
        let bus = Arc::new(EventBus::new());
        let manager = Arc::new(ModelManager::new(
            ModelsConfig {
                models,
                default_model: None,
            },
            Arc::new(ProcessRegistry::new()),
            Arc::new(LogRing::new()),
            Arc::clone(&bus),
        ));
        let work_dir = tempfile::tempdir().unwrap();
        let processor = Arc::new(JobProcessor::new(
            jobs.clone(),
            Arc::clone(&manager),
            Arc::clone(&bus),
            work_dir.path().to_path_buf(),
        ));
        Harness {
            processor,
            jobs,
            bus,
            manager,
            _work_dir: work_dir,
        }
    }

    fn descriptor(json: serde_json::Value) -> ModelDescriptor {
        serde_json::from_value(json).unwrap()
    }

    fn progress_values(events: &[AppEvent]) -> Vec<f64> {
        events
            .iter()
            .filter_map(|e| match e {
                AppEvent::JobProgress { progress, .. } => Some(*progress),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn server_mode_generation_end_to_end() {
        let bodies = Arc::new(Mutex::new(Vec::new()));
        let addr = spawn_engine_fixture(Arc::clone(&bodies)).await;
        let harness = harness(vec![descriptor(serde_json::json!({
            "id": "m1", "name": "M1", "command": "sleep", "args": ["30"],
            "api_url": format!("http://{addr}"),
            "generation_params": {"sample_steps": 9}
        }))])
        .await;
        let mut sub = harness.bus.subscribe([Topic::Queue]);

        let job = harness
            .jobs
            .enqueue(NewJob {
                model_id: "m1".into(),
                prompt: "cat".into(),
                size: Some(ImageSize::new(512, 512)),
                ..NewJob::default()
            })
            .await
            .unwrap();

        assert!(harness.processor.tick().await);

        let stored = harness.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert!((stored.progress - 1.0).abs() < f64::EPSILON);
        assert!(stored.model_loading_time_ms.is_some());
        assert!(stored.generation_time_ms.is_some());

        // One png image with the decoded engine payload
        let images = harness.jobs.images_for_job(job.id).await.unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].mime_type, "image/png");
        assert_eq!(images[0].data, b"fake-png-bytes");
        assert_eq!(images[0].revised_prompt.as_deref(), Some("a fluffy cat"));

        // The engine saw the model-default step count
        let bodies = bodies.lock().unwrap();
        assert_eq!(bodies.len(), 1);
        let body: serde_json::Value = serde_json::from_str(&bodies[0]).unwrap();
        assert_eq!(body["steps"], 9);
        assert_eq!(body["width"], 512);

        // Progress milestones in order, monotone, ending at 1.0
        let mut events = Vec::new();
        while let Some(event) = sub.try_recv() {
            events.push(event);
        }
        let progress = progress_values(&events);
        assert_eq!(progress, vec![0.1, 0.3, 0.7, 0.9, 1.0]);

        harness.manager.stop_all().await;
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn cli_mode_upscale_end_to_end() {
        // Fake engine script: copies nothing, writes a png and an argv dump
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("engine.sh");
        let argv_dump = dir.path().join("argv.txt");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\nprintf '%s\\n' \"$@\" > {argv}\nout=\"\"\nprev=\"\"\nfor a in \"$@\"; do\n  if [ \"$prev\" = \"--output\" ]; then out=\"$a\"; fi\n  prev=\"$a\"\ndone\nprintf 'PNGDATA' > \"$out\"\necho \"saved: $out\"\n",
                argv = argv_dump.display()
            ),
        )
        .unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let source = dir.path().join("source.png");
        std::fs::write(&source, b"src").unwrap();

        let harness = harness(vec![descriptor(serde_json::json!({
            "id": "u1", "name": "Upscaler", "command": script.to_str().unwrap(),
            "exec_mode": "cli", "capabilities": ["upscale"]
        }))])
        .await;

        let job = harness
            .jobs
            .enqueue(NewJob {
                model_id: "u1".into(),
                job_type: Some(JobType::Upscale),
                prompt: String::new(),
                source_image: Some(source.to_string_lossy().into_owned()),
                ..NewJob::default()
            })
            .await
            .unwrap();

        assert!(harness.processor.tick().await);

        let stored = harness.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed, "error: {:?}", stored.error);

        let images = harness.jobs.images_for_job(job.id).await.unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].data, b"PNGDATA");

        let argv = std::fs::read_to_string(&argv_dump).unwrap();
        assert!(argv.contains("--init-img"), "argv: {argv}");
        assert!(!argv.contains("--strength"), "argv: {argv}");
        assert!(!argv.contains("--steps"), "argv: {argv}");
    }

    #[tokio::test]
    async fn unknown_model_fails_the_job_and_the_loop_continues() {
        let harness = harness(vec![]).await;
        let job = harness
            .jobs
            .enqueue(NewJob {
                model_id: "ghost".into(),
                prompt: "cat".into(),
                ..NewJob::default()
            })
            .await
            .unwrap();

        assert!(harness.processor.tick().await);

        let stored = harness.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(stored.error.as_deref().unwrap().contains("unknown model"));

        // Next tick finds nothing but does not wedge
        assert!(!harness.processor.tick().await);
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn startup_timeout_cascades_to_the_job() {
        // sleep never answers health probes; tight timeout
        let harness = harness(vec![descriptor(serde_json::json!({
            "id": "m2", "name": "M2", "command": "sleep", "args": ["30"],
            "startup_timeout_ms": 300
        }))])
        .await;

        let job = harness
            .jobs
            .enqueue(NewJob {
                model_id: "m2".into(),
                prompt: "cat".into(),
                ..NewJob::default()
            })
            .await
            .unwrap();

        assert!(harness.processor.tick().await);

        let stored = harness.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(stored
            .error
            .as_deref()
            .unwrap()
            .contains("did not become ready"));
        assert_eq!(harness.manager.registry().count(), 0, "no record remains");
    }

    #[tokio::test]
    async fn missing_source_image_is_invalid() {
        let harness = harness(vec![descriptor(serde_json::json!({
            "id": "m1", "name": "M1", "command": "sd", "exec_mode": "cli"
        }))])
        .await;

        let job = harness
            .jobs
            .enqueue(NewJob {
                model_id: "m1".into(),
                job_type: Some(JobType::Variation),
                prompt: "p".into(),
                ..NewJob::default()
            })
            .await
            .unwrap();

        assert!(harness.processor.tick().await);
        let stored = harness.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(stored.error.as_deref().unwrap().contains("source image"));
    }

    #[tokio::test]
    async fn status_history_stays_within_the_state_machine() {
        let harness = harness(vec![]).await;
        for i in 0..3 {
            harness
                .jobs
                .enqueue(NewJob {
                    model_id: "ghost".into(),
                    prompt: format!("p{i}"),
                    ..NewJob::default()
                })
                .await
                .unwrap();
        }
        while harness.processor.tick().await {}

        let page = harness.jobs.list(JobFilter::default(), 10, 0).await.unwrap();
        assert_eq!(page.total, 3);
        // Every job ran pending → processing → failed; none left in
        // processing, none completed without images.
        assert!(page.jobs.iter().all(|j| j.status == JobStatus::Failed));
    }
}
