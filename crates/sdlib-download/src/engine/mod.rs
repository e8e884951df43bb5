//! Download engine: orchestration, cancellation, and pause/resume.
//!
//! The engine owns an in-memory map of active downloads (cancellation
//! token + live speed) mirroring the persisted records. Files transfer
//! sequentially inside a single worker task per download.

mod worker;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use sdlib_core::{
    AppEvent, DownloadError, DownloadFile, DownloadJob, DownloadStatus, EventBus,
};
use sdlib_db::DownloadStateRepository;
use sdlib_hf::HfClient;

use worker::{LiveStats, WorkerCtx};

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct DownloadEngineConfig {
    /// Root directory files are downloaded under (`root/{repo}/{path}`).
    pub destination_root: PathBuf,
    /// Whether cancel deletes partially downloaded files.
    pub remove_partial_on_cancel: bool,
}

struct ActiveDownload {
    cancel: CancellationToken,
    pause_requested: Arc<AtomicBool>,
    live: Arc<StdMutex<LiveStats>>,
}

/// Multi-file downloader with per-file resume and aggregate accounting.
pub struct DownloadEngine {
    config: DownloadEngineConfig,
    state: DownloadStateRepository,
    hf: Arc<HfClient>,
    bus: Arc<EventBus>,
    client: reqwest::Client,
    active: Mutex<HashMap<uuid::Uuid, ActiveDownload>>,
}

impl DownloadEngine {
    pub fn new(
        config: DownloadEngineConfig,
        state: DownloadStateRepository,
        hf: Arc<HfClient>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            config,
            state,
            hf,
            bus,
            client: reqwest::Client::new(),
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Validate the repository, create the download record, and start
    /// transferring. Returns the download id immediately.
    ///
    /// An empty `files` list downloads every file the repository lists.
    pub async fn start(
        self: &Arc<Self>,
        repo: &str,
        files: Vec<String>,
    ) -> Result<uuid::Uuid, DownloadError> {
        let info = self.hf.validate_repo(repo).await.map_err(DownloadError::from)?;

        let requested: Vec<String> = if files.is_empty() {
            info.siblings.iter().map(|s| s.rfilename.clone()).collect()
        } else {
            files
        };
        if requested.is_empty() {
            return Err(DownloadError::InvalidRepo(format!(
                "{repo} lists no downloadable files"
            )));
        }

        let mut job_files = Vec::with_capacity(requested.len());
        for path in &requested {
            let destination = self.config.destination_root.join(repo).join(path);
            let mut file = DownloadFile::new(path.clone(), destination);
            // Seed known sizes so aggregate progress is meaningful from
            // the first event.
            if let Some(sibling) = info.siblings.iter().find(|s| &s.rfilename == path) {
                file.total_bytes = sibling.size.unwrap_or(0);
            }
            job_files.push(file);
        }

        let mut job = DownloadJob::new(repo, job_files);
        job.status = DownloadStatus::Downloading;
        job.started_at = Some(chrono::Utc::now());
        self.state.upsert(&job).await?;
        self.publish_state(&job);

        let id = job.id;
        info!(id = %id, repo = %repo, files = job.files.len(), "download started");
        self.spawn_worker(job).await;
        Ok(id)
    }

    /// Resume a paused download: restart the worker, which range-resumes
    /// each file from its on-disk size.
    pub async fn resume(self: &Arc<Self>, id: uuid::Uuid) -> Result<(), DownloadError> {
        if self.active.lock().await.contains_key(&id) {
            return Err(DownloadError::NotResumable(format!(
                "download {id} is already running"
            )));
        }

        let mut job = self
            .state
            .get(id)
            .await?
            .ok_or_else(|| DownloadError::NotFound(id.to_string()))?;
        if job.status != DownloadStatus::Paused {
            return Err(DownloadError::NotResumable(format!(
                "download {id} is {}",
                job.status
            )));
        }

        // Reconcile counters with what actually landed on disk.
        for file in &mut job.files {
            if !file.complete {
                file.downloaded_bytes = tokio::fs::metadata(&file.destination)
                    .await
                    .map_or(0, |m| m.len());
            }
        }
        job.recompute_totals();
        job.status = DownloadStatus::Downloading;
        job.error = None;
        self.state.upsert(&job).await?;
        self.publish_state(&job);

        info!(id = %id, "download resumed");
        self.spawn_worker(job).await;
        Ok(())
    }

    /// Pause an active download. The in-flight request aborts within one
    /// chunk; on-disk partial files are kept for resume.
    pub async fn pause(&self, id: uuid::Uuid) -> Result<(), DownloadError> {
        let active = self.active.lock().await;
        let entry = active
            .get(&id)
            .ok_or_else(|| DownloadError::NotResumable(format!("download {id} is not active")))?;
        entry.pause_requested.store(true, Ordering::SeqCst);
        entry.cancel.cancel();
        Ok(())
    }

    /// Cancel a download. Active transfers abort within one chunk;
    /// pending or paused records move straight to `cancelled`.
    pub async fn cancel(&self, id: uuid::Uuid) -> Result<(), DownloadError> {
        {
            let active = self.active.lock().await;
            if let Some(entry) = active.get(&id) {
                entry.pause_requested.store(false, Ordering::SeqCst);
                entry.cancel.cancel();
                info!(id = %id, "cancelled active download");
                return Ok(());
            }
        }

        let job = self
            .state
            .get(id)
            .await?
            .ok_or_else(|| DownloadError::NotFound(id.to_string()))?;
        match job.status {
            DownloadStatus::Pending | DownloadStatus::Paused => {
                self.state
                    .set_status(id, DownloadStatus::Cancelled, None)
                    .await?;
                self.bus.publish(&AppEvent::DownloadStateChanged {
                    download_id: id,
                    status: DownloadStatus::Cancelled,
                    error: None,
                });
                Ok(())
            }
            status if status.is_terminal() => Ok(()),
            status => Err(DownloadError::NotResumable(format!(
                "download {id} is {status}"
            ))),
        }
    }

    /// Aggregated view of one download, with live speed when active.
    pub async fn status(&self, id: uuid::Uuid) -> Result<DownloadJob, DownloadError> {
        let mut job = self
            .state
            .get(id)
            .await?
            .ok_or_else(|| DownloadError::NotFound(id.to_string()))?;

        let active = self.active.lock().await;
        if let Some(entry) = active.get(&id) {
            if let Ok(live) = entry.live.lock() {
                job.speed_bps = live.0;
                job.eta_seconds = live.1;
            }
        }
        Ok(job)
    }

    /// All download records, newest first.
    pub async fn all(&self) -> Result<Vec<DownloadJob>, DownloadError> {
        self.state.all().await.map_err(Into::into)
    }

    /// Remove terminal records older than `max_age`.
    pub async fn cleanup(&self, max_age: chrono::Duration) -> Result<u32, DownloadError> {
        self.state.cleanup(max_age).await.map_err(Into::into)
    }

    /// Register the download as active, then run its worker task. The
    /// entry is inserted before spawning so pause/cancel can never miss a
    /// download that `start` already returned.
    async fn spawn_worker(self: &Arc<Self>, job: DownloadJob) {
        let cancel = CancellationToken::new();
        let pause_requested = Arc::new(AtomicBool::new(false));
        let live = Arc::new(StdMutex::new((0.0, None)));

        let entry = ActiveDownload {
            cancel: cancel.clone(),
            pause_requested: Arc::clone(&pause_requested),
            live: Arc::clone(&live),
        };

        let id = job.id;
        self.active.lock().await.insert(id, entry);

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.run_job(job, cancel, pause_requested, live).await;
            engine.active.lock().await.remove(&id);
        });
    }

    async fn run_job(
        &self,
        mut job: DownloadJob,
        cancel: CancellationToken,
        pause_requested: Arc<AtomicBool>,
        live: Arc<StdMutex<LiveStats>>,
    ) {
        let ctx = WorkerCtx {
            client: &self.client,
            hf: &self.hf,
            state: &self.state,
            bus: &self.bus,
            live: &live,
        };

        let result = worker::transfer_all(&ctx, &mut job, &cancel).await;
        let id = job.id;

        let (status, error) = match result {
            Ok(()) => {
                info!(id = %id, bytes = job.bytes_downloaded, "download completed");
                (DownloadStatus::Completed, None)
            }
            Err(DownloadError::Cancelled) if pause_requested.load(Ordering::SeqCst) => {
                info!(id = %id, "download paused");
                (DownloadStatus::Paused, None)
            }
            Err(DownloadError::Cancelled) => {
                info!(id = %id, "download cancelled");
                if self.config.remove_partial_on_cancel {
                    self.remove_partial_files(&job).await;
                }
                (DownloadStatus::Cancelled, None)
            }
            Err(e) => {
                warn!(id = %id, error = %e, "download failed");
                (DownloadStatus::Failed, Some(e.to_string()))
            }
        };

        if let Err(e) = self.state.set_status(id, status, error.as_deref()).await {
            warn!(id = %id, error = %e, "failed to persist download status");
        }
        self.bus.publish(&AppEvent::DownloadStateChanged {
            download_id: id,
            status,
            error,
        });
    }

    async fn remove_partial_files(&self, job: &DownloadJob) {
        for file in &job.files {
            if !file.complete {
                let _ = tokio::fs::remove_file(&file.destination).await;
            }
        }
    }

    fn publish_state(&self, job: &DownloadJob) {
        self.bus.publish(&AppEvent::DownloadStateChanged {
            download_id: job.id,
            status: job.status,
            error: job.error.clone(),
        });
    }
}
