//! Server bootstrap - the composition root.
//!
//! This module is the ONLY place where infrastructure is wired together:
//! database, event bus, process registry, model manager, download
//! engine, and the job processor all come to life here.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use sdlib_core::{AppEvent, EventBus, ModelsConfig, Topic};
use sdlib_db::{
    setup_database, DownloadStateRepository, JobRepository, ModelMirrorRepository,
    ProcessStateRepository,
};
use sdlib_download::{DownloadEngine, DownloadEngineConfig};
use sdlib_hf::{HfClient, HfConfig};
use sdlib_runtime::{JobProcessor, LogRing, ModelManager, ProcessRegistry};

use crate::routes::create_router;
use crate::state::AppState;

/// Interval of the background zombie-reclamation sweep.
const ZOMBIE_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port for the HTTP server.
    pub port: u16,
    /// Path to the models config document.
    pub config_path: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Data directory: uploads, CLI outputs, downloaded models.
    pub data_dir: PathBuf,
    /// Override for the processor poll interval.
    pub poll_interval: Option<Duration>,
    /// Registry token for gated repositories.
    pub hf_token: Option<String>,
}

/// Application context shared with every handler.
pub struct AxumContext {
    pub jobs: JobRepository,
    pub manager: Arc<ModelManager>,
    pub downloads: Arc<DownloadEngine>,
    pub bus: Arc<EventBus>,
    /// Where uploaded source/mask images are written.
    pub uploads_dir: PathBuf,
    /// Cancels the processor loop and background sweeps.
    pub shutdown: CancellationToken,
}

/// Wire up every component and start the background tasks.
pub async fn bootstrap(config: ServerConfig) -> Result<AxumContext> {
    let models_config = ModelsConfig::load(&config.config_path)
        .with_context(|| format!("loading {}", config.config_path.display()))?;
    info!(
        models = models_config.models.len(),
        config = %config.config_path.display(),
        "loaded model config"
    );

    let pool = setup_database(&config.db_path)
        .await
        .with_context(|| format!("opening database {}", config.db_path.display()))?;

    // Mirror the config for cross-process visibility
    ModelMirrorRepository::new(pool.clone())
        .sync(&models_config.models)
        .await
        .map_err(|e| anyhow::anyhow!("model mirror sync failed: {e}"))?;

    let bus = Arc::new(EventBus::new());
    let registry = Arc::new(ProcessRegistry::new());
    let logs = Arc::new(LogRing::new());
    let manager = Arc::new(ModelManager::new(
        models_config,
        Arc::clone(&registry),
        logs,
        Arc::clone(&bus),
    ));

    let uploads_dir = config.data_dir.join("uploads");
    let work_dir = config.data_dir.join("outputs");
    let models_dir = config.data_dir.join("models");
    for dir in [&uploads_dir, &work_dir, &models_dir] {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating {}", dir.display()))?;
    }

    let mut hf_config = HfConfig::default();
    if let Some(token) = config.hf_token.clone() {
        hf_config = hf_config.with_token(token);
    }
    let downloads = Arc::new(DownloadEngine::new(
        DownloadEngineConfig {
            destination_root: models_dir,
            remove_partial_on_cancel: false,
        },
        DownloadStateRepository::new(pool.clone()),
        Arc::new(HfClient::new(hf_config)),
        Arc::clone(&bus),
    ));

    let jobs = JobRepository::new(pool.clone());
    let shutdown = CancellationToken::new();

    // Mirror engine process state into SQLite for cross-process
    // visibility. Stale rows from a previous run are wiped first.
    let process_states = ProcessStateRepository::new(pool);
    process_states
        .clear()
        .await
        .map_err(|e| anyhow::anyhow!("process mirror reset failed: {e}"))?;
    {
        let mut sub = bus.subscribe([Topic::Models]);
        let cancel = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    event = sub.recv() => match event {
                        Some(AppEvent::ModelStateChanged { model_id, status, port, pid }) => {
                            if let Err(e) = process_states.upsert(&model_id, &status, pid, port).await {
                                warn!(model_id = %model_id, error = %e, "process mirror write failed");
                            }
                        }
                        Some(_) => {}
                        None => break,
                    }
                }
            }
        });
    }

    // Preload models marked for boot-time startup
    manager.preload().await;

    // Job processor loop
    let mut processor = JobProcessor::new(
        jobs.clone(),
        Arc::clone(&manager),
        Arc::clone(&bus),
        work_dir,
    );
    if let Some(interval) = config.poll_interval {
        processor = processor.with_poll_interval(interval);
    }
    Arc::new(processor).spawn(shutdown.clone());

    // Periodic zombie reclamation
    {
        let manager = Arc::clone(&manager);
        let cancel = shutdown.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(ZOMBIE_SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = tick.tick() => manager.cleanup_zombies(),
                }
            }
        });
    }

    Ok(AxumContext {
        jobs,
        manager,
        downloads,
        bus,
        uploads_dir,
        shutdown,
    })
}

/// Bootstrap and serve until the process is interrupted.
pub async fn serve(config: ServerConfig) -> Result<()> {
    let port = config.port;
    let ctx = bootstrap(config).await?;
    let shutdown = ctx.shutdown.clone();
    let manager = Arc::clone(&ctx.manager);

    let state: AppState = Arc::new(ctx);
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
        .await
        .with_context(|| format!("binding 127.0.0.1:{port}"))?;
    info!(port, "sdlib listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await
        .context("server error")?;

    shutdown.cancel();
    manager.stop_all().await;
    Ok(())
}

impl AxumContext {
    /// Stop background tasks and every tracked engine. Used by tests and
    /// the graceful-shutdown path.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.manager.stop_all().await;
    }
}
