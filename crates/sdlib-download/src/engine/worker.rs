//! Per-file transfer pipeline.
//!
//! The worker operates on a value-type `DownloadJob` and borrowed
//! dependencies, with no access to the engine's active map. Cancellation
//! is handled via `tokio::select!` around the stream read, so an abort
//! lands within one chunk.

use std::sync::Mutex;

use futures_util::StreamExt;
use reqwest::header;
use reqwest::StatusCode;
use tokio::fs;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use sdlib_core::{AppEvent, DownloadError, DownloadJob, EventBus};
use sdlib_db::DownloadStateRepository;
use sdlib_hf::HfClient;

use crate::progress::{eta_seconds, parse_content_range_total, ProgressThrottle, SpeedTracker};

/// Speed and ETA of the in-flight transfer, shared with `status()`.
pub(super) type LiveStats = (f64, Option<f64>);

/// Borrowed dependencies for one worker run.
pub(super) struct WorkerCtx<'a> {
    pub client: &'a reqwest::Client,
    pub hf: &'a HfClient,
    pub state: &'a DownloadStateRepository,
    pub bus: &'a EventBus,
    pub live: &'a Mutex<LiveStats>,
}

/// Download every incomplete file in the job, sequentially.
pub(super) async fn transfer_all(
    ctx: &WorkerCtx<'_>,
    job: &mut DownloadJob,
    cancel: &CancellationToken,
) -> Result<(), DownloadError> {
    let mut throttle = ProgressThrottle::new();
    let mut tracker = SpeedTracker::new(job.bytes_downloaded);

    for idx in 0..job.files.len() {
        if job.files[idx].complete {
            continue;
        }
        download_file(ctx, job, idx, cancel, &mut throttle, &mut tracker).await?;
    }
    Ok(())
}

/// Transfer one file, resuming from its on-disk size.
async fn download_file(
    ctx: &WorkerCtx<'_>,
    job: &mut DownloadJob,
    idx: usize,
    cancel: &CancellationToken,
    throttle: &mut ProgressThrottle,
    tracker: &mut SpeedTracker,
) -> Result<(), DownloadError> {
    let remote_path = job.files[idx].remote_path.clone();
    let destination = job.files[idx].destination.clone();
    let url = ctx.hf.download_url(&job.repo, &remote_path);

    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent).await?;
    }

    let start_offset = fs::metadata(&destination).await.map_or(0, |m| m.len());

    let mut request = ctx.client.get(url.as_str());
    if start_offset > 0 {
        request = request.header(header::RANGE, format!("bytes={start_offset}-"));
    }
    let response = request
        .send()
        .await
        .map_err(|e| DownloadError::Network(e.to_string()))?;
    let status = response.status();

    if status == StatusCode::RANGE_NOT_SATISFIABLE {
        // The requested range starts at or past EOF: nothing left to fetch.
        debug!(file = %remote_path, offset = start_offset, "range not satisfiable, file already complete");
        let file = &mut job.files[idx];
        file.downloaded_bytes = start_offset;
        if file.total_bytes == 0 {
            file.total_bytes = start_offset;
        }
        file.complete = true;
        job.recompute_totals();
        persist_file(ctx, job, idx).await?;
        emit_progress(ctx, job, idx);
        return Ok(());
    }

    if !status.is_success() {
        return Err(DownloadError::Network(format!(
            "registry returned {status} for {url}"
        )));
    }

    let resuming = status == StatusCode::PARTIAL_CONTENT;
    let total = if resuming {
        response
            .headers()
            .get(header::CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range_total)
            .or_else(|| response.content_length().map(|len| start_offset + len))
            .unwrap_or(0)
    } else {
        response.content_length().unwrap_or(0)
    };

    // 206 appends to the partial file; a full 200 body (fresh download, or
    // a server that ignored the range) truncates and starts over.
    let mut sink = if resuming {
        OpenOptions::new().append(true).open(&destination).await?
    } else {
        fs::File::create(&destination).await?
    };

    let mut downloaded = if resuming { start_offset } else { 0 };
    {
        let file = &mut job.files[idx];
        file.total_bytes = total;
        file.downloaded_bytes = downloaded;
    }
    job.recompute_totals();

    let mut stream = response.bytes_stream();
    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                let _ = sink.flush().await;
                // Best-effort persist so a later resume starts from here.
                if let Err(e) = persist_file(ctx, job, idx).await {
                    warn!(file = %remote_path, error = %e, "failed to persist progress on cancel");
                }
                return Err(DownloadError::Cancelled);
            }

            chunk = stream.next() => match chunk {
                Some(Ok(bytes)) => {
                    sink.write_all(&bytes).await?;
                    downloaded += bytes.len() as u64;
                    job.files[idx].downloaded_bytes = downloaded;
                    job.recompute_totals();

                    if throttle.should_emit(job.bytes_downloaded) {
                        let speed = tracker.sample(job.bytes_downloaded);
                        let eta = eta_seconds(speed, job.bytes_downloaded, job.total_bytes);
                        job.speed_bps = speed;
                        job.eta_seconds = eta;
                        if let Ok(mut live) = ctx.live.lock() {
                            *live = (speed, eta);
                        }
                        persist_file(ctx, job, idx).await?;
                        emit_progress(ctx, job, idx);
                    }
                }
                Some(Err(e)) => return Err(DownloadError::Network(e.to_string())),
                None => break,
            }
        }
    }
    sink.flush().await?;

    // A finished file must exist and be non-empty; when the total is
    // known the on-disk size must match it exactly.
    let on_disk = fs::metadata(&destination).await.map_or(0, |m| m.len());
    if on_disk == 0 {
        return Err(DownloadError::Integrity(format!(
            "{remote_path} is empty after download"
        )));
    }
    if total > 0 && on_disk != total {
        return Err(DownloadError::Integrity(format!(
            "{remote_path} is {on_disk} bytes, expected {total}"
        )));
    }

    let file = &mut job.files[idx];
    file.downloaded_bytes = on_disk;
    if file.total_bytes == 0 {
        file.total_bytes = on_disk;
    }
    file.complete = true;
    job.recompute_totals();
    persist_file(ctx, job, idx).await?;
    emit_progress(ctx, job, idx);

    Ok(())
}

async fn persist_file(
    ctx: &WorkerCtx<'_>,
    job: &DownloadJob,
    idx: usize,
) -> Result<(), DownloadError> {
    let file = &job.files[idx];
    ctx.state
        .update_file_progress(
            job.id,
            &file.remote_path,
            file.downloaded_bytes,
            file.total_bytes,
            file.complete,
        )
        .await
        .map_err(Into::into)
}

fn emit_progress(ctx: &WorkerCtx<'_>, job: &DownloadJob, idx: usize) {
    let file = &job.files[idx];
    ctx.bus.publish(&AppEvent::DownloadProgress {
        download_id: job.id,
        file: file.remote_path.clone(),
        file_downloaded: file.downloaded_bytes,
        file_total: file.total_bytes,
        bytes_downloaded: job.bytes_downloaded,
        total_bytes: job.total_bytes,
        progress: job.progress(),
        speed_bps: job.speed_bps,
        eta_seconds: job.eta_seconds,
    });
}
