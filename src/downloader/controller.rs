/*
 * turbodl - Multi-connection HTTP download accelerator.
 * Copyright (C) 2025  turbodl contributors
 */

//! Job controller: sequences probe → plan → transfer → finalize, owns the
//! output handle and the buffer, and supervises the worker pool.

use super::buffer::ChunkBuffer;
use super::finalize::{self, ClaimedOutput};
use super::plan::{self, DownloadPlan};
use super::probe::{self, RemoteFileInfo};
use super::progress::{Phase, ProgressEvent, ProgressSink, SpeedWindow};
use super::worker::{ByteSink, RangeWorker, WorkerState};
use super::writer;
use super::DownloadOptions;
use crate::error::{Result, TurboError};
use crate::system::{HostProbe, SystemProbe};
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Free space demanded beyond the file size before a job starts
const FREE_SPACE_MARGIN: u64 = 1024 * 1024 * 1024;
/// Progress emission period (10 Hz)
const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);
/// Window for the transfer-rate estimate
const SPEED_WINDOW: Duration = Duration::from_secs(3);

/// Multi-connection download engine.
///
/// One instance owns a pooled HTTP client and can run any number of jobs;
/// each `download` call is a single-use job.
pub struct TurboDl {
    options: DownloadOptions,
    client: Client,
    system: Arc<dyn SystemProbe>,
    sink: Option<Arc<dyn ProgressSink>>,
}

impl TurboDl {
    pub fn new(options: DownloadOptions) -> Result<Self> {
        let client = super::build_client(&options)?;
        Ok(Self {
            options,
            client,
            system: Arc::new(HostProbe),
            sink: None,
        })
    }

    /// Attach a progress sink; events flow only while `show_progress` is on
    pub fn with_progress_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Replace the host capability probe (tests use a fixed one)
    pub fn with_system_probe(mut self, system: Arc<dyn SystemProbe>) -> Self {
        self.system = system;
        self
    }

    /// Download `url` to `output_path` and return the final file path.
    ///
    /// A directory `output_path` receives the probed filename inside it.
    pub async fn download(&self, url: &str, output_path: impl AsRef<Path>) -> Result<PathBuf> {
        self.download_with_cancel(url, output_path, CancellationToken::new())
            .await
    }

    /// Like [`download`](Self::download), with an external cancellation
    /// signal. Cancelling aborts all workers at their next suspension
    /// point; the sentinel file is left on disk.
    pub async fn download_with_cancel(
        &self,
        url: &str,
        output_path: impl AsRef<Path>,
        cancel: CancellationToken,
    ) -> Result<PathBuf> {
        match self.options.timeout {
            None => self.run(url, output_path.as_ref(), cancel).await,
            Some(limit) => {
                tokio::select! {
                    result = self.run(url, output_path.as_ref(), cancel.clone()) => result,
                    _ = tokio::time::sleep(limit) => {
                        cancel.cancel();
                        Err(TurboError::JobTimeout {
                            seconds: limit.as_secs(),
                        })
                    }
                }
            }
        }
    }

    async fn run(&self, url: &str, output_path: &Path, cancel: CancellationToken) -> Result<PathBuf> {
        let started = Instant::now();
        self.emit_phase(Phase::Probing, 0, 0, None);

        let info = probe::probe(&self.client, url).await?;
        info!(
            url = %info.url,
            size = ?info.size,
            ranges = info.supports_ranges,
            "probed remote file"
        );

        let destination = resolve_destination(output_path, &info.filename).await;
        let parent = destination
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."))
            .to_path_buf();

        if let (Some(size), Some(free)) = (info.size, self.system.free_space_bytes(&parent)) {
            let required = size.saturating_add(FREE_SPACE_MARGIN);
            if free < required {
                return Err(TurboError::InsufficientSpace {
                    path: destination,
                    required,
                    available: free,
                });
            }
        }

        if self.options.pre_allocate_space && info.size.is_none() {
            // Cannot reserve space for a length the server will not reveal
            return Err(TurboError::UnidentifiedFileSize { url: info.url });
        }

        let plan = plan::build_plan(&info, &self.options, self.system.as_ref(), &parent);
        debug!(
            workers = plan.worker_count,
            buffered = plan.use_ram_buffer,
            pre_allocate = plan.pre_allocate,
            "download plan ready"
        );

        let ClaimedOutput {
            destination,
            sentinel,
            file,
        } = finalize::claim_destination(&destination, self.options.overwrite).await?;
        let file = Arc::new(file);

        if plan.pre_allocate {
            if let Some(size) = plan.size {
                let file = file.clone();
                tokio::task::spawn_blocking(move || file.set_len(size))
                    .await
                    .map_err(|e| TurboError::Io {
                        path: sentinel.clone(),
                        message: e.to_string(),
                        source: None,
                    })?
                    .map_err(|e| TurboError::io(&sentinel, e))?;
            }
        }

        let bytes_received = Arc::new(AtomicU64::new(0));
        let bytes_written = Arc::new(AtomicU64::new(0));
        let ticker = self.spawn_ticker(
            bytes_received.clone(),
            bytes_written.clone(),
            info.size,
            cancel.clone(),
        );

        let mut transfer = self
            .run_transfer(
                &info.url,
                &plan,
                &file,
                &sentinel,
                &bytes_received,
                &bytes_written,
                &cancel,
            )
            .await;

        // A server that advertised ranges but answered 200 mid-flight:
        // restart in place with a single connection
        if let Err(TurboError::RangesNotHonored { .. }) = &transfer {
            if plan.worker_count > 1 {
                warn!("server ignored range requests, retrying with a single connection");
                bytes_received.store(0, Ordering::Relaxed);
                bytes_written.store(0, Ordering::Relaxed);
                {
                    let file = file.clone();
                    tokio::task::spawn_blocking(move || file.set_len(0))
                        .await
                        .ok();
                }

                let fallback_info = RemoteFileInfo {
                    supports_ranges: false,
                    ..info.clone()
                };
                let fallback_plan =
                    plan::build_plan(&fallback_info, &self.options, self.system.as_ref(), &parent);
                transfer = self
                    .run_transfer(
                        &info.url,
                        &fallback_plan,
                        &file,
                        &sentinel,
                        &bytes_received,
                        &bytes_written,
                        &cancel,
                    )
                    .await;
            }
        }

        if let Some(ticker) = ticker {
            ticker.abort();
        }

        // Terminal errors surface with the sentinel file left in place
        transfer?;

        {
            let file = file.clone();
            tokio::task::spawn_blocking(move || file.sync_all())
                .await
                .map_err(|e| TurboError::Io {
                    path: sentinel.clone(),
                    message: e.to_string(),
                    source: None,
                })?
                .map_err(|e| TurboError::io(&sentinel, e))?;
        }
        drop(file);

        let received = bytes_received.load(Ordering::Relaxed);
        let written = bytes_written.load(Ordering::Relaxed);
        self.emit_phase(Phase::Downloading, received, written, info.size);
        if self.options.expected_hash.is_some() {
            self.emit_phase(Phase::Hashing, received, written, info.size);
        }

        let final_path = finalize::finalize_download(
            &sentinel,
            &destination,
            self.options.overwrite,
            self.options.expected_hash.as_deref(),
            self.options.hash_type,
        )
        .await?;

        info!(
            path = %final_path.display(),
            bytes = written,
            elapsed_s = started.elapsed().as_secs_f64(),
            "download complete"
        );
        Ok(final_path)
    }

    /// Run one transfer phase: spawn the worker pool (and the writer, in
    /// buffered mode) and wait for completion or the first fatal error.
    #[allow(clippy::too_many_arguments)]
    async fn run_transfer(
        &self,
        url: &str,
        plan: &DownloadPlan,
        file: &Arc<std::fs::File>,
        path: &Path,
        bytes_received: &Arc<AtomicU64>,
        bytes_written: &Arc<AtomicU64>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if plan.size == Some(0) {
            return Ok(());
        }

        // One assignment per chunk; an unknown size streams open-ended
        let assignments: Vec<(u64, Option<u64>)> = if plan.chunks.is_empty() {
            vec![(0, None)]
        } else {
            plan.chunks.iter().map(|c| (c.start, Some(c.end))).collect()
        };
        let single = assignments.len() == 1;

        let transfer_cancel = cancel.child_token();

        let mut buffer = None;
        let mut writer_handle = None;
        let mut watcher = None;
        let sink = if plan.use_ram_buffer {
            let capacity = ChunkBuffer::capacity_for(
                self.system.total_memory_bytes(),
                plan.average_chunk_len(),
            );
            let staged = Arc::new(ChunkBuffer::new(capacity));
            debug!(capacity, "staging through RAM buffer");

            // Blocked buffer calls cannot observe the token themselves
            watcher = Some(tokio::spawn({
                let staged = staged.clone();
                let transfer_cancel = transfer_cancel.clone();
                async move {
                    transfer_cancel.cancelled().await;
                    staged.cancel();
                }
            }));

            writer_handle = Some(tokio::task::spawn_blocking({
                let staged = staged.clone();
                let file = file.clone();
                let path = path.to_path_buf();
                let bytes_written = bytes_written.clone();
                move || writer::drain_to_file(&staged, &file, &path, &bytes_written)
            }));

            let sink = ByteSink::Buffered {
                buffer: staged.clone(),
                path: path.to_path_buf(),
            };
            buffer = Some(staged);
            sink
        } else {
            ByteSink::Direct {
                file: file.clone(),
                path: path.to_path_buf(),
            }
        };

        let mut workers = JoinSet::new();
        let mut states = Vec::with_capacity(assignments.len());
        for (index, (start, end)) in assignments.into_iter().enumerate() {
            let state = Arc::new(WorkerState::new(index));
            states.push(state.clone());

            let worker = RangeWorker {
                client: self.client.clone(),
                url: url.to_string(),
                start,
                end,
                state,
                sink: sink.clone(),
                bytes_received: bytes_received.clone(),
                cancel: transfer_cancel.clone(),
                inactivity_timeout: plan.inactivity_timeout,
                allow_full_response: single,
            };

            match plan.chunk_timeout {
                Some(limit) => workers.spawn(async move {
                    match tokio::time::timeout(limit, worker.run()).await {
                        Ok(result) => result,
                        Err(_) => Err(TurboError::JobTimeout {
                            seconds: limit.as_secs(),
                        }),
                    }
                }),
                None => workers.spawn(worker.run()),
            };
        }

        // First fatal error becomes the job's terminal error; siblings are
        // canceled and their Interrupted results do not mask it
        let mut terminal: Option<TurboError> = None;
        while let Some(joined) = workers.join_next().await {
            let result = joined.unwrap_or_else(|e| {
                Err(TurboError::Io {
                    path: path.to_path_buf(),
                    message: format!("worker task failed: {e}"),
                    source: None,
                })
            });

            if let Err(e) = result {
                let replaces = match &terminal {
                    None => true,
                    Some(TurboError::Interrupted) => !matches!(e, TurboError::Interrupted),
                    Some(_) => false,
                };
                if replaces {
                    terminal = Some(e);
                }
                transfer_cancel.cancel();
                if let Some(buffer) = &buffer {
                    buffer.cancel();
                }
            }
        }

        let attempts: u32 = states.iter().map(|s| s.attempt()).sum();
        if attempts as usize > states.len() {
            debug!(attempts, chunks = states.len(), "transfer needed retries");
        }

        if let Some(buffer) = &buffer {
            if terminal.is_none() {
                buffer.close_input();
            } else {
                buffer.cancel();
            }
        }

        if let Some(handle) = writer_handle {
            let drained = handle.await.unwrap_or_else(|e| {
                Err(TurboError::Io {
                    path: path.to_path_buf(),
                    message: format!("writer task failed: {e}"),
                    source: None,
                })
            });

            match drained {
                Ok(head) => {
                    if terminal.is_none() {
                        if let Some(size) = plan.size {
                            if head < size {
                                terminal = Some(TurboError::TruncatedBody {
                                    expected: size,
                                    received: head,
                                });
                            }
                        }
                    }
                }
                Err(e) => {
                    // A dead writer (e.g. disk full) outranks the worker
                    // cancellations it caused
                    let replaces = match &terminal {
                        None => true,
                        Some(TurboError::Interrupted) => !matches!(e, TurboError::Interrupted),
                        Some(_) => false,
                    };
                    if replaces {
                        terminal = Some(e);
                    }
                }
            }
        }

        if let Some(watcher) = watcher {
            watcher.abort();
        }

        match terminal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Emit transfer snapshots at 10 Hz until aborted or canceled
    fn spawn_ticker(
        &self,
        bytes_received: Arc<AtomicU64>,
        bytes_written: Arc<AtomicU64>,
        total_bytes: Option<u64>,
        cancel: CancellationToken,
    ) -> Option<tokio::task::JoinHandle<()>> {
        if !self.options.show_progress {
            return None;
        }
        let sink = self.sink.clone()?;

        Some(tokio::spawn(async move {
            let mut window = SpeedWindow::new(SPEED_WINDOW);
            let mut interval = tokio::time::interval(PROGRESS_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }

                let received = bytes_received.load(Ordering::Relaxed);
                window.record(Instant::now(), received);
                sink.on_event(&ProgressEvent {
                    phase: Phase::Downloading,
                    bytes_received: received,
                    bytes_written: bytes_written.load(Ordering::Relaxed),
                    total_bytes,
                    speed_bps: window.bytes_per_second(),
                });
            }
        }))
    }

    fn emit_phase(&self, phase: Phase, bytes_received: u64, bytes_written: u64, total: Option<u64>) {
        if !self.options.show_progress {
            return;
        }
        if let Some(sink) = &self.sink {
            sink.on_event(&ProgressEvent {
                phase,
                bytes_received,
                bytes_written,
                total_bytes: total,
                speed_bps: 0.0,
            });
        }
    }
}

/// A directory output path receives the derived filename inside it
async fn resolve_destination(output_path: &Path, filename: &str) -> PathBuf {
    match tokio::fs::metadata(output_path).await {
        Ok(meta) if meta.is_dir() => output_path.join(filename),
        _ => output_path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_destination_directory() {
        let dir = tempfile::tempdir().unwrap();
        let resolved = resolve_destination(dir.path(), "file.bin").await;
        assert_eq!(resolved, dir.path().join("file.bin"));
    }

    #[tokio::test]
    async fn test_resolve_destination_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let explicit = dir.path().join("named.bin");
        let resolved = resolve_destination(&explicit, "ignored.bin").await;
        assert_eq!(resolved, explicit);
    }
}
