/*
 * turbodl - Multi-connection HTTP download accelerator.
 * Copyright (C) 2025  turbodl contributors
 */

//! Range workers: each one fetches exactly one chunk end-to-end, retrying
//! with exponential backoff and resuming from its committed byte count.

use super::buffer::{BufferError, ChunkBuffer};
use super::writer::write_all_at;
use crate::error::{Result, TurboError};
use futures::StreamExt;
use reqwest::{header, Client, StatusCode};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Retry bound per chunk, counting the first attempt
pub const MAX_ATTEMPTS: u32 = 5;
/// Base delay for exponential backoff
const BACKOFF_BASE_MS: u64 = 500;
/// Ceiling on a single backoff delay
const BACKOFF_CAP_MS: u64 = 30_000;
/// Bytes gathered before handing off to the buffer or the file
const FLUSH_THRESHOLD: usize = 64 * 1024;

/// Observable lifecycle of one worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Pending,
    Running,
    Retrying,
    Done,
    Failed,
    Canceled,
}

impl WorkerStatus {
    fn as_u8(self) -> u8 {
        match self {
            WorkerStatus::Pending => 0,
            WorkerStatus::Running => 1,
            WorkerStatus::Retrying => 2,
            WorkerStatus::Done => 3,
            WorkerStatus::Failed => 4,
            WorkerStatus::Canceled => 5,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => WorkerStatus::Running,
            2 => WorkerStatus::Retrying,
            3 => WorkerStatus::Done,
            4 => WorkerStatus::Failed,
            5 => WorkerStatus::Canceled,
            _ => WorkerStatus::Pending,
        }
    }
}

/// Shared, atomically updated state of one worker
#[derive(Debug)]
pub struct WorkerState {
    pub chunk_index: usize,
    attempt: AtomicU32,
    bytes_completed: AtomicU64,
    status: AtomicU8,
}

impl WorkerState {
    pub fn new(chunk_index: usize) -> Self {
        Self {
            chunk_index,
            attempt: AtomicU32::new(0),
            bytes_completed: AtomicU64::new(0),
            status: AtomicU8::new(WorkerStatus::Pending.as_u8()),
        }
    }

    /// Attempts made so far, counting the one in flight
    pub fn attempt(&self) -> u32 {
        self.attempt.load(Ordering::Relaxed)
    }

    /// Bytes committed to the buffer or the file for this chunk
    pub fn bytes_completed(&self) -> u64 {
        self.bytes_completed.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> WorkerStatus {
        WorkerStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    fn set_status(&self, status: WorkerStatus) {
        self.status.store(status.as_u8(), Ordering::Release);
    }

    fn begin_attempt(&self) -> u32 {
        self.set_status(WorkerStatus::Running);
        self.attempt.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn add_bytes(&self, bytes: u64) {
        self.bytes_completed.fetch_add(bytes, Ordering::Relaxed);
    }
}

/// Where fetched bytes go
#[derive(Clone)]
pub(crate) enum ByteSink {
    /// Staged through the ordered RAM buffer
    Buffered {
        buffer: Arc<ChunkBuffer>,
        path: PathBuf,
    },
    /// Positional writes straight into the output file
    Direct {
        file: Arc<std::fs::File>,
        path: PathBuf,
    },
}

/// One chunk fetch, owned by the controller for the duration of the job
pub(crate) struct RangeWorker {
    pub client: Client,
    pub url: String,
    /// Absolute offset of the first byte of the chunk
    pub start: u64,
    /// Absolute offset of the last byte (inclusive); `None` streams to EOF
    /// without a Range header
    pub end: Option<u64>,
    pub state: Arc<WorkerState>,
    pub sink: ByteSink,
    pub bytes_received: Arc<AtomicU64>,
    pub cancel: CancellationToken,
    pub inactivity_timeout: Duration,
    /// A 200 answer to the ranged request is acceptable (single-worker jobs
    /// reading from offset zero)
    pub allow_full_response: bool,
}

impl RangeWorker {
    pub async fn run(self) -> Result<()> {
        let result = self.run_with_retries().await;
        match &result {
            Ok(()) => self.state.set_status(WorkerStatus::Done),
            Err(TurboError::Interrupted) => self.state.set_status(WorkerStatus::Canceled),
            Err(_) => self.state.set_status(WorkerStatus::Failed),
        }
        result
    }

    async fn run_with_retries(&self) -> Result<()> {
        loop {
            let attempt = self.state.begin_attempt();

            match self.attempt_once().await {
                Ok(()) => return Ok(()),
                Err(TurboError::Interrupted) => return Err(TurboError::Interrupted),
                Err(e) if e.is_retryable() && attempt < MAX_ATTEMPTS && self.can_resume() => {
                    let delay = backoff_delay(attempt);
                    warn!(
                        chunk = self.state.chunk_index,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "chunk attempt failed, backing off"
                    );
                    self.state.set_status(WorkerStatus::Retrying);
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(TurboError::Interrupted),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// A plain GET stream cannot be resumed once bytes were committed; the
    /// already-drained prefix is unreachable on a fresh request.
    fn can_resume(&self) -> bool {
        self.end.is_some() || self.state.bytes_completed() == 0
    }

    async fn attempt_once(&self) -> Result<()> {
        let chunk_len = self.end.map(|end| end - self.start + 1);
        let completed = self.state.bytes_completed();
        if let Some(chunk_len) = chunk_len {
            if completed >= chunk_len {
                return Ok(());
            }
        }

        let position = self.start + completed;
        let mut request = self.client.get(&self.url);
        if let Some(end) = self.end {
            request = request.header(header::RANGE, format!("bytes={position}-{end}"));
        }

        let response = tokio::select! {
            _ = self.cancel.cancelled() => return Err(TurboError::Interrupted),
            result = request.send() => {
                result.map_err(|e| TurboError::from_http(&self.url, e))?
            }
        };

        match response.status() {
            StatusCode::PARTIAL_CONTENT => {}
            StatusCode::OK if self.end.is_none() => {}
            StatusCode::OK if self.allow_full_response && position == 0 => {}
            StatusCode::OK => {
                return Err(TurboError::RangesNotHonored {
                    url: self.url.clone(),
                })
            }
            status => {
                return Err(TurboError::RemoteStatus {
                    url: self.url.clone(),
                    status,
                })
            }
        }

        debug!(
            chunk = self.state.chunk_index,
            position,
            end = ?self.end,
            "streaming chunk body"
        );

        let mut stream = response.bytes_stream();
        let mut stash: Vec<u8> = Vec::with_capacity(FLUSH_THRESHOLD);

        loop {
            let item = tokio::select! {
                _ = self.cancel.cancelled() => return Err(TurboError::Interrupted),
                item = timeout(self.inactivity_timeout, stream.next()) => item,
            };

            match item {
                Ok(Some(Ok(data))) => {
                    // Clamp against servers that send past the range end
                    let pending = self.state.bytes_completed() + stash.len() as u64;
                    let take = match chunk_len {
                        Some(chunk_len) => {
                            (chunk_len.saturating_sub(pending) as usize).min(data.len())
                        }
                        None => data.len(),
                    };
                    stash.extend_from_slice(&data[..take]);

                    if stash.len() >= FLUSH_THRESHOLD {
                        self.flush(&mut stash).await?;
                    }
                    if let Some(chunk_len) = chunk_len {
                        if self.state.bytes_completed() + stash.len() as u64 >= chunk_len {
                            self.flush(&mut stash).await?;
                            return Ok(());
                        }
                    }
                }
                Ok(Some(Err(e))) => {
                    // Bytes that made it through are good; keep them so the
                    // retry resumes instead of restarting
                    self.flush(&mut stash).await?;
                    return Err(TurboError::from_http(&self.url, e));
                }
                Ok(None) => {
                    self.flush(&mut stash).await?;
                    let completed = self.state.bytes_completed();
                    return match chunk_len {
                        Some(chunk_len) if completed < chunk_len => {
                            Err(TurboError::TruncatedBody {
                                expected: chunk_len,
                                received: completed,
                            })
                        }
                        _ => Ok(()),
                    };
                }
                Err(_) => {
                    self.flush(&mut stash).await?;
                    return Err(TurboError::InactivityTimeout {
                        seconds: self.inactivity_timeout.as_secs(),
                    });
                }
            }
        }
    }

    /// Hand the stashed bytes to the sink at the worker's current absolute
    /// offset, then advance the counters.
    async fn flush(&self, stash: &mut Vec<u8>) -> Result<()> {
        if stash.is_empty() {
            return Ok(());
        }

        let data = std::mem::take(stash);
        let len = data.len() as u64;
        let offset = self.start + self.state.bytes_completed();

        match &self.sink {
            ByteSink::Buffered { buffer, path } => {
                let buffer = buffer.clone();
                let deposited = tokio::task::spawn_blocking(move || buffer.deposit(offset, data))
                    .await
                    .map_err(|e| TurboError::Io {
                        path: path.clone(),
                        message: e.to_string(),
                        source: None,
                    })?;
                match deposited {
                    Ok(()) => {}
                    Err(BufferError::Canceled) => return Err(TurboError::Interrupted),
                    Err(e) => {
                        return Err(TurboError::Io {
                            path: path.clone(),
                            message: e.to_string(),
                            source: None,
                        })
                    }
                }
            }
            ByteSink::Direct { file, path } => {
                let file = file.clone();
                let write_path = path.clone();
                tokio::task::spawn_blocking(move || write_all_at(&file, &data, offset))
                    .await
                    .map_err(|e| TurboError::Io {
                        path: path.clone(),
                        message: e.to_string(),
                        source: None,
                    })?
                    .map_err(|e| TurboError::io(write_path, e))?;
            }
        }

        self.state.add_bytes(len);
        self.bytes_received.fetch_add(len, Ordering::Relaxed);
        Ok(())
    }
}

/// Exponential backoff with jitter:
/// `min(base * 2^(k-1) * (1 + U(0, 0.3)), cap)`
fn backoff_delay(attempt: u32) -> Duration {
    let doubled = BACKOFF_BASE_MS.saturating_mul(1u64 << attempt.saturating_sub(1).min(16));
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    let jitter = (nanos % 1000) as f64 / 1000.0 * 0.3;
    let delay = (doubled as f64 * (1.0 + jitter)) as u64;
    Duration::from_millis(delay.min(BACKOFF_CAP_MS))
}
