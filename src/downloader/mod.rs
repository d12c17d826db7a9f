/*
 * turbodl - Multi-connection HTTP download accelerator.
 * Copyright (C) 2025  turbodl contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 */

//! Parallel ranged-download engine: probe, plan, buffered transfer and
//! finalization.

mod buffer;
mod controller;
mod finalize;
mod plan;
mod probe;
mod progress;
mod worker;
mod writer;

pub use buffer::{BufferError, ChunkBuffer, Drained};
pub use controller::TurboDl;
pub use finalize::{hash_file, sentinel_path, HashAlgorithm, SENTINEL_SUFFIX};
pub use plan::{auto_worker_count, build_plan, partition, Chunk, DownloadPlan, MAX_WORKERS};
pub use probe::{probe, RemoteFileInfo};
pub use progress::{Phase, ProgressEvent, ProgressSink};
pub use worker::{WorkerState, WorkerStatus, MAX_ATTEMPTS};

use crate::error::{Result, TurboError};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::redirect::Policy;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Headers the caller cannot override; the engine depends on them
const IMMUTABLE_HEADERS: [&str; 3] = ["accept-encoding", "range", "connection"];

/// Redirect chain cap for every request
const MAX_REDIRECTS: usize = 10;

/// Parallel connection preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionCount {
    /// Derive from file size and advertised bandwidth
    #[default]
    Auto,
    /// Exact count, clamped to `[1, 24]`
    Fixed(u32),
}

impl FromStr for ConnectionCount {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("auto") {
            return Ok(ConnectionCount::Auto);
        }
        match s.parse::<u32>() {
            Ok(n) if (1..=MAX_WORKERS as u32).contains(&n) => Ok(ConnectionCount::Fixed(n)),
            _ => Err(format!(
                "expected 'auto' or a number between 1 and {MAX_WORKERS}"
            )),
        }
    }
}

/// RAM-buffer preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RamBufferMode {
    /// On unless the destination itself is RAM-backed
    #[default]
    Auto,
    On,
    Off,
}

impl FromStr for RamBufferMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(RamBufferMode::Auto),
            "on" => Ok(RamBufferMode::On),
            "off" => Ok(RamBufferMode::Off),
            _ => Err("expected 'auto', 'on' or 'off'".to_string()),
        }
    }
}

/// Caller-facing options for one engine instance
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub max_connections: ConnectionCount,
    /// Advertised link speed in Mbps, feeding the automatic worker count
    pub connection_speed_mbps: f64,
    /// Reserve the full file size on disk before downloading
    pub pre_allocate_space: bool,
    pub use_ram_buffer: RamBufferMode,
    /// Replace an existing destination instead of numbering a new one
    pub overwrite: bool,
    /// Extra request headers, merged over the defaults
    pub headers: Vec<(String, String)>,
    /// Job-level timeout; `None` means unbounded
    pub timeout: Option<Duration>,
    /// Abort an idle connection after this long without bytes
    pub inactivity_timeout: Duration,
    /// Expected digest of the finished file, hex, compared case-insensitively
    pub expected_hash: Option<String>,
    pub hash_type: HashAlgorithm,
    pub show_progress: bool,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            max_connections: ConnectionCount::Auto,
            connection_speed_mbps: 80.0,
            pre_allocate_space: false,
            use_ram_buffer: RamBufferMode::Auto,
            overwrite: true,
            headers: Vec::new(),
            timeout: None,
            inactivity_timeout: Duration::from_secs(120),
            expected_hash: None,
            hash_type: HashAlgorithm::Md5,
            show_progress: true,
        }
    }
}

/// Build the shared, pooled HTTP client: keep-alive on, HTTP/2 when the
/// server offers it, redirects capped at ten.
pub(crate) fn build_client(options: &DownloadOptions) -> Result<reqwest::Client> {
    let mut headers = HeaderMap::new();
    headers.insert(
        reqwest::header::USER_AGENT,
        HeaderValue::from_static(concat!("turbodl/", env!("CARGO_PKG_VERSION"))),
    );
    headers.insert(reqwest::header::ACCEPT, HeaderValue::from_static("*/*"));
    headers.insert(
        reqwest::header::ACCEPT_ENCODING,
        HeaderValue::from_static("identity"),
    );

    for (name, value) in &options.headers {
        if IMMUTABLE_HEADERS
            .iter()
            .any(|immutable| name.eq_ignore_ascii_case(immutable))
        {
            warn!(header = %name, "ignoring attempt to override a required header");
            continue;
        }
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => warn!(header = %name, "ignoring malformed header"),
        }
    }

    reqwest::Client::builder()
        .default_headers(headers)
        .redirect(Policy::limited(MAX_REDIRECTS))
        .connect_timeout(Duration::from_secs(10))
        .pool_max_idle_per_host(MAX_WORKERS)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_nodelay(true)
        .tcp_keepalive(Some(Duration::from_secs(15)))
        .http2_adaptive_window(true)
        .http2_keep_alive_interval(Some(Duration::from_secs(10)))
        .http2_keep_alive_timeout(Duration::from_secs(20))
        .build()
        .map_err(|e| TurboError::ClientInit {
            message: e.to_string(),
        })
}
