/*
 * turbodl - Multi-connection HTTP download accelerator.
 * Copyright (C) 2025  turbodl contributors
 */

//! Download plan construction: worker count and chunk partitioning.

use super::probe::RemoteFileInfo;
use super::{ConnectionCount, DownloadOptions, RamBufferMode};
use crate::system::SystemProbe;
use std::path::Path;
use std::time::Duration;

/// Hard ceiling on parallel connections
pub const MAX_WORKERS: usize = 24;
/// Floor for the automatic worker count
pub const MIN_AUTO_WORKERS: usize = 2;
/// Files at or below this size always use a single worker
const SINGLE_WORKER_THRESHOLD: u64 = 1024 * 1024;

const MIB: f64 = 1024.0 * 1024.0;

/// Size anchors (MiB) for the worker-count table rows
const SIZE_ANCHORS_MIB: [f64; 5] = [0.0, 10.0, 100.0, 1024.0, 5120.0];
/// Bandwidth anchors (Mbps) for the worker-count table columns
const MBPS_ANCHORS: [f64; 4] = [0.0, 10.0, 100.0, 500.0];
/// Worker counts at each (size, bandwidth) anchor pair
const WORKER_TABLE: [[f64; 4]; 5] = [
    [2.0, 2.0, 4.0, 4.0],
    [2.0, 4.0, 8.0, 10.0],
    [4.0, 8.0, 12.0, 16.0],
    [4.0, 12.0, 16.0, 20.0],
    [8.0, 16.0, 20.0, 24.0],
];

/// A contiguous byte range of the remote file assigned to one worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub index: usize,
    /// Start byte offset (inclusive)
    pub start: u64,
    /// End byte offset (inclusive)
    pub end: u64,
}

impl Chunk {
    /// Total size of this chunk in bytes
    pub fn size(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Resolved settings for one download job
#[derive(Debug, Clone)]
pub struct DownloadPlan {
    pub worker_count: usize,
    /// Ordered, gap-free partition of `[0, size - 1]`; empty when the size
    /// is zero or unknown
    pub chunks: Vec<Chunk>,
    pub size: Option<u64>,
    pub supports_ranges: bool,
    pub use_ram_buffer: bool,
    pub pre_allocate: bool,
    pub connect_timeout: Duration,
    pub inactivity_timeout: Duration,
    /// Per-chunk overall timeout; `None` means unbounded
    pub chunk_timeout: Option<Duration>,
}

impl DownloadPlan {
    /// Average chunk length, used to size the RAM buffer
    pub fn average_chunk_len(&self) -> u64 {
        match (self.size, self.chunks.len()) {
            (Some(size), n) if n > 0 => size / n as u64,
            (Some(size), _) => size,
            (None, _) => 0,
        }
    }
}

/// Build the plan for a probed file.
///
/// `destination_dir` is the directory that will hold the output file; it
/// drives the RAM-buffer auto resolution.
pub fn build_plan(
    info: &RemoteFileInfo,
    options: &DownloadOptions,
    system: &dyn SystemProbe,
    destination_dir: &Path,
) -> DownloadPlan {
    let worker_count = worker_count(info.size, info.supports_ranges, options);

    let chunks = match info.size {
        Some(size) if size > 0 => partition(size, worker_count),
        _ => Vec::new(),
    };
    let worker_count = if chunks.is_empty() { 1 } else { chunks.len() };

    let use_ram_buffer = match options.use_ram_buffer {
        RamBufferMode::On => true,
        RamBufferMode::Off => false,
        // Staging bytes in RAM to write them back into RAM gains nothing
        RamBufferMode::Auto => !system.is_ram_backed(destination_dir),
    };

    DownloadPlan {
        worker_count,
        chunks,
        size: info.size,
        supports_ranges: info.supports_ranges,
        use_ram_buffer,
        pre_allocate: options.pre_allocate_space,
        connect_timeout: Duration::from_secs(10),
        inactivity_timeout: options.inactivity_timeout,
        chunk_timeout: None,
    }
}

/// Resolve the worker count from size, range support and user preference
fn worker_count(size: Option<u64>, supports_ranges: bool, options: &DownloadOptions) -> usize {
    let size = match size {
        Some(size) if supports_ranges => size,
        // Unknown size or no range support: nothing to parallelize over
        _ => return 1,
    };

    if size <= SINGLE_WORKER_THRESHOLD {
        return 1;
    }

    match options.max_connections {
        ConnectionCount::Fixed(n) => (n as usize).clamp(1, MAX_WORKERS),
        ConnectionCount::Auto => auto_worker_count(size, options.connection_speed_mbps),
    }
}

/// Interpolated lookup in the reference table, clamped to `[2, 24]`.
///
/// Anchors sit at the lower bound of each table band; between anchors the
/// count is interpolated linearly along both axes. Larger files and faster
/// links both push the count up.
pub fn auto_worker_count(size: u64, speed_mbps: f64) -> usize {
    let size_mib = size as f64 / MIB;
    let speed = if speed_mbps.is_finite() && speed_mbps > 0.0 {
        speed_mbps
    } else {
        80.0
    };

    let (si, st) = axis_position(&SIZE_ANCHORS_MIB, size_mib);
    let (mi, mt) = axis_position(&MBPS_ANCHORS, speed);

    let row_lo = lerp(WORKER_TABLE[si][mi], WORKER_TABLE[si][mi + 1], mt);
    let row_hi = lerp(WORKER_TABLE[si + 1][mi], WORKER_TABLE[si + 1][mi + 1], mt);
    let value = lerp(row_lo, row_hi, st);

    (value.round() as usize).clamp(MIN_AUTO_WORKERS, MAX_WORKERS)
}

/// Locate `x` between two anchors: returns the lower anchor index and the
/// fractional position towards the next one. Past the last anchor the
/// position saturates.
fn axis_position(anchors: &[f64], x: f64) -> (usize, f64) {
    let last = anchors.len() - 1;
    for i in (0..last).rev() {
        if x >= anchors[i] {
            if i == last - 1 && x >= anchors[last] {
                return (last - 1, 1.0);
            }
            let t = ((x - anchors[i]) / (anchors[i + 1] - anchors[i])).clamp(0.0, 1.0);
            return (i, t);
        }
    }
    (0, 0.0)
}

fn lerp(a: f64, b: f64, t: f64) -> f64 {
    a + (b - a) * t
}

/// Partition `[0, size - 1]` into `workers` chunks of `ceil(size / workers)`
/// bytes, the last absorbing the remainder. A worker count that would yield
/// an empty chunk is decremented until every chunk is non-empty.
pub fn partition(size: u64, workers: usize) -> Vec<Chunk> {
    assert!(size > 0, "cannot partition an empty file");

    let mut workers = workers.max(1) as u64;
    let chunk_size = loop {
        let chunk_size = size.div_ceil(workers);
        if chunk_size * (workers - 1) < size {
            break chunk_size;
        }
        workers -= 1;
    };

    (0..workers)
        .map(|i| {
            let start = i * chunk_size;
            let end = ((i + 1) * chunk_size - 1).min(size - 1);
            Chunk {
                index: i as usize,
                start,
                end,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::probe::RemoteFileInfo;
    use crate::system::testing::FixedProbe;

    fn info(size: Option<u64>, supports_ranges: bool) -> RemoteFileInfo {
        RemoteFileInfo {
            url: "http://example.com/file.bin".into(),
            size,
            filename: "file.bin".into(),
            content_type: None,
            supports_ranges,
            etag: None,
            last_modified: None,
        }
    }

    #[test]
    fn test_auto_count_reference_points() {
        // 25_209_000 bytes at 80 Mbps resolves to 8 workers
        assert_eq!(auto_worker_count(25_209_000, 80.0), 8);

        // Exact anchors hit the table cells directly
        assert_eq!(auto_worker_count(100 * 1024 * 1024, 100.0), 12);
        assert_eq!(auto_worker_count(6 * 1024 * 1024 * 1024, 600.0), 24);
    }

    #[test]
    fn test_auto_count_monotonic() {
        let sizes: [u64; 4] = [
            5 * 1024 * 1024,
            50 * 1024 * 1024,
            500 * 1024 * 1024,
            2 * 1024 * 1024 * 1024,
        ];
        let speeds = [5.0, 50.0, 200.0, 800.0];

        for window in sizes.windows(2) {
            for &speed in &speeds {
                assert!(auto_worker_count(window[0], speed) <= auto_worker_count(window[1], speed));
            }
        }
        for &size in &sizes {
            for window in speeds.windows(2) {
                assert!(auto_worker_count(size, window[0]) <= auto_worker_count(size, window[1]));
            }
        }
    }

    #[test]
    fn test_auto_count_bounds() {
        assert!(auto_worker_count(2 * 1024 * 1024, 0.5) >= MIN_AUTO_WORKERS);
        assert!(auto_worker_count(u64::MAX / 2, 10_000.0) <= MAX_WORKERS);
    }

    #[test]
    fn test_small_file_single_worker() {
        let options = DownloadOptions::default();
        assert_eq!(worker_count(Some(500), true, &options), 1);
        assert_eq!(worker_count(Some(1024 * 1024), true, &options), 1);
    }

    #[test]
    fn test_no_ranges_single_worker() {
        let options = DownloadOptions::default();
        assert_eq!(worker_count(Some(300 * 1024 * 1024), false, &options), 1);
        assert_eq!(worker_count(None, true, &options), 1);
    }

    #[test]
    fn test_fixed_count_clamped() {
        let mut options = DownloadOptions::default();
        options.max_connections = ConnectionCount::Fixed(64);
        assert_eq!(
            worker_count(Some(300 * 1024 * 1024), true, &options),
            MAX_WORKERS
        );
    }

    #[test]
    fn test_partition_covers_without_gaps() {
        for (size, workers) in [(25_209_000u64, 8usize), (1000, 3), (7, 7), (10, 8)] {
            let chunks = partition(size, workers);

            assert_eq!(chunks[0].start, 0);
            assert_eq!(chunks.last().unwrap().end, size - 1);
            for pair in chunks.windows(2) {
                assert_eq!(pair[1].start, pair[0].end + 1);
            }
            assert!(chunks.iter().all(|c| c.size() > 0));
            assert_eq!(chunks.iter().map(Chunk::size).sum::<u64>(), size);
        }
    }

    #[test]
    fn test_partition_equal_chunks() {
        // 25_209_000 / 8 divides exactly into 3_151_125-byte chunks
        let chunks = partition(25_209_000, 8);
        assert_eq!(chunks.len(), 8);
        assert!(chunks.iter().all(|c| c.size() == 3_151_125));
    }

    #[test]
    fn test_partition_drops_empty_tail() {
        // ceil(10 / 8) = 2 leaves three empty tails; the count shrinks to 5
        let chunks = partition(10, 8);
        assert_eq!(chunks.len(), 5);
        assert!(chunks.iter().all(|c| c.size() == 2));
    }

    #[test]
    fn test_build_plan_known_size() {
        let probe = FixedProbe::default();
        let options = DownloadOptions::default();
        let plan = build_plan(
            &info(Some(25_209_000), true),
            &options,
            &probe,
            Path::new("/tmp"),
        );

        assert_eq!(plan.worker_count, 8);
        assert_eq!(plan.chunks.len(), 8);
        assert!(plan.use_ram_buffer);
        assert_eq!(plan.inactivity_timeout, Duration::from_secs(120));
        assert_eq!(plan.connect_timeout, Duration::from_secs(10));
        assert_eq!(plan.chunk_timeout, None);
    }

    #[test]
    fn test_build_plan_ram_destination_disables_buffer() {
        let probe = FixedProbe {
            ram_backed: true,
            ..FixedProbe::default()
        };
        let options = DownloadOptions::default();
        let plan = build_plan(
            &info(Some(300 * 1024 * 1024), false),
            &options,
            &probe,
            Path::new("/dev/shm"),
        );

        // No range support keeps a single worker, but buffering is a
        // separate decision
        assert_eq!(plan.worker_count, 1);
        assert!(!plan.use_ram_buffer);
    }

    #[test]
    fn test_build_plan_explicit_buffer_mode() {
        let probe = FixedProbe {
            ram_backed: true,
            ..FixedProbe::default()
        };
        let mut options = DownloadOptions::default();
        options.use_ram_buffer = RamBufferMode::On;
        let plan = build_plan(&info(Some(1000), true), &options, &probe, Path::new("/tmp"));
        assert!(plan.use_ram_buffer);
    }
}
