/*
 * turbodl - Multi-connection HTTP download accelerator.
 * Copyright (C) 2025  turbodl contributors
 */

//! Structured progress events. The engine stays headless: it emits events
//! to an injected sink and never renders anything itself.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Job phase carried on every event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Probing,
    Downloading,
    Hashing,
}

/// Snapshot of the job counters, emitted at 10 Hz or better while
/// downloading and once per phase change
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub phase: Phase,
    /// Bytes received from the network so far
    pub bytes_received: u64,
    /// Bytes persisted to the output file so far
    pub bytes_written: u64,
    /// Advertised total, when the server revealed one
    pub total_bytes: Option<u64>,
    /// Receive rate over a short sliding window, bytes per second
    pub speed_bps: f64,
}

/// Receiver for progress events
pub trait ProgressSink: Send + Sync {
    fn on_event(&self, event: &ProgressEvent);
}

/// Sliding-window rate estimator over cumulative byte counts
pub(crate) struct SpeedWindow {
    samples: VecDeque<(Instant, u64)>,
    window: Duration,
}

impl SpeedWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            samples: VecDeque::new(),
            window,
        }
    }

    /// Record the cumulative byte count observed at `now`
    pub fn record(&mut self, now: Instant, total_bytes: u64) {
        self.samples.push_back((now, total_bytes));
        let Some(horizon) = now.checked_sub(self.window) else {
            return;
        };
        // Always keep two samples so a quiet stretch still yields a rate
        while self.samples.len() > 2 {
            match self.samples.front() {
                Some(&(oldest, _)) if oldest < horizon => self.samples.pop_front(),
                _ => break,
            };
        }
    }

    /// Current rate in bytes per second
    pub fn bytes_per_second(&self) -> f64 {
        let (Some(&(first_at, first)), Some(&(last_at, last))) =
            (self.samples.front(), self.samples.back())
        else {
            return 0.0;
        };

        let elapsed = last_at.duration_since(first_at).as_secs_f64();
        if elapsed <= f64::EPSILON {
            return 0.0;
        }
        (last - first) as f64 / elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speed_over_steady_stream() {
        let start = Instant::now();
        let mut window = SpeedWindow::new(Duration::from_secs(3));

        for i in 0..=10u64 {
            window.record(start + Duration::from_millis(i * 100), i * 100_000);
        }

        let bps = window.bytes_per_second();
        assert!((bps - 1_000_000.0).abs() < 1_000.0, "got {bps}");
    }

    #[test]
    fn test_speed_without_samples() {
        let window = SpeedWindow::new(Duration::from_secs(3));
        assert_eq!(window.bytes_per_second(), 0.0);
    }

    #[test]
    fn test_old_samples_fall_out_of_window() {
        let start = Instant::now();
        let mut window = SpeedWindow::new(Duration::from_secs(1));

        // A fast burst long ago must not inflate the current rate
        window.record(start, 0);
        window.record(start + Duration::from_millis(100), 10_000_000);
        for i in 0..20u64 {
            window.record(
                start + Duration::from_secs(10) + Duration::from_millis(i * 100),
                10_000_000 + i * 1_000,
            );
        }

        let bps = window.bytes_per_second();
        assert!(bps < 100_000.0, "got {bps}");
    }
}
