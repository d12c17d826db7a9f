/*
 * turbodl - Multi-connection HTTP download accelerator.
 * Copyright (C) 2025  turbodl contributors
 */

//! Bounded in-memory staging buffer between range workers and the writer.
//!
//! Producers deposit byte segments tagged with their absolute file offset;
//! a single consumer drains the contiguous prefix in order. Coordination is
//! a mutex over an ordered segment map plus two condition variables, one for
//! fullness and one for emptiness. All methods block, so async callers go
//! through the blocking executor.

use std::collections::BTreeMap;
use std::sync::{Condvar, Mutex};
use thiserror::Error;

const GIB: u64 = 1024 * 1024 * 1024;

/// Capacity reserved for deposits that extend the drainable prefix, so the
/// worker feeding the writer cannot be starved by workers running ahead
const FRONTIER_RESERVE: u64 = 64 * 1024;

/// Staging target when the remote size is unknown
const UNKNOWN_SIZE_STAGING: u64 = 32 * 1024 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    /// The buffer was canceled; all blocked calls return this
    #[error("buffer canceled")]
    Canceled,

    /// Deposit entirely behind the head cursor; those bytes were already
    /// drained
    #[error("stale deposit at offset {offset}, head is {head}")]
    Stale { offset: u64, head: u64 },

    /// Deposit after `close_input`
    #[error("deposit after input was closed")]
    Closed,

    /// `reset` on a buffer still holding data
    #[error("buffer is not idle")]
    NotIdle,
}

/// Outcome of a `drain_contiguous` call
#[derive(Debug, PartialEq, Eq)]
pub enum Drained {
    /// The contiguous prefix that started at `offset`
    Data { offset: u64, bytes: Vec<u8> },
    /// Input closed and everything before the head was drained
    EndOfStream,
}

#[derive(Debug, Default)]
struct Shared {
    /// Segments keyed by absolute file offset, pairwise disjoint
    segments: BTreeMap<u64, Vec<u8>>,
    /// Sum of all segment lengths
    occupied: u64,
    /// Next byte the writer will emit
    head: u64,
    closed: bool,
    canceled: bool,
}

impl Shared {
    /// End of the contiguous run starting at the head cursor
    fn frontier(&self) -> u64 {
        let mut frontier = self.head;
        while let Some(segment) = self.segments.get(&frontier) {
            frontier += segment.len() as u64;
        }
        frontier
    }
}

/// Fixed-capacity ordered byte store with backpressure
pub struct ChunkBuffer {
    capacity: u64,
    reserve: u64,
    shared: Mutex<Shared>,
    not_full: Condvar,
    not_empty: Condvar,
}

impl ChunkBuffer {
    pub fn new(capacity: u64) -> Self {
        let capacity = capacity.max(2);
        Self {
            capacity,
            reserve: FRONTIER_RESERVE.min(capacity / 2),
            shared: Mutex::new(Shared::default()),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
        }
    }

    /// Capacity policy: the smallest of 20% of system RAM, 1 GiB, and the
    /// next power of two holding two average chunks. The RAM share is a
    /// hard ceiling.
    pub fn capacity_for(total_memory: u64, average_chunk: u64) -> u64 {
        let average_chunk = if average_chunk == 0 {
            UNKNOWN_SIZE_STAGING
        } else {
            average_chunk
        };
        let wanted = average_chunk.saturating_mul(2).next_power_of_two();
        (total_memory / 5).min(GIB).min(wanted)
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Next byte offset the writer will emit
    pub fn head_offset(&self) -> u64 {
        self.shared.lock().unwrap().head
    }

    /// Bytes currently held
    pub fn occupied(&self) -> u64 {
        self.shared.lock().unwrap().occupied
    }

    /// Store `data` at absolute file offset `offset`, blocking while the
    /// buffer is too full to accept it.
    ///
    /// A deposit that begins exactly at the contiguous frontier may use the
    /// reserved tail of the capacity and is admitted piecewise, so the
    /// writer always has something to drain; other deposits wait for room
    /// below `capacity - reserve`.
    pub fn deposit(&self, offset: u64, data: Vec<u8>) -> Result<(), BufferError> {
        if data.is_empty() {
            return Ok(());
        }

        let mut shared = self.shared.lock().unwrap();
        if offset + data.len() as u64 <= shared.head || offset < shared.head {
            return Err(BufferError::Stale {
                offset,
                head: shared.head,
            });
        }

        let mut position = offset;
        let mut data = &data[..];

        while !data.is_empty() {
            let admitted = loop {
                if shared.canceled {
                    return Err(BufferError::Canceled);
                }
                if shared.closed {
                    return Err(BufferError::Closed);
                }

                let at_frontier = position == shared.frontier();
                let limit = if at_frontier {
                    self.capacity
                } else {
                    self.capacity - self.reserve
                };
                let free = limit.saturating_sub(shared.occupied);

                if at_frontier && free > 0 {
                    break (free as usize).min(data.len());
                }
                if !at_frontier && free as usize >= data.len() {
                    break data.len();
                }

                shared = self.not_full.wait(shared).unwrap();
            };

            let (piece, rest) = data.split_at(admitted);
            let grows_prefix = position == shared.frontier();
            let _previous = shared.segments.insert(position, piece.to_vec());
            debug_assert!(_previous.is_none(), "overlapping deposit at {position}");
            shared.occupied += admitted as u64;
            position += admitted as u64;
            data = rest;

            if grows_prefix {
                self.not_empty.notify_all();
            }
        }

        Ok(())
    }

    /// Remove and return the longest prefix starting at the head cursor,
    /// blocking until one exists. Returns `EndOfStream` once the input is
    /// closed and no prefix remains.
    pub fn drain_contiguous(&self) -> Result<Drained, BufferError> {
        let mut shared = self.shared.lock().unwrap();

        loop {
            if shared.canceled {
                return Err(BufferError::Canceled);
            }

            let offset = shared.head;
            if let Some(first) = shared.segments.remove(&offset) {
                let mut cursor = offset + first.len() as u64;
                let mut bytes = first;
                while let Some(segment) = shared.segments.remove(&cursor) {
                    cursor += segment.len() as u64;
                    bytes.extend_from_slice(&segment);
                }

                shared.occupied -= bytes.len() as u64;
                shared.head = cursor;
                self.not_full.notify_all();
                return Ok(Drained::Data { offset, bytes });
            }

            if shared.closed {
                return Ok(Drained::EndOfStream);
            }

            shared = self.not_empty.wait(shared).unwrap();
        }
    }

    /// Mark all producers finished; the writer drains what is left and then
    /// sees `EndOfStream`.
    pub fn close_input(&self) {
        let mut shared = self.shared.lock().unwrap();
        shared.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Wake every blocked producer and the consumer with `Canceled`
    pub fn cancel(&self) {
        let mut shared = self.shared.lock().unwrap();
        shared.canceled = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Return the buffer to its initial state.
    ///
    /// Only legal while empty and with no producer or consumer active;
    /// callers are responsible for the latter.
    pub fn reset(&self) -> Result<(), BufferError> {
        let mut shared = self.shared.lock().unwrap();
        if !shared.segments.is_empty() || shared.occupied > 0 {
            return Err(BufferError::NotIdle);
        }
        *shared = Shared::default();
        Ok(())
    }
}
