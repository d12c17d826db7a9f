/*
 * turbodl - Multi-connection HTTP download accelerator.
 * Copyright (C) 2025  turbodl contributors
 */

//! Disk egress: the ordered drain loop for buffered downloads and the
//! positional write primitive shared with direct-mode workers.
//!
//! Everything here blocks and is meant to run on the blocking executor.

use super::buffer::{BufferError, ChunkBuffer, Drained};
use crate::error::{Result, TurboError};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

/// Write the whole of `buf` at `offset` without moving any shared cursor.
///
/// Positional writes keep concurrent disjoint-range writers from
/// interleaving through a shared seek position.
#[cfg(unix)]
pub(crate) fn write_all_at(file: &std::fs::File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
pub(crate) fn write_all_at(
    file: &std::fs::File,
    mut buf: &[u8],
    mut offset: u64,
) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let written = file.seek_write(buf, offset)?;
        if written == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "failed to write whole buffer",
            ));
        }
        buf = &buf[written..];
        offset += written as u64;
    }
    Ok(())
}

/// Drain the buffer into the output file until end-of-stream, emitting
/// bytes in strictly ascending offset order.
///
/// Returns the final head offset, which equals the file size on a complete
/// download.
pub(crate) fn drain_to_file(
    buffer: &ChunkBuffer,
    file: &std::fs::File,
    path: &Path,
    bytes_written: &AtomicU64,
) -> Result<u64> {
    loop {
        match buffer.drain_contiguous() {
            Ok(Drained::Data { offset, bytes }) => {
                if let Err(e) = write_all_at(file, &bytes, offset) {
                    // Unblock any depositor waiting on a drain that will
                    // never come
                    buffer.cancel();
                    return Err(TurboError::io(path, e));
                }
                bytes_written.fetch_add(bytes.len() as u64, Ordering::Relaxed);
            }
            Ok(Drained::EndOfStream) => return Ok(buffer.head_offset()),
            Err(BufferError::Canceled) => return Err(TurboError::Interrupted),
            Err(e) => {
                return Err(TurboError::Io {
                    path: path.to_path_buf(),
                    message: e.to_string(),
                    source: None,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_write_all_at_disjoint_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let file = std::fs::File::create(&path).unwrap();

        // Out of order on purpose
        write_all_at(&file, b"world", 5).unwrap();
        write_all_at(&file, b"hello", 0).unwrap();

        let mut content = String::new();
        std::fs::File::open(&path)
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "helloworld");
    }

    #[test]
    fn test_drain_to_file_orders_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let file = std::fs::File::create(&path).unwrap();
        let buffer = Arc::new(ChunkBuffer::new(1024));
        let written = AtomicU64::new(0);

        let producer = {
            let buffer = buffer.clone();
            thread::spawn(move || {
                buffer.deposit(6, b"buffer".to_vec()).unwrap();
                buffer.deposit(0, b"chunky".to_vec()).unwrap();
                buffer.close_input();
            })
        };

        let head = drain_to_file(&buffer, &file, &path, &written).unwrap();
        producer.join().unwrap();

        assert_eq!(head, 12);
        assert_eq!(written.load(Ordering::Relaxed), 12);
        assert_eq!(std::fs::read(&path).unwrap(), b"chunkybuffer");
    }

    #[test]
    fn test_drain_to_file_reports_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let file = std::fs::File::create(&path).unwrap();
        let buffer = Arc::new(ChunkBuffer::new(1024));
        let written = AtomicU64::new(0);

        let canceler = {
            let buffer = buffer.clone();
            thread::spawn(move || {
                thread::sleep(std::time::Duration::from_millis(50));
                buffer.cancel();
            })
        };

        let result = drain_to_file(&buffer, &file, &path, &written);
        canceler.join().unwrap();
        assert!(matches!(result, Err(TurboError::Interrupted)));
    }
}
