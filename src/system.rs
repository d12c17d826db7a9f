/*
 * turbodl - Multi-connection HTTP download accelerator.
 * Copyright (C) 2025  turbodl contributors
 */

//! Host capabilities injected into the engine.
//!
//! The engine never talks to the OS directly for environment facts; it asks
//! a [`SystemProbe`]. Tests substitute a fixed probe, the CLI installs
//! [`HostProbe`].

use std::path::Path;
use sysinfo::{Disks, MemoryRefreshKind, RefreshKind, System};

/// Filesystems that live in RAM; writing through a RAM buffer to one of
/// these would double the memory cost for nothing.
const RAM_FILESYSTEMS: &[&str] = &["tmpfs", "ramfs", "devtmpfs"];

/// Environment facts the engine needs from the host
pub trait SystemProbe: Send + Sync {
    /// Total physical memory in bytes
    fn total_memory_bytes(&self) -> u64;

    /// Whether the filesystem holding `path` is RAM-backed
    fn is_ram_backed(&self, path: &Path) -> bool;

    /// Free bytes on the filesystem holding `path`, if it can be determined
    fn free_space_bytes(&self, path: &Path) -> Option<u64>;
}

/// [`SystemProbe`] backed by sysinfo
pub struct HostProbe;

impl HostProbe {
    /// Find the mounted disk whose mount point is the longest prefix of `path`
    fn disk_for<'a>(disks: &'a Disks, path: &Path) -> Option<&'a sysinfo::Disk> {
        disks
            .iter()
            .filter(|d| path.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())
    }
}

impl SystemProbe for HostProbe {
    fn total_memory_bytes(&self) -> u64 {
        let sys = System::new_with_specifics(
            RefreshKind::nothing().with_memory(MemoryRefreshKind::everything()),
        );
        sys.total_memory()
    }

    fn is_ram_backed(&self, path: &Path) -> bool {
        let disks = Disks::new_with_refreshed_list();
        match Self::disk_for(&disks, path) {
            Some(disk) => {
                let fs = disk.file_system().to_string_lossy().to_ascii_lowercase();
                RAM_FILESYSTEMS.iter().any(|known| fs == *known)
            }
            None => false,
        }
    }

    fn free_space_bytes(&self, path: &Path) -> Option<u64> {
        let disks = Disks::new_with_refreshed_list();
        Self::disk_for(&disks, path).map(|d| d.available_space())
    }
}

/// Test support: probes with canned answers
pub mod testing {
    use super::*;

    /// Fixed-answer probe for tests
    pub struct FixedProbe {
        pub total_memory: u64,
        pub ram_backed: bool,
        pub free_space: Option<u64>,
    }

    impl Default for FixedProbe {
        fn default() -> Self {
            Self {
                total_memory: 8 * 1024 * 1024 * 1024,
                ram_backed: false,
                free_space: None,
            }
        }
    }

    impl SystemProbe for FixedProbe {
        fn total_memory_bytes(&self) -> u64 {
            self.total_memory
        }

        fn is_ram_backed(&self, _path: &Path) -> bool {
            self.ram_backed
        }

        fn free_space_bytes(&self, _path: &Path) -> Option<u64> {
            self.free_space
        }
    }
}
