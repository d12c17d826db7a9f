/*
 * turbodl - Multi-connection HTTP download accelerator.
 * Copyright (C) 2025  turbodl contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! TurboDL accelerates HTTP(S) downloads by splitting a file across
//! multiple concurrent ranged requests, optionally staging bytes through a
//! bounded in-memory buffer before writing them to disk in order, and
//! verifying integrity after completion.
//!
//! # Quick Start
//!
//! ```no_run
//! use turbodl::{DownloadOptions, TurboDl};
//!
//! # async fn example() -> turbodl::Result<()> {
//! let engine = TurboDl::new(DownloadOptions::default())?;
//! let path = engine
//!     .download("https://example.com/large-file.iso", ".")
//!     .await?;
//! println!("saved to {}", path.display());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod downloader;
pub mod error;
pub mod logging;
pub mod system;

pub use downloader::{
    ConnectionCount, DownloadOptions, HashAlgorithm, Phase, ProgressEvent, ProgressSink,
    RamBufferMode, RemoteFileInfo, TurboDl,
};
pub use error::{Result, TurboError};
pub use system::{HostProbe, SystemProbe};
