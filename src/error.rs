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

//! Error types for the download engine with retryability classification.

use reqwest::StatusCode;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for TurboDL operations
#[derive(Debug, Error)]
pub enum TurboError {
    /// URL is malformed or uses an unsupported scheme
    #[error("Invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// DNS resolution or TCP/TLS connect failure
    #[error("Network unreachable for '{url}': {message}")]
    NetworkUnreachable {
        url: String,
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    /// Server answered with an unexpected status code
    #[error("Remote server returned {status} for '{url}'")]
    RemoteStatus { url: String, status: StatusCode },

    /// Neither Content-Length nor Content-Range revealed the file size
    #[error("Unable to determine file size for '{url}'")]
    UnidentifiedFileSize { url: String },

    /// A ranged request was answered with 200, ignoring the Range header
    #[error("Server ignored range request for '{url}'")]
    RangesNotHonored { url: String },

    /// Response body ended before the requested range was complete
    #[error("Truncated body: expected {expected} bytes, received {received}")]
    TruncatedBody { expected: u64, received: u64 },

    /// No bytes arrived within the inactivity window
    #[error("No data received for {seconds} seconds")]
    InactivityTimeout { seconds: u64 },

    /// The job-level timeout elapsed
    #[error("Download timed out after {seconds} seconds")]
    JobTimeout { seconds: u64 },

    /// Downloaded file hash differs from the expected hash
    #[error("Hash verification failed ({algorithm}): expected {expected}, got {actual}")]
    HashMismatch {
        algorithm: String,
        expected: String,
        actual: String,
    },

    /// Destination filesystem lacks room for the file
    #[error("Not enough space at '{path}': {required} bytes required, {available} available")]
    InsufficientSpace {
        path: PathBuf,
        required: u64,
        available: u64,
    },

    /// Filesystem error while creating, writing or renaming the output
    #[error("I/O error for '{path}': {message}")]
    Io {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// The job was canceled by the caller
    #[error("Download interrupted")]
    Interrupted,

    /// The shared HTTP client could not be constructed
    #[error("Failed to initialize HTTP client: {message}")]
    ClientInit { message: String },
}

impl TurboError {
    /// Whether a worker may retry after this error (with backoff).
    ///
    /// Non-retryable errors become the job's terminal error and cancel
    /// the remaining workers.
    pub fn is_retryable(&self) -> bool {
        match self {
            TurboError::NetworkUnreachable { .. } => true,
            TurboError::InactivityTimeout { .. } => true,
            TurboError::TruncatedBody { .. } => true,
            TurboError::RemoteStatus { status, .. } => {
                matches!(status.as_u16(), 408 | 425 | 429 | 500..=599)
            }
            _ => false,
        }
    }

    /// Classify a reqwest transport error against the URL it hit.
    pub fn from_http(url: &str, err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return TurboError::RemoteStatus {
                url: url.to_string(),
                status,
            };
        }

        TurboError::NetworkUnreachable {
            url: url.to_string(),
            message: err.to_string(),
            source: Some(err),
        }
    }

    /// Create an I/O error bound to a path
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TurboError::Io {
            path: path.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }
}

/// Result type alias for TurboDL operations
pub type Result<T> = std::result::Result<T, TurboError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_statuses() {
        for code in [408u16, 425, 429, 500, 502, 503] {
            let err = TurboError::RemoteStatus {
                url: "http://test".into(),
                status: StatusCode::from_u16(code).unwrap(),
            };
            assert!(err.is_retryable(), "{code} should be retryable");
        }

        for code in [400u16, 401, 403, 404, 410] {
            let err = TurboError::RemoteStatus {
                url: "http://test".into(),
                status: StatusCode::from_u16(code).unwrap(),
            };
            assert!(!err.is_retryable(), "{code} should not be retryable");
        }
    }

    #[test]
    fn test_fatal_kinds_not_retryable() {
        assert!(!TurboError::Interrupted.is_retryable());
        assert!(!TurboError::JobTimeout { seconds: 10 }.is_retryable());
        assert!(!TurboError::HashMismatch {
            algorithm: "md5".into(),
            expected: "aa".into(),
            actual: "bb".into(),
        }
        .is_retryable());
    }

    #[test]
    fn test_transient_kinds_retryable() {
        assert!(TurboError::InactivityTimeout { seconds: 120 }.is_retryable());
        assert!(TurboError::TruncatedBody {
            expected: 100,
            received: 40
        }
        .is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = TurboError::HashMismatch {
            algorithm: "md5".into(),
            expected: "aaaa".into(),
            actual: "bbbb".into(),
        };
        assert_eq!(
            format!("{}", err),
            "Hash verification failed (md5): expected aaaa, got bbbb"
        );
    }
}
