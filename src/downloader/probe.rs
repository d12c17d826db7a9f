/*
 * turbodl - Multi-connection HTTP download accelerator.
 * Copyright (C) 2025  turbodl contributors
 */

//! Pre-download probe: resolve redirects and discover size, filename and
//! range support without consuming the body.

use crate::error::{Result, TurboError};
use percent_encoding::percent_decode_str;
use reqwest::{header, Client, Response, Url};
use sha2::{Digest, Sha256};
use tracing::debug;

/// What the server told us about the file
#[derive(Debug, Clone)]
pub struct RemoteFileInfo {
    /// Final URL after redirects
    pub url: String,
    /// Advertised size; `None` when the server does not reveal it
    pub size: Option<u64>,
    /// Filename derived from Content-Disposition, the URL path, or a
    /// deterministic fallback
    pub filename: String,
    pub content_type: Option<String>,
    pub supports_ranges: bool,
    /// Opaque coherence hints, passed through untouched
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

/// Probe `url` with a HEAD request, falling back to a one-byte ranged GET
/// when HEAD is rejected or silent about the size.
pub async fn probe(client: &Client, url: &str) -> Result<RemoteFileInfo> {
    let parsed = Url::parse(url).map_err(|e| TurboError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(TurboError::InvalidUrl {
            url: url.to_string(),
            reason: format!("unsupported scheme '{}'", parsed.scheme()),
        });
    }

    // Some servers mishandle HEAD entirely, so a transport error here still
    // falls through to the range probe
    let head = match client.head(parsed.clone()).send().await {
        Ok(response) if response.status().is_success() => Some(Fields::extract(&response)),
        Ok(response) => {
            debug!(status = %response.status(), "HEAD rejected, trying range probe");
            None
        }
        Err(e) => {
            debug!(error = %e, "HEAD failed, trying range probe");
            None
        }
    };

    let fields = match head {
        Some(fields) if fields.size.is_some() => fields,
        head => range_probe(client, parsed, head).await?,
    };

    let filename = fields
        .disposition
        .as_deref()
        .and_then(filename_from_disposition)
        .or_else(|| filename_from_url(&fields.final_url))
        .unwrap_or_else(|| fallback_filename(fields.final_url.as_str()));

    debug!(
        size = ?fields.size,
        ranges = fields.supports_ranges,
        filename = %filename,
        "probe complete"
    );

    Ok(RemoteFileInfo {
        url: fields.final_url.to_string(),
        size: fields.size,
        filename,
        content_type: fields.content_type,
        supports_ranges: fields.supports_ranges,
        etag: fields.etag,
        last_modified: fields.last_modified,
    })
}

/// Issue `GET` with `Range: bytes=0-0` and close the response immediately.
///
/// A 206 answer proves range support and carries the total size in
/// Content-Range; a 200 answer carries it in Content-Length.
async fn range_probe(client: &Client, url: Url, head: Option<Fields>) -> Result<Fields> {
    let response = client
        .get(url.clone())
        .header(header::RANGE, "bytes=0-0")
        .send()
        .await
        .map_err(|e| TurboError::from_http(url.as_str(), e))?;

    let status = response.status();
    if status != reqwest::StatusCode::PARTIAL_CONTENT && !status.is_success() {
        return Err(TurboError::RemoteStatus {
            url: url.to_string(),
            status,
        });
    }

    let mut fields = Fields::extract(&response);
    drop(response);

    if status == reqwest::StatusCode::PARTIAL_CONTENT {
        fields.supports_ranges = true;
        fields.size = fields.content_range_total.or(fields.size);
    }

    // A usable HEAD response still wins for everything it provided
    if let Some(head) = head {
        fields.size = head.size.or(fields.size);
        fields.supports_ranges |= head.supports_ranges;
        fields.content_type = head.content_type.or(fields.content_type);
        fields.disposition = head.disposition.or(fields.disposition);
        fields.etag = head.etag.or(fields.etag);
        fields.last_modified = head.last_modified.or(fields.last_modified);
    }

    Ok(fields)
}

/// Header fields shared by the HEAD and range-probe paths
#[derive(Debug)]
struct Fields {
    final_url: Url,
    size: Option<u64>,
    supports_ranges: bool,
    content_type: Option<String>,
    disposition: Option<String>,
    etag: Option<String>,
    last_modified: Option<String>,
    content_range_total: Option<u64>,
}

impl Fields {
    fn extract(response: &Response) -> Self {
        let headers = response.headers();
        let text = |name: header::HeaderName| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };

        let size = headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok());

        let supports_ranges = headers
            .get(header::ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains("bytes"))
            .unwrap_or(false);

        let content_type = text(header::CONTENT_TYPE)
            .map(|v| v.split(';').next().unwrap_or("").trim().to_string())
            .filter(|v| !v.is_empty());

        let content_range_total = headers
            .get(header::CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(content_range_total);

        Self {
            final_url: response.url().clone(),
            size,
            supports_ranges,
            content_type,
            disposition: text(header::CONTENT_DISPOSITION),
            etag: text(header::ETAG),
            last_modified: text(header::LAST_MODIFIED),
            content_range_total,
        }
    }
}

/// Total size from a Content-Range value like `bytes 0-0/12345`
fn content_range_total(value: &str) -> Option<u64> {
    value.split('/').next_back()?.trim().parse().ok()
}

/// RFC 6266 filename extraction: `filename*` (percent-encoded UTF-8) is
/// preferred over the plain `filename` parameter.
fn filename_from_disposition(value: &str) -> Option<String> {
    for part in value.split(';') {
        if let Some(rest) = part.trim().strip_prefix("filename*=") {
            let encoded = rest.trim().trim_matches('"');
            let encoded = encoded.rsplit('\'').next().unwrap_or(encoded);
            if let Ok(decoded) = percent_decode_str(encoded).decode_utf8() {
                let name = strip_path(&decoded);
                if !name.is_empty() {
                    return Some(name);
                }
            }
        }
    }

    for part in value.split(';') {
        if let Some(rest) = part.trim().strip_prefix("filename=") {
            let name = strip_path(rest.trim().trim_matches(|c| c == '"' || c == '\''));
            if !name.is_empty() {
                return Some(name);
            }
        }
    }

    None
}

/// Last path segment of the final URL, percent-decoded
fn filename_from_url(url: &Url) -> Option<String> {
    let segment = url.path_segments()?.filter(|s| !s.is_empty()).next_back()?;
    let decoded = percent_decode_str(segment).decode_utf8().ok()?;
    let name = strip_path(&decoded);
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

/// Deterministic name for URLs that reveal nothing
fn fallback_filename(url: &str) -> String {
    let digest = Sha256::digest(url.as_bytes());
    format!("download_{}", hex::encode(&digest[..4]))
}

/// Keep only the final component of anything that looks like a path
fn strip_path(name: &str) -> String {
    name.rsplit(['/', '\\']).next().unwrap_or("").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disposition_plain_filename() {
        assert_eq!(
            filename_from_disposition("attachment; filename=\"report.pdf\""),
            Some("report.pdf".to_string())
        );
        assert_eq!(
            filename_from_disposition("attachment; filename=archive.tar.gz"),
            Some("archive.tar.gz".to_string())
        );
    }

    #[test]
    fn test_disposition_extended_filename_wins() {
        let value = "attachment; filename=\"fallback.bin\"; filename*=UTF-8''na%C3%AFve%20file.txt";
        assert_eq!(
            filename_from_disposition(value),
            Some("naïve file.txt".to_string())
        );
    }

    #[test]
    fn test_disposition_rejects_path_components() {
        assert_eq!(
            filename_from_disposition("attachment; filename=\"../../etc/passwd\""),
            Some("passwd".to_string())
        );
    }

    #[test]
    fn test_disposition_without_filename() {
        assert_eq!(filename_from_disposition("inline"), None);
    }

    #[test]
    fn test_filename_from_url_path() {
        let url = Url::parse("https://host.example/files/My%20Video.mp4?token=x").unwrap();
        assert_eq!(filename_from_url(&url), Some("My Video.mp4".to_string()));
    }

    #[test]
    fn test_filename_from_bare_host() {
        let url = Url::parse("https://host.example/").unwrap();
        assert_eq!(filename_from_url(&url), None);
    }

    #[test]
    fn test_fallback_filename_deterministic() {
        let a = fallback_filename("https://host.example/");
        let b = fallback_filename("https://host.example/");
        assert_eq!(a, b);
        assert!(a.starts_with("download_"));
        assert_eq!(a.len(), "download_".len() + 8);
    }

    #[test]
    fn test_content_range_total() {
        assert_eq!(content_range_total("bytes 0-0/12345"), Some(12345));
        assert_eq!(content_range_total("bytes 0-0/*"), None);
        assert_eq!(content_range_total("garbage"), None);
    }
}
