/*
 * turbodl - Multi-connection HTTP download accelerator.
 * Copyright (C) 2025  turbodl contributors
 */

//! Output file lifecycle: sentinel claim at job start, hash verification
//! and the collision-safe rename at job end.

use crate::error::{Result, TurboError};
use blake2::{Blake2b512, Blake2s256};
use digest::DynDigest;
use md5::Md5;
use sha1::Sha1;
use sha2::{Sha224, Sha256, Sha384, Sha512};
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

/// Suffix of the in-flight sentinel file
pub const SENTINEL_SUFFIX: &str = "turbodownload";

/// Supported digest algorithms for integrity verification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HashAlgorithm {
    #[default]
    Md5,
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
    Blake2b,
    Blake2s,
}

impl HashAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::Md5 => "md5",
            HashAlgorithm::Sha1 => "sha1",
            HashAlgorithm::Sha224 => "sha224",
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha384 => "sha384",
            HashAlgorithm::Sha512 => "sha512",
            HashAlgorithm::Blake2b => "blake2b",
            HashAlgorithm::Blake2s => "blake2s",
        }
    }

    fn hasher(&self) -> Box<dyn DynDigest + Send> {
        match self {
            HashAlgorithm::Md5 => Box::new(Md5::default()),
            HashAlgorithm::Sha1 => Box::new(Sha1::default()),
            HashAlgorithm::Sha224 => Box::new(Sha224::default()),
            HashAlgorithm::Sha256 => Box::new(Sha256::default()),
            HashAlgorithm::Sha384 => Box::new(Sha384::default()),
            HashAlgorithm::Sha512 => Box::new(Sha512::default()),
            HashAlgorithm::Blake2b => Box::new(Blake2b512::default()),
            HashAlgorithm::Blake2s => Box::new(Blake2s256::default()),
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HashAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "md5" => Ok(HashAlgorithm::Md5),
            "sha1" => Ok(HashAlgorithm::Sha1),
            "sha224" => Ok(HashAlgorithm::Sha224),
            "sha256" => Ok(HashAlgorithm::Sha256),
            "sha384" => Ok(HashAlgorithm::Sha384),
            "sha512" => Ok(HashAlgorithm::Sha512),
            "blake2b" => Ok(HashAlgorithm::Blake2b),
            "blake2s" => Ok(HashAlgorithm::Blake2s),
            other => Err(format!("unknown hash type '{other}'")),
        }
    }
}

/// Stream a file through the chosen digest on the blocking executor
pub async fn hash_file(path: &Path, algorithm: HashAlgorithm) -> Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut file = std::fs::File::open(&path).map_err(|e| TurboError::io(&path, e))?;
        let mut hasher = algorithm.hasher();
        let mut buf = vec![0u8; 64 * 1024];

        loop {
            let n = file.read(&mut buf).map_err(|e| TurboError::io(&path, e))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }

        Ok(hex::encode(hasher.finalize()))
    })
    .await
    .map_err(|e| TurboError::Io {
        path: PathBuf::new(),
        message: e.to_string(),
        source: None,
    })?
}

/// The output identity a job writes into
pub(crate) struct ClaimedOutput {
    /// Where the file will land on success
    pub destination: PathBuf,
    /// In-flight path, `<destination>.turbodownload`
    pub sentinel: PathBuf,
    pub file: std::fs::File,
}

/// Sentinel path for a destination: the suffix is appended to the full
/// file name
pub fn sentinel_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(SENTINEL_SUFFIX);
    destination.with_file_name(name)
}

/// `<stem>_<k><ext>` next to the original
fn numbered_candidate(destination: &Path, k: u32) -> PathBuf {
    let stem = destination
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match destination.extension() {
        Some(ext) => format!("{stem}_{k}.{}", ext.to_string_lossy()),
        None => format!("{stem}_{k}"),
    };
    destination.with_file_name(name)
}

/// Claim the output identity at job start by creating the sentinel file.
///
/// With `overwrite` the sentinel is simply truncated into place. Without
/// it, creation is `create_new` so two concurrent jobs aiming at the same
/// name claim distinct `_<k>` slots; a taken final path or sentinel both
/// advance the counter.
pub(crate) async fn claim_destination(destination: &Path, overwrite: bool) -> Result<ClaimedOutput> {
    if overwrite {
        let sentinel = sentinel_path(destination);
        let file = tokio::fs::File::create(&sentinel)
            .await
            .map_err(|e| TurboError::io(&sentinel, e))?;
        return Ok(ClaimedOutput {
            destination: destination.to_path_buf(),
            sentinel,
            file: file.into_std().await,
        });
    }

    let mut k = 0u32;
    loop {
        let candidate = if k == 0 {
            destination.to_path_buf()
        } else {
            numbered_candidate(destination, k)
        };

        let taken = tokio::fs::try_exists(&candidate)
            .await
            .map_err(|e| TurboError::io(&candidate, e))?;
        if taken {
            k += 1;
            continue;
        }

        let sentinel = sentinel_path(&candidate);
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&sentinel)
            .await
        {
            Ok(file) => {
                if k > 0 {
                    debug!(path = %candidate.display(), "destination taken, using numbered name");
                }
                return Ok(ClaimedOutput {
                    destination: candidate,
                    sentinel,
                    file: file.into_std().await,
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => k += 1,
            Err(e) => return Err(TurboError::io(&sentinel, e)),
        }
    }
}

/// Verify and publish the finished sentinel file.
///
/// On a hash mismatch the sentinel is deleted and nothing appears at the
/// destination.
pub(crate) async fn finalize_download(
    sentinel: &Path,
    destination: &Path,
    overwrite: bool,
    expected_hash: Option<&str>,
    algorithm: HashAlgorithm,
) -> Result<PathBuf> {
    if let Some(expected) = expected_hash {
        let actual = hash_file(sentinel, algorithm).await?;
        if !actual.eq_ignore_ascii_case(expected) {
            let _ = tokio::fs::remove_file(sentinel).await;
            return Err(TurboError::HashMismatch {
                algorithm: algorithm.to_string(),
                expected: expected.to_string(),
                actual,
            });
        }
        debug!(algorithm = %algorithm, "hash verified");
    }

    let final_path = if overwrite {
        match tokio::fs::remove_file(destination).await {
            Ok(()) => destination.to_path_buf(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => destination.to_path_buf(),
            Err(e) => return Err(TurboError::io(destination, e)),
        }
    } else {
        // The claim made this name free, but re-check in case something
        // landed there during the transfer
        let mut candidate = destination.to_path_buf();
        let mut k = 1u32;
        while tokio::fs::try_exists(&candidate)
            .await
            .map_err(|e| TurboError::io(&candidate, e))?
        {
            candidate = numbered_candidate(destination, k);
            k += 1;
        }
        candidate
    };

    tokio::fs::rename(sentinel, &final_path)
        .await
        .map_err(|e| TurboError::io(&final_path, e))?;

    Ok(final_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_algorithm_roundtrip() {
        for name in [
            "md5", "sha1", "sha224", "sha256", "sha384", "sha512", "blake2b", "blake2s",
        ] {
            let algorithm: HashAlgorithm = name.parse().unwrap();
            assert_eq!(algorithm.to_string(), name);
        }
        assert!("crc32".parse::<HashAlgorithm>().is_err());
    }

    #[test]
    fn test_sentinel_path() {
        assert_eq!(
            sentinel_path(Path::new("/tmp/foo.bin")),
            Path::new("/tmp/foo.bin.turbodownload")
        );
    }

    #[test]
    fn test_numbered_candidate() {
        assert_eq!(
            numbered_candidate(Path::new("/tmp/foo.bin"), 2),
            Path::new("/tmp/foo_2.bin")
        );
        assert_eq!(
            numbered_candidate(Path::new("/tmp/noext"), 1),
            Path::new("/tmp/noext_1")
        );
        assert_eq!(
            numbered_candidate(Path::new("/tmp/a.tar.gz"), 1),
            Path::new("/tmp/a.tar_1.gz")
        );
    }

    #[tokio::test]
    async fn test_hash_of_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty");
        tokio::fs::write(&path, b"").await.unwrap();

        assert_eq!(
            hash_file(&path, HashAlgorithm::Md5).await.unwrap(),
            "d41d8cd98f00b204e9800998ecf8427e"
        );
    }

    #[tokio::test]
    async fn test_known_digests() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abc");
        tokio::fs::write(&path, b"abc").await.unwrap();

        assert_eq!(
            hash_file(&path, HashAlgorithm::Md5).await.unwrap(),
            "900150983cd24fb0d6963f7d28e17f72"
        );
        assert_eq!(
            hash_file(&path, HashAlgorithm::Sha256).await.unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );

        // Remaining algorithms produce digests of the documented widths
        for (algorithm, hex_len) in [
            (HashAlgorithm::Sha1, 40),
            (HashAlgorithm::Sha224, 56),
            (HashAlgorithm::Sha384, 96),
            (HashAlgorithm::Sha512, 128),
            (HashAlgorithm::Blake2b, 128),
            (HashAlgorithm::Blake2s, 64),
        ] {
            assert_eq!(hash_file(&path, algorithm).await.unwrap().len(), hex_len);
        }
    }

    #[tokio::test]
    async fn test_claim_picks_free_numbered_slot() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("foo.bin");
        tokio::fs::write(&destination, b"existing").await.unwrap();

        let claim = claim_destination(&destination, false).await.unwrap();
        assert_eq!(claim.destination, dir.path().join("foo_1.bin"));
        assert!(claim.sentinel.ends_with("foo_1.bin.turbodownload"));

        // A second concurrent job skips past the first job's sentinel
        let second = claim_destination(&destination, false).await.unwrap();
        assert_eq!(second.destination, dir.path().join("foo_2.bin"));
    }

    #[tokio::test]
    async fn test_claim_overwrite_reuses_name() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("foo.bin");
        tokio::fs::write(&destination, b"existing").await.unwrap();

        let claim = claim_destination(&destination, true).await.unwrap();
        assert_eq!(claim.destination, destination);
    }

    #[tokio::test]
    async fn test_finalize_renames_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("foo.bin");
        let sentinel = sentinel_path(&destination);
        tokio::fs::write(&sentinel, b"payload").await.unwrap();

        let final_path = finalize_download(&sentinel, &destination, true, None, HashAlgorithm::Md5)
            .await
            .unwrap();

        assert_eq!(final_path, destination);
        assert!(!sentinel.exists());
        assert_eq!(tokio::fs::read(&destination).await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_finalize_hash_gate() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("foo.bin");
        let sentinel = sentinel_path(&destination);
        tokio::fs::write(&sentinel, b"payload").await.unwrap();

        let err = finalize_download(
            &sentinel,
            &destination,
            true,
            Some("00000000000000000000000000000000"),
            HashAlgorithm::Md5,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, TurboError::HashMismatch { .. }));
        // Neither the sentinel nor the destination survive a bad hash
        assert!(!sentinel.exists());
        assert!(!destination.exists());
    }

    #[tokio::test]
    async fn test_finalize_hash_compare_is_case_insensitive() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("foo.bin");
        let sentinel = sentinel_path(&destination);
        tokio::fs::write(&sentinel, b"abc").await.unwrap();

        finalize_download(
            &sentinel,
            &destination,
            true,
            Some("900150983CD24FB0D6963F7D28E17F72"),
            HashAlgorithm::Md5,
        )
        .await
        .unwrap();
        assert!(destination.exists());
    }
}
