// SPDX-License-Identifier: Apache-2.0

//! Stable file identities.
//!
//! An identity is an opaque string: `dev:ino` for the inode strategy, a
//! SHA-256 hex digest for the checksum strategies. Two observations that
//! produce the same identity are treated as the same logical file, which is
//! how the collector follows files across renames and recognizes
//! truncate-and-recreate rotation.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::config::FingerprintStrategy;
use crate::error::FingerprintError;

const READ_CHUNK_SIZE: usize = 32 * 1024;

impl FingerprintStrategy {
    /// Compute the identity of an open file handle.
    ///
    /// The handle's cursor position is not restored; callers seek
    /// afterwards. Skip conditions (file too small, not enough separators)
    /// are surfaced as typed errors so the watcher can retry silently on a
    /// later scan.
    pub fn compute(&self, file: &mut File) -> Result<String, FingerprintError> {
        match self {
            FingerprintStrategy::DeviceAndInode => device_and_inode(file),
            FingerprintStrategy::Checksum { size } => checksum_prefix(file, *size),
            FingerprintStrategy::ChecksumSeparator { count, separator } => {
                checksum_until_nth_separator(file, separator.as_bytes(), *count)
            }
        }
    }

    /// Open `path` read-only and compute its identity.
    pub fn compute_at_path(&self, path: &Path) -> Result<String, FingerprintError> {
        let mut file = File::open(path)?;
        self.compute(&mut file)
    }
}

#[cfg(unix)]
fn device_and_inode(file: &File) -> Result<String, FingerprintError> {
    use std::os::unix::fs::MetadataExt;

    let metadata = file.metadata()?;
    Ok(format!("{}:{}", metadata.dev(), metadata.ino()))
}

#[cfg(not(unix))]
fn device_and_inode(_file: &File) -> Result<String, FingerprintError> {
    Err(FingerprintError::Io(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "deviceAndInode strategy is unsupported on this platform",
    )))
}

/// SHA-256 over exactly the first `size` bytes. A shorter file is a skip:
/// hashing a partial prefix would assign an identity that changes as soon
/// as the file grows.
fn checksum_prefix(file: &mut File, size: u64) -> Result<String, FingerprintError> {
    let len = file.metadata()?.len();
    if len < size {
        return Err(FingerprintError::SizeTooSmall {
            expected: size,
            actual: len,
        });
    }

    file.seek(SeekFrom::Start(0))?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file.take(size), &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// SHA-256 over everything up to and including the `count`-th occurrence of
/// `sep`. Reads in chunks; the search window keeps a `sep.len() - 1` byte
/// overlap so separators spanning a chunk boundary are still found.
fn checksum_until_nth_separator(
    file: &mut File,
    sep: &[u8],
    count: u32,
) -> Result<String, FingerprintError> {
    file.seek(SeekFrom::Start(0))?;

    let mut acc: Vec<u8> = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];
    let mut found: u32 = 0;
    let mut search_start: usize = 0;

    loop {
        let n = file.read(&mut chunk)?;
        if n == 0 {
            return Err(FingerprintError::NotEnoughSeparators {
                expected: count,
                actual: found,
            });
        }
        acc.extend_from_slice(&chunk[..n]);

        while let Some(idx) = find_subsequence(&acc[search_start..], sep) {
            found += 1;
            let pos_after = search_start + idx + sep.len();
            if found == count {
                let digest = Sha256::digest(&acc[..pos_after]);
                return Ok(hex::encode(digest));
            }
            search_start = pos_after;
        }

        // Re-scan only the tail that could still contain a boundary match.
        search_start = acc.len().saturating_sub(sep.len() - 1).max(search_start);
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
