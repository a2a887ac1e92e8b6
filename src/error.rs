// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid glob pattern: {0}")]
    InvalidGlob(String),

    #[error("regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("store migration error: {0}")]
    Migration(#[from] refinery::Error),

    #[error("offset store is closed")]
    StoreClosed,

    #[error("file not tracked: {0}")]
    UntrackedFile(String),

    #[error("fingerprint mismatch for {path}: expected {expected}, got {actual}")]
    FingerprintMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("fingerprint error: {0}")]
    Fingerprint(#[from] FingerprintError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True when the underlying cause is a missing file, which workers treat
    /// as transient (the watcher reconciles on its next pass).
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            Error::Fingerprint(FingerprintError::Io(e)) => {
                e.kind() == std::io::ErrorKind::NotFound
            }
            _ => false,
        }
    }
}

/// Errors from identity computation. Skip conditions are expected during
/// normal operation: the file has not accumulated enough content to be
/// fingerprinted yet and the watcher retries on a later scan.
#[derive(Error, Debug)]
pub enum FingerprintError {
    #[error("file has {actual} bytes, fingerprint requires {expected}")]
    SizeTooSmall { expected: u64, actual: u64 },

    #[error("expected {expected} separator occurrences, found {actual}")]
    NotEnoughSeparators { expected: u32, actual: u32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FingerprintError {
    /// Skip conditions mean "not ready yet", not failure.
    pub fn is_skip(&self) -> bool {
        matches!(
            self,
            FingerprintError::SizeTooSmall { .. } | FingerprintError::NotEnoughSeparators { .. }
        )
    }
}
