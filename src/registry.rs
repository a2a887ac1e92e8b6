// SPDX-License-Identifier: Apache-2.0

//! In-memory map from file identity to tracked state.
//!
//! The registry is the single source of truth for "which files exist right
//! now". The watcher creates and removes entries; workers advance offsets.
//! All operations are short and hold no I/O under the lock.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::config::FingerprintStrategy;

/// State for one tracked file. The strategy (with its params) is fixed for
/// the lifetime of the entry; a content change yields a new identity and
/// thus a new entry.
#[derive(Debug, Clone)]
pub struct TrackedFile {
    pub path: PathBuf,
    pub strategy: FingerprintStrategy,
    pub offset: u64,
}

#[derive(Default)]
pub struct FileRegistry {
    files: Mutex<HashMap<String, TrackedFile>>,
}

impl FileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a file. An existing entry with the same identity is
    /// overwritten, which supports re-registration after a
    /// strategy-equivalent recreation.
    pub fn add(&self, id: &str, path: PathBuf, strategy: FingerprintStrategy, offset: u64) {
        let mut files = self.files.lock().unwrap();
        files.insert(
            id.to_string(),
            TrackedFile {
                path,
                strategy,
                offset,
            },
        );
    }

    pub fn get(&self, id: &str) -> Option<TrackedFile> {
        let files = self.files.lock().unwrap();
        files.get(id).cloned()
    }

    /// Returns false when the identity is no longer tracked.
    pub fn update_offset(&self, id: &str, offset: u64) -> bool {
        let mut files = self.files.lock().unwrap();
        match files.get_mut(id) {
            Some(file) => {
                file.offset = offset;
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, id: &str) {
        let mut files = self.files.lock().unwrap();
        files.remove(id);
    }

    pub fn snapshot(&self) -> HashMap<String, TrackedFile> {
        let files = self.files.lock().unwrap();
        files.clone()
    }
}
