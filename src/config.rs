// SPDX-License-Identifier: Apache-2.0

//! Collector configuration.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};

/// Callback invoked for every emitted record. Must be callable from
/// multiple worker threads concurrently.
pub type RecordCallback = Arc<dyn Fn(String) + Send + Sync>;

/// How a file's stable identity is derived. The identity survives renames
/// (device/inode) or content-preserving copies (checksum variants), which
/// is what lets the collector follow files across rotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FingerprintStrategy {
    /// Device number + inode of the filesystem entry. Unix only.
    DeviceAndInode,
    /// SHA-256 of the first `size` bytes. Files shorter than `size` are
    /// skipped until they grow.
    Checksum { size: u64 },
    /// SHA-256 of everything up to and including the `count`-th occurrence
    /// of `separator`. Files with fewer occurrences are skipped.
    ChecksumSeparator { count: u32, separator: String },
}

impl FingerprintStrategy {
    /// Canonical name persisted in the offset store.
    pub fn name(&self) -> &'static str {
        match self {
            FingerprintStrategy::DeviceAndInode => "deviceAndInode",
            FingerprintStrategy::Checksum { .. } => "checksum",
            FingerprintStrategy::ChecksumSeparator { .. } => "checksumSeparator",
        }
    }

    /// Check a strategy name against the canonical spellings. The legacy
    /// misspelling `checksumSeperator` is rejected with a pointed message
    /// instead of being silently accepted.
    pub fn parse_name(name: &str) -> Result<&'static str> {
        match name {
            "deviceAndInode" => Ok("deviceAndInode"),
            "checksum" => Ok("checksum"),
            "checksumSeparator" => Ok("checksumSeparator"),
            "checksumSeperator" => Err(Error::Config(
                "strategy name 'checksumSeperator' is not accepted; use 'checksumSeparator'"
                    .to_string(),
            )),
            other => Err(Error::Config(format!(
                "unsupported fingerprint strategy: {other}"
            ))),
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        match self {
            FingerprintStrategy::DeviceAndInode => {
                if cfg!(unix) {
                    Ok(())
                } else {
                    Err(Error::Config(
                        "deviceAndInode strategy is unsupported on this platform".to_string(),
                    ))
                }
            }
            FingerprintStrategy::Checksum { size } => {
                if *size == 0 {
                    return Err(Error::Config(
                        "fingerprint size must be greater than 0".to_string(),
                    ));
                }
                Ok(())
            }
            FingerprintStrategy::ChecksumSeparator { count, separator } => {
                if *count == 0 {
                    return Err(Error::Config(
                        "fingerprint separator count must be greater than 0".to_string(),
                    ));
                }
                if separator.is_empty() {
                    return Err(Error::Config(
                        "fingerprint separator must not be empty".to_string(),
                    ));
                }
                Ok(())
            }
        }
    }
}

/// How accumulated lines relate to the condition pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultilineMode {
    /// Matching lines continue the record; the first non-matching line is
    /// appended and closes it.
    ContinuePast,
    /// Matching lines continue the record; a non-matching line closes it
    /// and may begin the next.
    ContinueThrough,
    /// A matching line closes the current record before itself.
    HaltBefore,
    /// A matching line is appended and closes the record.
    HaltWith,
}

/// Multi-line aggregation settings. Both patterns are required: lines that
/// do not match `start_pattern` while nothing is buffered are emitted as
/// standalone records.
#[derive(Debug, Clone)]
pub struct MultilineConfig {
    pub mode: MultilineMode,
    pub start_pattern: String,
    pub condition_pattern: String,
    /// Idle time after which a buffered record is flushed to the output
    /// channel even though no closing line arrived.
    pub timeout: Duration,
}

impl MultilineConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.start_pattern.is_empty() {
            return Err(Error::Config(
                "multiline start pattern is required".to_string(),
            ));
        }
        if self.condition_pattern.is_empty() {
            return Err(Error::Config(
                "multiline condition pattern is required".to_string(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(Error::Config(
                "multiline timeout must be greater than 0".to_string(),
            ));
        }
        regex::bytes::Regex::new(&self.start_pattern)?;
        regex::bytes::Regex::new(&self.condition_pattern)?;
        Ok(())
    }
}

/// Collector configuration.
#[derive(Clone)]
pub struct Config {
    /// Glob patterns, directories, or file paths to discover.
    pub include: Vec<String>,
    /// Glob patterns to skip, matched against basename and full path.
    pub exclude: Vec<String>,
    /// Interval between watcher scans.
    pub poll_interval: Duration,
    /// Record separator; may be multi-byte (e.g. `\r\n` or `<END>`).
    pub separator: String,
    pub strategy: FingerprintStrategy,
    /// Number of reader threads. Zero disables reading (discovery only).
    pub worker_count: usize,
    /// Persist per-file offsets so a restart resumes where it left off.
    pub store_offsets: bool,
    /// Path of the SQLite offset database.
    pub db_path: PathBuf,
    /// Invoked once per emitted record.
    pub on_record: Option<RecordCallback>,
    pub multiline: Option<MultilineConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            include: Vec::new(),
            exclude: Vec::new(),
            poll_interval: Duration::from_millis(100),
            separator: "\n".to_string(),
            strategy: FingerprintStrategy::DeviceAndInode,
            worker_count: 1,
            store_offsets: true,
            db_path: PathBuf::from("collector.db"),
            on_record: None,
            multiline: None,
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("include", &self.include)
            .field("exclude", &self.exclude)
            .field("poll_interval", &self.poll_interval)
            .field("separator", &self.separator)
            .field("strategy", &self.strategy)
            .field("worker_count", &self.worker_count)
            .field("store_offsets", &self.store_offsets)
            .field("db_path", &self.db_path)
            .field("on_record", &self.on_record.as_ref().map(|_| ".."))
            .field("multiline", &self.multiline)
            .finish()
    }
}

impl Config {
    /// Validate the configuration. Construction of a [`crate::Collector`]
    /// fails on the first violation.
    pub fn validate(&self) -> Result<()> {
        if self.separator.is_empty() {
            return Err(Error::Config("separator must not be empty".to_string()));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::Config(
                "poll interval must be greater than 0".to_string(),
            ));
        }
        self.strategy.validate()?;
        if let Some(multiline) = &self.multiline {
            multiline.validate()?;
        }
        Ok(())
    }
}
