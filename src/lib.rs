// SPDX-License-Identifier: Apache-2.0

//! Reliable file log collection.
//!
//! `logreel` discovers files under include/exclude patterns, assigns each
//! one a rotation-stable identity (device/inode or content checksum),
//! tails it from a resumable byte offset, and hands every
//! separator-delimited record to a callback. Offsets persist in an
//! embedded SQLite store so a restart picks up where the last run left
//! off. Optional multi-line aggregation groups stack traces and other
//! continuation lines into single records.
//!
//! ```no_run
//! use std::sync::Arc;
//! use logreel::{Collector, Config, FingerprintStrategy};
//!
//! let config = Config {
//!     include: vec!["/var/log/app/*.log".to_string()],
//!     strategy: FingerprintStrategy::Checksum { size: 256 },
//!     on_record: Some(Arc::new(|record| println!("{record}"))),
//!     ..Config::default()
//! };
//!
//! let mut collector = Collector::new(config).expect("invalid config");
//! collector.start();
//! // ...
//! collector.stop();
//! ```

mod collector;
mod config;
mod error;
mod fingerprint;
mod multiline;
mod registry;
mod scheduler;
mod shutdown;
mod sink;
mod store;
mod tailer;
mod watcher;

pub use collector::Collector;
pub use config::{Config, FingerprintStrategy, MultilineConfig, MultilineMode, RecordCallback};
pub use error::{Error, FingerprintError, Result};
pub use multiline::MultilineAggregator;
pub use registry::{FileRegistry, TrackedFile};
pub use sink::{callback_for, Sink};
pub use store::{OffsetStore, SqliteStore};
pub use tailer::{Tailer, TailerHandle};
