// SPDX-License-Identifier: Apache-2.0

//! Collector wiring and lifecycle.
//!
//! Construction opens the offset store and builds the watcher with its two
//! callbacks; `start` spawns the worker pool and the watcher thread. From
//! then on discovery drives scheduling: every registered identity gets a
//! tailer, workers pull ready tailers round-robin, and each successful read
//! commits its offset to the registry and (when enabled) the store.
//!
//! Per-file problems never stop the collector. Workers log and move on;
//! the only shutdown path is an explicit [`Collector::stop`].

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, error};

use crate::config::{Config, RecordCallback};
use crate::error::{Error, Result};
use crate::multiline::MultilineAggregator;
use crate::registry::FileRegistry;
use crate::scheduler::Scheduler;
use crate::shutdown::{shutdown_channel, Shutdown, ShutdownSignal};
use crate::store::{OffsetStore, SqliteStore};
use crate::tailer::{BufferPool, Tailer};
use crate::watcher::{Watcher, WatcherConfig};

const BACKOFF_INITIAL: Duration = Duration::from_millis(100);
const BACKOFF_MAX: Duration = Duration::from_secs(2);

/// Exponential backoff for idle workers. No elapsed-time cap: an idle
/// collector simply settles at the max interval.
struct Backoff {
    current: Duration,
}

impl Backoff {
    fn new() -> Self {
        Self {
            current: BACKOFF_INITIAL,
        }
    }

    fn next_duration(&mut self) -> Duration {
        let duration = self.current;
        self.current = (self.current * 2).min(BACKOFF_MAX);
        duration
    }

    fn reset(&mut self) {
        self.current = BACKOFF_INITIAL;
    }
}

#[derive(Clone)]
struct WorkerContext {
    scheduler: Arc<Scheduler>,
    registry: Arc<FileRegistry>,
    store: Option<Arc<dyn OffsetStore>>,
    strategy_name: &'static str,
    on_record: Option<RecordCallback>,
    shutdown: Shutdown,
}

pub struct Collector {
    watcher: Watcher,
    scheduler: Arc<Scheduler>,
    store: Option<Arc<dyn OffsetStore>>,
    worker_count: usize,
    worker_ctx: WorkerContext,
    workers: Vec<JoinHandle<()>>,
    signal: Option<ShutdownSignal>,
}

impl Collector {
    /// Validate the configuration and wire up all components. Fails on
    /// invalid config, bad patterns, overlapping scan roots, or a store
    /// that cannot be opened.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let store: Option<Arc<dyn OffsetStore>> = if config.store_offsets {
            Some(Arc::new(SqliteStore::open(&config.db_path)?))
        } else {
            None
        };

        let registry = Arc::new(FileRegistry::new());
        let scheduler = Arc::new(Scheduler::new());
        let pool = BufferPool::default();
        let (signal, shutdown) = shutdown_channel();
        let strategy_name = config.strategy.name();

        let on_add = {
            let registry = registry.clone();
            let scheduler = scheduler.clone();
            let store = store.clone();
            let separator = config.separator.clone();
            let multiline = config.multiline.clone();
            let pool = pool.clone();
            let shutdown = shutdown.clone();

            Box::new(move |id: &str, path: &Path| {
                let mut offset = 0;
                if let Some(store) = &store {
                    match store.load(id, strategy_name) {
                        Ok(Some(saved)) => {
                            offset = saved;
                            // The watcher registered this identity at 0.
                            registry.update_offset(id, offset);
                            debug!(id, offset, "restored offset from store");
                        }
                        Ok(None) => {}
                        Err(err) => error!(id, %err, "failed to load offset"),
                    }
                }

                let aggregator = match &multiline {
                    Some(cfg) => match MultilineAggregator::new(cfg) {
                        Ok(agg) => Some(agg),
                        Err(err) => {
                            // Config was validated up front; a failure here
                            // would drop grouping for this file only.
                            error!(id, %err, "failed to build multiline aggregator");
                            None
                        }
                    },
                    None => None,
                };

                let tailer = Tailer::with_runtime(
                    id,
                    separator.clone(),
                    offset,
                    registry.clone(),
                    aggregator,
                    pool.clone(),
                    shutdown.clone(),
                );
                debug!(id, path = %path.display(), offset, "file added");
                scheduler.add(id, Arc::new(Mutex::new(tailer)));
            })
        };

        let on_remove = {
            let scheduler = scheduler.clone();
            let store = store.clone();

            Box::new(move |id: &str| {
                scheduler.remove(id);
                if let Some(store) = &store {
                    match store.delete(id, strategy_name) {
                        Ok(()) => debug!(id, "deleted offset"),
                        Err(err) => error!(id, %err, "failed to delete offset"),
                    }
                }
            })
        };

        let watcher = Watcher::new(
            WatcherConfig {
                include: config.include.clone(),
                exclude: config.exclude.clone(),
                poll_interval: config.poll_interval,
                strategy: config.strategy.clone(),
            },
            registry.clone(),
            on_add,
            on_remove,
        )?;

        let worker_ctx = WorkerContext {
            scheduler: scheduler.clone(),
            registry,
            store: store.clone(),
            strategy_name,
            on_record: config.on_record.clone(),
            shutdown,
        };

        Ok(Self {
            watcher,
            scheduler,
            store,
            worker_count: config.worker_count,
            worker_ctx,
            workers: Vec::new(),
            signal: Some(signal),
        })
    }

    /// Spawn the workers and start discovery. A `worker_count` of zero
    /// leaves the collector in discovery-only mode.
    pub fn start(&mut self) {
        for _ in 0..self.worker_count {
            let ctx = self.worker_ctx.clone();
            self.workers.push(std::thread::spawn(move || worker_loop(ctx)));
        }
        self.watcher.start();
    }

    /// Synchronous shutdown: cancel, wait for every worker to finish its
    /// current attempt, stop the watcher (waiting out any in-flight scan),
    /// then close the store. Safe to call more than once.
    pub fn stop(&mut self) {
        if let Some(signal) = self.signal.take() {
            signal.shutdown();
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        self.watcher.stop();
        if let Some(store) = &self.store {
            if let Err(err) = store.close() {
                error!(%err, "failed to close offset store");
            }
        }
    }

    /// Number of files currently scheduled for reading.
    pub fn tracked_count(&self) -> usize {
        self.scheduler.count()
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(ctx: WorkerContext) {
    let mut backoff = Backoff::new();
    let mut loop_limit = ctx.scheduler.count();
    let mut loop_count = 0usize;

    while !ctx.shutdown.is_shutdown() {
        // After one full sweep of the ready list, wait before sweeping
        // again so idle workers do not spin.
        if loop_count >= loop_limit {
            if ctx.shutdown.sleep(backoff.next_duration()) {
                return;
            }
            loop_limit = ctx.scheduler.count();
            loop_count = 0;
        }
        loop_count += 1;

        let Some((id, tailer)) = ctx.scheduler.next_available() else {
            continue;
        };

        let mut emitted = false;
        let (result, offset) = {
            let mut tailer = tailer.lock().unwrap();
            let result = tailer.read_once(|record| {
                emitted = true;
                if let Some(on_record) = &ctx.on_record {
                    on_record(record);
                }
            });
            (result, tailer.offset())
        };

        match result {
            Ok(()) => {
                ctx.registry.update_offset(&id, offset);
                if let Some(store) = &ctx.store {
                    if let Some(tracked) = ctx.registry.get(&id) {
                        match store.save(&id, ctx.strategy_name, &tracked.path, offset) {
                            Ok(()) => {
                                debug!(id = %id, path = %tracked.path.display(), offset, "saved offset")
                            }
                            Err(err) => error!(id = %id, offset, %err, "failed to save offset"),
                        }
                    }
                }
                if emitted {
                    backoff.reset();
                }
            }
            Err(err) if err.is_not_found() => {
                // The watcher reconciles removals on its next pass.
                debug!(id = %id, %err, "file not found");
            }
            Err(Error::FingerprintMismatch { .. }) => {
                // Rotated or truncated; treated as gone until re-identified.
                debug!(id = %id, "fingerprint mismatch, awaiting re-identification");
            }
            Err(err) => {
                error!(id = %id, %err, "failed to read file");
            }
        }

        ctx.scheduler.set_idle(&id);
    }
}
